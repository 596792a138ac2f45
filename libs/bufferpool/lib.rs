#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// A pool of equally-sized byte buffers.
///
/// [`Buffer`]s pulled from the pool return their storage on drop; ownership in
/// between is linear. The free list is lock-free so the TUN reader never
/// contends with dispatchers releasing buffers.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    free: SegQueue<Vec<u8>>,
    capacity: usize,
    tag: &'static str,
}

impl BufferPool {
    pub fn new(capacity: usize, tag: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: SegQueue::new(),
                capacity,
                tag,
            }),
        }
    }

    /// A zeroed buffer of the pool's full capacity.
    pub fn pull(&self) -> Buffer {
        let storage = match self.inner.free.pop() {
            Some(mut storage) => {
                storage.clear();
                storage.resize(self.inner.capacity, 0);
                storage
            }
            None => {
                tracing::trace!(tag = %self.inner.tag, "Allocating new buffer");

                vec![0; self.inner.capacity]
            }
        };

        Buffer {
            storage,
            pool: Arc::clone(&self.inner),
        }
    }

    /// A buffer sized and initialised to `data`.
    pub fn pull_initialised(&self, data: &[u8]) -> Buffer {
        let mut buffer = self.pull();
        buffer.storage.truncate(data.len());
        buffer.storage.copy_from_slice(data);

        buffer
    }
}

pub struct Buffer {
    storage: Vec<u8>,
    pool: Arc<Inner>,
}

impl Buffer {
    /// Truncates N bytes from the front of the buffer.
    pub fn truncate_front(&mut self, num: usize) {
        let current_len = self.storage.len();

        self.storage.copy_within(num.., 0);
        self.storage.truncate(current_len - num);
    }

    /// Moves the content back by N bytes, returning the new space at the front.
    pub fn move_back(&mut self, num: usize) -> &mut [u8] {
        let current_len = self.storage.len();

        self.storage.resize(current_len + num, 0);
        self.storage.copy_within(..current_len, num);

        &mut self.storage[..num]
    }

    pub fn truncate(&mut self, len: usize) {
        self.storage.truncate(len);
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let mut copy = BufferPool {
            inner: Arc::clone(&self.pool),
        }
        .pull();
        copy.storage.truncate(self.storage.len());
        copy.storage.copy_from_slice(&self.storage);

        copy
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.free.push(std::mem::take(&mut self.storage));
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.storage
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.storage.len())
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.storage == other.storage
    }
}

impl Eq for Buffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused() {
        let pool = BufferPool::new(1500, "test");

        let first = pool.pull();
        drop(first);

        let _second = pool.pull();

        assert_eq!(pool.inner.free.len(), 0);
    }

    #[test]
    fn initialised_buffer_is_only_as_long_as_content() {
        let pool = BufferPool::new(1500, "test");

        let buffer = pool.pull_initialised(b"hello world");

        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn reused_buffer_is_zeroed_to_full_capacity() {
        let pool = BufferPool::new(16, "test");

        drop(pool.pull_initialised(&b"some left-over data"[..16]));

        let buffer = pool.pull();

        assert_eq!(buffer.len(), 16);
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[test]
    fn move_back_prepends_writable_space() {
        let pool = BufferPool::new(32, "test");

        let mut buffer = pool.pull_initialised(b"payload");
        buffer.move_back(4).copy_from_slice(&[0, 0, 0, 2]);

        assert_eq!(&buffer[..4], &[0, 0, 0, 2]);
        assert_eq!(&buffer[4..], b"payload");

        buffer.truncate_front(4);

        assert_eq!(&buffer[..], b"payload");
    }

    #[test]
    fn cloned_buffer_owns_its_own_memory() {
        let pool = BufferPool::new(32, "test");

        let buffer = pool.pull_initialised(b"hello world");
        let copy = buffer.clone();
        drop(buffer);

        assert_eq!(&copy[..], b"hello world");
    }
}
