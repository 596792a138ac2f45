use std::{
    io,
    task::{Context, Poll},
};

use ip_packet::IpPacket;

#[cfg(target_family = "unix")]
mod device;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_family = "unix")]
pub use device::TunDevice;

/// The interface name of the virtual device on Linux.
///
/// macOS assigns the next free `utunN` itself.
pub const IFACE_NAME: &str = "tel0";

/// A TUN device as seen by the packet loop.
///
/// I/O errors surfaced here are fatal to the device; per-packet parse failures
/// are logged and skipped by the implementations.
pub trait Tun: Send + Sync + 'static {
    /// Check if more packets can be sent.
    fn poll_send_ready(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;
    /// Send a packet.
    fn send(&mut self, packet: IpPacket) -> io::Result<()>;

    /// Receive a batch of packets, up to `max`.
    fn poll_recv_many(
        &mut self,
        cx: &mut Context,
        buf: &mut Vec<IpPacket>,
        max: usize,
    ) -> Poll<usize>;

    /// The name of the TUN device.
    fn name(&self) -> &str;
}
