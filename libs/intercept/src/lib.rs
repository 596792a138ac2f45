#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The intercept state machine and registry.
//!
//! User intent goes to the manager as RPCs; manager snapshots drive every
//! state transition here. The daemon reacts to the emitted [`InterceptEvent`]s
//! by wiring mounts, environment files and stream handlers.

pub mod env;
pub mod handler;
pub mod header;
pub mod mount;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use telepresence_model::{
    InterceptError, InterceptRuntime, InterceptSpec, InterceptState, timeouts,
};
use telepresence_rpc::manager::{self, InterceptDisposition};

/// What the daemon must act on after a snapshot or timeout sweep.
#[derive(Debug, PartialEq, Eq)]
pub enum InterceptEvent {
    /// Agent reachable and environment received: wire mounts and handlers.
    BecameActive {
        name: String,
        namespace: String,
        runtime: InterceptRuntime,
    },
    Failed {
        name: String,
        namespace: String,
        reason: InterceptError,
    },
    /// Terminal removal confirmed; replace-mode workloads must be back at
    /// `original_replicas`.
    Removed {
        name: String,
        namespace: String,
        original_replicas: Option<i32>,
    },
}

#[derive(Debug, Clone)]
pub struct InterceptEntry {
    pub spec: InterceptSpec,
    pub state: InterceptState,
    pub runtime: InterceptRuntime,
    pub mount_point: Option<PathBuf>,
    requested_at: Instant,
}

/// All intercepts of one session, keyed by `(name, namespace)`.
///
/// Guarded by a mutex; iteration for display copies a snapshot out.
#[derive(Default)]
pub struct InterceptRegistry {
    inner: Mutex<HashMap<(String, String), InterceptEntry>>,
}

impl InterceptRegistry {
    /// Registers a new intercept in REQUESTED state.
    ///
    /// Fails without touching the cluster when the mount point overlaps an
    /// existing intercept's mount.
    pub fn insert_requested(
        &self,
        spec: InterceptSpec,
        mount_point: Option<PathBuf>,
        now: Instant,
    ) -> Result<(), InterceptError> {
        let mut inner = self.inner.lock();

        if let Some(candidate) = &mount_point {
            let existing: Vec<PathBuf> = inner
                .values()
                .filter_map(|entry| entry.mount_point.clone())
                .collect();

            if mount::check_overlap(candidate, existing.iter().map(PathBuf::as_path)).is_err() {
                return Err(InterceptError::MountOverlap(candidate.clone()));
            }
        }

        let key = (spec.id.name.clone(), spec.id.namespace.clone());
        inner.insert(
            key,
            InterceptEntry {
                spec,
                state: InterceptState::Requested,
                runtime: InterceptRuntime::default(),
                mount_point,
                requested_at: now,
            },
        );

        Ok(())
    }

    /// The manager acknowledged the create RPC.
    pub fn on_manager_ack(&self, name: &str, namespace: &str, now: Instant) {
        if let Some(entry) = self
            .inner
            .lock()
            .get_mut(&(name.to_owned(), namespace.to_owned()))
        {
            entry.state = InterceptState::Waiting;
            entry.requested_at = now;
        }
    }

    /// The manager rejected the create RPC.
    pub fn on_manager_reject(&self, name: &str, namespace: &str, message: String) {
        if let Some(entry) = self
            .inner
            .lock()
            .get_mut(&(name.to_owned(), namespace.to_owned()))
        {
            entry.state = InterceptState::Failed(InterceptError::Rejected(message));
        }
    }

    /// The user asked for removal; the delete RPC is on its way.
    pub fn mark_removing(&self, name: &str, namespace: &str) {
        if let Some(entry) = self
            .inner
            .lock()
            .get_mut(&(name.to_owned(), namespace.to_owned()))
        {
            entry.state = InterceptState::Removing;
        }
    }

    /// Records the locally chosen mount point once the mount is up.
    pub fn set_mount_point(&self, name: &str, namespace: &str, mount_point: PathBuf) {
        if let Some(entry) = self
            .inner
            .lock()
            .get_mut(&(name.to_owned(), namespace.to_owned()))
        {
            entry.runtime.mount_point = Some(mount_point.clone());
            entry.mount_point = Some(mount_point);
        }
    }

    /// Applies one authoritative manager snapshot and returns the transitions.
    pub fn apply_snapshot(&self, infos: &[manager::InterceptInfo]) -> Vec<InterceptEvent> {
        let mut events = Vec::new();
        let mut inner = self.inner.lock();

        let mut seen: Vec<(String, String)> = Vec::with_capacity(infos.len());

        for info in infos {
            let Some(spec) = &info.spec else { continue };
            let key = (spec.name.clone(), spec.namespace.clone());
            seen.push(key.clone());

            let Some(entry) = inner.get_mut(&key) else {
                tracing::debug!(
                    name = %spec.name,
                    namespace = %spec.namespace,
                    "Snapshot mentions an intercept we never requested"
                );
                continue;
            };

            match info.disposition() {
                InterceptDisposition::Waiting => {
                    if entry.state == InterceptState::Requested {
                        entry.state = InterceptState::Waiting;
                    }
                }
                InterceptDisposition::Active => {
                    let runtime = match telepresence_rpc::runtime_from_info(info) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            tracing::warn!("Ignoring malformed intercept info: {e}");
                            continue;
                        }
                    };

                    let was_active = entry.state == InterceptState::Active;
                    let mount_point = entry.runtime.mount_point.clone();
                    entry.runtime = InterceptRuntime {
                        mount_point,
                        ..runtime
                    };

                    if !was_active && !entry.state.is_terminal() {
                        entry.state = InterceptState::Active;
                        events.push(InterceptEvent::BecameActive {
                            name: key.0.clone(),
                            namespace: key.1.clone(),
                            runtime: entry.runtime.clone(),
                        });
                    }
                }
                InterceptDisposition::AgentError => {
                    if !entry.state.is_terminal() {
                        let reason = InterceptError::Rejected(info.message.clone());
                        entry.state = InterceptState::Failed(reason.clone());
                        events.push(InterceptEvent::Failed {
                            name: key.0.clone(),
                            namespace: key.1.clone(),
                            reason,
                        });
                    }
                }
                InterceptDisposition::Removed | InterceptDisposition::Unspecified => {}
            }
        }

        // Anything the snapshot no longer carries is gone from the cluster.
        inner.retain(|key, entry| {
            if seen.contains(key) {
                return true;
            }

            match entry.state {
                InterceptState::Requested => true, // The create RPC may still be in flight.
                InterceptState::Removing
                | InterceptState::Active
                | InterceptState::Waiting
                | InterceptState::Removed => {
                    events.push(InterceptEvent::Removed {
                        name: key.0.clone(),
                        namespace: key.1.clone(),
                        original_replicas: entry.runtime.original_replicas,
                    });

                    false
                }
                InterceptState::Failed(_) => false,
            }
        });

        events
    }

    /// Fails intercepts stuck in WAITING beyond the arrival timeout.
    pub fn check_timeouts(&self, now: Instant) -> Vec<InterceptEvent> {
        let mut events = Vec::new();

        for (key, entry) in self.inner.lock().iter_mut() {
            let waiting = matches!(
                entry.state,
                InterceptState::Requested | InterceptState::Waiting
            );

            if waiting && now.duration_since(entry.requested_at) >= timeouts::INTERCEPT_ARRIVAL {
                entry.state = InterceptState::Failed(InterceptError::AgentTimeout);
                events.push(InterceptEvent::Failed {
                    name: key.0.clone(),
                    namespace: key.1.clone(),
                    reason: InterceptError::AgentTimeout,
                });
            }
        }

        events
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<InterceptEntry> {
        self.inner
            .lock()
            .get(&(name.to_owned(), namespace.to_owned()))
            .cloned()
    }

    /// A point-in-time copy for display.
    pub fn snapshot(&self) -> Vec<InterceptEntry> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn remove(&self, name: &str, namespace: &str) -> Option<InterceptEntry> {
        self.inner
            .lock()
            .remove(&(name.to_owned(), namespace.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use telepresence_model::{InterceptId, Mechanism, MountIntent};

    fn spec(name: &str) -> InterceptSpec {
        InterceptSpec {
            id: InterceptId {
                name: name.to_owned(),
                workload: "web".to_owned(),
                namespace: "default".to_owned(),
            },
            mechanism: Mechanism::Tcp,
            target_port: 8080,
            local_addr: "127.0.0.1:9000".parse().unwrap(),
            mount: MountIntent::None,
            replace: true,
        }
    }

    fn active_info(name: &str, original_replicas: i32) -> manager::InterceptInfo {
        manager::InterceptInfo {
            spec: Some(manager::InterceptSpec {
                name: name.to_owned(),
                workload: "web".to_owned(),
                namespace: "default".to_owned(),
                mechanism: "tcp".to_owned(),
                headers: Vec::new(),
                target_port: 8080,
                replace: true,
            }),
            disposition: InterceptDisposition::Active.into(),
            message: String::new(),
            agent_pod_ip: vec![10, 0, 0, 42],
            sftp_port: 2222,
            environment: StdHashMap::from([("PORT".to_owned(), "8080".to_owned())]),
            original_replicas,
        }
    }

    #[test]
    fn snapshot_drives_waiting_to_active() {
        let registry = InterceptRegistry::default();
        let now = Instant::now();

        registry.insert_requested(spec("one"), None, now).unwrap();
        registry.on_manager_ack("one", "default", now);

        let events = registry.apply_snapshot(&[active_info("one", 3)]);

        assert_eq!(events.len(), 1);
        let InterceptEvent::BecameActive { name, runtime, .. } = &events[0] else {
            panic!("expected BecameActive, got {events:?}");
        };
        assert_eq!(name, "one");
        assert_eq!(runtime.agent_pod_ip, Some("10.0.0.42".parse().unwrap()));
        assert_eq!(runtime.sftp_port, Some(2222));
        assert_eq!(
            registry.get("one", "default").unwrap().state,
            InterceptState::Active
        );

        // A second identical snapshot changes nothing.
        assert!(registry.apply_snapshot(&[active_info("one", 3)]).is_empty());
    }

    #[test]
    fn removal_reports_the_original_replica_count() {
        let registry = InterceptRegistry::default();
        let now = Instant::now();

        registry.insert_requested(spec("one"), None, now).unwrap();
        registry.on_manager_ack("one", "default", now);
        registry.apply_snapshot(&[active_info("one", 3)]);

        registry.mark_removing("one", "default");
        let events = registry.apply_snapshot(&[]);

        assert_eq!(
            events,
            vec![InterceptEvent::Removed {
                name: "one".to_owned(),
                namespace: "default".to_owned(),
                original_replicas: Some(3),
            }]
        );
        assert!(registry.get("one", "default").is_none());
    }

    #[test]
    fn waiting_times_out_after_the_arrival_deadline() {
        let registry = InterceptRegistry::default();
        let now = Instant::now();

        registry.insert_requested(spec("one"), None, now).unwrap();
        registry.on_manager_ack("one", "default", now);

        assert!(registry.check_timeouts(now).is_empty());

        let events = registry.check_timeouts(now + timeouts::INTERCEPT_ARRIVAL);

        assert_eq!(events.len(), 1);
        assert!(matches!(
            registry.get("one", "default").unwrap().state,
            InterceptState::Failed(InterceptError::AgentTimeout)
        ));
    }

    #[test]
    fn overlapping_mounts_are_rejected_before_any_rpc() {
        let registry = InterceptRegistry::default();
        let now = Instant::now();

        registry
            .insert_requested(spec("one"), Some("/mnt/web".into()), now)
            .unwrap();

        let mut second = spec("two");
        second.id.name = "two".to_owned();

        let error = registry
            .insert_requested(second, Some("/mnt/web/sub".into()), now)
            .unwrap_err();

        assert!(matches!(error, InterceptError::MountOverlap(_)));
    }

    #[test]
    fn agent_errors_fail_the_intercept() {
        let registry = InterceptRegistry::default();
        let now = Instant::now();

        registry.insert_requested(spec("one"), None, now).unwrap();
        registry.on_manager_ack("one", "default", now);

        let mut info = active_info("one", 0);
        info.disposition = InterceptDisposition::AgentError.into();
        info.message = "agent crashed".to_owned();

        let events = registry.apply_snapshot(&[info]);

        assert!(matches!(events[0], InterceptEvent::Failed { .. }));
    }
}
