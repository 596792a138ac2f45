//! Drives intercepts end to end: manager RPCs out, snapshot events in, and
//! the local wiring (reverse streams, mounts, environment files) in between.

use crate::error::DaemonError;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use telepresence_intercept::env::EnvFormat;
use telepresence_intercept::{InterceptEvent, InterceptRegistry, env, handler, mount};
use telepresence_model::{
    HeaderValue, InterceptId, InterceptRuntime, InterceptSpec, MountIntent, Protocol, Session,
};
use telepresence_rpc::daemon::{self, InterceptSummary};
use telepresence_rpc::manager::manager_client::ManagerClient;
use telepresence_rpc::{header_matches_from_proto, manager};
use telepresence_tunnel::{ManagerTransport, Transport, accept, dial};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

type Key = (String, String);

/// The caller-side half of an intercept spec that never goes to the manager.
#[derive(Clone)]
struct LocalConfig {
    target: handler::LocalTarget,
    mount: MountIntent,
    env_file: Option<(PathBuf, EnvFormat)>,
}

struct ActiveWiring {
    cancel: CancellationToken,
    mount: Option<mount::Mount>,
}

pub struct InterceptManager {
    manager: ManagerClient<Channel>,
    session: Arc<Mutex<Session>>,
    pub registry: Arc<InterceptRegistry>,
    configs: Mutex<HashMap<Key, LocalConfig>>,
    active: tokio::sync::Mutex<HashMap<Key, ActiveWiring>>,
    cancel: CancellationToken,
}

impl InterceptManager {
    pub fn new(
        manager: ManagerClient<Channel>,
        session: Arc<Mutex<Session>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            session,
            registry: Arc::new(InterceptRegistry::default()),
            configs: Mutex::default(),
            active: tokio::sync::Mutex::default(),
            cancel,
        }
    }

    fn session_info(&self) -> manager::SessionInfo {
        manager::SessionInfo::from(&*self.session.lock())
    }

    pub async fn create(
        &self,
        request: daemon::CreateInterceptRequest,
    ) -> Result<InterceptSummary, DaemonError> {
        let proto_spec = request
            .spec
            .ok_or_else(|| DaemonError::user("missing intercept spec"))?;

        let local_addr: SocketAddr = request
            .local_addr
            .parse()
            .map_err(|_| DaemonError::user(format!("bad local address '{}'", request.local_addr)))?;

        let mechanism = match proto_spec.mechanism.as_str() {
            "tcp" => telepresence_model::Mechanism::Tcp,
            "http-header" => {
                let matches = header_matches_from_proto(&proto_spec.headers);

                for m in &matches {
                    if let HeaderValue::Regex(pattern) = &m.value {
                        regex::Regex::new(pattern).map_err(|e| {
                            DaemonError::user(format!("bad header regex '{pattern}': {e}"))
                        })?;
                    }
                }

                telepresence_model::Mechanism::HttpHeader(matches)
            }
            other => {
                return Err(DaemonError::user(format!("unknown mechanism '{other}'")));
            }
        };

        let mount_intent = match request.mount_point.as_str() {
            "" => MountIntent::None,
            "-" => MountIntent::TempDir,
            path => MountIntent::Path(PathBuf::from(path)),
        };
        let env_file = match request.env_file.as_str() {
            "" => None,
            path => {
                let format = match request.env_format.as_str() {
                    "" | "dotenv" => EnvFormat::Dotenv,
                    "json" => EnvFormat::Json,
                    other => {
                        return Err(DaemonError::user(format!("unknown env format '{other}'")));
                    }
                };

                Some((PathBuf::from(path), format))
            }
        };

        let target_port = u16::try_from(proto_spec.target_port)
            .map_err(|_| DaemonError::user(format!("bad port {}", proto_spec.target_port)))?;

        let spec = InterceptSpec {
            id: InterceptId {
                name: proto_spec.name.clone(),
                workload: proto_spec.workload.clone(),
                namespace: proto_spec.namespace.clone(),
            },
            mechanism,
            target_port,
            local_addr,
            mount: mount_intent.clone(),
            replace: proto_spec.replace,
        };

        let mount_candidate = match &mount_intent {
            MountIntent::Path(path) => Some(path.clone()),
            MountIntent::None | MountIntent::TempDir => None,
        };

        self.registry
            .insert_requested(spec, mount_candidate, Instant::now())
            .map_err(|e| DaemonError::user(e.to_string()))?;

        let key = (proto_spec.name.clone(), proto_spec.namespace.clone());
        self.configs.lock().insert(
            key.clone(),
            LocalConfig {
                target: handler::LocalTarget::Addr(local_addr),
                mount: mount_intent,
                env_file,
            },
        );

        let result = self
            .manager
            .clone()
            .create_intercept(manager::CreateInterceptRequest {
                session: Some(self.session_info()),
                spec: Some(proto_spec),
            })
            .await;

        match result {
            Ok(_) => {
                self.registry.on_manager_ack(&key.0, &key.1, Instant::now());

                Ok(self.summary(&key.0, &key.1))
            }
            Err(status) => {
                self.registry
                    .on_manager_reject(&key.0, &key.1, status.message().to_owned());
                self.configs.lock().remove(&key);

                Err(categorize_status(&status))
            }
        }
    }

    pub async fn remove(&self, name: &str, namespace: &str) -> Result<(), DaemonError> {
        if self.registry.get(name, namespace).is_none() {
            return Err(DaemonError::user(format!(
                "no intercept named '{name}' in namespace '{namespace}'"
            )));
        }

        self.registry.mark_removing(name, namespace);

        self.manager
            .clone()
            .remove_intercept(manager::RemoveInterceptRequest {
                session: Some(self.session_info()),
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            })
            .await
            .map_err(|status| categorize_status(&status))?;

        Ok(())
    }

    /// Applies one manager snapshot and performs the resulting local wiring.
    pub async fn handle_snapshot(&self, snapshot: manager::InterceptInfoSnapshot) {
        let events = self.registry.apply_snapshot(&snapshot.intercepts);

        self.handle_events(events).await;
    }

    /// Fails intercepts whose agent never arrived.
    pub async fn sweep(&self) {
        let events = self.registry.check_timeouts(Instant::now());

        self.handle_events(events).await;
    }

    async fn handle_events(&self, events: Vec<InterceptEvent>) {
        for event in events {
            match event {
                InterceptEvent::BecameActive {
                    name,
                    namespace,
                    runtime,
                } => {
                    if let Err(e) = self.wire_up(&name, &namespace, &runtime).await {
                        tracing::warn!(%name, %namespace, "Failed to wire intercept: {e:#}");
                    }
                }
                InterceptEvent::Failed {
                    name,
                    namespace,
                    reason,
                } => {
                    tracing::warn!(%name, %namespace, "Intercept failed: {reason}");

                    self.unwire(&name, &namespace).await;
                }
                InterceptEvent::Removed {
                    name,
                    namespace,
                    original_replicas,
                } => {
                    if let Some(replicas) = original_replicas {
                        tracing::info!(
                            %name,
                            %namespace,
                            %replicas,
                            "Intercept removed; workload restored to its original replica count"
                        );
                    } else {
                        tracing::info!(%name, %namespace, "Intercept removed");
                    }

                    self.unwire(&name, &namespace).await;
                    self.configs.lock().remove(&(name, namespace));
                }
            }
        }
    }

    async fn wire_up(&self, name: &str, namespace: &str, runtime: &InterceptRuntime) -> Result<()> {
        let config = self
            .configs
            .lock()
            .get(&(name.to_owned(), namespace.to_owned()))
            .cloned()
            .context("No local config for intercept")?;

        let wiring_cancel = self.cancel.child_token();
        let transport: Arc<dyn Transport> = Arc::new(ManagerTransport {
            client: self.manager.clone(),
        });

        // Agent-side connections come in as reverse streams.
        tokio::spawn(reverse_accept_loop(
            transport.clone(),
            self.session.clone(),
            config.target.clone(),
            wiring_cancel.clone(),
        ));

        if let Some((path, format)) = &config.env_file {
            env::write_file(path, &runtime.environment, *format)
                .context("Failed to write environment file")?;
        }

        let mounted = match (&config.mount, runtime.agent_pod_ip, runtime.sftp_port) {
            (MountIntent::None, _, _) => None,
            (intent, Some(agent_ip), Some(sftp_port)) => {
                let local_port = spawn_sftp_forward(
                    transport,
                    self.session.clone(),
                    agent_ip,
                    sftp_port,
                    wiring_cancel.clone(),
                )
                .await
                .context("Failed to forward the SFTP port")?;

                let mounted = mount::mount_remote(intent, local_port)
                    .await
                    .context("Failed to mount remote filesystem")?;

                if let Some(mounted) = &mounted {
                    self.registry.set_mount_point(
                        name,
                        namespace,
                        mounted.mount_point().to_owned(),
                    );
                }

                mounted
            }
            (_, _, _) => {
                tracing::warn!(%name, "Mount requested but the agent exposes no SFTP port");

                None
            }
        };

        self.active.lock().await.insert(
            (name.to_owned(), namespace.to_owned()),
            ActiveWiring {
                cancel: wiring_cancel,
                mount: mounted,
            },
        );

        Ok(())
    }

    async fn unwire(&self, name: &str, namespace: &str) {
        let wiring = self
            .active
            .lock()
            .await
            .remove(&(name.to_owned(), namespace.to_owned()));

        let Some(wiring) = wiring else { return };

        wiring.cancel.cancel();

        if let Some(mounted) = wiring.mount {
            if let Err(e) = mounted.unmount().await {
                tracing::warn!(%name, "Failed to unmount: {e:#}");
            }
        }
    }

    /// Best-effort cleanup on disconnect or crash-adjacent shutdown: every
    /// live intercept is removed so replace-mode workloads scale back up.
    pub async fn shutdown(&self) {
        let entries = self.registry.snapshot();

        for entry in entries {
            if entry.state.is_terminal() {
                continue;
            }

            let name = entry.spec.id.name.clone();
            let namespace = entry.spec.id.namespace.clone();

            if let Err(e) = self.remove(&name, &namespace).await {
                tracing::warn!(%name, "Failed to remove intercept on shutdown: {e}");
            }

            self.unwire(&name, &namespace).await;
        }
    }

    pub fn summary(&self, name: &str, namespace: &str) -> InterceptSummary {
        match self.registry.get(name, namespace) {
            Some(entry) => InterceptSummary {
                name: entry.spec.id.name,
                namespace: entry.spec.id.namespace,
                workload: entry.spec.id.workload,
                state: entry.state.to_string(),
                mount_point: entry
                    .mount_point
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
            },
            None => InterceptSummary {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
                workload: String::new(),
                state: "REMOVED".to_owned(),
                mount_point: String::new(),
            },
        }
    }

    pub fn summaries(&self) -> Vec<InterceptSummary> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|entry| InterceptSummary {
                name: entry.spec.id.name,
                namespace: entry.spec.id.namespace,
                workload: entry.spec.id.workload,
                state: entry.state.to_string(),
                mount_point: entry
                    .mount_point
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

fn categorize_status(status: &tonic::Status) -> DaemonError {
    match status.code() {
        tonic::Code::InvalidArgument | tonic::Code::NotFound => {
            DaemonError::user(status.message().to_owned())
        }
        tonic::Code::FailedPrecondition => DaemonError::config(status.message().to_owned()),
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
            DaemonError::transient(status.message().to_owned())
        }
        _ => DaemonError::fatal(status.message().to_owned()),
    }
}

/// Keeps one reverse pipe pending at the manager; every stream accepted on it
/// is one agent-side connection, handed to the local target.
async fn reverse_accept_loop(
    transport: Arc<dyn Transport>,
    session: Arc<Mutex<Session>>,
    target: handler::LocalTarget,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let pipe = tokio::select! {
            () = cancel.cancelled() => break,
            pipe = transport.open() => pipe,
        };

        let (sink, source) = match pipe {
            Ok(pipe) => pipe,
            Err(e) => {
                tracing::debug!("Failed to open reverse pipe: {e:#}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let session_id = session.lock().id.clone();
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = accept(sink, source, &session_id, cancel.child_token()) => accepted,
        };

        match accepted {
            Ok((id, stream)) => {
                tracing::debug!(%id, "Accepted agent-side connection");

                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler::handle_stream(stream, &target).await {
                        tracing::debug!("Stream handler failed: {e:#}");
                    }
                });
            }
            Err(e) => {
                tracing::debug!("Reverse accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Binds a local port whose connections are tunnelled to the agent's SFTP
/// server.
async fn spawn_sftp_forward(
    transport: Arc<dyn Transport>,
    session: Arc<Mutex<Session>>,
    agent_ip: IpAddr,
    sftp_port: u16,
    cancel: CancellationToken,
) -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to bind forward port")?;
    let local_port = listener.local_addr()?.port();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (tcp, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!("Forward accept failed: {e}");
                    break;
                }
            };

            let id = telepresence_model::ConnectionId::new(
                Protocol::Tcp,
                peer,
                SocketAddr::new(agent_ip, sftp_port),
            );
            let session_id = session.lock().id.clone();
            let transport = transport.clone();
            let cancel = cancel.child_token();

            tokio::spawn(async move {
                match dial(transport.as_ref(), &session_id, id, cancel).await {
                    Ok(stream) => {
                        let (read_half, write_half) = tcp.into_split();

                        if let Err(e) = handler::pump(stream, read_half, write_half).await {
                            tracing::debug!("SFTP forward failed: {e:#}");
                        }
                    }
                    Err(e) => tracing::debug!("Failed to dial SFTP stream: {e}"),
                }
            });
        }
    });

    Ok(local_port)
}
