//! The control socket service: CLI commands in the front, manager RPCs and
//! root daemon plumbing out the back.

use crate::error::{DaemonError, retry_transient};
use crate::intercepts::InterceptManager;
use crate::session::{self, SessionHealth, SessionWorker};
use futures::StreamExt as _;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use telepresence_model::Session;
use telepresence_rpc::daemon::connector_server::Connector;
use telepresence_rpc::daemon::{
    ConnectInfo, ConnectRequest, CreateInterceptRequest, Empty, ErrorCategory, InterceptSummary,
    ListRequest, RemoveInterceptRequest, SessionDescriptor, VersionInfo,
};
use telepresence_rpc::manager::manager_client::ManagerClient;
use telepresence_rpc::manager::{self, TunnelMessage, WorkloadInfoList};
use telepresence_rpc::API_VERSION;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};

use telepresence_rpc::daemon::root_client::RootClient;

pub fn root_socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TELEPRESENCE_ROOT_SOCKET") {
        return PathBuf::from(path);
    }

    known_dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rootd.sock")
}

struct Connection {
    name: String,
    manager: ManagerClient<Channel>,
    root: RootClient<Channel>,
    session: Arc<Mutex<Session>>,
    health: watch::Receiver<SessionHealth>,
    intercepts: Arc<InterceptManager>,
    /// The last cluster-announced subnets, for `Status`.
    subnets: Arc<Mutex<Vec<manager::Subnet>>>,
    cancel: CancellationToken,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ConnectorService {
    active: tokio::sync::Mutex<Option<Connection>>,
    shutdown: CancellationToken,
    /// Our own socket path; the root daemon dials streams back through it.
    connector_socket: PathBuf,
}

impl ConnectorService {
    pub fn new(shutdown: CancellationToken, connector_socket: PathBuf) -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
            shutdown,
            connector_socket,
        }
    }

    async fn establish(&self, request: ConnectRequest) -> Result<Connection, DaemonError> {
        let manager_addr = if request.manager_addr.starts_with("http") {
            request.manager_addr.clone()
        } else {
            format!("http://{}", request.manager_addr)
        };

        let channel = retry_transient("connect to traffic manager", || {
            let manager_addr = manager_addr.clone();

            async move {
                tonic::transport::Endpoint::from_shared(manager_addr)?
                    .connect()
                    .await
            }
        })
        .await
        .map_err(|e| {
            DaemonError::config(format!(
                "traffic manager at '{manager_addr}' is unreachable ({e}); \
                 check your kube context and that telepresence is installed in the cluster"
            ))
        })?;

        let mut manager = ManagerClient::new(channel);

        let client_info = manager::ClientInfo {
            name: request.name.clone(),
            install_id: std::env::var("TELEPRESENCE_INSTALL_ID").unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            api_key: request.bearer_token.clone(),
        };

        let session = session::arrive(&mut manager, client_info.clone())
            .await
            .map_err(|e| DaemonError::transient(format!("{e:#}")))?;

        if let Err(e) = known_dirs::save_session_token(&request.name, session.id.as_str()) {
            tracing::warn!("Failed to persist session token: {e:#}");
        }

        // Hand the session to the root daemon; it owns TUN, stack and routes.
        let root_socket = root_socket_path();
        let mut root = RootClient::new(
            telepresence_rpc::uds::connect(&root_socket)
                .await
                .map_err(|e| {
                    DaemonError::config(format!(
                        "root daemon at '{}' is not running ({e:#})",
                        root_socket.display()
                    ))
                })?,
        );

        root.set_session(SessionDescriptor {
            session_id: session.id.as_str().to_owned(),
            expires_at: manager::SessionInfo::from(&session).expires_at,
            connector_socket: self.connector_socket.display().to_string(),
        })
        .await
        .map_err(|status| DaemonError::fatal(format!("root daemon rejected session: {status}")))?;

        let cancel = CancellationToken::new();
        let session = Arc::new(Mutex::new(session));
        let (health_tx, health) = watch::channel(SessionHealth::Healthy);
        let (renewed_tx, mut renewed_rx) = mpsc::channel(1);

        tokio::spawn(
            SessionWorker {
                client: manager.clone(),
                client_info,
                session: session.clone(),
                health_tx,
                renewed_tx,
            }
            .run(cancel.clone()),
        );

        // A renewed session must reach the root daemon or its streams die
        // with SESSION_EXPIRED.
        tokio::spawn({
            let mut root = root.clone();
            let connector_socket = self.connector_socket.display().to_string();
            let cancel = cancel.clone();

            async move {
                loop {
                    let renewed: Session = tokio::select! {
                        () = cancel.cancelled() => break,
                        renewed = renewed_rx.recv() => match renewed {
                            Some(renewed) => renewed,
                            None => break,
                        }
                    };

                    let descriptor = SessionDescriptor {
                        session_id: renewed.id.as_str().to_owned(),
                        expires_at: manager::SessionInfo::from(&renewed).expires_at,
                        connector_socket: connector_socket.clone(),
                    };

                    if let Err(status) = root.set_session(descriptor).await {
                        tracing::warn!("Failed to update root daemon session: {status}");
                    }
                }
            }
        });

        let intercepts = Arc::new(InterceptManager::new(
            manager.clone(),
            session.clone(),
            cancel.clone(),
        ));
        let subnets = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(watch_cluster_info(
            manager.clone(),
            root.clone(),
            session.clone(),
            subnets.clone(),
            cancel.clone(),
        ));
        tokio::spawn(watch_intercepts(
            manager.clone(),
            session.clone(),
            intercepts.clone(),
            cancel.clone(),
        ));
        tokio::spawn({
            let intercepts = intercepts.clone();
            let cancel = cancel.clone();

            async move {
                let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
                sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = sweep.tick() => intercepts.sweep().await,
                    }
                }
            }
        });

        let info = known_dirs::DaemonInfo {
            name: request.name.clone(),
            kube_context: request.kube_context.clone(),
            namespace: request.namespace.clone(),
            socket_path: self.connector_socket.clone(),
            in_container: std::env::var_os("TELEPRESENCE_CONTAINER").is_some(),
        };
        if let Err(e) = known_dirs::save_daemon_info(&info) {
            tracing::warn!("Failed to write daemon info: {e:#}");
        }

        Ok(Connection {
            name: request.name,
            manager,
            root,
            session,
            health,
            intercepts,
            subnets,
            cancel,
        })
    }

    fn connect_info(&self, connection: &Connection) -> ConnectInfo {
        let session = connection.session.lock();
        let session_info = manager::SessionInfo::from(&*session);

        let (error_category, error_text) = match *connection.health.borrow() {
            SessionHealth::Healthy => (ErrorCategory::Unspecified, String::new()),
            SessionHealth::Degraded => (
                ErrorCategory::Unknown,
                "traffic manager is unreachable; retrying".to_owned(),
            ),
        };

        ConnectInfo {
            error_category: error_category.into(),
            error_text,
            session_id: session_info.session_id,
            session_expires_at: session_info.expires_at,
            subnets: connection.subnets.lock().clone(),
            intercepts: connection.intercepts.summaries(),
        }
    }

    fn not_connected() -> ConnectInfo {
        ConnectInfo {
            error_category: ErrorCategory::User.into(),
            error_text: "not connected".to_owned(),
            ..Default::default()
        }
    }
}

async fn watch_cluster_info(
    mut manager: ManagerClient<Channel>,
    mut root: RootClient<Channel>,
    session: Arc<Mutex<Session>>,
    subnets: Arc<Mutex<Vec<manager::Subnet>>>,
    cancel: CancellationToken,
) {
    loop {
        let session_info = manager::SessionInfo::from(&*session.lock());

        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            stream = manager.watch_cluster_info(session_info) => stream,
        };

        let mut stream = match stream {
            Ok(response) => response.into_inner(),
            Err(status) => {
                tracing::debug!("WatchClusterInfo failed: {status}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return,
                message = stream.next() => message,
            };

            let info = match message {
                Some(Ok(info)) => info,
                Some(Err(status)) => {
                    tracing::debug!("Cluster info stream failed: {status}");
                    break;
                }
                None => break,
            };

            *subnets.lock() = info.cluster_subnets.clone();

            if let Err(status) = root.apply_subnets(info).await {
                tracing::warn!("Root daemon rejected subnet snapshot: {status}");
            }
        }
    }
}

async fn watch_intercepts(
    mut manager: ManagerClient<Channel>,
    session: Arc<Mutex<Session>>,
    intercepts: Arc<InterceptManager>,
    cancel: CancellationToken,
) {
    loop {
        let session_info = manager::SessionInfo::from(&*session.lock());

        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            stream = manager.watch_intercepts(session_info) => stream,
        };

        let mut stream = match stream {
            Ok(response) => response.into_inner(),
            Err(status) => {
                tracing::debug!("WatchIntercepts failed: {status}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(snapshot)) => intercepts.handle_snapshot(snapshot).await,
                Some(Err(status)) => {
                    tracing::debug!("Intercept stream failed: {status}");
                    break;
                }
                None => break,
            }
        }
    }
}

#[tonic::async_trait]
impl Connector for ConnectorService {
    type TunnelStream = Pin<Box<dyn futures::Stream<Item = Result<TunnelMessage, Status>> + Send>>;

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectInfo>, Status> {
        let request = request.into_inner();
        let mut active = self.active.lock().await;

        if let Some(connection) = active.as_ref() {
            tracing::debug!(name = %connection.name, "Already connected");

            return Ok(Response::new(self.connect_info(connection)));
        }

        match self.establish(request).await {
            Ok(connection) => {
                let info = self.connect_info(&connection);
                *active = Some(connection);

                Ok(Response::new(info))
            }
            Err(e) => Ok(Response::new(ConnectInfo {
                error_category: e.wire_category().into(),
                error_text: e.message,
                ..Default::default()
            })),
        }
    }

    async fn disconnect(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        let Some(connection) = self.active.lock().await.take() else {
            return Ok(Response::new(Empty {}));
        };

        connection.intercepts.shutdown().await;

        let session = connection.session.lock().clone();
        session::depart(&mut connection.manager.clone(), &session).await;

        if let Err(status) = connection.root.clone().clear_session(Empty {}).await {
            tracing::warn!("Failed to clear root daemon session: {status}");
        }

        known_dirs::remove_daemon_info(&connection.name).ok();

        tracing::info!(name = %connection.name, "Disconnected");

        Ok(Response::new(Empty {}))
    }

    async fn status(&self, _request: Request<Empty>) -> Result<Response<ConnectInfo>, Status> {
        let active = self.active.lock().await;

        let info = match active.as_ref() {
            Some(connection) => self.connect_info(connection),
            None => Self::not_connected(),
        };

        Ok(Response::new(info))
    }

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<WorkloadInfoList>, Status> {
        let namespace = request.into_inner().namespace;
        let active = self.active.lock().await;
        let Some(connection) = active.as_ref() else {
            return Err(Status::failed_precondition("not connected"));
        };

        let session = manager::SessionInfo::from(&*connection.session.lock());
        let workloads = connection
            .manager
            .clone()
            .list_workloads(manager::ListWorkloadsRequest {
                session: Some(session),
                namespace,
            })
            .await?
            .into_inner();

        Ok(Response::new(workloads))
    }

    async fn create_intercept(
        &self,
        request: Request<CreateInterceptRequest>,
    ) -> Result<Response<InterceptSummary>, Status> {
        let request = request.into_inner();
        let active = self.active.lock().await;
        let Some(connection) = active.as_ref() else {
            return Err(Status::failed_precondition("not connected"));
        };

        let summary = connection
            .intercepts
            .create(request)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(summary))
    }

    async fn remove_intercept(
        &self,
        request: Request<RemoveInterceptRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        let active = self.active.lock().await;
        let Some(connection) = active.as_ref() else {
            return Err(Status::failed_precondition("not connected"));
        };

        connection
            .intercepts
            .remove(&request.name, &request.namespace)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(Empty {}))
    }

    async fn version(&self, _request: Request<Empty>) -> Result<Response<VersionInfo>, Status> {
        Ok(Response::new(VersionInfo {
            api: API_VERSION,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }))
    }

    async fn quit(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        tracing::info!("Quit requested");

        self.disconnect(Request::new(Empty {})).await?;
        self.shutdown.cancel();

        Ok(Response::new(Empty {}))
    }

    async fn tunnel(
        &self,
        request: Request<Streaming<TunnelMessage>>,
    ) -> Result<Response<Self::TunnelStream>, Status> {
        let (manager, session_id) = {
            let active = self.active.lock().await;
            let Some(connection) = active.as_ref() else {
                return Err(Status::failed_precondition("not connected"));
            };

            (
                connection.manager.clone(),
                connection.session.lock().id.clone(),
            )
        };

        let mut inbound = request.into_inner();

        // The first frame must be a CONNECT for our session; reject anything else.
        let first = inbound
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("stream closed before CONNECT"))??;

        let (frame, _) = telepresence_tunnel::Frame::decode(&first.frame)
            .map_err(|e| Status::invalid_argument(format!("bad frame: {e:#}")))?;

        if frame.kind != telepresence_tunnel::FrameKind::Connect {
            return Err(Status::invalid_argument("expected CONNECT"));
        }

        let (peer_session, id) = telepresence_tunnel::parse_connect(&frame.payload)
            .map_err(|e| Status::invalid_argument(format!("bad CONNECT: {e:#}")))?;

        if peer_session != session_id {
            return Err(Status::permission_denied("unknown session"));
        }

        tracing::debug!(%id, "Relaying tunnel stream to the manager");

        // Pipe the already-consumed CONNECT plus everything after it upstream.
        let (upstream_tx, upstream_rx) = mpsc::channel(16);
        upstream_tx
            .send(first)
            .await
            .map_err(|_| Status::internal("relay channel closed"))?;

        let upstream = manager
            .clone()
            .tunnel(ReceiverStream::new(upstream_rx))
            .await?
            .into_inner();

        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(status) => {
                        tracing::debug!("Relay inbound failed: {status}");
                        break;
                    }
                };

                if upstream_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        let outbound: Self::TunnelStream = Box::pin(upstream);

        Ok(Response::new(outbound))
    }

    async fn lookup_dns(
        &self,
        request: Request<manager::LookupDnsRequest>,
    ) -> Result<Response<manager::LookupDnsResponse>, Status> {
        let mut request = request.into_inner();
        let active = self.active.lock().await;
        let Some(connection) = active.as_ref() else {
            return Err(Status::failed_precondition("not connected"));
        };

        let session = manager::SessionInfo::from(&*connection.session.lock());

        match &request.session {
            Some(peer_session) if peer_session.session_id == session.session_id => {}
            Some(_) | None => return Err(Status::permission_denied("unknown session")),
        }
        request.session = Some(session);

        let response = connection.manager.clone().lookup_dns(request).await?;

        Ok(Response::new(response.into_inner()))
    }
}
