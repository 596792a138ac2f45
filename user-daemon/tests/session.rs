#![allow(clippy::unwrap_used)]

//! Session lifecycle against an in-process stub traffic manager.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use telepresence_model::Session;
use telepresence_rpc::manager::manager_client::ManagerClient;
use telepresence_rpc::manager::manager_server::{Manager, ManagerServer};
use telepresence_rpc::manager::{
    ClientInfo, ClusterInfo, CreateInterceptRequest, Empty, InterceptInfo, InterceptInfoSnapshot,
    ListWorkloadsRequest, LookupDnsRequest, LookupDnsResponse, RemainRequest,
    RemoveInterceptRequest, SessionInfo, TunnelMessage, UpdateInterceptRequest, WorkloadInfoList,
};
use telepresence_user_daemon::session::{SessionHealth, SessionWorker, arrive, depart};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

#[derive(Default, Clone)]
struct StubManager {
    sessions: Arc<Mutex<HashMap<String, ()>>>,
    next_id: Arc<AtomicU64>,
    /// Simulates a dead manager: every RPC answers `unavailable`.
    down: Arc<AtomicBool>,
}

impl StubManager {
    fn check_up(&self) -> Result<(), Status> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Status::unavailable("manager is down"));
        }

        Ok(())
    }

    fn expiry() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};

        (SystemTime::now() + Duration::from_secs(300))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}

type Unimplemented<T> = Result<Response<T>, Status>;

#[tonic::async_trait]
impl Manager for StubManager {
    type WatchClusterInfoStream =
        Pin<Box<dyn Stream<Item = Result<ClusterInfo, Status>> + Send>>;
    type WatchInterceptsStream =
        Pin<Box<dyn Stream<Item = Result<InterceptInfoSnapshot, Status>> + Send>>;
    type TunnelStream = Pin<Box<dyn Stream<Item = Result<TunnelMessage, Status>> + Send>>;

    async fn arrive_as_client(
        &self,
        _request: Request<ClientInfo>,
    ) -> Result<Response<SessionInfo>, Status> {
        self.check_up()?;

        let id = format!("sess-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sessions.lock().insert(id.clone(), ());

        Ok(Response::new(SessionInfo {
            session_id: id,
            expires_at: Self::expiry(),
        }))
    }

    async fn depart(&self, request: Request<SessionInfo>) -> Result<Response<Empty>, Status> {
        self.check_up()?;
        self.sessions.lock().remove(&request.into_inner().session_id);

        Ok(Response::new(Empty {}))
    }

    async fn remain(
        &self,
        request: Request<RemainRequest>,
    ) -> Result<Response<SessionInfo>, Status> {
        self.check_up()?;

        let session = request
            .into_inner()
            .session
            .ok_or_else(|| Status::invalid_argument("missing session"))?;

        if !self.sessions.lock().contains_key(&session.session_id) {
            return Err(Status::not_found("unknown session"));
        }

        Ok(Response::new(SessionInfo {
            session_id: session.session_id,
            expires_at: Self::expiry(),
        }))
    }

    async fn watch_cluster_info(
        &self,
        _request: Request<SessionInfo>,
    ) -> Unimplemented<Self::WatchClusterInfoStream> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn watch_intercepts(
        &self,
        _request: Request<SessionInfo>,
    ) -> Unimplemented<Self::WatchInterceptsStream> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn create_intercept(
        &self,
        _request: Request<CreateInterceptRequest>,
    ) -> Unimplemented<InterceptInfo> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn update_intercept(
        &self,
        _request: Request<UpdateInterceptRequest>,
    ) -> Unimplemented<InterceptInfo> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn remove_intercept(
        &self,
        _request: Request<RemoveInterceptRequest>,
    ) -> Unimplemented<Empty> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn list_workloads(
        &self,
        _request: Request<ListWorkloadsRequest>,
    ) -> Unimplemented<WorkloadInfoList> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn lookup_dns(
        &self,
        _request: Request<LookupDnsRequest>,
    ) -> Unimplemented<LookupDnsResponse> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn tunnel(
        &self,
        _request: Request<Streaming<TunnelMessage>>,
    ) -> Unimplemented<Self::TunnelStream> {
        Err(Status::unimplemented("not needed by these tests"))
    }
}

async fn spawn_stub() -> (StubManager, ManagerClient<Channel>) {
    let stub = StubManager::default();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(
        Server::builder()
            .add_service(ManagerServer::new(stub.clone()))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener)),
    );

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();

    (stub, ManagerClient::new(channel))
}

fn client_info() -> ClientInfo {
    ClientInfo {
        name: "laptop".to_owned(),
        install_id: "test".to_owned(),
        version: "0.0.0".to_owned(),
        api_key: String::new(),
    }
}

fn spawn_worker(
    client: ManagerClient<Channel>,
    session: Session,
) -> (
    Arc<Mutex<Session>>,
    watch::Receiver<SessionHealth>,
    mpsc::Receiver<Session>,
    CancellationToken,
) {
    let session = Arc::new(Mutex::new(session));
    let (health_tx, health_rx) = watch::channel(SessionHealth::Healthy);
    let (renewed_tx, renewed_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    tokio::spawn(
        SessionWorker {
            client,
            client_info: client_info(),
            session: session.clone(),
            health_tx,
            renewed_tx,
        }
        .run(cancel.clone()),
    );

    (session, health_rx, renewed_rx, cancel)
}

#[tokio::test]
async fn arrive_then_depart_restores_manager_state() {
    let (stub, mut client) = spawn_stub().await;

    assert!(stub.sessions.lock().is_empty());

    let session = arrive(&mut client, client_info()).await.unwrap();
    assert_eq!(stub.sessions.lock().len(), 1);

    depart(&mut client, &session).await;
    assert!(stub.sessions.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dead_manager_degrades_within_three_keepalives_and_recovers() {
    let (stub, mut client) = spawn_stub().await;
    let session = arrive(&mut client, client_info()).await.unwrap();
    let original_id = session.id.clone();

    let (shared_session, health, _renewed, cancel) = spawn_worker(client, session);

    // A healthy keep-alive round first.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(*health.borrow(), SessionHealth::Healthy);

    // Kill the manager between keep-alives.
    stub.down.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        *health.borrow(),
        SessionHealth::Degraded,
        "three missed keep-alives must degrade the session"
    );

    // The manager comes back with the same identity: the session recovers
    // silently and keeps its id.
    stub.down.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(*health.borrow(), SessionHealth::Healthy);
    assert_eq!(shared_session.lock().id, original_id);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn forgotten_session_is_reestablished_silently() {
    let (stub, mut client) = spawn_stub().await;
    let session = arrive(&mut client, client_info()).await.unwrap();
    let original_id = session.id.clone();

    let (shared_session, health, mut renewed, cancel) = spawn_worker(client, session);

    // The manager restarts and forgets every session.
    stub.sessions.lock().clear();

    tokio::time::sleep(Duration::from_secs(11)).await;

    let new_session = tokio::time::timeout(Duration::from_secs(30), renewed.recv())
        .await
        .expect("worker should re-arrive")
        .unwrap();

    assert_ne!(new_session.id, original_id);
    assert_eq!(shared_session.lock().id, new_session.id);
    assert_eq!(*health.borrow(), SessionHealth::Healthy);

    cancel.cancel();
}
