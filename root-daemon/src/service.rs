use crate::factory::{ManagerDnsResolver, RelayStreamFactory};
use anyhow::{Context as _, Result};
use bufferpool::BufferPool;
use std::net::Ipv4Addr;
use std::sync::Arc;
use telepresence_model::{Session, SubnetSnapshot};
use telepresence_netstack::Netstack;
use telepresence_router::{Router, RoutingView};
use telepresence_rpc::daemon::connector_client::ConnectorClient;
use telepresence_rpc::daemon::root_server::Root;
use telepresence_rpc::daemon::{Empty, RootStatus, SessionDescriptor};
use telepresence_rpc::{manager, subnet_to_proto};
use telepresence_tunnel::ConnectorTransport;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// The virtual interface's own addresses; private and never routed anywhere.
const VIF_IPV4: Ipv4Addr = Ipv4Addr::new(100, 64, 78, 1);
const VIF_IPV6: std::net::Ipv6Addr = std::net::Ipv6Addr::new(0xfd00, 0x7e1e, 0, 0, 0, 0, 0, 1);

struct ActiveSession {
    session: Session,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<SubnetSnapshot>,
    view: Arc<parking_lot::RwLock<RoutingView>>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct RootService {
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl RootService {
    pub fn new() -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
        }
    }

    async fn start_session(&self, descriptor: SessionDescriptor) -> Result<ActiveSession> {
        let session = Session::try_from(manager::SessionInfo {
            session_id: descriptor.session_id,
            expires_at: descriptor.expires_at,
        })
        .context("Bad session descriptor")?;

        let connector = ConnectorClient::new(
            telepresence_rpc::uds::connect(&descriptor.connector_socket)
                .await
                .context("Failed to reach the user daemon")?,
        );

        let cancel = CancellationToken::new();

        // Routing first; a session without routes is useless.
        let route_ops = platform_route_ops()?;
        let (router, view, dns_rx) = Router::new(route_ops);
        let (snapshot_tx, snapshot_rx) = watch::channel(SubnetSnapshot::default());

        let pool = BufferPool::new(ip_packet::MTU, "tun");
        let tun_device = make_tun(pool.clone()).await?;

        let factory = RelayStreamFactory {
            transport: Arc::new(ConnectorTransport {
                client: connector.clone(),
            }),
            session: session.id.clone(),
            view: view.clone(),
            cancel: cancel.clone(),
        };
        let resolver = ManagerDnsResolver {
            client: connector,
            session: manager::SessionInfo::from(&session),
            view: view.clone(),
        };

        let netstack = Netstack::new(pool, Arc::new(factory), Arc::new(resolver), dns_rx);

        supervise("router", cancel.clone(), {
            let cancel = cancel.clone();

            router.run(snapshot_rx, cancel)
        });
        supervise("netstack", cancel.clone(), {
            let cancel = cancel.clone();

            netstack.run(tun_device, cancel)
        });

        tracing::info!(session = %session.id, "Session established");

        Ok(ActiveSession {
            session,
            cancel,
            snapshot_tx,
            view,
        })
    }
}

#[cfg(target_os = "linux")]
fn platform_route_ops() -> Result<telepresence_router::linux::RouteManager> {
    telepresence_router::linux::RouteManager::new().context("Routing subsystem unavailable")
}

#[cfg(target_os = "linux")]
async fn make_tun(pool: BufferPool) -> Result<tun::TunDevice> {
    let device = tun::TunDevice::new(pool).context("Failed to open TUN device")?;

    // The device exists now; give it addresses and bring it up.
    telepresence_router::linux::RouteManager::new()?
        .setup_interface(VIF_IPV4, Some(VIF_IPV6), ip_packet::MTU as u32)
        .await
        .context("Failed to configure TUN interface")?;

    Ok(device)
}

/// Runs a session task to completion; a failure or panic tears the session
/// down but never the daemon process.
fn supervise<F, E>(name: &'static str, session_cancel: CancellationToken, task: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let handle = tokio::spawn(task);

    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(())) => tracing::debug!("{name} finished"),
            Ok(Err(e)) => {
                tracing::error!("{name} failed fatally: {e}");
                session_cancel.cancel();
            }
            Err(join_error) if join_error.is_panic() => {
                // The stack trace is in the panic hook output above.
                tracing::error!("{name} panicked; tearing the session down");
                session_cancel.cancel();
            }
            Err(_) => {}
        }
    });
}

#[tonic::async_trait]
impl Root for RootService {
    async fn set_session(
        &self,
        request: Request<SessionDescriptor>,
    ) -> Result<Response<Empty>, Status> {
        let descriptor = request.into_inner();
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            tracing::info!(session = %previous.session.id, "Replacing existing session");
        }

        let session = self
            .start_session(descriptor)
            .await
            .map_err(|e| Status::internal(format!("{e:#}")))?;

        *active = Some(session);

        Ok(Response::new(Empty {}))
    }

    async fn clear_session(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        if let Some(session) = self.active.lock().await.take() {
            tracing::info!(session = %session.session.id, "Clearing session");
        }

        Ok(Response::new(Empty {}))
    }

    async fn apply_subnets(
        &self,
        request: Request<manager::ClusterInfo>,
    ) -> Result<Response<Empty>, Status> {
        let snapshot = SubnetSnapshot::try_from(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let active = self.active.lock().await;
        let Some(session) = active.as_ref() else {
            return Err(Status::failed_precondition("no active session"));
        };

        session
            .snapshot_tx
            .send(snapshot)
            .map_err(|_| Status::internal("router is gone"))?;

        Ok(Response::new(Empty {}))
    }

    async fn status(&self, _request: Request<Empty>) -> Result<Response<RootStatus>, Status> {
        let active = self.active.lock().await;

        let status = match active.as_ref() {
            Some(session) => RootStatus {
                session_active: true,
                routes: session
                    .view
                    .read()
                    .routes
                    .iter()
                    .copied()
                    .map(subnet_to_proto)
                    .collect(),
            },
            None => RootStatus {
                session_active: false,
                routes: Vec::new(),
            },
        };

        Ok(Response::new(status))
    }
}
