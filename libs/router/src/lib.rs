#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Reconciles the host routing table and DNS configuration against the
//! cluster-announced subnet snapshots.

mod reconcile;

#[cfg(target_os = "linux")]
pub mod linux;

pub use reconcile::desired_routes;

use anyhow::Result;
use ip_network::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use telepresence_model::SubnetSnapshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Route-level failures are reported and skipped; kernel failures are fatal
/// to the root daemon.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("failed to apply route {route}: {message}")]
    Route { route: IpNetwork, message: String },
    #[error("kernel routing subsystem failed: {0}")]
    Kernel(#[source] anyhow::Error),
}

/// Platform route operations. One implementation per platform; all of them
/// must be idempotent for add and remove.
pub trait RouteOps: Send + Sync + 'static {
    fn add_route(&self, net: IpNetwork) -> impl Future<Output = Result<(), RouteError>> + Send;
    fn remove_route(&self, net: IpNetwork) -> impl Future<Output = Result<(), RouteError>> + Send;

    /// An existing host route (not ours) that overlaps `net`, if any.
    fn host_conflict(
        &self,
        net: IpNetwork,
    ) -> impl Future<Output = Result<Option<IpNetwork>, RouteError>> + Send;
}

/// What flow classifiers and the DNS interceptor read.
///
/// Swapped wholesale per snapshot so no reader ever observes a
/// partially-applied one.
#[derive(Debug, Clone, Default)]
pub struct RoutingView {
    /// Routes currently installed via the virtual interface.
    pub routes: HashSet<IpNetwork>,
    /// Destinations that must never traverse the virtual interface.
    pub never_proxy: Vec<IpNetwork>,
    pub dns_include_suffixes: Vec<String>,
    pub dns_exclude_suffixes: Vec<String>,
}

impl RoutingView {
    pub fn is_proxied(&self, ip: IpAddr) -> bool {
        self.routes.iter().any(|net| net.contains(ip))
    }

    pub fn is_never_proxied(&self, ip: IpAddr) -> bool {
        self.never_proxy.iter().any(|net| net.contains(ip))
    }
}

/// Whether `outer` contains all of `inner`.
fn covers(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    match (outer, inner) {
        (IpNetwork::V4(outer), IpNetwork::V4(inner)) => {
            outer.netmask() <= inner.netmask() && outer.contains(inner.network_address())
        }
        (IpNetwork::V6(outer), IpNetwork::V6(inner)) => {
            outer.netmask() <= inner.netmask() && outer.contains(inner.network_address())
        }
        (IpNetwork::V4(_), IpNetwork::V6(_)) | (IpNetwork::V6(_), IpNetwork::V4(_)) => false,
    }
}

pub struct Router<R> {
    ops: R,
    installed: HashSet<IpNetwork>,
    view: Arc<RwLock<RoutingView>>,
    /// Resolver addresses for the DNS interceptor.
    dns_tx: watch::Sender<Vec<IpAddr>>,
}

impl<R> Router<R>
where
    R: RouteOps,
{
    pub fn new(ops: R) -> (Self, Arc<RwLock<RoutingView>>, watch::Receiver<Vec<IpAddr>>) {
        let view = Arc::new(RwLock::new(RoutingView::default()));
        let (dns_tx, dns_rx) = watch::channel(Vec::new());

        let router = Self {
            ops,
            installed: HashSet::default(),
            view: view.clone(),
            dns_tx,
        };

        (router, view, dns_rx)
    }

    /// Applies snapshots until cancelled, then removes all installed routes.
    ///
    /// `snapshots` is a watch channel, so snapshots arriving while one is
    /// being applied coalesce; only the latest pending one is applied next.
    pub async fn run(
        mut self,
        mut snapshots: watch::Receiver<SubnetSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), RouteError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let snapshot = snapshots.borrow_and_update().clone();
            self.apply(&snapshot).await?;
        }

        self.teardown().await;

        Ok(())
    }

    /// Reconciles the host table against one authoritative snapshot.
    pub async fn apply(&mut self, snapshot: &SubnetSnapshot) -> Result<(), RouteError> {
        let desired = reconcile::desired_routes(snapshot);

        tracing::info!(routes = desired.len(), "Applying subnet snapshot");

        for stale in self.installed.difference(&desired).copied().collect::<Vec<_>>() {
            match self.ops.remove_route(stale).await {
                Ok(()) => {
                    self.installed.remove(&stale);
                }
                Err(RouteError::Route { route, message }) => {
                    tracing::warn!(%route, "Failed to remove route: {message}");
                    self.installed.remove(&stale);
                }
                Err(fatal @ RouteError::Kernel(_)) => return Err(fatal),
            }
        }

        for missing in desired.difference(&self.installed).copied().collect::<Vec<_>>() {
            match self.ops.host_conflict(missing).await? {
                Some(conflict)
                    if !snapshot
                        .allow_conflict
                        .iter()
                        .any(|allowed| covers(allowed, &missing)) =>
                {
                    tracing::warn!(
                        route = %missing,
                        %conflict,
                        "Skipping route; it overlaps an existing host route"
                    );
                    continue;
                }
                Some(_) | None => {}
            }

            match self.ops.add_route(missing).await {
                Ok(()) => {
                    self.installed.insert(missing);
                }
                Err(RouteError::Route { route, message }) => {
                    tracing::warn!(%route, "Failed to add route: {message}");
                }
                Err(fatal @ RouteError::Kernel(_)) => return Err(fatal),
            }
        }

        // Swap the reader view in one go.
        *self.view.write() = RoutingView {
            routes: self.installed.clone(),
            never_proxy: snapshot.never_proxy.clone(),
            dns_include_suffixes: snapshot.dns.include_suffixes.clone(),
            dns_exclude_suffixes: snapshot.dns.exclude_suffixes.clone(),
        };
        self.dns_tx.send_replace(snapshot.dns.remote_addrs.clone());

        Ok(())
    }

    /// Restores the host routing table on teardown.
    async fn teardown(&mut self) {
        for route in std::mem::take(&mut self.installed) {
            if let Err(e) = self.ops.remove_route(route).await {
                tracing::warn!(%route, "Failed to remove route on teardown: {e}");
            }
        }

        *self.view.write() = RoutingView::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use telepresence_model::DnsConfig;

    #[derive(Default, Clone)]
    struct MockOps {
        routes: Arc<Mutex<HashSet<IpNetwork>>>,
        host_routes: Arc<Mutex<Vec<IpNetwork>>>,
        operations: Arc<Mutex<Vec<String>>>,
    }

    impl RouteOps for MockOps {
        async fn add_route(&self, net: IpNetwork) -> Result<(), RouteError> {
            if self.routes.lock().insert(net) {
                self.operations.lock().push(format!("add {net}"));
            }

            Ok(())
        }

        async fn remove_route(&self, net: IpNetwork) -> Result<(), RouteError> {
            if self.routes.lock().remove(&net) {
                self.operations.lock().push(format!("remove {net}"));
            }

            Ok(())
        }

        async fn host_conflict(&self, net: IpNetwork) -> Result<Option<IpNetwork>, RouteError> {
            Ok(self
                .host_routes
                .lock()
                .iter()
                .find(|host| {
                    host.contains(net.network_address()) || net.contains(host.network_address())
                })
                .copied())
        }
    }

    fn snapshot(cluster: &[&str], never: &[&str]) -> SubnetSnapshot {
        SubnetSnapshot {
            cluster_subnets: cluster.iter().map(|s| s.parse().unwrap()).collect(),
            never_proxy: never.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn applies_and_clears_snapshots() {
        let ops = MockOps::default();
        let (mut router, view, _dns) = Router::new(ops.clone());

        router
            .apply(&snapshot(&["10.0.0.0/16"], &["10.0.5.0/24"]))
            .await
            .unwrap();

        let installed = ops.routes.lock().clone();
        assert!(!installed.is_empty());
        assert!(
            installed
                .iter()
                .all(|net| !net.contains("10.0.5.1".parse::<IpAddr>().unwrap()))
        );
        assert!(view.read().is_proxied("10.0.99.1".parse().unwrap()));
        assert!(!view.read().is_proxied("10.0.5.1".parse().unwrap()));

        router.apply(&snapshot(&[], &[])).await.unwrap();

        assert!(ops.routes.lock().is_empty());
        assert!(!view.read().is_proxied("10.0.99.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn applying_the_same_snapshot_twice_is_a_no_op() {
        let ops = MockOps::default();
        let (mut router, _view, _dns) = Router::new(ops.clone());

        let snapshot = snapshot(&["10.0.0.0/16"], &[]);

        router.apply(&snapshot).await.unwrap();
        let operations = ops.operations.lock().clone();

        router.apply(&snapshot).await.unwrap();

        assert_eq!(*ops.operations.lock(), operations);
    }

    #[tokio::test]
    async fn conflicting_routes_are_skipped_unless_allowed() {
        let ops = MockOps::default();
        ops.host_routes.lock().push("10.0.0.0/16".parse().unwrap());

        let (mut router, view, _dns) = Router::new(ops.clone());

        router.apply(&snapshot(&["10.0.0.0/16"], &[])).await.unwrap();
        assert!(ops.routes.lock().is_empty());
        assert!(!view.read().is_proxied("10.0.0.1".parse().unwrap()));

        let allowed = SubnetSnapshot {
            cluster_subnets: vec!["10.0.0.0/16".parse().unwrap()],
            allow_conflict: vec!["10.0.0.0/16".parse().unwrap()],
            ..Default::default()
        };
        router.apply(&allowed).await.unwrap();

        assert!(ops.routes.lock().contains(&"10.0.0.0/16".parse().unwrap()));
    }

    #[tokio::test]
    async fn dns_sentinels_follow_the_snapshot() {
        let ops = MockOps::default();
        let (mut router, _view, dns) = Router::new(ops);

        let snapshot = SubnetSnapshot {
            cluster_subnets: vec!["10.0.0.0/16".parse().unwrap()],
            dns: DnsConfig {
                remote_addrs: vec!["10.96.0.10".parse().unwrap()],
                include_suffixes: vec!["cluster.local".to_owned()],
                ..Default::default()
            },
            ..Default::default()
        };
        router.apply(&snapshot).await.unwrap();

        assert_eq!(*dns.borrow(), vec!["10.96.0.10".parse::<IpAddr>().unwrap()]);
    }
}
