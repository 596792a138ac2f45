//! Glue between the network stack and the tunnel: every new flow dials one
//! stream through the user daemon, and DNS queries become `LookupDns` RPCs.

use anyhow::{Context as _, Result};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use telepresence_model::{ConnectionId, SessionId};
use telepresence_netstack::{DnsQuery, DnsResolver, FlowIo, StreamFactory};
use telepresence_router::RoutingView;
use telepresence_rpc::daemon::connector_client::ConnectorClient;
use telepresence_rpc::manager;
use telepresence_tunnel::{Transport, TunnelError, TunnelStream, dial};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Chunks queued between the stack and a tunnel stream, per direction.
const FLOW_QUEUE: usize = 16;

pub struct RelayStreamFactory {
    pub transport: Arc<dyn Transport>,
    pub session: SessionId,
    pub view: Arc<RwLock<RoutingView>>,
    pub cancel: CancellationToken,
}

impl StreamFactory for RelayStreamFactory {
    fn open(&self, id: ConnectionId) -> BoxFuture<'static, Result<FlowIo>> {
        let transport = self.transport.clone();
        let session = self.session.clone();
        let cancel = self.cancel.child_token();
        let never_proxied = self.view.read().is_never_proxied(id.destination().ip());

        async move {
            if never_proxied {
                return Err(TunnelError::Unroutable)
                    .with_context(|| format!("Refusing to dial {id}"));
            }

            let stream = dial(transport.as_ref(), &session, id, cancel).await?;

            Ok(wire_flow(stream))
        }
        .boxed()
    }
}

/// Adapts a [`TunnelStream`] to the channel pair the stack expects.
fn wire_flow(stream: TunnelStream) -> FlowIo {
    let (to_tunnel_tx, mut to_tunnel_rx) = mpsc::channel::<Vec<u8>>(FLOW_QUEUE);
    let (from_tunnel_tx, from_tunnel_rx) = mpsc::channel::<Vec<u8>>(FLOW_QUEUE);

    tokio::spawn(async move {
        let mut stream = stream;
        let mut from_tunnel_tx = Some(from_tunnel_tx);
        let mut outbound_done = false;

        while !(outbound_done && from_tunnel_tx.is_none()) {
            tokio::select! {
                chunk = to_tunnel_rx.recv(), if !outbound_done => match chunk {
                    Some(chunk) => {
                        if let Err(e) = stream.send(&chunk).await {
                            tracing::debug!(id = %stream.id(), "Stream send failed: {e}");
                            break;
                        }
                    }
                    None => {
                        stream.close_send().await;
                        outbound_done = true;
                    }
                },
                chunk = stream.recv(), if from_tunnel_tx.is_some() => match chunk {
                    Some(chunk) => {
                        let Some(tx) = &from_tunnel_tx else { break };

                        if tx.send(chunk).await.is_err() {
                            // The stack dropped the flow; tear the stream down.
                            break;
                        }
                    }
                    None => {
                        from_tunnel_tx = None;
                    }
                },
            }
        }
    });

    FlowIo {
        tx: to_tunnel_tx,
        rx: from_tunnel_rx,
    }
}

/// Serves the stack's DNS hook by forwarding questions to the manager via the
/// user daemon.
pub struct ManagerDnsResolver {
    pub client: ConnectorClient<Channel>,
    pub session: manager::SessionInfo,
    pub view: Arc<RwLock<RoutingView>>,
}

impl DnsResolver for ManagerDnsResolver {
    fn resolve(&self, query: DnsQuery) -> BoxFuture<'static, Result<Vec<u8>>> {
        let mut client = self.client.clone();
        let session = self.session.clone();

        let excluded = {
            let view = self.view.read();

            view.dns_exclude_suffixes
                .iter()
                .any(|suffix| query.name.ends_with(suffix.trim_start_matches('.')))
        };

        async move {
            if excluded {
                return Ok(negative_response());
            }

            let response = client
                .lookup_dns(manager::LookupDnsRequest {
                    session: Some(session),
                    name: query.name,
                    qtype: u32::from(query.qtype),
                })
                .await
                .context("LookupDns RPC failed")?
                .into_inner();

            anyhow::ensure!(!response.response.is_empty(), "Empty DNS response");

            Ok(response.response)
        }
        .boxed()
    }
}

/// A header-only NXDOMAIN; sent for names the cluster must never resolve.
fn negative_response() -> Vec<u8> {
    vec![
        0, 0, // id, patched by the interceptor
        0x81, 0x83, // qr, rd, ra, rcode = NXDOMAIN
        0, 0, 0, 0, 0, 0, 0, 0, // empty sections
    ]
}
