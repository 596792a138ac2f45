//! Route operations on Linux, spoken over rtnetlink.

use crate::{RouteError, RouteOps};
use anyhow::{Context as _, Result};
use futures::TryStreamExt as _;
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use libc::{EEXIST, ENOENT, ESRCH};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope,
};
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder, new_connection};
use std::net::{Ipv4Addr, Ipv6Addr};

pub struct RouteManager {
    handle: Handle,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RouteManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RouteManager {
    /// Creates a new manager speaking to the kernel over netlink.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn new() -> Result<Self, RouteError> {
        let (connection, handle, _) = new_connection()
            .context("Failed to create netlink connection")
            .map_err(RouteError::Kernel)?;
        let task = tokio::spawn(connection);

        Ok(Self { handle, task })
    }

    /// Assigns the virtual interface its addresses, sets the MTU and brings
    /// the link up.
    pub async fn setup_interface(
        &self,
        ipv4: Ipv4Addr,
        ipv6: Option<Ipv6Addr>,
        mtu: u32,
    ) -> Result<()> {
        let index = self.device_index().await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
            .execute()
            .await
            .context("Failed to set MTU")?;

        self.handle
            .address()
            .add(index, ipv4.into(), 32)
            .execute()
            .await
            .or_else(tolerate_exists)
            .context("Failed to assign IPv4 address")?;

        if let Some(ipv6) = ipv6 {
            self.handle
                .address()
                .add(index, ipv6.into(), 128)
                .execute()
                .await
                .or_else(tolerate_exists)
                .context("Failed to assign IPv6 address")?;
        }

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .context("Failed to bring up interface")?;

        Ok(())
    }

    async fn device_index(&self) -> Result<u32> {
        let index = self
            .handle
            .link()
            .get()
            .match_name(tun::IFACE_NAME.to_string())
            .execute()
            .try_next()
            .await?
            .context("No such interface")?
            .header
            .index;

        Ok(index)
    }

    fn make_route(&self, index: u32, net: IpNetwork) -> RouteMessage {
        match net {
            IpNetwork::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .destination_prefix(net.network_address(), net.netmask())
                .build(),
            IpNetwork::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .destination_prefix(net.network_address(), net.netmask())
                .build(),
        }
    }
}

fn tolerate_exists(error: rtnetlink::Error) -> Result<(), rtnetlink::Error> {
    if matches!(&error, NetlinkError(inner) if inner.raw_code() == -EEXIST) {
        return Ok(());
    }

    Err(error)
}

impl RouteOps for RouteManager {
    async fn add_route(&self, net: IpNetwork) -> Result<(), RouteError> {
        let index = self
            .device_index()
            .await
            .map_err(RouteError::Kernel)?;
        let message = self.make_route(index, net);

        let Err(error) = self.handle.route().add(message).execute().await else {
            tracing::debug!(route = %net, "Created new route");

            return Ok(());
        };

        // Adding an already existing route is expected; reconcile runs repeatedly.
        if matches!(&error, NetlinkError(inner) if inner.raw_code() == -EEXIST) {
            return Ok(());
        }

        // Systems without IPv6 support answer with EOPNOTSUPP.
        if matches!(&error, NetlinkError(inner) if inner.raw_code() == -libc::EOPNOTSUPP) {
            return Ok(());
        }

        Err(RouteError::Route {
            route: net,
            message: error.to_string(),
        })
    }

    async fn remove_route(&self, net: IpNetwork) -> Result<(), RouteError> {
        let index = self
            .device_index()
            .await
            .map_err(RouteError::Kernel)?;
        let message = self.make_route(index, net);

        let Err(error) = self.handle.route().del(message).execute().await else {
            tracing::debug!(route = %net, "Removed route");

            return Ok(());
        };

        // Our view of the routes may be stale; a missing route is not an error.
        if matches!(&error, NetlinkError(inner) if inner.raw_code() == -ENOENT) {
            return Ok(());
        }

        // "No such process" is the kernel's other way of saying the route is gone.
        if matches!(&error, NetlinkError(inner) if inner.raw_code() == -ESRCH) {
            return Ok(());
        }

        Err(RouteError::Route {
            route: net,
            message: error.to_string(),
        })
    }

    async fn host_conflict(&self, net: IpNetwork) -> Result<Option<IpNetwork>, RouteError> {
        let index = self
            .device_index()
            .await
            .map_err(RouteError::Kernel)?;

        let mut routes = match net {
            IpNetwork::V4(_) => self
                .handle
                .route()
                .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
                .execute(),
            IpNetwork::V6(_) => self
                .handle
                .route()
                .get(RouteMessageBuilder::<Ipv6Addr>::new().build())
                .execute(),
        };

        while let Some(message) = routes
            .try_next()
            .await
            .context("Failed to dump host routes")
            .map_err(RouteError::Kernel)?
        {
            let Some(existing) = route_from_message(&message) else {
                continue;
            };

            // Default routes overlap everything; they are not conflicts.
            let prefix = match existing {
                IpNetwork::V4(net) => net.netmask(),
                IpNetwork::V6(net) => net.netmask(),
            };
            if prefix == 0 {
                continue;
            }

            if iface_index_from_message(&message) == Some(index) {
                continue;
            }

            if overlaps(&existing, &net) {
                return Ok(Some(existing));
            }
        }

        Ok(None)
    }
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    crate::covers(a, b) || crate::covers(b, a)
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
fn iface_index_from_message(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
fn route_from_message(message: &RouteMessage) -> Option<IpNetwork> {
    let netmask = message.header.destination_prefix_length;

    message.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Destination(RouteAddress::Inet(ipv4)) => {
            Some(IpNetwork::V4(Ipv4Network::new(*ipv4, netmask).ok()?))
        }
        RouteAttribute::Destination(RouteAddress::Inet6(ipv6)) => {
            Some(IpNetwork::V6(Ipv6Network::new(*ipv6, netmask).ok()?))
        }
        _ => None,
    })
}
