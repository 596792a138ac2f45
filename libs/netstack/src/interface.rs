use smoltcp::{
    iface::{Config, Interface},
    wire::{HardwareAddress, Ipv4Address, Ipv4Cidr, Ipv6Address, Ipv6Cidr},
};

use crate::device::InMemoryDevice;

const IP4_ADDR: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);
const IP6_ADDR: Ipv6Address = Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1);

/// Creates the [`Interface`] backing the stack.
///
/// The interface never appears on any host; it terminates whatever the TUN
/// routes our way. Therefore it is configured to:
/// - Accept packets with any destination IP
/// - Carry dummy interface IPs (localhost for IPv4 and IPv6)
/// - Route everything handed to `smoltcp` to itself via catch-all routes
pub(crate) fn create_interface(device: &mut InMemoryDevice) -> Interface {
    let mut interface = Interface::new(
        Config::new(HardwareAddress::Ip),
        device,
        smoltcp::time::Instant::ZERO,
    );
    interface.set_any_ip(true);

    interface.update_ip_addrs(|ips| {
        ips.push(Ipv4Cidr::new(IP4_ADDR, 32).into())
            .expect("should be a valid IPv4 CIDR");
        ips.push(Ipv6Cidr::new(IP6_ADDR, 128).into())
            .expect("should be a valid IPv6 CIDR");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(IP4_ADDR)
        .expect("IPv4 default route should fit");
    interface
        .routes_mut()
        .add_default_ipv6_route(IP6_ADDR)
        .expect("IPv6 default route should fit");

    interface
}

/// Computes a [`smoltcp::time::Instant`] from a fixed starting point and the current time.
pub(crate) fn smol_now(boot: std::time::Instant, now: std::time::Instant) -> smoltcp::time::Instant {
    let millis_since_startup = now.duration_since(boot).as_millis();

    smoltcp::time::Instant::from_millis(millis_since_startup as i64)
}
