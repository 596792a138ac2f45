//! Default deadlines for all network operations.

use std::time::Duration;

/// Opening a tunnel stream to the cluster.
pub const DIAL: Duration = Duration::from_secs(10);
/// Completing the CONNECT / STREAM_OK exchange on a freshly dialled stream.
pub const HANDSHAKE: Duration = Duration::from_secs(5);
/// Interval between KEEP_ALIVE frames on an idle tunnel stream, and between
/// `Remain` calls on the manager session.
pub const KEEP_ALIVE: Duration = Duration::from_secs(10);
/// A UDP endpoint whose stream has seen no traffic for this long is closed.
pub const UDP_IDLE: Duration = Duration::from_secs(5);
/// How long an intercept may sit in WAITING before it fails.
pub const INTERCEPT_ARRIVAL: Duration = Duration::from_secs(30);
/// How long teardown waits for in-flight streams to drain.
pub const DISCONNECT_DRAIN: Duration = Duration::from_secs(5);

/// Assumed worst-case round trip to the cluster, used to scale the stream watchdog.
pub const ROUNDTRIP_LATENCY: Duration = Duration::from_secs(2);

/// A stream with no activity for longer than this is cancelled.
pub fn stream_watchdog() -> Duration {
    DIAL + ROUNDTRIP_LATENCY * 10
}
