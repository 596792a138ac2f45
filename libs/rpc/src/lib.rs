#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Generated gRPC types plus the conversions and socket plumbing shared by
//! the daemons.

mod convert;
pub mod uds;

pub use convert::{
    ConvertError, header_matches_from_proto, intercept_spec_to_proto, ip_from_bytes, ip_to_bytes,
    runtime_from_info, subnet_from_proto, subnet_to_proto,
};

/// The control-socket API version reported by `Version`.
pub const API_VERSION: u32 = 3;

#[allow(clippy::all)]
pub mod manager {
    tonic::include_proto!("manager");
}

#[allow(clippy::all)]
pub mod daemon {
    tonic::include_proto!("daemon");
}
