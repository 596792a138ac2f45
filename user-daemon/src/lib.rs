#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Library half of the user daemon, split out so the session machinery can be
//! exercised by integration tests.

pub mod error;
pub mod intercepts;
pub mod service;
pub mod session;
