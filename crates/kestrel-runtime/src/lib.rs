//! # kestrel-runtime
//!
//! Linux runtime for the kestrel proxy supervision core.
//!
//! This crate provides:
//! - Edge-triggered epoll reactor with typed registrations (`event`)
//! - Master/worker control channel over a socketpair (`channel`)
//! - Per-worker shared-memory snapshot regions (`shm`)
//! - Signal plumbing: typed events over a self-pipe, drain timer (`signals`)
//! - Listening-pool lifecycle and migration (`proxy`)
//! - Two-tier telemetry: sampler thread and master scrape (`stats`)
//! - Fork-based supervisor and the per-worker loop (`supervisor`, `worker`)

#![allow(dead_code)]

pub mod channel;
pub mod event;
pub mod proxy;
pub mod shm;
pub mod signals;
pub mod stats;
pub mod supervisor;
pub mod worker;

// Re-exports
pub use channel::ControlChannel;
pub use event::{Reactor, Ready, Token};
pub use proxy::Pool;
pub use shm::SharedRegion;
pub use stats::Stats;
pub use supervisor::Supervisor;
pub use worker::Driver;

use kestrel_core::error::ProxyError;

/// Map a raw negative syscall return into `ProxyError` from errno.
pub(crate) fn os_err() -> ProxyError {
    ProxyError::last_os()
}
