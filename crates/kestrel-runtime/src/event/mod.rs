//! Readiness-based event dispatch
//!
//! Platform adapters map the `READ`/`WRITE`/`ERR` interest mask onto the
//! OS readiness primitive. Only the Linux epoll adapter is provided.
//!
//! Registrations carry a typed token instead of a callback pointer; the
//! owning loop matches on the token variant to dispatch.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::Reactor;
    }
}

use kestrel_core::events::EventSet;
use std::os::unix::io::RawFd;

/// What an fd registration stands for inside a worker loop.
///
/// `Client`/`Upstream` carry an index into the connection engine's own
/// table; the engine is external to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A pool's listening socket, by pool index
    Listener(u32),
    /// A downstream client connection, by engine slot
    Client(u32),
    /// An upstream server connection, by engine slot
    Upstream(u32),
    /// The worker end of the control channel
    Channel,
    /// The telemetry listener (master only)
    Stats,
}

/// One dispatched readiness event
#[derive(Debug, Clone, Copy)]
pub struct Ready<T> {
    pub token: T,
    pub events: EventSet,
}

/// Connection-side registration state used by the convenience wrappers.
///
/// The reactor never reads the socket; it only tracks which directions
/// are currently registered so the wrappers can be repeat-safely called
/// from the connection engine.
pub trait Pollable {
    fn fd(&self) -> RawFd;
    fn recv_active(&self) -> bool;
    fn set_recv_active(&mut self, on: bool);
    fn send_active(&self) -> bool;
    fn set_send_active(&mut self, on: bool);
}
