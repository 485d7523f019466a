//! Two-tier telemetry
//!
//! Each worker keeps three books: `current` is written by the I/O path,
//! `shadow` is handed to the sampler at a swap, and `sum` (owned by the
//! sampler thread) accumulates across swaps and is what gets published
//! to shared memory. The hot path never contends with the sampler:
//! ownership of `shadow` alternates through the `updated`/`aggregate`
//! flag handshake instead of a lock.
//!
//! - the I/O loop calls `swap()` once per loop turn; it backs off while
//!   the sampler still holds the previous shadow (`aggregate == 1`) or
//!   when nothing changed (`updated == 0`);
//! - the sampler calls `drain_shadow_into(sum)` on its tick; it backs
//!   off until a swap has handed a fresh shadow over.

pub mod sampler;
pub mod scrape;

use kestrel_core::log_trace;
use kestrel_core::metrics::{PoolField, ServerField, StatsBook, NBUCKETS};

use serde::Serialize;

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::proxy;

/// Name reported as `service` in every snapshot
pub const SERVICE_NAME: &str = "kestrel";

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One worker's stats state shared between its I/O thread and sampler
pub struct Stats {
    current: UnsafeCell<StatsBook>,
    shadow: UnsafeCell<StatsBook>,
    /// The I/O path recorded something since the last swap
    updated: AtomicBool,
    /// A swapped-out shadow is waiting for the sampler
    aggregate: AtomicBool,
    /// Pristine copy of the book shape for building `sum`
    template: StatsBook,
    start_ts: i64,
    source: String,
    pub interval_ms: u64,
}

// Safety: `current` is only touched by the owning I/O thread (recording
// primitives and swap()). `shadow` is touched by the I/O thread only
// while aggregate == 0 and by the sampler only while aggregate == 1;
// the release/acquire pair on `aggregate` orders the hand-offs.
unsafe impl Send for Stats {}
unsafe impl Sync for Stats {}

impl Stats {
    /// Build from `(pool name, server names)` shape pairs.
    pub fn new(shape: &[(String, Vec<String>)], source: &str, interval_ms: u64) -> Stats {
        let template = StatsBook::from_shape(shape);
        Stats {
            current: UnsafeCell::new(template.clone()),
            shadow: UnsafeCell::new(template.clone()),
            updated: AtomicBool::new(false),
            aggregate: AtomicBool::new(false),
            template,
            start_ts: now_secs(),
            source: source.to_string(),
            interval_ms,
        }
    }

    /// A zeroed book of the same shape, for the sampler's `sum`.
    pub fn fresh_book(&self) -> StatsBook {
        self.template.clone()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn start_ts(&self) -> i64 {
        self.start_ts
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn current_mut(&self) -> &mut StatsBook {
        // owning I/O thread only; see the Sync safety note
        unsafe { &mut *self.current.get() }
    }

    // ── Hot-path recording primitives (owning thread only) ───────────

    pub fn pool_incr(&self, pidx: usize, f: PoolField) {
        self.pool_incr_by(pidx, f, 1);
    }

    pub fn pool_decr(&self, pidx: usize, f: PoolField) {
        self.current_mut().pools[pidx].decr_by(f, 1);
        self.updated.store(true, Ordering::Release);
    }

    pub fn pool_incr_by(&self, pidx: usize, f: PoolField, delta: i64) {
        self.current_mut().pools[pidx].incr_by(f, delta);
        self.updated.store(true, Ordering::Release);
    }

    pub fn pool_record_latency(&self, pidx: usize, ms: i64) {
        self.current_mut().pools[pidx].latency.record(ms);
        self.updated.store(true, Ordering::Release);
    }

    pub fn server_incr(&self, pidx: usize, sidx: usize, f: ServerField) {
        self.server_incr_by(pidx, sidx, f, 1);
    }

    pub fn server_decr(&self, pidx: usize, sidx: usize, f: ServerField) {
        self.current_mut().pools[pidx].servers[sidx].decr_by(f, 1);
        self.updated.store(true, Ordering::Release);
    }

    pub fn server_incr_by(&self, pidx: usize, sidx: usize, f: ServerField, delta: i64) {
        self.current_mut().pools[pidx].servers[sidx].incr_by(f, delta);
        self.updated.store(true, Ordering::Release);
    }

    pub fn server_set_ts(&self, pidx: usize, sidx: usize, f: ServerField, ts: i64) {
        self.current_mut().pools[pidx].servers[sidx].set_ts(f, ts);
        self.updated.store(true, Ordering::Release);
    }

    pub fn server_record_latency(&self, pidx: usize, sidx: usize, ms: i64) {
        self.current_mut().pools[pidx].servers[sidx].latency.record(ms);
        self.updated.store(true, Ordering::Release);
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Hand the current book to the sampler. Called from the I/O loop,
    /// once per turn. Returns whether a swap happened.
    ///
    /// `current` is reset right after the swap so addition into `sum`
    /// stays idempotent.
    pub fn swap(&self) -> bool {
        if self.aggregate.load(Ordering::Acquire) {
            log_trace!("skip swap of current and shadow as aggregator is busy");
            return false;
        }
        if !self.updated.load(Ordering::Acquire) {
            log_trace!("skip swap of current and shadow as there is nothing new");
            return false;
        }
        // Safety: aggregate == 0, so the sampler is not holding shadow
        unsafe {
            std::mem::swap(&mut *self.current.get(), &mut *self.shadow.get());
            (*self.current.get()).reset();
        }
        self.updated.store(false, Ordering::Release);
        self.aggregate.store(true, Ordering::Release);
        true
    }

    /// Fold the swapped-out shadow into the sampler's `sum`. Called from
    /// the sampler thread. Returns whether anything was consumed.
    pub fn drain_shadow_into(&self, sum: &mut StatsBook) -> bool {
        if !self.aggregate.load(Ordering::Acquire) {
            log_trace!("skip aggregate of shadow as generator is slow");
            return false;
        }
        // Safety: aggregate == 1, so the I/O thread will not swap
        unsafe {
            sum.aggregate_from(&*self.shadow.get());
        }
        self.aggregate.store(false, Ordering::Release);
        true
    }
}

// ── Snapshot serialization ───────────────────────────────────────────

#[derive(Serialize)]
struct ServerSnapshot<'a> {
    #[serde(flatten)]
    metrics: BTreeMap<&'static str, i64>,
    server_latency: &'a [u64; NBUCKETS],
}

#[derive(Serialize)]
struct PoolSnapshot<'a> {
    #[serde(flatten)]
    metrics: BTreeMap<&'static str, i64>,
    request_latency: &'a [u64; NBUCKETS],
    servers: BTreeMap<&'a str, ServerSnapshot<'a>>,
}

#[derive(Serialize)]
struct WorkerSnapshot<'a> {
    service: &'static str,
    source: &'a str,
    version: &'static str,
    uptime: i64,
    timestamp: i64,
    pid: i32,
    total_connections: u64,
    curr_connections: i64,
    pools: BTreeMap<&'a str, PoolSnapshot<'a>>,
}

/// Serialize a `sum` book as one newline-terminated JSON object.
pub fn render_snapshot(sum: &StatsBook, source: &str, start_ts: i64) -> Vec<u8> {
    let ts = now_secs();
    let snapshot = WorkerSnapshot {
        service: SERVICE_NAME,
        source,
        version: env!("CARGO_PKG_VERSION"),
        uptime: ts - start_ts,
        timestamp: ts,
        pid: std::process::id() as i32,
        total_connections: proxy::total_connections(),
        curr_connections: proxy::curr_connections(),
        pools: sum
            .pools
            .iter()
            .map(|p| {
                (
                    p.name.as_str(),
                    PoolSnapshot {
                        metrics: PoolField::ALL
                            .iter()
                            .map(|f| (f.name(), p.get(*f)))
                            .collect(),
                        request_latency: p.latency.buckets(),
                        servers: p
                            .servers
                            .iter()
                            .map(|s| {
                                (
                                    s.name.as_str(),
                                    ServerSnapshot {
                                        metrics: ServerField::ALL
                                            .iter()
                                            .map(|f| (f.name(), s.get(*f)))
                                            .collect(),
                                        server_latency: s.latency.buckets(),
                                    },
                                )
                            })
                            .collect(),
                    },
                )
            })
            .collect(),
    };

    // the shape is plain data; serialization cannot fail
    let mut buf = serde_json::to_vec(&snapshot).unwrap_or_default();
    buf.push(b'\n');
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> Vec<(String, Vec<String>)> {
        vec![("alpha".to_string(), vec!["s1".to_string()])]
    }

    #[test]
    fn test_swap_requires_updates() {
        let st = Stats::new(&shape(), "test", 1000);
        // nothing recorded: no swap
        assert!(!st.swap());

        st.pool_incr(0, PoolField::Requests);
        assert!(st.swap());
    }

    #[test]
    fn test_swap_backs_off_while_sampler_holds_shadow() {
        let st = Stats::new(&shape(), "test", 1000);
        st.pool_incr(0, PoolField::Requests);
        assert!(st.swap());

        // sampler has not drained yet: a second swap is refused
        st.pool_incr(0, PoolField::Requests);
        assert!(!st.swap());

        let mut sum = st.fresh_book();
        assert!(st.drain_shadow_into(&mut sum));
        assert_eq!(sum.pools[0].get(PoolField::Requests), 1);

        // now the handed-back shadow can take the next swap
        assert!(st.swap());
        assert!(st.drain_shadow_into(&mut sum));
        assert_eq!(sum.pools[0].get(PoolField::Requests), 2);
    }

    #[test]
    fn test_snapshot_math() {
        let st = Stats::new(&shape(), "test", 1000);
        let mut sum = st.fresh_book();

        st.pool_incr_by(0, PoolField::Requests, 10);
        st.pool_record_latency(0, 5);
        st.server_incr_by(0, 0, ServerField::Responses, 7);

        assert!(st.swap());
        assert!(st.drain_shadow_into(&mut sum));

        // current is all-zero after a successful snapshot
        assert!(st.current_mut().is_zero());
        assert_eq!(sum.pools[0].get(PoolField::Requests), 10);
        assert_eq!(sum.pools[0].latency.buckets()[1], 1);
        assert_eq!(sum.pools[0].servers[0].get(ServerField::Responses), 7);

        // a drain with no pending shadow is a no-op
        let before = sum.clone();
        assert!(!st.drain_shadow_into(&mut sum));
        assert_eq!(sum, before);
    }

    #[test]
    fn test_render_snapshot_shape() {
        let st = Stats::new(&shape(), "worker-0", 1000);
        let mut sum = st.fresh_book();
        st.pool_incr(0, PoolField::Requests);
        st.pool_record_latency(0, 2);
        st.swap();
        st.drain_shadow_into(&mut sum);

        let buf = render_snapshot(&sum, st.source(), st.start_ts());
        assert_eq!(*buf.last().unwrap(), b'\n');

        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["service"], "kestrel");
        assert_eq!(v["source"], "worker-0");
        assert!(v["uptime"].is_i64());
        assert!(v["timestamp"].is_i64());
        assert!(v["pid"].is_i64());
        assert!(v["total_connections"].is_u64());
        assert!(v["curr_connections"].is_i64());

        let pool = &v["pools"]["alpha"];
        assert_eq!(pool["requests"], 1);
        assert_eq!(pool["request_latency"].as_array().unwrap().len(), NBUCKETS);
        assert_eq!(pool["request_latency"][1], 1);
        let server = &pool["servers"]["s1"];
        assert_eq!(server["server_latency"].as_array().unwrap().len(), NBUCKETS);
        assert_eq!(server["requests"], 0);
    }
}
