//! Pool/server stats books and the request-latency histogram
//!
//! The runtime keeps three books per worker: `current` (written by the
//! I/O path), `shadow` (handed to the sampler) and `sum` (the published
//! accumulator). This module holds the book shapes and the metric-wise
//! aggregation rules; the swap/aggregate handshake lives in the runtime.
//!
//! Counters and gauges aggregate by addition; timestamps keep the last
//! non-zero observation. Bucket count and ordering are compile-time
//! constants so master and worker always agree.

/// Number of latency buckets, the last one open-ended
pub const NBUCKETS: usize = 11;

/// Upper bucket bounds in milliseconds
pub const LATENCY_BUCKETS_MS: [i64; NBUCKETS] =
    [1, 10, 20, 50, 100, 200, 500, 1000, 2000, 3000, i64::MAX];

/// Fixed-bound latency histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyHistogram {
    buckets: [u64; NBUCKETS],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        LatencyHistogram {
            buckets: [0; NBUCKETS],
        }
    }

    /// Record one observation: increments exactly the least bucket `i`
    /// with `ms <= LATENCY_BUCKETS_MS[i]`.
    #[inline]
    pub fn record(&mut self, ms: i64) {
        let mut i = 0;
        while ms > LATENCY_BUCKETS_MS[i] {
            i += 1;
        }
        self.buckets[i] += 1;
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        for i in 0..NBUCKETS {
            self.buckets[i] += other.buckets[i];
        }
    }

    pub fn reset(&mut self) {
        self.buckets = [0; NBUCKETS];
    }

    #[inline]
    pub fn buckets(&self) -> &[u64; NBUCKETS] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// How a metric aggregates across snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Timestamp,
}

/// Per-pool metric fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PoolField {
    ClientEof = 0,
    ClientErr,
    ClientConnections,
    ServerEjects,
    ForwardError,
    Fragments,
    Requests,
    RequestBytes,
    Responses,
    ResponseBytes,
}

impl PoolField {
    pub const COUNT: usize = 10;

    pub const ALL: [PoolField; Self::COUNT] = [
        PoolField::ClientEof,
        PoolField::ClientErr,
        PoolField::ClientConnections,
        PoolField::ServerEjects,
        PoolField::ForwardError,
        PoolField::Fragments,
        PoolField::Requests,
        PoolField::RequestBytes,
        PoolField::Responses,
        PoolField::ResponseBytes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PoolField::ClientEof => "client_eof",
            PoolField::ClientErr => "client_err",
            PoolField::ClientConnections => "client_connections",
            PoolField::ServerEjects => "server_ejects",
            PoolField::ForwardError => "forward_error",
            PoolField::Fragments => "fragments",
            PoolField::Requests => "requests",
            PoolField::RequestBytes => "request_bytes",
            PoolField::Responses => "responses",
            PoolField::ResponseBytes => "response_bytes",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            PoolField::ClientConnections => MetricKind::Gauge,
            _ => MetricKind::Counter,
        }
    }
}

/// Per-server metric fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ServerField {
    ServerEof = 0,
    ServerErr,
    ServerTimedout,
    ServerConnections,
    ServerEjectedAt,
    Requests,
    RequestBytes,
    Responses,
    ResponseBytes,
    InQueue,
    InQueueBytes,
    OutQueue,
    OutQueueBytes,
}

impl ServerField {
    pub const COUNT: usize = 13;

    pub const ALL: [ServerField; Self::COUNT] = [
        ServerField::ServerEof,
        ServerField::ServerErr,
        ServerField::ServerTimedout,
        ServerField::ServerConnections,
        ServerField::ServerEjectedAt,
        ServerField::Requests,
        ServerField::RequestBytes,
        ServerField::Responses,
        ServerField::ResponseBytes,
        ServerField::InQueue,
        ServerField::InQueueBytes,
        ServerField::OutQueue,
        ServerField::OutQueueBytes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServerField::ServerEof => "server_eof",
            ServerField::ServerErr => "server_err",
            ServerField::ServerTimedout => "server_timedout",
            ServerField::ServerConnections => "server_connections",
            ServerField::ServerEjectedAt => "server_ejected_at",
            ServerField::Requests => "requests",
            ServerField::RequestBytes => "request_bytes",
            ServerField::Responses => "responses",
            ServerField::ResponseBytes => "response_bytes",
            ServerField::InQueue => "in_queue",
            ServerField::InQueueBytes => "in_queue_bytes",
            ServerField::OutQueue => "out_queue",
            ServerField::OutQueueBytes => "out_queue_bytes",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            ServerField::ServerConnections
            | ServerField::InQueue
            | ServerField::InQueueBytes
            | ServerField::OutQueue
            | ServerField::OutQueueBytes => MetricKind::Gauge,
            ServerField::ServerEjectedAt => MetricKind::Timestamp,
            _ => MetricKind::Counter,
        }
    }
}

fn aggregate_value(kind: MetricKind, dst: &mut i64, src: i64) {
    match kind {
        MetricKind::Counter | MetricKind::Gauge => *dst += src,
        MetricKind::Timestamp => {
            if src != 0 {
                *dst = src;
            }
        }
    }
}

/// Stats for one upstream server of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub name: String,
    values: [i64; ServerField::COUNT],
    pub latency: LatencyHistogram,
}

impl ServerStats {
    pub fn new(name: &str) -> Self {
        ServerStats {
            name: name.to_string(),
            values: [0; ServerField::COUNT],
            latency: LatencyHistogram::new(),
        }
    }

    #[inline]
    pub fn get(&self, f: ServerField) -> i64 {
        self.values[f as usize]
    }

    #[inline]
    pub fn incr_by(&mut self, f: ServerField, delta: i64) {
        debug_assert!(f.kind() != MetricKind::Timestamp);
        self.values[f as usize] += delta;
    }

    #[inline]
    pub fn decr_by(&mut self, f: ServerField, delta: i64) {
        debug_assert!(f.kind() == MetricKind::Gauge);
        self.values[f as usize] -= delta;
    }

    #[inline]
    pub fn set_ts(&mut self, f: ServerField, ts: i64) {
        debug_assert!(f.kind() == MetricKind::Timestamp);
        self.values[f as usize] = ts;
    }

    pub fn aggregate_from(&mut self, other: &ServerStats) {
        for f in ServerField::ALL {
            aggregate_value(f.kind(), &mut self.values[f as usize], other.values[f as usize]);
        }
        self.latency.merge(&other.latency);
    }

    pub fn reset(&mut self) {
        self.values = [0; ServerField::COUNT];
        self.latency.reset();
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0) && self.latency.total() == 0
    }
}

/// Stats for one listening pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    values: [i64; PoolField::COUNT],
    pub latency: LatencyHistogram,
    pub servers: Vec<ServerStats>,
}

impl PoolStats {
    pub fn new(name: &str, server_names: &[String]) -> Self {
        PoolStats {
            name: name.to_string(),
            values: [0; PoolField::COUNT],
            latency: LatencyHistogram::new(),
            servers: server_names.iter().map(|s| ServerStats::new(s)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, f: PoolField) -> i64 {
        self.values[f as usize]
    }

    #[inline]
    pub fn incr_by(&mut self, f: PoolField, delta: i64) {
        debug_assert!(f.kind() != MetricKind::Timestamp);
        self.values[f as usize] += delta;
    }

    #[inline]
    pub fn decr_by(&mut self, f: PoolField, delta: i64) {
        debug_assert!(f.kind() == MetricKind::Gauge);
        self.values[f as usize] -= delta;
    }

    pub fn aggregate_from(&mut self, other: &PoolStats) {
        debug_assert_eq!(self.servers.len(), other.servers.len());
        for f in PoolField::ALL {
            aggregate_value(f.kind(), &mut self.values[f as usize], other.values[f as usize]);
        }
        self.latency.merge(&other.latency);
        for (dst, src) in self.servers.iter_mut().zip(&other.servers) {
            dst.aggregate_from(src);
        }
    }

    pub fn reset(&mut self) {
        self.values = [0; PoolField::COUNT];
        self.latency.reset();
        for s in &mut self.servers {
            s.reset();
        }
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0)
            && self.latency.total() == 0
            && self.servers.iter().all(|s| s.is_zero())
    }
}

/// One worker's full set of pool stats
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsBook {
    pub pools: Vec<PoolStats>,
}

impl StatsBook {
    /// Build an all-zero book from `(pool name, server names)` pairs.
    /// Current, shadow and sum must be built from the same shape.
    pub fn from_shape(shape: &[(String, Vec<String>)]) -> Self {
        StatsBook {
            pools: shape
                .iter()
                .map(|(name, servers)| PoolStats::new(name, servers))
                .collect(),
        }
    }

    pub fn aggregate_from(&mut self, other: &StatsBook) {
        debug_assert_eq!(self.pools.len(), other.pools.len());
        for (dst, src) in self.pools.iter_mut().zip(&other.pools) {
            dst.aggregate_from(src);
        }
    }

    pub fn reset(&mut self) {
        for p in &mut self.pools {
            p.reset();
        }
    }

    pub fn is_zero(&self) -> bool {
        self.pools.iter().all(|p| p.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_bounds() {
        // each bound lands in its own bucket, bound + 1 in the next
        for (i, bound) in LATENCY_BUCKETS_MS[..NBUCKETS - 1].iter().enumerate() {
            let mut h = LatencyHistogram::new();
            h.record(*bound);
            assert_eq!(h.buckets()[i], 1, "bound {} bucket {}", bound, i);
            assert_eq!(h.total(), 1);

            let mut h = LatencyHistogram::new();
            h.record(*bound + 1);
            assert_eq!(h.buckets()[i + 1], 1);
        }
    }

    #[test]
    fn test_bucket_edges() {
        let mut h = LatencyHistogram::new();
        h.record(0);
        h.record(-5);
        assert_eq!(h.buckets()[0], 2);

        h.record(i64::MAX);
        assert_eq!(h.buckets()[NBUCKETS - 1], 1);
        assert_eq!(h.total(), 3);
    }

    #[test]
    fn test_exactly_one_bucket_per_record() {
        let mut h = LatencyHistogram::new();
        for ms in [0, 1, 2, 7, 10, 11, 500, 501, 2999, 3000, 3001, 1 << 40] {
            let before = h.total();
            h.record(ms);
            assert_eq!(h.total(), before + 1);
        }
    }

    #[test]
    fn test_aggregate_kinds() {
        let mut a = ServerStats::new("s1");
        let mut b = ServerStats::new("s1");

        a.incr_by(ServerField::Requests, 3);
        b.incr_by(ServerField::Requests, 4);

        a.incr_by(ServerField::InQueue, 2);
        b.decr_by(ServerField::InQueue, 1);

        a.set_ts(ServerField::ServerEjectedAt, 100);
        b.set_ts(ServerField::ServerEjectedAt, 0);

        a.aggregate_from(&b);
        assert_eq!(a.get(ServerField::Requests), 7);
        assert_eq!(a.get(ServerField::InQueue), 1);
        // zero timestamp does not clobber the last observation
        assert_eq!(a.get(ServerField::ServerEjectedAt), 100);

        b.set_ts(ServerField::ServerEjectedAt, 200);
        a.aggregate_from(&b);
        assert_eq!(a.get(ServerField::ServerEjectedAt), 200);
    }

    #[test]
    fn test_book_aggregate_and_reset() {
        let shape = vec![("alpha".to_string(), vec!["s1".to_string()])];
        let mut sum = StatsBook::from_shape(&shape);
        let mut cur = StatsBook::from_shape(&shape);

        cur.pools[0].incr_by(PoolField::Requests, 10);
        cur.pools[0].latency.record(5);
        cur.pools[0].servers[0].incr_by(ServerField::Responses, 9);

        sum.aggregate_from(&cur);
        cur.reset();

        assert!(cur.is_zero());
        assert_eq!(sum.pools[0].get(PoolField::Requests), 10);
        assert_eq!(sum.pools[0].latency.buckets()[1], 1);
        assert_eq!(sum.pools[0].servers[0].get(ServerField::Responses), 9);

        // addition stays idempotent after reset
        sum.aggregate_from(&cur);
        assert_eq!(sum.pools[0].get(PoolField::Requests), 10);
    }

    #[test]
    fn test_field_tables_consistent() {
        for (i, f) in PoolField::ALL.iter().enumerate() {
            assert_eq!(*f as usize, i);
        }
        for (i, f) in ServerField::ALL.iter().enumerate() {
            assert_eq!(*f as usize, i);
        }
    }
}
