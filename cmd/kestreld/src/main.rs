//! Kestrel demo daemon
//!
//! Runs the full supervision core (master, forked workers, control
//! channels, telemetry) with a trivial echo engine standing in for the
//! protocol layer. Every byte a client sends comes straight back.
//!
//! Usage:
//!     cargo build --release -p kestreld
//!     KESTREL_POOLS="default=127.0.0.1:22121" ./target/release/kestreld
//!
//! Poke it:
//!     echo "hello" | nc -q1 127.0.0.1 22121
//!     nc 127.0.0.1 22222          # scrape the telemetry listener
//!     kill -HUP  <master-pid>     # reload (re-reads KESTREL_* env)
//!     kill -TERM <master-pid>     # graceful drain
//!     kill -TTIN <master-pid>     # one level more logging

use kestrel_core::config::{ConfigError, PoolConfig, ProxyConfig};
use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::metrics::PoolField;
use kestrel_core::{log_error, log_warn};

use kestrel_runtime::event::{Pollable, Reactor, Token};
use kestrel_runtime::proxy::{self, Pool};
use kestrel_runtime::stats::Stats;
use kestrel_runtime::supervisor::Supervisor;
use kestrel_runtime::worker::Driver;

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

const READ_CHUNK: usize = 4096;
const MAX_CONNS: usize = 1024;

// ── Per-connection state ─────────────────────────────────────────────

struct EchoConn {
    fd: OwnedFd,
    pool: u32,
    /// Bytes read but not yet echoed back
    out: Vec<u8>,
    recv_active: bool,
    send_active: bool,
}

impl Pollable for EchoConn {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
    fn recv_active(&self) -> bool {
        self.recv_active
    }
    fn set_recv_active(&mut self, on: bool) {
        self.recv_active = on;
    }
    fn send_active(&self) -> bool {
        self.send_active
    }
    fn set_send_active(&mut self, on: bool) {
        self.send_active = on;
    }
}

// ── Echo engine ──────────────────────────────────────────────────────

struct EchoDriver {
    conns: Vec<Option<EchoConn>>,
    free: Vec<usize>,
    active: usize,
}

impl EchoDriver {
    fn new(max: usize) -> EchoDriver {
        EchoDriver {
            conns: (0..max).map(|_| None).collect(),
            free: (0..max).rev().collect(),
            active: 0,
        }
    }

    fn accept_ready(
        &mut self,
        reactor: &mut Reactor<Token>,
        pools: &mut [Pool],
        stats: &Stats,
        pidx: u32,
    ) -> ProxyResult<()> {
        let pool = &pools[pidx as usize];
        // edge-triggered: drain the whole backlog
        while let Some(fd) = pool.accept()? {
            let Some(idx) = self.free.pop() else {
                // table full; dropping the fd closes the connection
                proxy::conn_closed();
                log_warn!("connection table full, rejecting client");
                return Ok(());
            };
            let mut conn = EchoConn {
                fd,
                pool: pidx,
                out: Vec::new(),
                recv_active: false,
                send_active: false,
            };
            if let Err(e) = reactor.add_conn_in(&mut conn, Token::Client(idx as u32)) {
                proxy::conn_closed();
                self.free.push(idx);
                return Err(e);
            }
            self.conns[idx] = Some(conn);
            self.active += 1;
            stats.pool_incr(pidx as usize, PoolField::ClientConnections);
        }
        Ok(())
    }

    fn close(&mut self, reactor: &mut Reactor<Token>, stats: &Stats, idx: usize) {
        if let Some(mut conn) = self.conns[idx].take() {
            let _ = reactor.del_conn(&mut conn);
            stats.pool_decr(conn.pool as usize, PoolField::ClientConnections);
            proxy::conn_closed();
            self.active -= 1;
            self.free.push(idx);
        }
    }

    /// Push pending bytes; registers for WRITE when the socket pushes
    /// back and drops the registration once drained.
    fn flush(
        &mut self,
        reactor: &mut Reactor<Token>,
        stats: &Stats,
        idx: usize,
    ) -> ProxyResult<()> {
        let mut wrote = false;
        loop {
            let Some(conn) = self.conns[idx].as_mut() else {
                return Ok(());
            };
            if conn.out.is_empty() {
                if wrote {
                    stats.pool_incr(conn.pool as usize, PoolField::Responses);
                }
                return reactor.del_conn_out(conn);
            }

            let n = unsafe {
                libc::send(
                    conn.fd.as_raw_fd(),
                    conn.out.as_ptr() as *const _,
                    conn.out.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                let n = n as usize;
                let pool = conn.pool as usize;
                conn.out.drain(..n);
                stats.pool_incr_by(pool, PoolField::ResponseBytes, n as i64);
                wrote = true;
                continue;
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    let token = Token::Client(idx as u32);
                    return reactor.add_conn_out(conn, token);
                }
                _ => {
                    self.close(reactor, stats, idx);
                    return Err(ProxyError::from(err));
                }
            }
        }
    }

    fn client_ready(
        &mut self,
        reactor: &mut Reactor<Token>,
        stats: &Stats,
        idx: usize,
        events: EventSet,
    ) -> ProxyResult<()> {
        if events.contains(EventSet::ERR) {
            self.close(reactor, stats, idx);
            return Ok(());
        }

        if events.contains(EventSet::READ) {
            let started = Instant::now();
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let Some(conn) = self.conns[idx].as_mut() else {
                    return Ok(());
                };
                let n = unsafe {
                    libc::read(conn.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, READ_CHUNK)
                };
                if n > 0 {
                    let n = n as usize;
                    let pool = conn.pool as usize;
                    conn.out.extend_from_slice(&buf[..n]);
                    stats.pool_incr(pool, PoolField::Requests);
                    stats.pool_incr_by(pool, PoolField::RequestBytes, n as i64);
                    continue;
                }
                if n == 0 {
                    let pool = conn.pool as usize;
                    stats.pool_incr(pool, PoolField::ClientEof);
                    self.close(reactor, stats, idx);
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => break,
                    _ => {
                        let pool = conn.pool as usize;
                        stats.pool_incr(pool, PoolField::ClientErr);
                        self.close(reactor, stats, idx);
                        return Err(ProxyError::from(err));
                    }
                }
            }
            self.flush(reactor, stats, idx)?;
            if let Some(conn) = self.conns[idx].as_ref() {
                let ms = started.elapsed().as_millis() as i64;
                stats.pool_record_latency(conn.pool as usize, ms.max(1));
            }
        } else if events.contains(EventSet::WRITE) {
            self.flush(reactor, stats, idx)?;
        }
        Ok(())
    }
}

impl Driver for EchoDriver {
    fn ready(
        &mut self,
        reactor: &mut Reactor<Token>,
        pools: &mut [Pool],
        stats: &Stats,
        token: Token,
        events: EventSet,
    ) -> ProxyResult<()> {
        match token {
            Token::Listener(pidx) => self.accept_ready(reactor, pools, stats, pidx),
            Token::Client(idx) => self.client_ready(reactor, stats, idx as usize, events),
            _ => Ok(()),
        }
    }

    fn active_conns(&self) -> usize {
        self.active
    }
}

// ── Entry point ──────────────────────────────────────────────────────

fn load_config() -> Result<ProxyConfig, ConfigError> {
    let mut cfg = ProxyConfig::from_env();
    if cfg.pools.is_empty() {
        cfg = cfg.pool(PoolConfig::new(
            "default",
            "127.0.0.1:22121".parse().expect("static address parses"),
        ));
    }
    cfg.validate()?;
    Ok(cfg)
}

fn main() {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("kestreld: {}", e);
            std::process::exit(2);
        }
    };

    let mut supervisor = match Supervisor::new(
        cfg,
        // reload re-reads the KESTREL_* environment
        Box::new(load_config),
        Box::new(|| Box::new(EchoDriver::new(MAX_CONNS))),
    ) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("kestreld: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = supervisor.run() {
        log_error!("fatal: {}", e);
        std::process::exit(1);
    }
}
