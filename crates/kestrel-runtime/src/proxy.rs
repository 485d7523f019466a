//! Listening-pool lifecycle and migration
//!
//! The connection engine behind a pool is external; this module owns the
//! listening sockets: binding (with `SO_REUSEPORT`, since every worker
//! slot gets its own socket for the same address), the drain-time
//! "stop accepting" hook, and the reload-time migration of already-bound
//! sockets between contexts when `address:port` matches.

use kestrel_core::config::PoolConfig;
use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::{log_info, log_warn};

use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::event::Reactor;

const LISTEN_BACKLOG: libc::c_int = 128;

// Process-wide connection counters feeding the snapshot header.
static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static CURR_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

pub fn conn_opened() {
    TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    CURR_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn conn_closed() {
    CURR_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

pub fn total_connections() -> u64 {
    TOTAL_CONNECTIONS.load(Ordering::Relaxed)
}

pub fn curr_connections() -> i64 {
    CURR_CONNECTIONS.load(Ordering::Relaxed)
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    size_of::<libc::sockaddr_in>(),
                );
            }
            (ss, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    size_of::<libc::sockaddr_in6>(),
                );
            }
            (ss, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to_addr(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

fn set_opt(fd: RawFd, opt: libc::c_int) -> ProxyResult<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &on as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(crate::os_err());
    }
    Ok(())
}

/// Address a socket is locally bound to (resolves port 0).
pub fn local_addr_of(fd: RawFd) -> ProxyResult<SocketAddr> {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    sockaddr_to_addr(&ss).ok_or(ProxyError::Internal("unknown address family"))
}

/// Bind a non-blocking listening socket with address and port reuse.
pub fn bind_listener(addr: &SocketAddr) -> ProxyResult<OwnedFd> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let sd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if sd < 0 {
        return Err(crate::os_err());
    }
    let sd = unsafe { OwnedFd::from_raw_fd(sd) };

    set_opt(sd.as_raw_fd(), libc::SO_REUSEADDR)?;
    set_opt(sd.as_raw_fd(), libc::SO_REUSEPORT)?;

    let (ss, len) = sockaddr_of(addr);
    let rc = unsafe { libc::bind(sd.as_raw_fd(), &ss as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    let rc = unsafe { libc::listen(sd.as_raw_fd(), LISTEN_BACKLOG) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    Ok(sd)
}

/// One listening pool as the core sees it
pub struct Pool {
    pub name: String,
    pub addr: SocketAddr,
    listener: Option<OwnedFd>,
    accepting: bool,
}

impl Pool {
    pub fn from_config(cfg: &PoolConfig) -> Pool {
        Pool {
            name: cfg.name.clone(),
            addr: cfg.listen,
            listener: None,
            accepting: false,
        }
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Bind the pool's listening socket. A pool that received a migrated
    /// socket on reload keeps it and skips the fresh bind.
    pub fn bind(&mut self) -> ProxyResult<()> {
        if self.listener.is_none() {
            let sd = bind_listener(&self.addr)?;
            log_info!(
                "pool [{}] listening on {} (sd {})",
                self.name,
                self.addr,
                sd.as_raw_fd()
            );
            self.listener = Some(sd);
        }
        self.accepting = true;
        Ok(())
    }

    /// Address the kernel actually bound (resolves port 0).
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        let fd = self
            .listener_fd()
            .ok_or(ProxyError::Internal("pool is not bound"))?;
        local_addr_of(fd)
    }

    /// Accept one pending connection; `None` when the backlog is empty.
    /// Accepted sockets are non-blocking and counted.
    pub fn accept(&self) -> ProxyResult<Option<OwnedFd>> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };
        loop {
            let sd = unsafe {
                libc::accept4(
                    listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if sd >= 0 {
                conn_opened();
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(sd) }));
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::ECONNABORTED) => return Ok(None),
                _ => return Err(ProxyError::from(err)),
            }
        }
    }

    /// Drain-time hook: deregister and close the listening socket so no
    /// new connections arrive while in-flight requests finish.
    pub fn unaccept<T: Copy>(&mut self, reactor: &mut Reactor<T>) {
        if let Some(listener) = self.listener.take() {
            let _ = reactor.del(listener.as_raw_fd(), EventSet::READ | EventSet::WRITE);
            log_warn!("pool [{}] stopped accepting on {}", self.name, self.addr);
        }
        self.accepting = false;
    }

    /// Close without touching a reactor (master-side teardown).
    pub fn close(&mut self) {
        self.listener = None;
        self.accepting = false;
    }

    fn take_listener(&mut self) -> Option<OwnedFd> {
        self.accepting = false;
        self.listener.take()
    }

    fn put_listener(&mut self, fd: OwnedFd) {
        self.listener = Some(fd);
    }
}

/// Build unbound pools from configuration.
pub fn build_pools(cfgs: &[PoolConfig]) -> Vec<Pool> {
    cfgs.iter().map(Pool::from_config).collect()
}

/// Bind every pool that does not already hold a (migrated) socket.
pub fn bind_pools(pools: &mut [Pool]) -> ProxyResult<()> {
    for pool in pools.iter_mut() {
        pool.bind()?;
    }
    Ok(())
}

/// Keep the old context's bound sockets wherever the new context listens
/// on the same `address:port`. A name-only change keeps the socket and
/// is logged; unmatched new pools are left for a fresh bind.
pub fn migrate_pools(dst: &mut [Pool], src: &mut [Pool]) {
    for old in src.iter_mut() {
        for new in dst.iter_mut() {
            if new.addr != old.addr {
                continue;
            }
            if new.name != old.name {
                log_warn!(
                    "listening socket's name changed from [{}] to [{}]",
                    old.name,
                    new.name
                );
            }
            if new.is_bound() {
                continue;
            }
            if let Some(fd) = old.take_listener() {
                log_warn!("migrate [{}] [{}]", new.name, new.addr);
                new.put_listener(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::config::PoolConfig;

    fn ephemeral_pool(name: &str) -> Pool {
        let cfg = PoolConfig::new(name, "127.0.0.1:0".parse().unwrap());
        let mut p = Pool::from_config(&cfg);
        p.bind().unwrap();
        p
    }

    #[test]
    fn test_bind_and_local_addr() {
        let p = ephemeral_pool("alpha");
        let addr = p.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert!(p.is_bound());
    }

    #[test]
    fn test_accept_counts_connections() {
        let p = ephemeral_pool("alpha");
        let addr = p.local_addr().unwrap();

        assert!(p.accept().unwrap().is_none());

        let before_total = total_connections();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        // the backlog entry shows up without a reactor in this test
        let mut accepted = None;
        for _ in 0..100 {
            accepted = p.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let accepted = accepted.expect("no connection accepted");
        assert!(accepted.as_raw_fd() >= 0);
        assert_eq!(total_connections(), before_total + 1);
        conn_closed();
    }

    #[test]
    fn test_reuseport_allows_sibling_binds() {
        let a = ephemeral_pool("alpha");
        let addr = a.local_addr().unwrap();

        // second bind of the same address, as a sibling worker slot would
        let cfg = PoolConfig::new("alpha", addr);
        let mut b = Pool::from_config(&cfg);
        b.bind().unwrap();
        assert!(b.is_bound());
    }

    #[test]
    fn test_migrate_matching_address() {
        let mut old = vec![ephemeral_pool("alpha")];
        let addr = old[0].local_addr().unwrap();
        let old_fd = old[0].listener_fd().unwrap();

        // renamed pool, same address: socket moves over
        let mut new = vec![Pool::from_config(&PoolConfig::new("beta", addr))];
        migrate_pools(&mut new, &mut old);

        assert!(new[0].is_bound());
        assert!(!old[0].is_bound());
        assert_eq!(new[0].listener_fd().unwrap(), old_fd);

        // bind() after migration keeps the migrated socket
        new[0].bind().unwrap();
        assert_eq!(new[0].listener_fd().unwrap(), old_fd);
    }

    #[test]
    fn test_migrate_skips_unmatched() {
        let mut old = vec![ephemeral_pool("alpha")];
        let mut new = vec![Pool::from_config(&PoolConfig::new(
            "alpha",
            "127.0.0.1:1".parse().unwrap(),
        ))];
        migrate_pools(&mut new, &mut old);
        assert!(!new[0].is_bound());
        assert!(old[0].is_bound());
    }

    #[test]
    fn test_unaccept_closes_listener() {
        let mut p = ephemeral_pool("alpha");
        let mut reactor: Reactor<u8> = Reactor::new(4).unwrap();
        reactor
            .add(p.listener_fd().unwrap(), EventSet::READ, 1)
            .unwrap();
        p.unaccept(&mut reactor);
        assert!(!p.is_bound());
        assert!(p.accept().unwrap().is_none());
    }
}
