//! Master-side telemetry fan-in
//!
//! The master binds one TCP listener and runs a small reactor over just
//! that fd in its own thread. Each accepted connection gets the
//! concatenation of every live worker's shared-memory snapshot as a
//! JSON array (`[w0,w1,…]`), then the socket is closed. No keep-alive,
//! no request parsing.
//!
//! Snapshots from different workers are scraped at slightly different
//! wall-clock moments by construction; the array is eventually
//! consistent, never transactional.

use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::{log_error, log_info, log_warn};

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::event::{Reactor, Ready, Token};
use crate::proxy;
use crate::shm::SharedRegion;
use crate::signals;

/// The set of worker regions the scraper reads, swapped wholesale by the
/// supervisor on reload.
pub struct ScrapeRegistry {
    regions: Mutex<Vec<Arc<SharedRegion>>>,
}

impl ScrapeRegistry {
    pub fn new() -> ScrapeRegistry {
        ScrapeRegistry {
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Replace the region set (worker generation changed).
    pub fn replace(&self, regions: Vec<Arc<SharedRegion>>) {
        let mut guard = self.regions.lock().unwrap_or_else(|e| e.into_inner());
        *guard = regions;
    }

    /// Snapshot every region that currently holds a framed payload.
    fn collect(&self) -> Vec<Vec<u8>> {
        let guard = self.regions.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .filter_map(|r| r.read_snapshot())
            .collect()
    }
}

impl Default for ScrapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Join worker snapshots into the response body `[w0,w1,…]`.
///
/// The per-worker trailing newline is stripped; workers that have not
/// published yet are skipped.
pub fn assemble(parts: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 1).sum();
    let mut buf = Vec::with_capacity(total + 2);
    buf.push(b'[');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        let body = match part.last() {
            Some(b'\n') => &part[..part.len() - 1],
            _ => &part[..],
        };
        buf.extend_from_slice(body);
    }
    buf.push(b']');
    buf
}

/// Bind the telemetry listener.
pub fn bind_stats_listener(addr: &str, port: u16) -> ProxyResult<OwnedFd> {
    let sockaddr: SocketAddr = format!("{}:{}", addr, port)
        .parse()
        .map_err(|_| ProxyError::Internal("stats address must be ip:port"))?;
    let sd = proxy::bind_listener(&sockaddr)?;
    log_info!("m {} listening on {}", sd.as_raw_fd(), sockaddr);
    Ok(sd)
}

fn send_all(sd: RawFd, buf: &[u8]) -> ProxyResult<()> {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe {
            libc::send(
                sd,
                buf[off..].as_ptr() as *const _,
                buf.len() - off,
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(ProxyError::from(err));
        }
        off += n as usize;
    }
    Ok(())
}

fn serve_one(listener: RawFd, registry: &ScrapeRegistry) {
    loop {
        let sd = unsafe { libc::accept4(listener, std::ptr::null_mut(), std::ptr::null_mut(), 0) };
        if sd < 0 {
            // EAGAIN means the backlog is drained for this edge
            return;
        }
        let sd = unsafe { OwnedFd::from_raw_fd(sd) };

        let payload = assemble(&registry.collect());
        if let Err(e) = send_all(sd.as_raw_fd(), &payload) {
            log_error!("send stats of {} bytes failed: {}", payload.len(), e);
        }
        // drop closes; one exchange per connection
    }
}

/// Handle to the master's scrape thread
pub struct Scraper {
    shutdown: Arc<AtomicBool>,
    addr: SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl Scraper {
    /// Start the scrape loop on its own thread over the bound listener.
    pub fn spawn(
        listener: OwnedFd,
        registry: Arc<ScrapeRegistry>,
        interval_ms: u64,
    ) -> ProxyResult<Scraper> {
        let addr = proxy::local_addr_of(listener.as_raw_fd())?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("kestrel-stats".into())
            .spawn(move || {
                signals::block_all_in_thread();
                scrape_loop(listener, &registry, interval_ms, &shutdown_clone);
            })
            .expect("failed to spawn stats thread");

        Ok(Scraper {
            shutdown,
            addr,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the loop; a throwaway connection wakes it out of its wait.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = std::net::TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scraper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scrape_loop(
    listener: OwnedFd,
    registry: &ScrapeRegistry,
    interval_ms: u64,
    shutdown: &AtomicBool,
) {
    let mut reactor: Reactor<Token> = match Reactor::new(1) {
        Ok(r) => r,
        Err(e) => {
            log_error!("stats reactor create failed: {}", e);
            return;
        }
    };
    if let Err(e) = reactor.add(listener.as_raw_fd(), EventSet::READ, Token::Stats) {
        log_error!("stats listener register failed: {}", e);
        return;
    }

    let mut ready: Vec<Ready<Token>> = Vec::new();
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match reactor.wait(interval_ms as i32, &mut ready) {
            Ok(0) => continue,
            Ok(_) => {
                for ev in &ready {
                    if ev.token == Token::Stats && ev.events.contains(EventSet::READ) {
                        serve_one(listener.as_raw_fd(), registry);
                    }
                }
            }
            Err(ProxyError::Interrupted) => continue,
            Err(e) => {
                log_warn!("stats wait failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_assemble_shapes() {
        assert_eq!(assemble(&[]), b"[]");

        let parts = vec![b"{\"a\":1}\n".to_vec(), b"{\"b\":2}\n".to_vec()];
        assert_eq!(assemble(&parts), b"[{\"a\":1},{\"b\":2}]");
    }

    #[test]
    fn test_registry_skips_unpublished_regions() {
        let registry = ScrapeRegistry::new();
        let published = Arc::new(SharedRegion::alloc(4096).unwrap());
        let empty = Arc::new(SharedRegion::alloc(4096).unwrap());
        published.write_snapshot(b"{\"pid\":1}\n").unwrap();
        registry.replace(vec![published, empty]);

        let parts = registry.collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(assemble(&parts), b"[{\"pid\":1}]");
    }

    #[test]
    fn test_scrape_end_to_end() {
        let registry = Arc::new(ScrapeRegistry::new());
        let r0 = Arc::new(SharedRegion::alloc(4096).unwrap());
        let r1 = Arc::new(SharedRegion::alloc(4096).unwrap());
        r0.write_snapshot(b"{\"pid\":10}\n").unwrap();
        r1.write_snapshot(b"{\"pid\":11}\n").unwrap();
        registry.replace(vec![r0, r1]);

        let listener = bind_stats_listener("127.0.0.1", 0).unwrap();
        let mut scraper = Scraper::spawn(listener, registry, 50).unwrap();

        let mut body = Vec::new();
        let mut conn = std::net::TcpStream::connect(scraper.addr()).unwrap();
        conn.read_to_end(&mut body).unwrap();
        drop(conn);
        scraper.stop();

        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let arr = v.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["pid"], 10);
        assert_eq!(arr[1]["pid"], 11);
    }
}
