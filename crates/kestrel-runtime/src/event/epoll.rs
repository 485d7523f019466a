//! Edge-triggered epoll adapter
//!
//! Owns the epoll instance, a fixed-capacity readiness buffer sized at
//! creation, and a dense fd-indexed slot table mapping fd to
//! `{interest mask, token}`. The table grows on demand (doubling, or to
//! `fd + 1` if larger) and is never shrunk.
//!
//! Delivery is edge-triggered: callers must drain readable/writable
//! state to exhaustion before the next `wait`, or the readiness is not
//! re-reported.

use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::{log_error, log_trace};

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{Pollable, Ready};
use crate::signals;

struct Slot<T> {
    mask: EventSet,
    token: Option<T>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot {
            mask: EventSet::NONE,
            token: None,
        }
    }
}

/// Edge-triggered readiness dispatcher over one epoll instance
pub struct Reactor<T> {
    ep: OwnedFd,
    slots: Vec<Slot<T>>,
    events: Vec<libc::epoll_event>,
    nevent: usize,
}

fn kernel_events(mask: EventSet) -> u32 {
    let mut events = libc::EPOLLET as u32;
    if mask.contains(EventSet::READ) {
        events |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventSet::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

impl<T: Copy> Reactor<T> {
    /// Create a reactor. `nevent` is both the readiness-buffer size and
    /// the initial fd-table capacity.
    pub fn new(nevent: usize) -> ProxyResult<Self> {
        if nevent == 0 {
            return Err(ProxyError::Internal("reactor nevent must be > 0"));
        }
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            log_error!("epoll create of size {} failed", nevent);
            return Err(crate::os_err());
        }
        let ep = unsafe { OwnedFd::from_raw_fd(ep) };

        let mut slots = Vec::new();
        slots.resize_with(nevent, Slot::empty);

        let events = vec![libc::epoll_event { events: 0, u64: 0 }; nevent];

        log_trace!("e {} with nevent {}", ep.as_raw_fd(), nevent);

        Ok(Reactor {
            ep,
            slots,
            events,
            nevent,
        })
    }

    /// Grow the slot table so `fd` is addressable; existing entries are
    /// preserved and the table never shrinks.
    fn reserve_fd(&mut self, fd: RawFd) {
        let fd = fd as usize;
        if fd < self.slots.len() {
            return;
        }
        let new_size = if fd >= self.slots.len() * 2 {
            fd + 1
        } else {
            self.slots.len() * 2
        };
        self.slots.resize_with(new_size, Slot::empty);
    }

    /// Register or update interest in `fd`.
    ///
    /// `mask` is OR-merged into any existing interest; the token replaces
    /// the prior one.
    pub fn add(&mut self, fd: RawFd, mask: EventSet, token: T) -> ProxyResult<()> {
        debug_assert!(fd >= 0);
        debug_assert!(!mask.is_empty());

        self.reserve_fd(fd);
        let slot = &mut self.slots[fd as usize];
        let op = if slot.mask.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        slot.mask |= mask;
        slot.token = Some(token);

        let mut ev = libc::epoll_event {
            events: kernel_events(slot.mask),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            let err = crate::os_err();
            log_error!("epoll ctl on e {} sd {} failed: {}", self.ep.as_raw_fd(), fd, err);
            return Err(err);
        }
        Ok(())
    }

    /// Clear the given interest bits on `fd`.
    ///
    /// When the residual mask is empty the fd is fully deregistered and
    /// its token dropped; a later `wait` never dispatches on it again.
    pub fn del(&mut self, fd: RawFd, delmask: EventSet) -> ProxyResult<()> {
        debug_assert!(fd >= 0);
        if fd as usize >= self.slots.len() {
            return Err(ProxyError::Internal("del on fd beyond slot table"));
        }
        let slot = &mut self.slots[fd as usize];
        let residual = slot.mask.remove(delmask);
        slot.mask = residual;

        // kernels before 2.6.9 want a non-null event even for CTL_DEL
        let mut ev = libc::epoll_event {
            events: 0,
            u64: fd as u64,
        };
        let rc = if residual.is_empty() {
            slot.token = None;
            unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev) }
        } else {
            ev.events = kernel_events(residual);
            unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev) }
        };
        if rc < 0 {
            let err = crate::os_err();
            log_error!("epoll ctl on e {} sd {} failed: {}", self.ep.as_raw_fd(), fd, err);
            return Err(err);
        }
        Ok(())
    }

    /// Block until at least one fd is ready or `timeout_ms` elapses
    /// (`-1` means indefinite), then push `(token, events)` pairs for
    /// every ready registration into `out`.
    ///
    /// Hangup folds into `READ`; `ERR` is reported without being
    /// requested. `EINTR` is retried internally unless the drain alarm
    /// fired, which surfaces as `Interrupted` so the owning loop can
    /// re-check its shutdown flags.
    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<Ready<T>>) -> ProxyResult<usize> {
        out.clear();
        loop {
            let n = unsafe {
                libc::epoll_pwait(
                    self.ep.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.nevent as i32,
                    timeout_ms,
                    std::ptr::null(),
                )
            };

            if n > 0 {
                for i in 0..n as usize {
                    let ev = self.events[i];
                    let fd = ev.u64 as RawFd;
                    let mut set = EventSet::NONE;
                    if ev.events & libc::EPOLLERR as u32 != 0 {
                        set |= EventSet::ERR;
                    }
                    if ev.events & (libc::EPOLLIN | libc::EPOLLHUP) as u32 != 0 {
                        set |= EventSet::READ;
                    }
                    if ev.events & libc::EPOLLOUT as u32 != 0 {
                        set |= EventSet::WRITE;
                    }
                    let ev_events = ev.events;
                    log_trace!("epoll {:04x} triggered on sd {}", ev_events, fd);

                    // a handler earlier in this batch may have deregistered it
                    if let Some(slot) = self.slots.get(fd as usize) {
                        if let Some(token) = slot.token {
                            out.push(Ready { token, events: set });
                        }
                    }
                }
                return Ok(out.len());
            }

            if n == 0 {
                if timeout_ms == -1 {
                    log_error!(
                        "epoll wait on e {} with no timeout returned no events",
                        self.ep.as_raw_fd()
                    );
                    return Err(ProxyError::Internal("indefinite wait returned no events"));
                }
                return Ok(0);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                if signals::take_alarm() {
                    return Err(ProxyError::Interrupted);
                }
                continue;
            }
            log_error!("epoll wait on e {} failed: {}", self.ep.as_raw_fd(), err);
            return Err(ProxyError::from(err));
        }
    }

    /// Interest currently registered for `fd` (NONE when unregistered)
    pub fn interest(&self, fd: RawFd) -> EventSet {
        self.slots
            .get(fd as usize)
            .map(|s| s.mask)
            .unwrap_or(EventSet::NONE)
    }

    // ── Connection wrappers ──────────────────────────────────────────
    //
    // Repeat-safe direction toggles driven by the connection's own
    // `recv_active`/`send_active` flags. A writable-only registration is
    // never used: `add_conn_out` requires reads to be active already.

    pub fn add_conn_in<P: Pollable>(&mut self, c: &mut P, token: T) -> ProxyResult<()> {
        if c.recv_active() {
            return Ok(());
        }
        self.add(c.fd(), EventSet::READ, token)?;
        c.set_recv_active(true);
        Ok(())
    }

    /// Kept as a no-op for symmetry with `add_conn_in`; reads stay
    /// registered until `del_conn`.
    pub fn del_conn_in<P: Pollable>(&mut self, _c: &mut P) -> ProxyResult<()> {
        Ok(())
    }

    pub fn add_conn_out<P: Pollable>(&mut self, c: &mut P, token: T) -> ProxyResult<()> {
        debug_assert!(c.recv_active());
        if c.send_active() {
            return Ok(());
        }
        self.add(c.fd(), EventSet::WRITE, token)?;
        c.set_send_active(true);
        Ok(())
    }

    pub fn del_conn_out<P: Pollable>(&mut self, c: &mut P) -> ProxyResult<()> {
        debug_assert!(c.recv_active());
        if !c.send_active() {
            return Ok(());
        }
        self.del(c.fd(), EventSet::WRITE)?;
        c.set_send_active(false);
        Ok(())
    }

    pub fn add_conn<P: Pollable>(&mut self, c: &mut P, token: T) -> ProxyResult<()> {
        self.add(c.fd(), EventSet::READ | EventSet::WRITE, token)?;
        c.set_recv_active(true);
        c.set_send_active(true);
        Ok(())
    }

    pub fn del_conn<P: Pollable>(&mut self, c: &mut P) -> ProxyResult<()> {
        self.del(c.fd(), EventSet::READ | EventSet::WRITE)?;
        c.set_recv_active(false);
        c.set_send_active(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn send_byte(fd: &OwnedFd) {
        let b = [0x2au8];
        let n = unsafe { libc::write(fd.as_raw_fd(), b.as_ptr() as *const _, 1) };
        assert_eq!(n, 1);
    }

    fn drain(fd: &OwnedFd) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, 64) };
            if n <= 0 {
                break;
            }
        }
    }

    #[test]
    fn test_read_dispatch() {
        let (a, b) = sock_pair();
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();
        let mut out = Vec::new();

        r.add(a.as_raw_fd(), EventSet::READ, 7).unwrap();
        assert_eq!(r.wait(0, &mut out).unwrap(), 0);

        send_byte(&b);
        assert_eq!(r.wait(1000, &mut out).unwrap(), 1);
        assert_eq!(out[0].token, 7);
        assert!(out[0].events.contains(EventSet::READ));
    }

    #[test]
    fn test_mask_or_merge() {
        let (a, b) = sock_pair();
        let _keep = b;
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();

        r.add(a.as_raw_fd(), EventSet::READ, 1).unwrap();
        r.add(a.as_raw_fd(), EventSet::WRITE, 2).unwrap();
        assert_eq!(r.interest(a.as_raw_fd()), EventSet::READ | EventSet::WRITE);

        // a fresh socket is writable; the merged registration reports it
        let mut out = Vec::new();
        assert_eq!(r.wait(1000, &mut out).unwrap(), 1);
        assert!(out[0].events.contains(EventSet::WRITE));
        // token was replaced by the second add
        assert_eq!(out[0].token, 2);
    }

    #[test]
    fn test_del_to_none_stops_dispatch() {
        let (a, b) = sock_pair();
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();
        let mut out = Vec::new();

        r.add(a.as_raw_fd(), EventSet::READ, 1).unwrap();
        r.del(a.as_raw_fd(), EventSet::READ | EventSet::WRITE).unwrap();
        assert_eq!(r.interest(a.as_raw_fd()), EventSet::NONE);

        send_byte(&b);
        assert_eq!(r.wait(50, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_del_partial_keeps_residual() {
        let (a, b) = sock_pair();
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();
        let mut out = Vec::new();

        r.add(a.as_raw_fd(), EventSet::READ | EventSet::WRITE, 1).unwrap();
        // consume the initial writable edge
        r.wait(1000, &mut out).unwrap();

        r.del(a.as_raw_fd(), EventSet::WRITE).unwrap();
        assert_eq!(r.interest(a.as_raw_fd()), EventSet::READ);

        send_byte(&b);
        assert_eq!(r.wait(1000, &mut out).unwrap(), 1);
        assert!(out[0].events.contains(EventSet::READ));
        assert!(!out[0].events.contains(EventSet::WRITE));
    }

    #[test]
    fn test_slot_table_growth_preserves_entries() {
        let (a, b) = sock_pair();
        let (c, d) = sock_pair();
        // tiny initial capacity forces growth on first registration
        let mut r: Reactor<u32> = Reactor::new(1).unwrap();
        let mut out = Vec::new();

        r.add(a.as_raw_fd(), EventSet::READ, 1).unwrap();
        r.add(c.as_raw_fd(), EventSet::READ, 2).unwrap();

        send_byte(&b);
        send_byte(&d);
        let mut seen = Vec::new();
        while seen.len() < 2 {
            r.wait(1000, &mut out).unwrap();
            assert!(!out.is_empty());
            for i in 0..out.len() {
                let ev = out[i];
                seen.push(ev.token);
                // drain only the reported fd; edge-triggered delivery
                // would otherwise drop the still-pending sibling event
                match ev.token {
                    1 => drain(&a),
                    2 => drain(&c),
                    _ => unreachable!(),
                }
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_peer_close_reports_read() {
        let (a, b) = sock_pair();
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();
        let mut out = Vec::new();

        r.add(a.as_raw_fd(), EventSet::READ, 9).unwrap();
        drop(b);
        assert_eq!(r.wait(1000, &mut out).unwrap(), 1);
        // hangup folds into READ so the owner reads to EOF
        assert!(out[0].events.contains(EventSet::READ));
    }

    struct TestConn {
        fd: RawFd,
        recv_active: bool,
        send_active: bool,
    }

    impl Pollable for TestConn {
        fn fd(&self) -> RawFd {
            self.fd
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

    #[test]
    fn test_conn_wrappers_are_repeat_safe() {
        let (a, b) = sock_pair();
        let _keep = b;
        let mut r: Reactor<u32> = Reactor::new(4).unwrap();
        let mut c = TestConn {
            fd: a.as_raw_fd(),
            recv_active: false,
            send_active: false,
        };

        r.add_conn_in(&mut c, 1).unwrap();
        assert!(c.recv_active);
        // second call is a no-op, not a kernel error
        r.add_conn_in(&mut c, 1).unwrap();
        assert_eq!(r.interest(c.fd), EventSet::READ);

        r.add_conn_out(&mut c, 1).unwrap();
        assert!(c.send_active);
        assert_eq!(r.interest(c.fd), EventSet::READ | EventSet::WRITE);

        r.del_conn_out(&mut c).unwrap();
        assert!(!c.send_active);
        assert_eq!(r.interest(c.fd), EventSet::READ);
        r.del_conn_out(&mut c).unwrap();

        // del_conn_in stays registered by design
        r.del_conn_in(&mut c).unwrap();
        assert_eq!(r.interest(c.fd), EventSet::READ);

        r.del_conn(&mut c).unwrap();
        assert!(!c.recv_active && !c.send_active);
        assert_eq!(r.interest(c.fd), EventSet::NONE);
    }
}
