//! Signal plumbing for master and workers
//!
//! Handlers do no work themselves: master-side handlers push a typed
//! event onto a lock-free queue and write one byte to a self-pipe; the
//! supervisor loop blocks on the pipe and drains the queue outside
//! handler context. Worker processes consume only `SIGALRM` (the drain
//! timer); everything else is blocked and shutdown arrives over the
//! control channel.
//!
//! Process-wide shutdown flags (`quit`, `terminate`) are published with
//! release stores and observed with acquire loads; both the channel
//! handler and the alarm handler toggle them.

use kestrel_core::error::ProxyResult;

use crossbeam_queue::ArrayQueue;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

/// Typed event posted by a master signal handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP: rebuild the configuration and restart workers
    Reload,
    /// SIGCHLD: reap and maybe respawn
    ChildExit,
    /// SIGINT: broadcast quit, wait, exit
    QuitAll,
    /// SIGTERM: broadcast terminate, wait, exit
    TerminateAll,
    /// SIGUSR1
    LogReopen,
    /// SIGTTIN
    LogLevelUp,
    /// SIGTTOU
    LogLevelDown,
}

const EVENT_QUEUE_CAP: usize = 64;

// Initialized eagerly by install_master() so handlers never allocate.
static EVENTS: OnceLock<ArrayQueue<SignalEvent>> = OnceLock::new();
static WAKE_WR: AtomicI32 = AtomicI32::new(-1);

static ALARM_FIRED: AtomicBool = AtomicBool::new(false);
static QUIT: AtomicBool = AtomicBool::new(false);
static TERMINATE: AtomicBool = AtomicBool::new(false);

// ── Shutdown flags ───────────────────────────────────────────────────

#[inline]
pub fn quit_requested() -> bool {
    QUIT.load(Ordering::Acquire)
}

#[inline]
pub fn request_quit() {
    QUIT.store(true, Ordering::Release);
}

#[inline]
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::Acquire)
}

#[inline]
pub fn request_terminate() {
    TERMINATE.store(true, Ordering::Release);
}

/// Consume the "drain alarm fired" edge recorded by the SIGALRM handler.
#[inline]
pub fn take_alarm() -> bool {
    ALARM_FIRED.swap(false, Ordering::AcqRel)
}

// ── Handlers ─────────────────────────────────────────────────────────

fn wake() {
    let fd = WAKE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let b = [1u8];
        // EAGAIN means a wakeup is already pending, which is enough
        unsafe { libc::write(fd, b.as_ptr() as *const _, 1) };
    }
}

extern "C" fn master_handler(signo: libc::c_int) {
    let ev = match signo {
        libc::SIGHUP => SignalEvent::Reload,
        libc::SIGCHLD => SignalEvent::ChildExit,
        libc::SIGINT => SignalEvent::QuitAll,
        libc::SIGTERM => SignalEvent::TerminateAll,
        libc::SIGUSR1 => SignalEvent::LogReopen,
        libc::SIGTTIN => SignalEvent::LogLevelUp,
        libc::SIGTTOU => SignalEvent::LogLevelDown,
        _ => return,
    };
    if let Some(q) = EVENTS.get() {
        // a full queue drops the event; control is idempotent and the
        // sender retries by intent, not by protocol
        let _ = q.push(ev);
    }
    wake();
}

extern "C" fn alarm_handler(_signo: libc::c_int) {
    ALARM_FIRED.store(true, Ordering::Release);
    if TERMINATE.load(Ordering::Acquire) {
        // drain deadline reached: time's up, quit
        QUIT.store(true, Ordering::Release);
        TERMINATE.store(false, Ordering::Release);
    }
}

extern "C" fn segv_handler(_signo: libc::c_int) {
    log_safe(b"SIGSEGV received, dumping core\n");
    // SA_RESETHAND restored the default disposition; re-raise for the dump
    unsafe {
        libc::raise(libc::SIGSEGV);
    }
}

/// Async-signal-safe raw write to stderr.
pub fn log_safe(msg: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const _, msg.len());
    }
}

// ── Installation ─────────────────────────────────────────────────────

fn install(sig: Signal, handler: SigHandler, flags: SaFlags) -> ProxyResult<()> {
    let sa = SigAction::new(handler, flags, SigSet::empty());
    unsafe {
        signal::sigaction(sig, &sa).map_err(|e| kestrel_core::error::ProxyError::Os(e as i32))?;
    }
    Ok(())
}

/// Create the self-pipe the supervisor loop sleeps on.
///
/// The read end stays blocking; the write end is non-blocking so a full
/// pipe never stalls a handler.
pub fn signal_pipe() -> ProxyResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let rc = unsafe { libc::fcntl(wr.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    Ok((rd, wr))
}

/// Install the master's signal set and arm the event queue.
pub fn install_master(wake_wr: RawFd) -> ProxyResult<()> {
    EVENTS.get_or_init(|| ArrayQueue::new(EVENT_QUEUE_CAP));
    WAKE_WR.store(wake_wr, Ordering::Release);

    for sig in [
        Signal::SIGHUP,
        Signal::SIGCHLD,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
    ] {
        install(sig, SigHandler::Handler(master_handler), SaFlags::empty())?;
    }
    install(Signal::SIGALRM, SigHandler::Handler(alarm_handler), SaFlags::empty())?;
    install(
        Signal::SIGSEGV,
        SigHandler::Handler(segv_handler),
        SaFlags::SA_RESETHAND,
    )?;
    install(Signal::SIGPIPE, SigHandler::SigIgn, SaFlags::empty())?;
    Ok(())
}

/// Worker-side signal state, called first thing after fork: clear the
/// flags and queue inherited from the master, keep only the SIGALRM
/// handler deliverable.
pub fn install_worker() -> ProxyResult<()> {
    QUIT.store(false, Ordering::Release);
    TERMINATE.store(false, Ordering::Release);
    ALARM_FIRED.store(false, Ordering::Release);
    WAKE_WR.store(-1, Ordering::Release);
    if let Some(q) = EVENTS.get() {
        while q.pop().is_some() {}
    }

    install(Signal::SIGALRM, SigHandler::Handler(alarm_handler), SaFlags::empty())?;
    install(Signal::SIGPIPE, SigHandler::SigIgn, SaFlags::empty())?;

    let mut mask = SigSet::all();
    mask.remove(Signal::SIGALRM);
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .map_err(|e| kestrel_core::error::ProxyError::Os(e as i32))?;
    Ok(())
}

/// Block every signal on the calling thread. Sampler and scrape threads
/// call this so SIGALRM and the master set always land on the main
/// thread's wait.
pub fn block_all_in_thread() {
    let mask = SigSet::all();
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None);
}

// ── Event delivery ───────────────────────────────────────────────────

/// Block until a handler wakes us, then return. EINTR is expected: the
/// handler that interrupted the read has already queued its event.
pub fn wait_for_wake(rd: &OwnedFd) {
    let mut buf = [0u8; 32];
    loop {
        let n = unsafe { libc::read(rd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
        if n > 0 {
            return;
        }
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                // the signal itself is the wakeup
                return;
            }
        }
        return;
    }
}

/// Pop the next queued event, if any.
pub fn next_event() -> Option<SignalEvent> {
    EVENTS.get()?.pop()
}

// ── Drain timer ──────────────────────────────────────────────────────

/// Arm the one-shot real-time drain timer.
pub fn set_drain_timer(secs: u64) -> ProxyResult<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: secs as libc::time_t,
            tv_usec: 0,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(crate::os_err());
    }
    Ok(())
}

/// Disarm the drain timer.
pub fn clear_drain_timer() {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };
    unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
}

/// Serializes tests that poke the process-global flags.
#[cfg(test)]
pub(crate) mod test_sync {
    use std::sync::Mutex;
    pub static FLAGS: Mutex<()> = Mutex::new(());
}

#[cfg(test)]
pub(crate) fn reset_flags_for_test() {
    QUIT.store(false, Ordering::Release);
    TERMINATE.store(false, Ordering::Release);
    ALARM_FIRED.store(false, Ordering::Release);
}
