//! Master↔worker control channel
//!
//! A non-blocking socketpair per worker. The master writes framed
//! commands to its end; the worker drains them from the reactor's READ
//! events and flips the process shutdown flags or pokes the log sink.
//! The worker never writes back: the channel is master→worker by
//! convention, so WRITE readiness is a no-op.
//!
//! Frames are fixed-size (`FRAME_SIZE`) and fit well inside the socket
//! buffer, so a frame is sent and received whole; a short read means the
//! peer is gone or confused and the channel is deregistered.

use kestrel_core::command::{Command, CtlMsg, FRAME_SIZE};
use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::{log, log_error, log_warn};

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::event::Reactor;
use crate::signals;

/// One worker's control channel: `fds[0]` master end, `fds[1]` worker end
pub struct ControlChannel {
    master: OwnedFd,
    worker: OwnedFd,
}

impl ControlChannel {
    /// Create a non-blocking socketpair. Both ends close on drop.
    pub fn alloc() -> ProxyResult<ControlChannel> {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            let err = crate::os_err();
            log_error!("socketpair() failed: {}", err);
            return Err(err);
        }
        let (master, worker) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(ControlChannel { master, worker })
    }

    /// End the master writes to
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// End the worker registers with its reactor
    pub fn worker_fd(&self) -> RawFd {
        self.worker.as_raw_fd()
    }

    /// Keep only the worker end, closing the master end. Called in the
    /// child right after fork.
    pub fn into_worker_end(self) -> OwnedFd {
        self.worker
    }
}

/// Send one whole framed message.
///
/// `EAGAIN` surfaces as `WouldBlock`; partial writes do not occur
/// because a frame fits within the socket buffer.
pub fn write_msg(fd: RawFd, msg: CtlMsg) -> ProxyResult<usize> {
    let buf = msg.to_bytes();
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const _, FRAME_SIZE, 0) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Err(ProxyError::WouldBlock);
        }
        return Err(ProxyError::from(err));
    }
    Ok(n as usize)
}

/// Receive one whole framed message.
///
/// EOF reads as `Closed`; a short read or unknown command as `BadFrame`.
pub fn read_msg(fd: RawFd) -> ProxyResult<CtlMsg> {
    let mut buf = [0u8; FRAME_SIZE];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, FRAME_SIZE, 0) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Err(ProxyError::WouldBlock);
        }
        return Err(ProxyError::from(err));
    }
    if n == 0 {
        return Err(ProxyError::Closed);
    }
    if (n as usize) < FRAME_SIZE {
        return Err(ProxyError::BadFrame);
    }
    CtlMsg::from_bytes(&buf)
}

fn dispatch(cmd: Command) {
    match cmd {
        Command::Quit => {
            signals::request_quit();
            log_warn!("quit command received");
        }
        Command::Terminate => {
            signals::request_terminate();
            log_warn!("terminate command received");
        }
        Command::LogReopen => log::reopen(),
        Command::LogLevelUp => log::level_up(),
        Command::LogLevelDown => log::level_down(),
    }
}

/// Worker-side readiness handler for the channel fd.
///
/// `ERR` deregisters the fd; `READ` drains messages to `WouldBlock`,
/// dispatching each in arrival order; a closed or malformed channel is
/// deregistered and reported. Commands are idempotent, so redelivery is
/// harmless.
pub fn channel_ready<T: Copy>(
    reactor: &mut Reactor<T>,
    fd: RawFd,
    events: EventSet,
) -> ProxyResult<()> {
    if events.contains(EventSet::ERR) {
        return reactor.del(fd, EventSet::READ | EventSet::WRITE);
    }
    if events.contains(EventSet::READ) {
        loop {
            match read_msg(fd) {
                Ok(msg) => dispatch(msg.command),
                Err(ProxyError::WouldBlock) => break,
                Err(e) => {
                    log_error!("control channel on sd {} failed: {}", fd, e);
                    reactor.del(fd, EventSet::READ | EventSet::WRITE)?;
                    return Err(e);
                }
            }
        }
    }
    // WRITE: nothing to push back to the master
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_command() {
        let ch = ControlChannel::alloc().unwrap();
        for cmd in Command::ALL {
            write_msg(ch.master_fd(), CtlMsg::new(cmd)).unwrap();
            let got = read_msg(ch.worker_fd()).unwrap();
            assert_eq!(got.command, cmd);
        }
    }

    #[test]
    fn test_empty_channel_would_block() {
        let ch = ControlChannel::alloc().unwrap();
        assert_eq!(read_msg(ch.worker_fd()), Err(ProxyError::WouldBlock));
    }

    #[test]
    fn test_fifo_per_channel() {
        let ch = ControlChannel::alloc().unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelUp)).unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelUp)).unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelDown)).unwrap();

        let order: Vec<Command> = (0..3)
            .map(|_| read_msg(ch.worker_fd()).unwrap().command)
            .collect();
        assert_eq!(
            order,
            vec![Command::LogLevelUp, Command::LogLevelUp, Command::LogLevelDown]
        );
        assert_eq!(read_msg(ch.worker_fd()), Err(ProxyError::WouldBlock));
    }

    #[test]
    fn test_peer_close_reads_closed() {
        let ch = ControlChannel::alloc().unwrap();
        let worker_end = unsafe { OwnedFd::from_raw_fd(libc::dup(ch.worker_fd())) };
        drop(ch);
        assert_eq!(read_msg(worker_end.as_raw_fd()), Err(ProxyError::Closed));
    }

    #[test]
    fn test_handler_drains_and_deregisters_on_close() {
        let ch = ControlChannel::alloc().unwrap();
        let mut reactor: Reactor<u8> = Reactor::new(4).unwrap();
        reactor
            .add(ch.worker_fd(), EventSet::READ | EventSet::WRITE, 1)
            .unwrap();

        // three queued level commands drain in order; net effect one up
        let before = log::level();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelUp)).unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelUp)).unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::LogLevelDown)).unwrap();
        channel_ready(&mut reactor, ch.worker_fd(), EventSet::READ).unwrap();
        let after = log::level();
        if before < log::Level::Trace {
            assert_eq!(after as u8, before as u8 + 1);
        }
        log::set_level(before);

        // peer gone: the handler deregisters the fd
        let worker_keep = unsafe { OwnedFd::from_raw_fd(libc::dup(ch.worker_fd())) };
        let wfd = worker_keep.as_raw_fd();
        reactor.add(wfd, EventSet::READ | EventSet::WRITE, 2).unwrap();
        drop(ch);
        let err = channel_ready(&mut reactor, wfd, EventSet::READ).unwrap_err();
        assert_eq!(err, ProxyError::Closed);
        assert_eq!(reactor.interest(wfd), EventSet::NONE);
    }

    #[test]
    fn test_handler_err_event_deregisters() {
        let ch = ControlChannel::alloc().unwrap();
        let mut reactor: Reactor<u8> = Reactor::new(4).unwrap();
        reactor
            .add(ch.worker_fd(), EventSet::READ | EventSet::WRITE, 1)
            .unwrap();
        channel_ready(&mut reactor, ch.worker_fd(), EventSet::ERR).unwrap();
        assert_eq!(reactor.interest(ch.worker_fd()), EventSet::NONE);
    }

    #[test]
    fn test_shutdown_commands_set_flags() {
        let _guard = signals::test_sync::FLAGS
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let ch = ControlChannel::alloc().unwrap();
        let mut reactor: Reactor<u8> = Reactor::new(4).unwrap();
        reactor
            .add(ch.worker_fd(), EventSet::READ | EventSet::WRITE, 1)
            .unwrap();

        write_msg(ch.master_fd(), CtlMsg::new(Command::Terminate)).unwrap();
        // repeated delivery is idempotent
        write_msg(ch.master_fd(), CtlMsg::new(Command::Terminate)).unwrap();
        write_msg(ch.master_fd(), CtlMsg::new(Command::Quit)).unwrap();
        channel_ready(&mut reactor, ch.worker_fd(), EventSet::READ).unwrap();

        assert!(signals::terminate_requested());
        assert!(signals::quit_requested());
        signals::reset_flags_for_test();
    }
}
