//! Per-worker event loop
//!
//! A worker owns one reactor driving its inherited listening sockets,
//! the worker end of its control channel, and whatever connections the
//! external engine registers. Shutdown never arrives as a signal (all
//! but SIGALRM are masked); it arrives as a channel command:
//!
//! - `Quit`: exit at the next loop turn;
//! - `Terminate`: stop accepting on every pool, arm the one-shot drain
//!   timer, keep serving until everything drains or SIGALRM promotes
//!   the terminate into a quit.
//!
//! A worker that leaves on purpose exits `EXIT_RETIRED` so the master
//! does not respawn it; a fatal loop error exits nonzero and the slot
//! is respawned in place.

use kestrel_core::config::ProxyConfig;
use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::events::EventSet;
use kestrel_core::{log, log_error, log_info, log_warn};

use nix::unistd::{geteuid, initgroups, setgid, setuid, Gid, Uid};

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::channel;
use crate::event::{Reactor, Ready, Token};
use crate::proxy::Pool;
use crate::shm::SharedRegion;
use crate::signals;
use crate::stats::sampler::Sampler;
use crate::stats::Stats;

/// Exit status of a worker that left on purpose (reload or drain);
/// the supervisor does not respawn it.
pub const EXIT_RETIRED: i32 = 0;

/// Exit status of a worker whose loop died; the slot is respawned.
pub const EXIT_FAILURE: i32 = 1;

/// Seam to the external connection engine.
///
/// The engine gets every readiness event the worker loop does not
/// consume itself (everything but `Token::Channel`) and may register
/// its own `Client`/`Upstream` fds on the reactor from inside `ready`.
pub trait Driver {
    /// Handle one readiness event.
    fn ready(
        &mut self,
        reactor: &mut Reactor<Token>,
        pools: &mut [Pool],
        stats: &Stats,
        token: Token,
        events: EventSet,
    ) -> ProxyResult<()>;

    /// Connections still being served; a draining worker exits early
    /// when this reaches zero.
    fn active_conns(&self) -> usize;

    /// Upstream server names per pool, for server-level stats. The core
    /// has no servers of its own.
    fn server_names(&self, pool: &str) -> Vec<String> {
        let _ = pool;
        Vec::new()
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut _, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "localhost".to_string()
    }
}

/// Drop root privileges to the configured user right after fork.
/// `initgroups` failure is logged but not fatal.
fn drop_privileges(cfg: &ProxyConfig) -> ProxyResult<()> {
    if !geteuid().is_root() {
        return Ok(());
    }
    let (Some(uid), Some(gid)) = (cfg.uid, cfg.gid) else {
        return Ok(());
    };

    setgid(Gid::from_raw(gid)).map_err(|e| ProxyError::Os(e as i32))?;
    if let Some(user) = &cfg.user {
        match CString::new(user.as_str()) {
            Ok(cuser) => {
                if let Err(e) = initgroups(&cuser, Gid::from_raw(gid)) {
                    log_error!("failed to initgroups for [{}]: {}", user, e);
                }
            }
            Err(_) => log_error!("user name [{}] is not a valid c string", user),
        }
    }
    setuid(Uid::from_raw(uid)).map_err(|e| ProxyError::Os(e as i32))?;
    Ok(())
}

/// Worker process entry, called in the child right after fork. Never
/// returns.
pub fn worker_main(
    worker_id: usize,
    cfg: &ProxyConfig,
    pools: Vec<Pool>,
    channel_fd: OwnedFd,
    shm: Arc<SharedRegion>,
    master_stats_fd: RawFd,
    driver: &mut dyn Driver,
) -> ! {
    let code = worker_run(worker_id, cfg, pools, channel_fd, shm, master_stats_fd, driver);
    std::process::exit(code);
}

fn worker_run(
    worker_id: usize,
    cfg: &ProxyConfig,
    mut pools: Vec<Pool>,
    channel_fd: OwnedFd,
    shm: Arc<SharedRegion>,
    master_stats_fd: RawFd,
    driver: &mut dyn Driver,
) -> i32 {
    if let Err(e) = signals::install_worker() {
        log_error!("failed to set worker signal state: {}", e);
        return EXIT_FAILURE;
    }
    log::set_tag(&format!("worker-{}", worker_id));

    if let Err(e) = drop_privileges(cfg) {
        log_error!("failed to drop privileges: {}", e);
        return EXIT_FAILURE;
    }

    // telemetry first, so the shared region publishes early
    let shape: Vec<(String, Vec<String>)> = pools
        .iter()
        .map(|p| (p.name.clone(), driver.server_names(&p.name)))
        .collect();
    let stats = Arc::new(Stats::new(&shape, &hostname(), cfg.stats_interval_ms));
    let mut sampler = Sampler::spawn(stats.clone(), shm);

    // the inherited master telemetry listener is not ours to serve
    if master_stats_fd >= 0 {
        unsafe {
            libc::close(master_stats_fd);
        }
    }

    let mut reactor: Reactor<Token> = match Reactor::new(cfg.max_events) {
        Ok(r) => r,
        Err(e) => {
            log_error!("failed to create reactor: {}", e);
            return EXIT_FAILURE;
        }
    };

    for (i, pool) in pools.iter().enumerate() {
        if let Some(fd) = pool.listener_fd() {
            if let Err(e) = reactor.add(fd, EventSet::READ, Token::Listener(i as u32)) {
                log_error!("failed to register pool [{}]: {}", pool.name, e);
                return EXIT_FAILURE;
            }
        }
    }
    if let Err(e) = reactor.add(
        channel_fd.as_raw_fd(),
        EventSet::READ | EventSet::WRITE,
        Token::Channel,
    ) {
        log_error!("failed to add channel event: {}", e);
        return EXIT_FAILURE;
    }

    log_info!("worker {} running (pid {})", worker_id, std::process::id());

    let mut ready: Vec<Ready<Token>> = Vec::new();
    let mut draining = false;
    let mut code = EXIT_RETIRED;

    while !signals::quit_requested() {
        if signals::terminate_requested() && !draining {
            for pool in pools.iter_mut() {
                pool.unaccept(&mut reactor);
            }
            match signals::set_drain_timer(cfg.worker_shutdown_timeout) {
                Ok(()) => log_warn!(
                    "draining: accepting stopped, {}s deadline",
                    cfg.worker_shutdown_timeout
                ),
                Err(e) => {
                    // without a deadline a drain could hang forever
                    log_error!("failed to arm drain timer: {}", e);
                    signals::request_quit();
                }
            }
            draining = true;
        }

        if draining && driver.active_conns() == 0 {
            log_info!("drain complete, all connections served");
            break;
        }

        stats.swap();

        match reactor.wait(cfg.stats_interval_ms as i32, &mut ready) {
            Ok(_) => {}
            Err(ProxyError::Interrupted) => continue,
            Err(e) => {
                log_error!("event loop failed: {}", e);
                code = EXIT_FAILURE;
                break;
            }
        }

        for i in 0..ready.len() {
            let ev = ready[i];
            let result = match ev.token {
                Token::Channel => {
                    channel::channel_ready(&mut reactor, channel_fd.as_raw_fd(), ev.events)
                }
                token => driver.ready(&mut reactor, &mut pools, &stats, token, ev.events),
            };
            if let Err(e) = result {
                if !e.is_transient() {
                    log_warn!("handler error on {:?}: {}", ev.token, e);
                }
            }
        }

    }

    signals::clear_drain_timer();
    sampler.stop();
    log_warn!(
        "worker {} terminated with quit flag: {}",
        worker_id,
        signals::quit_requested()
    );
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{write_msg, ControlChannel};
    use kestrel_core::command::{Command, CtlMsg};
    use kestrel_core::config::PoolConfig;
    use std::os::unix::io::FromRawFd;

    struct NullDriver;

    impl Driver for NullDriver {
        fn ready(
            &mut self,
            _reactor: &mut Reactor<Token>,
            _pools: &mut [Pool],
            _stats: &Stats,
            _token: Token,
            _events: EventSet,
        ) -> ProxyResult<()> {
            Ok(())
        }

        fn active_conns(&self) -> usize {
            0
        }
    }

    fn test_cfg() -> ProxyConfig {
        ProxyConfig::new()
            .worker_processes(1)
            .worker_shutdown_timeout(1)
            .stats_interval_ms(50)
            .pool(PoolConfig::new("alpha", "127.0.0.1:0".parse().unwrap()))
    }

    #[test]
    fn test_quit_command_retires_worker() {
        let _guard = signals::test_sync::FLAGS
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let cfg = test_cfg();
        let mut pools = vec![Pool::from_config(&cfg.pools[0])];
        pools[0].bind().unwrap();

        let ch = ControlChannel::alloc().unwrap();
        // queue the command up front; registration reports the pending
        // readability as the initial edge
        write_msg(ch.master_fd(), CtlMsg::new(Command::Quit)).unwrap();

        let shm = Arc::new(SharedRegion::alloc(64 * 1024).unwrap());
        let worker_end = unsafe { OwnedFd::from_raw_fd(libc::dup(ch.worker_fd())) };

        let code = worker_run(
            0,
            &cfg,
            pools,
            worker_end,
            shm,
            -1,
            &mut NullDriver,
        );
        assert_eq!(code, EXIT_RETIRED);

        signals::reset_flags_for_test();
    }

    #[test]
    fn test_drop_privileges_noop_without_root() {
        // test runs unprivileged in CI; the path must be a clean no-op
        if geteuid().is_root() {
            return;
        }
        let cfg = test_cfg();
        assert!(drop_privileges(&cfg).is_ok());
    }
}
