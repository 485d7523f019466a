//! Master supervisor
//!
//! The master owns every listening socket, forks the worker pool, reaps
//! and respawns crashed workers, orchestrates zero-downtime reload, and
//! fans administrative commands out over the per-worker control
//! channels.
//!
//! The event loop never does work in signal-handler context: handlers
//! queue typed events and poke a self-pipe; the loop sleeps on the pipe
//! and acts on drained events.
//!
//! Reload is staged with explicit rollback: build the new worker array,
//! create per-slot contexts (pools + shared region), migrate matching
//! listening sockets by `address:port`, bind the rest. Any stage
//! failure unwinds and the old workers keep running untouched. Only
//! after every stage succeeds are the old workers told to terminate.

use kestrel_core::command::{Command, CtlMsg};
use kestrel_core::config::{ConfigError, ProxyConfig};
use kestrel_core::error::{ProxyError, ProxyResult};
use kestrel_core::{log, log_error, log_info, log_warn};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::channel::{self, ControlChannel};
use crate::proxy::{self, Pool};
use crate::shm::{SharedRegion, SHARED_REGION_SIZE};
use crate::signals::{self, SignalEvent};
use crate::stats::scrape::{self, ScrapeRegistry, Scraper};
use crate::worker::{self, Driver};

/// Everything the master tracks about one worker slot. The context
/// (pools + shared region) is created before fork so the child inherits
/// its own listener set and snapshot window.
struct WorkerSlot {
    id: usize,
    pid: Option<Pid>,
    channel: Option<ControlChannel>,
    pools: Vec<Pool>,
    shm: Arc<SharedRegion>,
    /// Set before a deliberate shutdown so the reaper never respawns
    /// a worker that was asked to leave.
    retiring: bool,
}

/// Re-reads the configuration on SIGHUP; supplied by the embedding
/// layer that owns the actual config format.
pub type ConfigSource = Box<dyn Fn() -> Result<ProxyConfig, ConfigError>>;

/// Builds the connection engine inside a freshly forked worker.
pub type DriverFactory = Box<dyn Fn() -> Box<dyn Driver>>;

pub struct Supervisor {
    cfg: ProxyConfig,
    source: ConfigSource,
    driver_factory: DriverFactory,
    slots: Vec<WorkerSlot>,
    registry: Arc<ScrapeRegistry>,
    scraper: Option<Scraper>,
    /// Raw fd of the telemetry listener, closed in every child
    stats_fd: RawFd,
    pipe_rd: OwnedFd,
    pipe_wr: OwnedFd,
    respawn: bool,
}

impl Supervisor {
    pub fn new(
        cfg: ProxyConfig,
        source: ConfigSource,
        driver_factory: DriverFactory,
    ) -> ProxyResult<Supervisor> {
        cfg.validate()?;
        let (pipe_rd, pipe_wr) = signals::signal_pipe()?;
        Ok(Supervisor {
            cfg,
            source,
            driver_factory,
            slots: Vec::new(),
            registry: Arc::new(ScrapeRegistry::new()),
            scraper: None,
            stats_fd: -1,
            pipe_rd,
            pipe_wr,
            respawn: false,
        })
    }

    /// Allocate the per-slot contexts: a fresh shared region and an
    /// unbound pool set per worker.
    fn build_slots(cfg: &ProxyConfig) -> ProxyResult<Vec<WorkerSlot>> {
        let mut slots = Vec::with_capacity(cfg.worker_processes);
        for id in 0..cfg.worker_processes {
            let shm = Arc::new(SharedRegion::alloc(SHARED_REGION_SIZE)?);
            slots.push(WorkerSlot {
                id,
                pid: None,
                channel: None,
                pools: proxy::build_pools(&cfg.pools),
                shm,
                retiring: false,
            });
        }
        Ok(slots)
    }

    /// Build and bind a new worker array. With `old` present this is a
    /// reload: matching listeners migrate over first and any bind
    /// failure migrates them back, leaving the old array fully intact.
    fn setup_workers(
        cfg: &ProxyConfig,
        mut old: Option<&mut Vec<WorkerSlot>>,
    ) -> ProxyResult<Vec<WorkerSlot>> {
        // array + contexts; a failure here has touched nothing shared
        let mut slots = Self::build_slots(cfg)?;

        for i in 0..slots.len() {
            if let Some(old) = old.as_deref_mut() {
                if i < old.len() {
                    proxy::migrate_pools(&mut slots[i].pools, &mut old[i].pools);
                }
            }
            if let Err(e) = proxy::bind_pools(&mut slots[i].pools) {
                log_error!("failed to init worker listeners, rollback: {}", e);
                if let Some(old) = old.as_deref_mut() {
                    let n = old.len().min(i + 1);
                    for j in 0..n {
                        proxy::migrate_pools(&mut old[j].pools, &mut slots[j].pools);
                    }
                }
                return Err(e);
            }
        }
        Ok(slots)
    }

    fn publish_registry(&self) {
        self.registry
            .replace(self.slots.iter().map(|s| s.shm.clone()).collect());
    }

    /// Master main loop. Returns only on a fatal startup error; normal
    /// shutdown exits the process.
    pub fn run(&mut self) -> ProxyResult<()> {
        log::set_tag("master");
        if let Some(path) = self.cfg.log_file.clone() {
            if let Err(e) = log::open(&path) {
                log_error!("failed to open log file {}: {}", path.display(), e);
            }
        }

        signals::install_master(self.pipe_wr.as_raw_fd())?;

        // telemetry first: the listener must exist before the first fork
        // so every child can close its inherited copy
        let listener = scrape::bind_stats_listener(&self.cfg.stats_addr, self.cfg.stats_port)?;
        self.stats_fd = listener.as_raw_fd();
        self.scraper = Some(Scraper::spawn(
            listener,
            self.registry.clone(),
            self.cfg.stats_interval_ms,
        )?);

        // a bind failure during initial startup is fatal
        self.slots = Self::setup_workers(&self.cfg, None)?;
        self.publish_registry();
        self.respawn = true;

        log_info!(
            "master running (pid {}), {} worker slots",
            std::process::id(),
            self.slots.len()
        );

        loop {
            if self.respawn {
                self.respawn = false;
                self.spawn_missing();
            }

            signals::wait_for_wake(&self.pipe_rd);
            while let Some(ev) = signals::next_event() {
                match ev {
                    SignalEvent::Reload => self.reload(),
                    SignalEvent::ChildExit => self.reap(),
                    SignalEvent::QuitAll => self.shutdown_all(Command::Quit),
                    SignalEvent::TerminateAll => self.shutdown_all(Command::Terminate),
                    SignalEvent::LogReopen => {
                        self.broadcast(Command::LogReopen);
                        log::reopen();
                    }
                    SignalEvent::LogLevelUp => {
                        self.broadcast(Command::LogLevelUp);
                        log::level_up();
                    }
                    SignalEvent::LogLevelDown => {
                        self.broadcast(Command::LogLevelDown);
                        log::level_down();
                    }
                }
            }
        }
    }

    // ── Spawning ─────────────────────────────────────────────────────

    fn spawn_missing(&mut self) {
        for i in 0..self.slots.len() {
            if self.slots[i].pid.is_none() {
                if let Err(e) = self.spawn_worker(i) {
                    log_error!("failed to spawn worker {}: {}", i, e);
                }
            }
        }
    }

    fn spawn_worker(&mut self, idx: usize) -> ProxyResult<()> {
        let ch = ControlChannel::alloc()?;
        self.slots[idx].channel = Some(ch);
        self.slots[idx].retiring = false;

        match unsafe { fork() }.map_err(|e| ProxyError::Os(e as i32))? {
            ForkResult::Child => self.child_main(idx),
            ForkResult::Parent { child } => {
                self.slots[idx].pid = Some(child);
                log_warn!("worker [{}] started", child);
                Ok(())
            }
        }
    }

    /// Runs in the child. Closes everything that belongs to the master
    /// or to siblings, then hands off to the worker loop.
    fn child_main(&mut self, idx: usize) -> ! {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == idx {
                continue;
            }
            for pool in slot.pools.iter_mut() {
                pool.close();
            }
            // dropping the sibling channel closes both of its ends
            slot.channel = None;
        }

        let slot = &mut self.slots[idx];
        let channel = match slot.channel.take() {
            Some(ch) => ch,
            None => {
                log_error!("worker {} forked without a channel", idx);
                std::process::exit(worker::EXIT_FAILURE);
            }
        };
        let pools = std::mem::take(&mut slot.pools);
        let shm = slot.shm.clone();
        let mut driver = (self.driver_factory)();

        worker::worker_main(
            idx,
            &self.cfg,
            pools,
            channel.into_worker_end(),
            shm,
            self.stats_fd,
            driver.as_mut(),
        )
    }

    // ── Reaping ──────────────────────────────────────────────────────

    fn reap(&mut self) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(WaitStatus::Exited(pid, status)) => {
                    log_warn!("worker [{}] exited with status: {}", pid, status);
                    if status == worker::EXIT_RETIRED {
                        self.retire_slot(pid);
                    } else {
                        self.respawn_slot(pid);
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    log_warn!("worker [{}] terminated by signal {}", pid, sig);
                    self.respawn_slot(pid);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                // ECHILD: nothing left to reap
                Err(_) => return,
            }
        }
    }

    /// The worker left on purpose; free the slot without respawning.
    fn retire_slot(&mut self, pid: Pid) {
        for slot in self.slots.iter_mut() {
            if slot.pid == Some(pid) {
                slot.pid = None;
                return;
            }
        }
        // retirees from an old generation are already gone from slots
    }

    /// Crash or nonzero exit: respawn the slot in place with a freshly
    /// allocated channel; context and listeners are reused as-is.
    fn respawn_slot(&mut self, pid: Pid) {
        for i in 0..self.slots.len() {
            if self.slots[i].pid != Some(pid) {
                continue;
            }
            self.slots[i].pid = None;
            self.slots[i].channel = None;
            if self.slots[i].retiring {
                return;
            }
            log_info!("respawn worker to replace [{}]", pid);
            if let Err(e) = self.spawn_worker(i) {
                log_error!("failed to respawn worker {}: {}", i, e);
            }
            return;
        }
    }

    // ── Reload ───────────────────────────────────────────────────────

    /// SIGHUP: build a new context from the config source and switch
    /// worker generations. Every failure path keeps the current
    /// generation running.
    fn reload(&mut self) {
        log_warn!("reloading config");
        let new_cfg = match (self.source)() {
            Ok(cfg) => cfg,
            Err(e) => {
                log_error!("failed to load config, keeping current: {}", e);
                return;
            }
        };
        if let Err(e) = new_cfg.validate() {
            log_error!("new config rejected, keeping current: {}", e);
            return;
        }

        match Self::setup_workers(&new_cfg, Some(&mut self.slots)) {
            Ok(new_slots) => {
                let old = std::mem::replace(&mut self.slots, new_slots);
                self.cfg = new_cfg;
                self.publish_registry();
                self.shutdown_workers(old);
                self.respawn = true;
            }
            Err(e) => {
                log_error!("reload failed, keeping current workers: {}", e);
            }
        }
    }

    /// Retire an old worker generation: mark, signal terminate, then
    /// drop the array (closing channels, listeners and regions).
    fn shutdown_workers(&mut self, mut old: Vec<WorkerSlot>) {
        for slot in old.iter_mut() {
            slot.retiring = true;
            if slot.pid.is_none() {
                continue;
            }
            if let Some(ch) = &slot.channel {
                if let Err(e) = channel::write_msg(ch.master_fd(), CtlMsg::new(Command::Terminate))
                {
                    log_error!("failed to signal worker [{:?}]: {}", slot.pid, e);
                }
            }
        }
    }

    // ── Broadcast and shutdown ───────────────────────────────────────

    /// Push one command to every live worker. Delivery is best-effort;
    /// commands are idempotent and retried by intent.
    fn broadcast(&mut self, cmd: Command) {
        for slot in &self.slots {
            if slot.pid.is_none() {
                continue;
            }
            if let Some(ch) = &slot.channel {
                if let Err(e) = channel::write_msg(ch.master_fd(), CtlMsg::new(cmd)) {
                    log_error!("failed to write channel to worker [{:?}]: {}", slot.pid, e);
                }
            }
        }
    }

    /// SIGINT/SIGTERM: broadcast, wait for every child, exit.
    fn shutdown_all(&mut self, cmd: Command) -> ! {
        log_warn!("shutting down all workers with {:?}", cmd);
        for slot in self.slots.iter_mut() {
            slot.retiring = true;
        }
        self.broadcast(cmd);

        loop {
            match waitpid(None::<Pid>, None) {
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        if let Some(scraper) = &mut self.scraper {
            scraper.stop();
        }
        log_warn!("master exiting");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::config::PoolConfig;
    use kestrel_core::error::ProxyResult;
    use kestrel_core::events::EventSet;
    use crate::event::{Reactor, Token};
    use crate::stats::Stats;

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

    fn test_cfg(workers: usize) -> ProxyConfig {
        ProxyConfig::new()
            .worker_processes(workers)
            .pool(PoolConfig::new("alpha", "127.0.0.1:0".parse().unwrap()))
    }

    fn test_supervisor(cfg: ProxyConfig) -> Supervisor {
        Supervisor::new(
            cfg,
            Box::new(|| Err(ConfigError::Load("no source in tests"))),
            Box::new(|| Box::new(NullDriver)),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = test_cfg(0);
        assert!(Supervisor::new(
            cfg,
            Box::new(|| Err(ConfigError::Load("unused"))),
            Box::new(|| Box::new(NullDriver)),
        )
        .is_err());
    }

    #[test]
    fn test_setup_binds_every_slot() {
        let cfg = test_cfg(2);
        let slots = Supervisor::setup_workers(&cfg, None).unwrap();
        assert_eq!(slots.len(), 2);
        for slot in &slots {
            assert_eq!(slot.pools.len(), 1);
            assert!(slot.pools[0].is_bound());
            assert!(slot.pid.is_none());
        }
    }

    #[test]
    fn test_reload_reuses_matching_listeners() {
        let cfg = test_cfg(2);
        let mut old = Supervisor::setup_workers(&cfg, None).unwrap();
        let old_fds: Vec<RawFd> = old
            .iter()
            .map(|s| s.pools[0].listener_fd().unwrap())
            .collect();

        // identical configuration: the post-reload listener set equals
        // the pre-reload set, fd for fd
        let new = Supervisor::setup_workers(&cfg, Some(&mut old)).unwrap();
        let new_fds: Vec<RawFd> = new
            .iter()
            .map(|s| s.pools[0].listener_fd().unwrap())
            .collect();
        assert_eq!(old_fds, new_fds);
        for slot in &old {
            assert!(!slot.pools[0].is_bound());
        }
    }

    #[test]
    fn test_renamed_pool_keeps_socket() {
        let cfg = test_cfg(1);
        let mut old = Supervisor::setup_workers(&cfg, None).unwrap();
        let old_fd = old[0].pools[0].listener_fd().unwrap();

        let renamed = ProxyConfig::new()
            .worker_processes(1)
            .pool(PoolConfig::new("beta", cfg.pools[0].listen));
        let new = Supervisor::setup_workers(&renamed, Some(&mut old)).unwrap();
        assert_eq!(new[0].pools[0].name, "beta");
        assert_eq!(new[0].pools[0].listener_fd().unwrap(), old_fd);
    }

    #[test]
    fn test_broadcast_reaches_worker_ends() {
        let mut sup = test_supervisor(test_cfg(2));
        sup.slots = Supervisor::setup_workers(&sup.cfg, None).unwrap();
        for (i, slot) in sup.slots.iter_mut().enumerate() {
            slot.channel = Some(ControlChannel::alloc().unwrap());
            // fake a live pid so broadcast includes the slot
            slot.pid = Some(Pid::from_raw(i as i32 + 100_000));
        }

        sup.broadcast(Command::LogReopen);

        for slot in &sup.slots {
            let ch = slot.channel.as_ref().unwrap();
            let msg = channel::read_msg(ch.worker_fd()).unwrap();
            assert_eq!(msg.command, Command::LogReopen);
        }
        // avoid waitpid on the fake pids
        for slot in sup.slots.iter_mut() {
            slot.pid = None;
        }
    }

    #[test]
    fn test_retire_and_respawn_bookkeeping() {
        let mut sup = test_supervisor(test_cfg(1));
        sup.slots = Supervisor::setup_workers(&sup.cfg, None).unwrap();
        let pid = Pid::from_raw(4242);
        sup.slots[0].pid = Some(pid);
        sup.slots[0].channel = Some(ControlChannel::alloc().unwrap());

        // a retiring slot never respawns
        sup.slots[0].retiring = true;
        sup.respawn_slot(pid);
        assert!(sup.slots[0].pid.is_none());
        assert!(sup.slots[0].channel.is_none());

        // exits from pids the master no longer tracks are ignored
        sup.retire_slot(Pid::from_raw(31337));
        sup.respawn_slot(Pid::from_raw(31337));
        assert!(sup.slots[0].pid.is_none());
    }

    #[test]
    fn test_registry_follows_slots() {
        let mut sup = test_supervisor(test_cfg(2));
        sup.slots = Supervisor::setup_workers(&sup.cfg, None).unwrap();
        sup.slots[0].shm.write_snapshot(b"{\"w\":0}\n").unwrap();
        sup.publish_registry();

        let payload = scrape::assemble(&[b"{\"w\":0}\n".to_vec()]);
        assert_eq!(payload, b"[{\"w\":0}]");
    }
}
