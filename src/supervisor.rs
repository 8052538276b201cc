//! Worker pool supervisor
//!
//! ## Responsibilities
//!
//! - Spawn `workers` copies of this binary in `worker` mode
//! - Track every worker's busy slots from its slot event stream
//! - SIGKILL a worker whose slot outlived the request timeout, log the
//!   abandoned requests and replace it
//! - Replace workers that exit on their own, backing off exponentially while
//!   they keep dying young
//! - Run the orphan reaper at startup and on an interval
//! - On shutdown: SIGTERM, wait up to the request timeout, then SIGKILL
//!
//! A timeout is never cooperative. Killed requests get no response and their
//! transient files are left for the reaper.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, WORKER_CONFIG_ENV};
use crate::protocol::{read_frame, SlotEvent};
use crate::reaper::Reaper;
use crate::storage::Storage;

/// How often slot deadlines and worker liveness are checked
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// A worker that ran this long before exiting restarts without delay
const STABLE_UPTIME: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Delay before restarting a worker after `failures` consecutive early exits
pub fn restart_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_MAX)
}

// ============================================================================
// Spawning
// ============================================================================

/// Starts one worker process
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, index: usize) -> std::io::Result<Child>;
}

/// Re-executes the current binary as `worker --index N`
pub struct ExecSpawner {
    program: PathBuf,
    config_json: String,
}

impl ExecSpawner {
    pub fn current(config: &ServiceConfig) -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate own executable")?;
        Self::new(program, config)
    }

    /// Runs `program`, which must accept the `worker` subcommand
    pub fn new(program: impl Into<PathBuf>, config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            config_json: config.to_env_value()?,
        })
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, index: usize) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg("worker")
            .arg("--index")
            .arg(index.to_string())
            .env(WORKER_CONFIG_ENV, &self.config_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

// ============================================================================
// Slot ledger
// ============================================================================

/// Busy slots of one worker, as reported by its event stream
#[derive(Debug, Default)]
pub struct SlotLedger {
    busy: BTreeMap<usize, (String, DateTime<Utc>)>,
}

impl SlotLedger {
    pub fn apply(&mut self, event: &SlotEvent) {
        match event {
            SlotEvent::Ready { .. } => self.busy.clear(),
            SlotEvent::Begin {
                slot,
                request_id,
                started_at,
            } => {
                self.busy.insert(*slot, (request_id.clone(), *started_at));
            }
            SlotEvent::End { slot, request_id } => {
                if self.busy.get(slot).map(|(id, _)| id == request_id).unwrap_or(false) {
                    self.busy.remove(slot);
                }
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.busy.len()
    }

    /// Requests whose deadline (`start + timeout`) has passed
    pub fn overdue(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        self.busy
            .values()
            .filter(|(_, started)| {
                (now - *started)
                    .to_std()
                    .map(|elapsed| elapsed >= timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every request still bound to a slot
    pub fn requests(&self) -> Vec<String> {
        self.busy.values().map(|(id, _)| id.clone()).collect()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct Inbound {
    index: usize,
    generation: u64,
    event: SlotEvent,
}

struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    generation: u64,
    started: Instant,
    ledger: SlotLedger,
}

/// Restart pacing for one pool index
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

pub struct Supervisor {
    config: Arc<ServiceConfig>,
    spawner: Box<dyn WorkerSpawner>,
    workers: Vec<Option<WorkerHandle>>,
    backoff: Vec<Backoff>,
    generation: u64,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    restarts: u64,
}

impl Supervisor {
    pub fn new(config: Arc<ServiceConfig>, spawner: Box<dyn WorkerSpawner>) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let workers = (0..config.workers).map(|_| None).collect();
        let backoff = (0..config.workers).map(|_| Backoff::default()).collect();
        Self {
            config,
            spawner,
            workers,
            backoff,
            generation: 0,
            inbox_tx,
            inbox,
            restarts: 0,
        }
    }

    /// Workers replaced after a kill or an unexpected exit
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn pids(&self) -> Vec<Option<u32>> {
        self.workers.iter().map(|w| w.as_ref().and_then(|w| w.pid)).collect()
    }

    /// Run the pool until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let storage = Storage::open(&self.config.uploads_dir, &self.config.data_dir)
            .context("Failed to open storage")?;
        let reaper = Reaper::new(storage, self.config.orphan_age(), self.config.reap_interval());
        let reaper_task = tokio::spawn(reaper.run());

        for index in 0..self.workers.len() {
            self.start_worker(index)
                .with_context(|| format!("Failed to start worker {}", index))?;
        }
        info!(
            "👷 Supervising {} workers x {} slots ({} concurrent requests, timeout {:?})",
            self.config.workers,
            self.config.threads,
            self.config.capacity(),
            self.config.timeout()
        );

        let mut ticker = interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(inbound) = self.inbox.recv() => self.record(inbound),
                _ = ticker.tick() => {
                    self.enforce_deadlines(Utc::now()).await;
                    self.replace_exited();
                }
            }
        }

        reaper_task.abort();
        self.shutdown().await;
        Ok(())
    }

    fn start_worker(&mut self, index: usize) -> std::io::Result<()> {
        let mut child = self.spawner.spawn(index)?;
        self.generation += 1;
        let generation = self.generation;
        let pid = child.id();

        if let Some(mut stdout) = child.stdout.take() {
            let inbox = self.inbox_tx.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut stdout).await {
                        Ok(Some(event)) => {
                            if inbox.send(Inbound { index, generation, event }).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Worker {} event stream broken: {}", index, e);
                            break;
                        }
                    }
                }
            });
        }

        info!("Started worker {} (pid {:?})", index, pid);
        self.workers[index] = Some(WorkerHandle {
            child,
            pid,
            generation,
            started: Instant::now(),
            ledger: SlotLedger::default(),
        });
        Ok(())
    }

    fn record(&mut self, inbound: Inbound) {
        let Some(Some(worker)) = self.workers.get_mut(inbound.index) else {
            return;
        };
        // events from a replaced worker are stale
        if worker.generation != inbound.generation {
            return;
        }
        if let SlotEvent::Ready { pid, slots } = &inbound.event {
            debug!("Worker {} ready (pid {}, {} slots)", inbound.index, pid, slots);
        }
        worker.ledger.apply(&inbound.event);
    }

    /// Kill and replace every worker holding an overdue slot
    async fn enforce_deadlines(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.timeout();

        for index in 0..self.workers.len() {
            let overdue = match &self.workers[index] {
                Some(worker) => worker.ledger.overdue(now, timeout),
                None => continue,
            };
            if overdue.is_empty() {
                continue;
            }

            let Some(mut worker) = self.workers[index].take() else {
                continue;
            };
            warn!(
                "⏱️ Worker {} (pid {:?}) exceeded the {:?} request timeout, killing",
                index, worker.pid, timeout
            );
            for request_id in worker.ledger.requests() {
                warn!(request_id = %request_id, worker = index, "Request abandoned by worker kill");
            }

            if let Err(e) = worker.child.start_kill() {
                error!("Failed to kill worker {}: {}", index, e);
            }
            if let Err(e) = worker.child.wait().await {
                error!("Failed to reap worker {}: {}", index, e);
            }

            self.restarts += 1;
            if let Err(e) = self.start_worker(index) {
                error!("Failed to replace worker {}: {}", index, e);
            }
        }
    }

    /// Replace workers that exited without being asked to.
    ///
    /// A worker that dies before [`STABLE_UPTIME`] counts as a failure and
    /// its replacement waits [`restart_delay`]; a crash loop therefore settles
    /// at one attempt every [`BACKOFF_MAX`].
    fn replace_exited(&mut self) {
        let now = Instant::now();

        for index in 0..self.workers.len() {
            let exited = match self.workers[index].as_mut() {
                Some(worker) => match worker.child.try_wait() {
                    Ok(Some(status)) => Some(status.to_string()),
                    Ok(None) => None,
                    Err(e) => Some(e.to_string()),
                },
                None => None,
            };

            if let Some(reason) = exited {
                if let Some(worker) = self.workers[index].take() {
                    let abandoned = worker.ledger.requests();
                    warn!(
                        "Worker {} (pid {:?}) exited: {}; abandoned {:?}",
                        index, worker.pid, reason, abandoned
                    );
                    let backoff = &mut self.backoff[index];
                    if worker.started.elapsed() >= STABLE_UPTIME {
                        backoff.failures = 0;
                    } else {
                        backoff.failures += 1;
                    }
                    let delay = restart_delay(backoff.failures);
                    if !delay.is_zero() {
                        warn!("Restarting worker {} in {:?} ({} early exits)", index, delay, backoff.failures);
                    }
                    backoff.retry_at = Some(now + delay);
                }
            }

            if self.workers[index].is_some() {
                continue;
            }
            let due = self.backoff[index].retry_at.map_or(true, |at| now >= at);
            if !due {
                continue;
            }

            self.backoff[index].retry_at = None;
            self.restarts += 1;
            if let Err(e) = self.start_worker(index) {
                let backoff = &mut self.backoff[index];
                backoff.failures += 1;
                backoff.retry_at = Some(now + restart_delay(backoff.failures));
                error!("Failed to replace worker {}: {}", index, e);
            }
        }
    }

    /// SIGTERM every worker, escalating to SIGKILL after the request timeout
    async fn shutdown(&mut self) {
        info!("Shutting down {} workers", self.workers.len());

        for worker in self.workers.iter().flatten() {
            if let Some(pid) = worker.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to signal worker pid {}: {}", pid, e);
                }
            }
        }

        let timeout = self.config.timeout();
        for (index, slot) in self.workers.iter_mut().enumerate() {
            let Some(worker) = slot.as_mut() else { continue };
            match tokio::time::timeout(timeout, worker.child.wait()).await {
                Ok(Ok(status)) => debug!("Worker {} exited: {}", index, status),
                Ok(Err(e)) => warn!("Failed to wait for worker {}: {}", index, e),
                Err(_) => {
                    warn!("Worker {} did not drain within {:?}, killing", index, timeout);
                    let _ = worker.child.start_kill();
                    let _ = worker.child.wait().await;
                }
            }
            *slot = None;
        }
        info!("All workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in worker that ignores everything and sleeps
    struct SleepSpawner;

    impl WorkerSpawner for SleepSpawner {
        fn spawn(&self, _index: usize) -> std::io::Result<Child> {
            Command::new("sleep")
                .arg("30")
                .stdout(Stdio::null())
                .kill_on_drop(true)
                .spawn()
        }
    }

    fn config(workers: usize) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig {
            workers,
            timeout_secs: 1,
            ..ServiceConfig::default()
        })
    }

    fn begin(slot: usize, id: &str, started_at: DateTime<Utc>) -> SlotEvent {
        SlotEvent::Begin {
            slot,
            request_id: id.to_string(),
            started_at,
        }
    }

    #[test]
    fn test_ledger_tracks_deadlines() {
        let now = Utc::now();
        let mut ledger = SlotLedger::default();
        ledger.apply(&begin(0, "old", now - chrono::Duration::seconds(5)));
        ledger.apply(&begin(1, "new", now));
        assert_eq!(ledger.in_use(), 2);
        assert_eq!(ledger.overdue(now, Duration::from_secs(2)), vec!["old".to_string()]);

        // an End for a request no longer in the slot is ignored
        ledger.apply(&SlotEvent::End {
            slot: 1,
            request_id: "other".to_string(),
        });
        assert_eq!(ledger.in_use(), 2);

        ledger.apply(&SlotEvent::End {
            slot: 0,
            request_id: "old".to_string(),
        });
        assert!(ledger.overdue(now, Duration::from_secs(2)).is_empty());

        ledger.apply(&SlotEvent::Ready { pid: 1, slots: 4 });
        assert_eq!(ledger.in_use(), 0);
    }

    #[tokio::test]
    async fn test_overdue_worker_is_killed_and_replaced() {
        let mut supervisor = Supervisor::new(config(2), Box::new(SleepSpawner));
        supervisor.start_worker(0).unwrap();
        supervisor.start_worker(1).unwrap();
        let before = supervisor.pids();

        let generation = supervisor.workers[0].as_ref().unwrap().generation;
        supervisor.record(Inbound {
            index: 0,
            generation,
            event: begin(0, "stuck", Utc::now() - chrono::Duration::seconds(10)),
        });
        supervisor.enforce_deadlines(Utc::now()).await;

        let after = supervisor.pids();
        assert_ne!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
        assert_eq!(supervisor.restarts(), 1);
        assert_eq!(supervisor.workers[0].as_ref().unwrap().ledger.in_use(), 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_ignored() {
        let mut supervisor = Supervisor::new(config(1), Box::new(SleepSpawner));
        supervisor.start_worker(0).unwrap();
        supervisor.record(Inbound {
            index: 0,
            generation: 999,
            event: begin(0, "ghost", Utc::now() - chrono::Duration::seconds(10)),
        });
        supervisor.enforce_deadlines(Utc::now()).await;
        assert_eq!(supervisor.restarts(), 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_worker_is_replaced() {
        struct ExitSpawner;
        impl WorkerSpawner for ExitSpawner {
            fn spawn(&self, _index: usize) -> std::io::Result<Child> {
                Command::new("true").stdout(Stdio::null()).spawn()
            }
        }

        let mut supervisor = Supervisor::new(config(1), Box::new(ExitSpawner));
        supervisor.start_worker(0).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // died young: the replacement waits out the first backoff step
        supervisor.replace_exited();
        assert_eq!(supervisor.restarts(), 0);
        assert!(supervisor.workers[0].is_none());
        supervisor.replace_exited();
        assert!(supervisor.workers[0].is_none());

        tokio::time::sleep(restart_delay(1) + Duration::from_millis(100)).await;
        supervisor.replace_exited();
        assert_eq!(supervisor.restarts(), 1);
        assert!(supervisor.workers[0].is_some());

        // dying young again doubles the wait
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.replace_exited();
        assert_eq!(supervisor.backoff[0].failures, 2);
        let wait = supervisor.backoff[0].retry_at.unwrap() - Instant::now();
        assert!(wait > restart_delay(1) && wait <= restart_delay(2), "{:?}", wait);
    }

    #[test]
    fn test_restart_delay_doubles_up_to_a_cap() {
        assert_eq!(restart_delay(0), Duration::ZERO);
        assert_eq!(restart_delay(1), Duration::from_millis(500));
        assert_eq!(restart_delay(2), Duration::from_secs(1));
        assert_eq!(restart_delay(4), Duration::from_secs(4));
        assert_eq!(restart_delay(7), Duration::from_secs(30));
        assert_eq!(restart_delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_long_lived_worker_restarts_at_once() {
        let mut supervisor = Supervisor::new(config(1), Box::new(SleepSpawner));
        supervisor.start_worker(0).unwrap();
        supervisor.backoff[0].failures = 5;

        let worker = supervisor.workers[0].as_mut().unwrap();
        worker.started = Instant::now() - STABLE_UPTIME;
        worker.child.start_kill().unwrap();
        worker.child.wait().await.unwrap();

        supervisor.replace_exited();
        assert_eq!(supervisor.restarts(), 1);
        assert_eq!(supervisor.backoff[0].failures, 0);
        assert!(supervisor.workers[0].is_some());
        supervisor.shutdown().await;
    }
}
