//! Poll cycles and the interval scheduler that drives them.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::auth::TokenGuard;
use crate::discovery::{Host, ResourceDiscovery};
use crate::fetcher::{MetricFetcher, SampleOutcome};
use crate::links::LinkResolver;
use crate::sender::SenderClient;
use crate::Result;

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Discovering,
    Resolving,
    Fetching,
    Sending,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Discovering => "discovering",
            CycleState::Resolving => "resolving",
            CycleState::Fetching => "fetching",
            CycleState::Sending => "sending",
        };
        f.write_str(s)
    }
}

/// Counters for one finished cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub hosts_seen: usize,
    pub hosts_skipped: usize,
    pub hosts_failed: usize,
    pub samples_sent: usize,
    pub samples_absent: usize,
    pub samples_malformed: usize,
    pub metrics_failed: usize,
}

struct StateTracker {
    state: CycleState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: CycleState::Idle,
        }
    }

    fn enter(&mut self, next: CycleState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "cycle state");
            self.state = next;
        }
    }
}

/// Something the [`Scheduler`] can run once per tick.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run(&self) -> Result<CycleReport>;
}

/// One discover → resolve → fetch → send pass over all active hosts.
pub struct PollCycle {
    guard: Arc<TokenGuard>,
    discovery: ResourceDiscovery,
    resolver: LinkResolver,
    fetcher: MetricFetcher,
    sender: SenderClient,
    template_name: String,
}

impl PollCycle {
    pub fn new(
        guard: Arc<TokenGuard>,
        discovery: ResourceDiscovery,
        resolver: LinkResolver,
        fetcher: MetricFetcher,
        sender: SenderClient,
        template_name: impl Into<String>,
    ) -> Self {
        Self {
            guard,
            discovery,
            resolver,
            fetcher,
            sender,
            template_name: template_name.into(),
        }
    }

    /// Run a full pass.
    ///
    /// Failures are contained to the host or metric they happen on, except
    /// for cycle-fatal ones (see [`Error::is_cycle_fatal`](crate::Error::is_cycle_fatal)),
    /// which abort the pass and are returned.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut tracker = StateTracker::new();
        let mut report = CycleReport::default();

        self.guard.ensure_valid().await?;

        tracker.enter(CycleState::Discovering);
        let hosts = self.discovery.list_active_hosts().await?;
        if hosts.is_empty() {
            info!("No active instances. Nothing to monitor.");
            tracker.enter(CycleState::Idle);
            return Ok(report);
        }

        for host in &hosts {
            report.hosts_seen += 1;
            if host.name == self.template_name {
                debug!(host = %host.id, name = %host.name, "skipping template host");
                report.hosts_skipped += 1;
                continue;
            }

            info!(host = %host.id, name = %host.name, "Checking host");
            if let Err(e) = self.poll_host(host, &mut tracker, &mut report).await {
                if e.is_cycle_fatal() {
                    tracker.enter(CycleState::Idle);
                    return Err(e);
                }
                warn!(host = %host.id, error = %e, "host poll failed");
                report.hosts_failed += 1;
            }
        }

        tracker.enter(CycleState::Idle);
        Ok(report)
    }

    async fn poll_host(
        &self,
        host: &Host,
        tracker: &mut StateTracker,
        report: &mut CycleReport,
    ) -> Result<()> {
        tracker.enter(CycleState::Resolving);
        let links = self.resolver.resolve_links(&host.id).await?;

        tracker.enter(CycleState::Fetching);
        let mut samples = Vec::with_capacity(links.len());
        for link in &links {
            match self.fetcher.fetch_latest_sample(link, &host.id).await {
                Ok(SampleOutcome::Present(sample)) => samples.push(sample),
                Ok(SampleOutcome::Absent) => report.samples_absent += 1,
                Ok(SampleOutcome::Malformed(_)) => report.samples_malformed += 1,
                Err(e) if e.is_cycle_fatal() => return Err(e),
                Err(e) => {
                    warn!(host = %host.id, item = %link.key, error = %e, "metric fetch failed");
                    report.metrics_failed += 1;
                }
            }
        }

        if samples.is_empty() {
            debug!(host = %host.id, "no samples to send");
            return Ok(());
        }

        tracker.enter(CycleState::Sending);
        self.sender.send_samples(&samples).await?;
        report.samples_sent += samples.len();
        Ok(())
    }
}

#[async_trait]
impl CycleRunner for PollCycle {
    async fn run(&self) -> Result<CycleReport> {
        self.run_cycle().await
    }
}

/// What to do with a tick that arrives while a cycle is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Drop the tick.
    #[default]
    Skip,
    /// Let one tick wait for the running cycle; drop any further ones.
    Queue,
    /// Start another cycle as long as fewer than `max_in_flight` are running.
    Concurrent { max_in_flight: usize },
}

/// Shortest tick period; `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl OverlapPolicy {
    /// How many cycles may run at once, within what a [`Semaphore`] accepts.
    pub fn permits(&self) -> usize {
        match *self {
            OverlapPolicy::Skip | OverlapPolicy::Queue => 1,
            OverlapPolicy::Concurrent { max_in_flight } => {
                max_in_flight.clamp(1, Semaphore::MAX_PERMITS)
            }
        }
    }
}

/// Fires a cycle every `interval`, the first one immediately.
pub struct Scheduler {
    cycle: Arc<dyn CycleRunner>,
    interval: Duration,
    policy: OverlapPolicy,
}

impl Scheduler {
    /// An `interval` below [`MIN_INTERVAL`] is raised to it.
    pub fn new(cycle: Arc<dyn CycleRunner>, interval: Duration, policy: OverlapPolicy) -> Self {
        if interval < MIN_INTERVAL {
            warn!(?interval, min = ?MIN_INTERVAL, "polling interval too short, raising it");
        }
        Self {
            cycle,
            interval: interval.max(MIN_INTERVAL),
            policy,
        }
    }

    /// Tick until `shutdown` resolves or a cycle hits a process-fatal error.
    ///
    /// Cycles still running at shutdown are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let slots = Arc::new(Semaphore::new(self.policy.permits()));
        let queued = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<Result<CycleReport>> = JoinSet::new();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, policy = ?self.policy, "scheduler started");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    self.dispatch(&mut tasks, &slots, &queued);
                }
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(Err(e)) if e.is_process_fatal() => {
                            error!(error = %e, "stopping after fatal error");
                            tasks.abort_all();
                            return Err(e);
                        }
                        Ok(Err(e)) => error!(error = %e, "poll cycle aborted"),
                        Ok(Ok(_)) => {}
                        Err(e) => error!(error = %e, "poll cycle task failed"),
                    }
                }
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<Result<CycleReport>>,
        slots: &Arc<Semaphore>,
        queued: &Arc<AtomicBool>,
    ) {
        let id = Uuid::now_v7();
        let span = tracing::info_span!("cycle", %id);
        let cycle = self.cycle.clone();

        match slots.clone().try_acquire_owned() {
            Ok(permit) => {
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        run_and_report(cycle.as_ref()).await
                    }
                    .instrument(span),
                );
            }
            Err(_) if self.policy == OverlapPolicy::Queue && !queued.swap(true, Ordering::SeqCst) => {
                debug!(%id, "cycle still running, queueing tick");
                let slots = slots.clone();
                let queued = queued.clone();
                tasks.spawn(
                    async move {
                        let permit = slots.acquire_owned().await;
                        queued.store(false, Ordering::SeqCst);
                        let Ok(_permit) = permit else {
                            return Ok(CycleReport::default());
                        };
                        run_and_report(cycle.as_ref()).await
                    }
                    .instrument(span),
                );
            }
            Err(_) => {
                debug!(%id, policy = ?self.policy, "cycle still running, skipping tick");
            }
        }
    }
}

async fn run_and_report(cycle: &dyn CycleRunner) -> Result<CycleReport> {
    let started = Instant::now();
    let report = cycle.run().await?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        hosts = report.hosts_seen,
        skipped = report.hosts_skipped,
        failed = report.hosts_failed,
        sent = report.samples_sent,
        absent = report.samples_absent,
        malformed = report.samples_malformed,
        "poll cycle finished"
    );
    Ok(report)
}
