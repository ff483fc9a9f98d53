//! The single scheduler for every plugin's periodic work.
//!
//! Plugins declare [`TaskSpec`]s in their manifest; the registry registers
//! them here after a successful init. One tick loop sleeps until the
//! earliest due task, fires what is due and hands each firing to a
//! [`TaskExecutor`] (the dispatcher), which runs the plugin's task handler
//! with the usual deadline, isolation and stats.
//!
//! Rules:
//!
//! - cron is evaluated in the task's timezone (default `Africa/Lagos`);
//! - while the chat connection is not `Connected`, due ticks are counted as
//!   skipped and never backfilled;
//! - a tick that finds its previous run still in flight is skipped
//!   ([`Overlap::Skip`]) or held as the single pending run
//!   ([`Overlap::Queue`]);
//! - time comes from [`HostClock`], which follows the tokio clock so tests
//!   can drive it with `tokio::time::pause`/`advance`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use chorus_core::ConnectionState;

use crate::dispatcher::HandlerOutcome;
use crate::error::{SchedulerError, SchedulerResult};

/// Timezone used when neither the task nor the host names one.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Africa::Lagos;

/// Longest the tick loop sleeps without re-checking.
const MAX_SLEEP: Duration = Duration::from_secs(60);

// =============================================================================
// Task declarations
// =============================================================================

/// What to do when a tick finds the previous run still going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overlap {
    /// Drop the tick (counted as skipped).
    #[default]
    Skip,
    /// Keep at most one pending run; further ticks are skipped.
    Queue,
}

/// A scheduled task declared in a plugin manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, unique within the plugin.
    pub name: String,
    /// Cron expression (5, 6 or 7 fields).
    pub cron: String,
    /// IANA timezone; the host default when absent.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Overlap policy.
    #[serde(default)]
    pub overlap: Overlap,
    /// Deadline override for this task.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    /// Declares a task.
    pub fn new(name: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            timezone: None,
            overlap: Overlap::Skip,
            timeout_ms: None,
        }
    }

    /// Sets the timezone.
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    /// Sets the overlap policy.
    pub fn overlap(mut self, overlap: Overlap) -> Self {
        self.overlap = overlap;
        self
    }

    /// Sets the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Identifies a registered task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId {
    /// Owning plugin.
    pub plugin: String,
    /// Task name.
    pub task: String,
}

impl TaskId {
    /// Builds an id.
    pub fn new(plugin: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            task: task.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.task)
    }
}

/// Parses a cron expression, accepting classic 5-field syntax.
///
/// 5-field expressions get a leading seconds field and have their numeric
/// day-of-week values (`0`/`7` = Sunday) shifted to the 1-based form the
/// parser expects.
pub fn parse_cron(task: &str, expr: &str) -> SchedulerResult<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = shift_day_of_week(fields[4]);
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        n => {
            return Err(SchedulerError::InvalidCron {
                task: task.to_string(),
                expr: expr.to_string(),
                message: format!("expected 5, 6 or 7 fields, found {n}"),
            });
        }
    };
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        task: task.to_string(),
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

fn shift_day_of_week(field: &str) -> String {
    fn shift(n: &str) -> Option<u32> {
        n.parse::<u32>().ok().map(|d| (d % 7) + 1)
    }

    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((b, s)) => (b, Some(s)),
                None => (item, None),
            };
            let base = match base.split_once('-') {
                Some((a, b)) => match (shift(a), shift(b)) {
                    (Some(a), Some(b)) if a <= b => format!("{a}-{b}"),
                    // Wrapped through Sunday (`5-7`, `6-0`).
                    (Some(a), Some(b)) => format!("{a}-7,1-{b}"),
                    _ => base.to_string(),
                },
                None => shift(base).map_or_else(|| base.to_string(), |d| d.to_string()),
            };
            match step {
                Some(s) => format!("{base}/{s}"),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolves an IANA timezone name.
pub fn parse_timezone(name: &str) -> SchedulerResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::UnknownTimezone(name.to_string()))
}

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock time for the scheduler.
///
/// A [`system`](Self::system) clock reads the system time on every call, so
/// it follows NTP corrections and manual steps; time advanced on a paused
/// tokio clock is added on top. A [`starting_at`](Self::starting_at) clock
/// runs purely off the tokio clock from a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    anchor: Option<DateTime<Utc>>,
    origin: Instant,
    real_origin: std::time::Instant,
}

impl HostClock {
    /// A clock following the system time.
    pub fn system() -> Self {
        Self {
            anchor: None,
            origin: Instant::now(),
            real_origin: std::time::Instant::now(),
        }
    }

    /// A clock reading `at` right now.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            anchor: Some(at),
            ..Self::system()
        }
    }

    /// The current wall-clock time.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = to_delta(self.origin.elapsed());
        match self.anchor {
            Some(at) => at + elapsed,
            // Zero unless the tokio clock is paused and advanced.
            None => Utc::now() + (elapsed - to_delta(self.real_origin.elapsed())),
        }
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::zero())
}

impl Default for HostClock {
    fn default() -> Self {
        Self::system()
    }
}

// =============================================================================
// Executor seam
// =============================================================================

/// Runs a task handler; implemented by the dispatcher.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Runs one invocation of `task` to completion.
    async fn run_task(&self, task: &TaskId, timeout: Option<Duration>) -> HandlerOutcome;
}

// =============================================================================
// Stats
// =============================================================================

/// Per-task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Invocations started.
    pub fired: u64,
    /// Ticks dropped (unhealthy connection or overlap).
    pub skipped: u64,
    /// Invocations that errored, panicked or timed out.
    pub failed: u64,
    /// Start of the latest invocation.
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// A snapshot of one registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Task id.
    pub id: TaskId,
    /// Cron expression as declared.
    pub cron: String,
    /// Effective timezone.
    pub timezone: String,
    /// Overlap policy.
    pub overlap: Overlap,
    /// Whether the owning plugin is paused.
    pub paused: bool,
    /// Whether a run is in flight.
    pub running: bool,
    /// Next due time.
    pub next_run: Option<DateTime<Utc>>,
    /// Counters.
    pub stats: TaskStats,
}

// =============================================================================
// Scheduler
// =============================================================================

struct TaskEntry {
    spec: TaskSpec,
    schedule: Schedule,
    tz: Tz,
    next_run: Option<DateTime<Utc>>,
    in_flight: bool,
    queued: bool,
    paused: bool,
    stats: TaskStats,
}

impl TaskEntry {
    fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&at.with_timezone(&self.tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_ms.map(Duration::from_millis)
    }
}

struct Inner {
    tasks: Mutex<BTreeMap<TaskId, TaskEntry>>,
    default_tz: Tz,
    clock: HostClock,
    health: watch::Receiver<ConnectionState>,
    executor: OnceLock<Arc<dyn TaskExecutor>>,
    notify: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// The host scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    tick_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Creates a scheduler observing `health`.
    pub fn new(health: watch::Receiver<ConnectionState>, default_tz: Tz, clock: HostClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(BTreeMap::new()),
                default_tz,
                clock,
                health,
                executor: OnceLock::new(),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            tick_loop: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs the executor. Only the first call has an effect.
    pub fn set_executor(&self, executor: Arc<dyn TaskExecutor>) {
        if self.inner.executor.set(executor).is_err() {
            warn!("Scheduler executor already set");
        }
    }

    /// The scheduler's clock.
    pub fn clock(&self) -> HostClock {
        self.inner.clock
    }

    /// Validates and registers a plugin's tasks (all or none).
    pub fn register(&self, plugin: &str, specs: &[TaskSpec]) -> SchedulerResult<()> {
        let now = self.inner.clock.now();
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            if entries.iter().any(|(id, _): &(TaskId, TaskEntry)| id.task == spec.name) {
                return Err(SchedulerError::DuplicateTask {
                    plugin: plugin.to_string(),
                    task: spec.name.clone(),
                });
            }
            let schedule = parse_cron(&spec.name, &spec.cron)?;
            let tz = match &spec.timezone {
                Some(name) => parse_timezone(name)?,
                None => self.inner.default_tz,
            };
            let mut entry = TaskEntry {
                spec: spec.clone(),
                schedule,
                tz,
                next_run: None,
                in_flight: false,
                queued: false,
                paused: false,
                stats: TaskStats::default(),
            };
            entry.next_run = entry.next_after(now);
            entries.push((TaskId::new(plugin, &spec.name), entry));
        }

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|id, _| id.plugin != plugin);
        for (id, entry) in entries {
            info!(
                task = %id,
                cron = %entry.spec.cron,
                timezone = %entry.tz,
                next_run = ?entry.next_run,
                "Task scheduled"
            );
            tasks.insert(id, entry);
        }
        drop(tasks);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Removes every task of `plugin`. In-flight runs finish on their own.
    pub fn unregister_plugin(&self, plugin: &str) {
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        tasks.retain(|id, _| id.plugin != plugin);
        if tasks.len() != before {
            debug!(plugin, removed = before - tasks.len(), "Tasks unregistered");
        }
    }

    /// Pauses or resumes every task of `plugin`.
    pub fn set_paused(&self, plugin: &str, paused: bool) {
        let mut tasks = self.inner.tasks.lock();
        for (id, entry) in tasks.iter_mut().filter(|(id, _)| id.plugin == plugin) {
            entry.paused = paused;
            if !paused {
                entry.queued = false;
            }
            trace!(task = %id, paused, "Task pause state changed");
        }
        drop(tasks);
        self.inner.notify.notify_one();
    }

    /// Snapshot of every registered task.
    pub fn stats(&self) -> Vec<TaskReport> {
        self.inner
            .tasks
            .lock()
            .iter()
            .map(|(id, entry)| TaskReport {
                id: id.clone(),
                cron: entry.spec.cron.clone(),
                timezone: entry.tz.to_string(),
                overlap: entry.spec.overlap,
                paused: entry.paused,
                running: entry.in_flight,
                next_run: entry.next_run,
                stats: entry.stats.clone(),
            })
            .collect()
    }

    /// Stats of one task.
    pub fn task_stats(&self, plugin: &str, task: &str) -> Option<TaskStats> {
        self.inner
            .tasks
            .lock()
            .get(&TaskId::new(plugin, task))
            .map(|e| e.stats.clone())
    }

    /// Fires every task due at the current clock time.
    pub fn tick(&self) -> Vec<TaskId> {
        Inner::fire_due(&self.inner, self.inner.clock.now())
    }

    /// Starts the tick loop. Calling it twice has no effect.
    pub fn start(&self) {
        let mut slot = self.tick_loop.lock();
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(Inner::run(inner)));
        info!("Scheduler started");
    }

    /// Stops the tick loop and waits up to `deadline` for in-flight runs.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.inner.cancel.cancel();
        let handle = self.tick_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.tracker.close();
        let drained = tokio::time::timeout(deadline, self.inner.tracker.wait())
            .await
            .is_ok();
        if drained {
            info!("Scheduler stopped");
        } else {
            warn!(
                in_flight = self.inner.tracker.len(),
                "Scheduler stopped with task runs still in flight"
            );
        }
        drained
    }
}

impl Inner {
    fn healthy(&self) -> bool {
        self.health.borrow().is_healthy()
    }

    fn fire_due(this: &Arc<Self>, now: DateTime<Utc>) -> Vec<TaskId> {
        let healthy = this.healthy();
        let mut launch = Vec::new();
        {
            let mut tasks = this.tasks.lock();
            for (id, entry) in tasks.iter_mut() {
                let Some(due) = entry.next_run else { continue };
                if due > now {
                    continue;
                }
                // Missed ticks are never backfilled.
                entry.next_run = entry.next_after(now);

                if entry.paused {
                    continue;
                }
                if !healthy {
                    entry.stats.skipped += 1;
                    debug!(task = %id, "Tick suppressed while disconnected");
                    continue;
                }
                if entry.in_flight {
                    match entry.spec.overlap {
                        Overlap::Queue if !entry.queued => {
                            entry.queued = true;
                            debug!(task = %id, "Previous run in flight, queued");
                        }
                        _ => {
                            entry.stats.skipped += 1;
                            debug!(task = %id, "Previous run in flight, tick skipped");
                        }
                    }
                    continue;
                }
                entry.in_flight = true;
                entry.stats.fired += 1;
                entry.stats.last_fired_at = Some(now);
                launch.push((id.clone(), entry.timeout()));
            }
        }

        let fired: Vec<TaskId> = launch.iter().map(|(id, _)| id.clone()).collect();
        for (id, timeout) in launch {
            let inner = Arc::clone(this);
            this.tracker.spawn(async move { inner.execute(id, timeout).await });
        }
        fired
    }

    async fn execute(self: Arc<Self>, id: TaskId, mut timeout: Option<Duration>) {
        loop {
            let outcome = match self.executor.get() {
                Some(executor) => executor.run_task(&id, timeout).await,
                None => {
                    warn!(task = %id, "No task executor installed");
                    HandlerOutcome::Failed
                }
            };

            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if outcome.is_failure() {
                entry.stats.failed += 1;
            }
            let rerun = entry.queued
                && !entry.paused
                && !self.cancel.is_cancelled()
                && self.healthy();
            entry.queued = false;
            if !rerun {
                entry.in_flight = false;
                return;
            }
            entry.stats.fired += 1;
            entry.stats.last_fired_at = Some(self.clock.now());
            timeout = entry.timeout();
            debug!(task = %id, "Running queued invocation");
        }
    }

    fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        self.tasks
            .lock()
            .values()
            .filter(|e| !e.paused)
            .filter_map(|e| e.next_run)
            .min()
            .map_or(MAX_SLEEP, |at| {
                (at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP)
            })
    }

    async fn run(this: Arc<Self>) {
        loop {
            let now = this.clock.now();
            Self::fire_due(&this, now);
            let wait = this.next_wake(now);
            tokio::select! {
                _ = this.cancel.cancelled() => break,
                _ = this.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Scheduler tick loop stopped");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.inner.tasks.lock().len())
            .field("default_tz", &self.inner.default_tz)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Timelike};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_reads_wall_time_plus_paused_advance() {
        let clock = HostClock::system();
        assert!((clock.now() - Utc::now()).num_milliseconds().abs() < 1_000);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        let ahead = clock.now() - Utc::now();
        assert!((ahead - TimeDelta::hours(1)).num_milliseconds().abs() < 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_clock_ignores_system_time() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let clock = HostClock::starting_at(start);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + TimeDelta::seconds(90));
    }

    struct Recorder {
        runs: AtomicUsize,
        hold: Duration,
        outcome: HandlerOutcome,
    }

    impl Recorder {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                hold,
                outcome: HandlerOutcome::Completed,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskExecutor for Recorder {
        async fn run_task(&self, _task: &TaskId, _timeout: Option<Duration>) -> HandlerOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.outcome
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    fn scheduler(
        start: DateTime<Utc>,
        state: ConnectionState,
    ) -> (watch::Sender<ConnectionState>, Scheduler) {
        let (tx, rx) = watch::channel(state);
        let scheduler = Scheduler::new(rx, chrono_tz::UTC, HostClock::starting_at(start));
        (tx, scheduler)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("t", "0 8 * * *").is_ok());
        assert!(parse_cron("t", "*/10 * * * * *").is_ok());
        assert!(parse_cron("t", "0 0 8 * * * 2030").is_ok());
        assert!(matches!(
            parse_cron("t", "8 * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_five_field_weekdays_follow_classic_numbering() {
        assert_eq!(shift_day_of_week("1-5"), "2-6");
        assert_eq!(shift_day_of_week("0"), "1");
        assert_eq!(shift_day_of_week("5-7"), "6-7,1-1");
        assert_eq!(shift_day_of_week("*/2"), "*/2");
        assert_eq!(shift_day_of_week("Mon-Fri"), "Mon-Fri");

        // Monday 2026-03-02 08:00 UTC is the first weekday run after Sunday.
        let schedule = parse_cron("t", "0 8 * * 1-5").unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let next = schedule.after(&sunday).next().unwrap();
        assert_eq!(next, at(8, 0, 0));
    }

    #[test]
    fn test_unknown_timezone_is_rejected() {
        let (_tx, scheduler) = scheduler(at(7, 0, 0), ConnectionState::Connected);
        let err = scheduler
            .register("p", &[TaskSpec::new("t", "0 8 * * *").timezone("Mars/Olympus")])
            .unwrap_err();
        assert_eq!(err, SchedulerError::UnknownTimezone("Mars/Olympus".into()));
    }

    #[test]
    fn test_duplicate_task_names_are_rejected() {
        let (_tx, scheduler) = scheduler(at(7, 0, 0), ConnectionState::Connected);
        let err = scheduler
            .register(
                "p",
                &[TaskSpec::new("t", "0 8 * * *"), TaskSpec::new("t", "0 9 * * *")],
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { .. }));
        assert!(scheduler.stats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_follows_task_timezone() {
        let (_tx, scheduler) = scheduler(at(0, 0, 0), ConnectionState::Connected);
        scheduler
            .register("p", &[TaskSpec::new("t", "0 8 * * *").timezone("Africa/Lagos")])
            .unwrap();
        // 08:00 in Lagos is 07:00 UTC.
        let next = scheduler.stats()[0].next_run.unwrap();
        assert_eq!(next.hour(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_skip_does_not_double_invoke() {
        let (_tx, scheduler) = scheduler(at(7, 59, 59), ConnectionState::Connected);
        let recorder = Recorder::new(Duration::from_secs(90));
        scheduler.set_executor(recorder.clone());
        scheduler
            .register("p", &[TaskSpec::new("t", "0 * * * * *")])
            .unwrap();
        scheduler.start();

        // Ticks at 08:00:00 and 08:01:00; the first run holds for 90 s.
        tokio::time::sleep(Duration::from_secs(62)).await;
        settle().await;

        let stats = scheduler.task_stats("p", "t").unwrap();
        assert_eq!(recorder.runs(), 1);
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.skipped, 1);

        assert!(scheduler.shutdown(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_queue_keeps_one_pending_run() {
        let (_tx, scheduler) = scheduler(at(7, 59, 59), ConnectionState::Connected);
        let recorder = Recorder::new(Duration::from_secs(150));
        scheduler.set_executor(recorder.clone());
        scheduler
            .register(
                "p",
                &[TaskSpec::new("t", "0 * * * * *").overlap(Overlap::Queue)],
            )
            .unwrap();
        scheduler.start();

        // 08:00 fires, 08:01 queues, 08:02 is skipped.
        tokio::time::sleep(Duration::from_secs(122)).await;
        settle().await;
        let stats = scheduler.task_stats("p", "t").unwrap();
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.skipped, 1);

        // First run ends at 08:02:30 and the queued one starts immediately.
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(recorder.runs(), 2);

        scheduler.shutdown(Duration::from_secs(300)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_ticks_are_skipped_not_backfilled() {
        let (tx, scheduler) = scheduler(at(7, 58, 0), ConnectionState::Connected);
        let recorder = Recorder::new(Duration::ZERO);
        scheduler.set_executor(recorder.clone());
        scheduler
            .register("p", &[TaskSpec::new("daily", "0 8 * * *")])
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send(ConnectionState::Disconnected).unwrap();

        // 08:00 passes while disconnected.
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        settle().await;
        let stats = scheduler.task_stats("p", "daily").unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.fired, 0);

        // Reconnect at 08:05: nothing is fired retroactively.
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        tx.send(ConnectionState::Connected).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(recorder.runs(), 0);

        // Next day at 08:00 it fires normally.
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        settle().await;
        let stats = scheduler.task_stats("p", "daily").unwrap();
        assert_eq!(stats.fired, 1);
        assert_eq!(recorder.runs(), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_plugins_do_not_fire() {
        let (_tx, scheduler) = scheduler(at(7, 59, 59), ConnectionState::Connected);
        let recorder = Recorder::new(Duration::ZERO);
        scheduler.set_executor(recorder.clone());
        scheduler
            .register("p", &[TaskSpec::new("t", "0 * * * * *")])
            .unwrap();
        scheduler.set_paused("p", true);
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(125)).await;
        settle().await;
        assert_eq!(recorder.runs(), 0);

        scheduler.set_paused("p", false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(recorder.runs(), 1);

        scheduler.unregister_plugin("p");
        assert!(scheduler.stats().is_empty());
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted() {
        let (_tx, scheduler) = scheduler(at(7, 59, 59), ConnectionState::Connected);
        let recorder = Arc::new(Recorder {
            runs: AtomicUsize::new(0),
            hold: Duration::ZERO,
            outcome: HandlerOutcome::TimedOut,
        });
        scheduler.set_executor(recorder.clone());
        scheduler
            .register("p", &[TaskSpec::new("t", "0 * * * * *")])
            .unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.tick().len(), 1);
        settle().await;
        assert_eq!(scheduler.task_stats("p", "t").unwrap().failed, 1);
    }
}
