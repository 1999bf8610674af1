//! Cron/poll timer registration driven by the elected leader.
//!
//! Wraps `tokio-cron-scheduler` for timer lifecycle and layers the
//! coordination rules on top: only the current leader scans the store for
//! active cron/polling workflows, diffs them against registered timers
//! (add new, remove stale, reschedule changed patterns), and fires them.
//! Losing the lock cancels every local timer before another process takes
//! over, preventing duplicate firing.
//!
//! Firing a timer enqueues the workflow through the queue manager -- the
//! same path as any other trigger, including its degraded synchronous
//! fallback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowstack_types::config::SchedulerConfig;
use flowstack_types::job::{QueueJob, TriggerType};
use flowstack_types::workflow::{TriggerConfig, WorkflowDefinition};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::lock::LockBackend;
use crate::repository::workflow::WorkflowStore;

use super::error::EngineError;
use super::leader::{LeaderElector, LeaderTransition};
use super::queue::JobQueueManager;

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression.
///
/// Accepted forms (case-insensitive):
/// - Standard 5-field cron (seconds field prepended) or 6-field cron
/// - "every N seconds" / "every N minutes" / "every N hours"
/// - "every minute" / "every hour" / "every day", "minutely" / "hourly" / "daily"
/// - "every day at HH:MM"
pub fn normalize_schedule(input: &str) -> Result<String, EngineError> {
    let trimmed = input.trim();
    let invalid = |reason: &str| EngineError::InvalidSchedule {
        schedule: input.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        // Standard 5-field cron -- prepend "0" for seconds
        return validate_cron(&format!("0 {trimmed}"), input);
    }
    if parts.len() == 6 {
        return validate_cron(trimmed, input);
    }

    let lower = trimmed.to_lowercase();

    if lower == "every minute" || lower == "minutely" {
        return Ok("0 * * * * *".to_string());
    }
    if lower == "every hour" || lower == "hourly" {
        return Ok("0 0 * * * *".to_string());
    }
    if lower == "every day" || lower == "daily" {
        return Ok("0 0 0 * * *".to_string());
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        // "every day at HH:MM"
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let time_parts: Vec<&str> = at_part.split(':').collect();
            if time_parts.len() == 2 {
                let hour: u32 = time_parts[0]
                    .trim()
                    .parse()
                    .map_err(|_| invalid("bad hour"))?;
                let minute: u32 = time_parts[1]
                    .trim()
                    .parse()
                    .map_err(|_| invalid("bad minute"))?;
                if hour < 24 && minute < 60 {
                    return Ok(format!("0 {minute} {hour} * * *"));
                }
            }
            return Err(invalid("expected HH:MM"));
        }

        // "every N seconds/minutes/hours"
        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0].parse().map_err(|_| invalid("bad interval"))?;
            if n == 0 {
                return Err(invalid("interval must be > 0"));
            }
            let unit = words[1].trim_end_matches('s');
            return match unit {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(invalid("unknown unit")),
            };
        }
    }

    Err(invalid("unrecognized schedule format"))
}

/// Parse-validate a 6-field expression with croner.
fn validate_cron(expr: &str, original: &str) -> Result<String, EngineError> {
    expr.parse::<croner::Cron>()
        .map_err(|e| EngineError::InvalidSchedule {
            schedule: original.to_string(),
            reason: e.to_string(),
        })?;
    Ok(expr.to_string())
}

// ---------------------------------------------------------------------------
// Timer specs
// ---------------------------------------------------------------------------

/// One desired timer, derived from a workflow's trigger list. Doubles as the
/// diff key: any change to the schedule or owner re-registers the timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerSpec {
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    /// Raw schedule string as written in the definition.
    pub schedule: String,
    /// Polling module path, for `Poll` triggers.
    pub module: Option<String>,
    pub owner_user_id: Option<Uuid>,
    pub organization_id: Option<String>,
}

/// Derive the desired timer set from active scheduled workflows.
pub fn desired_timers(definitions: &[WorkflowDefinition]) -> Vec<TimerSpec> {
    let mut specs = Vec::new();
    for def in definitions.iter().filter(|d| d.active) {
        for trigger in &def.triggers {
            match trigger {
                TriggerConfig::Cron { schedule, .. } => specs.push(TimerSpec {
                    workflow_id: def.id,
                    trigger_type: TriggerType::Cron,
                    schedule: schedule.clone(),
                    module: None,
                    owner_user_id: def.owner_user_id,
                    organization_id: def.organization_id.clone(),
                }),
                TriggerConfig::Poll { module, schedule } => specs.push(TimerSpec {
                    workflow_id: def.id,
                    trigger_type: TriggerType::Poll,
                    schedule: schedule.clone(),
                    module: Some(module.clone()),
                    owner_user_id: def.owner_user_id,
                    organization_id: def.organization_id.clone(),
                }),
                TriggerConfig::Manual {} | TriggerConfig::Webhook { .. } => {}
            }
        }
    }
    specs
}

// ---------------------------------------------------------------------------
// TimerSet
// ---------------------------------------------------------------------------

/// Callback invoked when a timer fires.
pub type FireCallback =
    Arc<dyn Fn(TimerSpec, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Registered cron jobs wrapping `tokio_cron_scheduler::JobScheduler`.
pub struct TimerSet {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    registered: Arc<RwLock<HashMap<TimerSpec, Uuid>>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            registered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the underlying scheduler. Idempotent.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        if inner.is_some() {
            return Ok(());
        }
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
        *inner = Some(scheduler);
        tracing::info!("cron timer set started");
        Ok(())
    }

    /// Shut down the scheduler and forget all registrations. Idempotent.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        if let Some(mut scheduler) = inner.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
            tracing::info!("cron timer set stopped");
        }
        self.registered.write().await.clear();
        Ok(())
    }

    /// Cancel every registered timer, keeping the scheduler running.
    /// Called immediately on lost leadership.
    pub async fn clear(&self) {
        let mut registered = self.registered.write().await;
        let inner = self.inner.read().await;
        if let Some(scheduler) = inner.as_ref() {
            for (spec, job_id) in registered.drain() {
                if let Err(e) = scheduler.remove(&job_id).await {
                    tracing::warn!(
                        workflow_id = %spec.workflow_id,
                        error = %e,
                        "failed to remove timer"
                    );
                }
            }
        } else {
            registered.clear();
        }
        tracing::info!("all timers cancelled");
    }

    /// Diff the desired timers against current registrations: register new
    /// ones, remove stale ones. A changed schedule shows up as remove+add.
    pub async fn sync(
        &self,
        desired: Vec<TimerSpec>,
        callback: FireCallback,
    ) -> Result<(), EngineError> {
        let desired_set: HashSet<TimerSpec> = desired.into_iter().collect();
        let mut registered = self.registered.write().await;
        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| EngineError::Infrastructure("timer set not started".to_string()))?;

        // Remove stale registrations
        let stale: Vec<TimerSpec> = registered
            .keys()
            .filter(|spec| !desired_set.contains(spec))
            .cloned()
            .collect();
        for spec in stale {
            if let Some(job_id) = registered.remove(&spec) {
                if let Err(e) = scheduler.remove(&job_id).await {
                    tracing::warn!(workflow_id = %spec.workflow_id, error = %e, "failed to remove timer");
                }
                tracing::info!(
                    workflow_id = %spec.workflow_id,
                    schedule = spec.schedule.as_str(),
                    "timer removed"
                );
            }
        }

        // Register new timers
        for spec in desired_set {
            if registered.contains_key(&spec) {
                continue;
            }
            let cron_expr = normalize_schedule(&spec.schedule)?;

            let cb = Arc::clone(&callback);
            let fire_spec = spec.clone();
            let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
                let cb = Arc::clone(&cb);
                let spec = fire_spec.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    tracing::debug!(workflow_id = %spec.workflow_id, %now, "timer fired");
                    cb(spec, now).await;
                })
            })
            .map_err(|e| EngineError::InvalidSchedule {
                schedule: spec.schedule.clone(),
                reason: e.to_string(),
            })?;

            let job_id = job.guid();
            scheduler
                .add(job)
                .await
                .map_err(|e| EngineError::Infrastructure(e.to_string()))?;

            tracing::info!(
                workflow_id = %spec.workflow_id,
                schedule = spec.schedule.as_str(),
                cron = cron_expr.as_str(),
                "timer registered"
            );
            registered.insert(spec, job_id);
        }

        Ok(())
    }

    /// Number of registered timers.
    pub async fn count(&self) -> usize {
        self.registered.read().await.len()
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ScheduleCoordinator
// ---------------------------------------------------------------------------

/// Leader-gated cron coordination for one worker process.
///
/// Drives a periodic election tick: on becoming leader it scans the store
/// and registers timers; while leader it keeps the registrations in sync
/// with the store; on losing the lock it cancels everything.
pub struct ScheduleCoordinator<S: WorkflowStore> {
    store: Arc<S>,
    elector: Arc<LeaderElector>,
    timers: Arc<TimerSet>,
    queue: Arc<JobQueueManager>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    tick_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<S: WorkflowStore + 'static> ScheduleCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        lock: Option<Arc<dyn LockBackend>>,
        queue: Arc<JobQueueManager>,
        config: SchedulerConfig,
    ) -> Self {
        let elector = Arc::new(LeaderElector::new(
            lock,
            config.lock_key.clone(),
            Duration::from_secs(config.lock_ttl_secs),
        ));
        Self {
            store,
            elector,
            timers: Arc::new(TimerSet::new()),
            queue,
            config,
            shutdown: CancellationToken::new(),
            tick_task: std::sync::Mutex::new(None),
        }
    }

    /// Whether this process currently holds scheduler leadership.
    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Number of locally registered timers.
    pub async fn timer_count(&self) -> usize {
        self.timers.count().await
    }

    /// Start the timer set and the periodic election loop. Idempotent.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.timers.start().await?;

        let mut task = self.tick_task.lock().expect("tick task lock poisoned");
        if task.is_some() {
            return Ok(());
        }

        let elector = Arc::clone(&self.elector);
        let timers = Arc::clone(&self.timers);
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        let cancel = self.shutdown.child_token();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = run_tick(&elector, &timers, &store, &queue).await {
                    tracing::error!(error = %e, "scheduler tick failed");
                }
            }
        }));

        Ok(())
    }

    /// One election + sync step. Public so tests (and callers embedding
    /// their own timer loop) can drive it without wall-clock waits.
    pub async fn tick(&self) -> Result<(), EngineError> {
        run_tick(&self.elector, &self.timers, &self.store, &self.queue).await
    }

    /// Re-sync cron/poll registrations from the store. No-op unless leader.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        if !self.elector.is_leader() {
            return Ok(());
        }
        sync_registrations(&self.timers, &self.store, &self.queue).await
    }

    /// Cancel timers, stop the tick loop, and release the lock. Idempotent.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.shutdown.cancel();
        if let Some(task) = self.tick_task.lock().expect("tick task lock poisoned").take() {
            task.abort();
        }
        self.timers.stop().await?;
        self.elector.release().await?;
        Ok(())
    }
}

/// One coordination step: elect, then sync or clear timers accordingly.
async fn run_tick<S: WorkflowStore>(
    elector: &LeaderElector,
    timers: &TimerSet,
    store: &Arc<S>,
    queue: &Arc<JobQueueManager>,
) -> Result<(), EngineError> {
    match elector.tick().await? {
        LeaderTransition::BecameLeader | LeaderTransition::StillLeader => {
            sync_registrations(timers, store, queue).await
        }
        LeaderTransition::LostLeadership => {
            timers.clear().await;
            Ok(())
        }
        LeaderTransition::StillFollower => Ok(()),
    }
}

/// Scan the store and bring the timer set in line with it. A workflow whose
/// stored schedule no longer parses is skipped with an error log so it
/// cannot wedge every other registration.
async fn sync_registrations<S: WorkflowStore>(
    timers: &TimerSet,
    store: &Arc<S>,
    queue: &Arc<JobQueueManager>,
) -> Result<(), EngineError> {
    let scheduled = store.list_scheduled().await?;
    let desired: Vec<TimerSpec> = desired_timers(&scheduled)
        .into_iter()
        .filter(|spec| match normalize_schedule(&spec.schedule) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    workflow_id = %spec.workflow_id,
                    schedule = spec.schedule.as_str(),
                    error = %e,
                    "skipping workflow with invalid schedule"
                );
                false
            }
        })
        .collect();

    let queue = Arc::clone(queue);
    let callback: FireCallback = Arc::new(move |spec, fired_at| {
        let queue = Arc::clone(&queue);
        Box::pin(async move {
            fire_timer(queue, spec, fired_at).await;
        })
    });

    timers.sync(desired, callback).await
}

/// Build the trigger job for a fired timer and hand it to the queue (which
/// falls back to direct execution when the backend is unavailable).
async fn fire_timer(queue: Arc<JobQueueManager>, spec: TimerSpec, fired_at: DateTime<Utc>) {
    let mut trigger_data = json!({
        "fired_at": fired_at.to_rfc3339(),
        "schedule": spec.schedule,
    });
    if let Some(module) = &spec.module {
        trigger_data["module"] = json!(module);
    }

    let job = QueueJob::new(
        spec.workflow_id,
        spec.owner_user_id.unwrap_or_else(Uuid::nil),
        spec.organization_id.clone(),
        spec.trigger_type,
        trigger_data,
    );

    if let Err(e) = queue.queue_workflow_execution(job).await {
        tracing::error!(
            workflow_id = %spec.workflow_id,
            error = %e,
            "scheduled workflow execution failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
