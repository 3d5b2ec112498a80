//! Local cron scheduler kept in sync with the remote schedule set.
//!
//! [`CronReconciler`] periodically lists remote schedules, keeps the ones carrying a cron
//! expression and converges the [`CronScheduler`] entry set onto them. The scheduler fires due
//! entries on its own loop; a fire only queues a remote task.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funcgate_core::{JobQueue, ResolvedSchedule, TaskSpec, TimeoutPolicy};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};

pub type EntryId = u64;

// Upper bound on one scheduler sleep so wall-clock jumps are noticed.
const MAX_IDLE: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CronJob: Send + Sync {
    async fn run(&self);
}

struct Entry {
    key: String,
    expression: String,
    schedule: cron::Schedule,
    next: Option<DateTime<Utc>>,
    job: Arc<dyn CronJob>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub key: String,
    pub expression: String,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SchedulerInner {
    entries: Mutex<BTreeMap<EntryId, Entry>>,
    next_id: AtomicU64,
    notify: Notify,
}

/// In-process cron scheduler. Cloning shares the same entry set.
#[derive(Clone, Default)]
pub struct CronScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("entries", &self.entries())
            .finish()
    }
}

/// Parse a cron expression, accepting the classic five-field form.
pub fn parse_expression(expression: &str) -> anyhow::Result<cron::Schedule> {
    let expression = expression.trim();
    let normalized = if !expression.starts_with('@') && expression.split_whitespace().count() == 5
    {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .with_context(|| format!("parse cron expression {expression:?}"))
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_mut(&self) -> MutexGuard<'_, BTreeMap<EntryId, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_job(
        &self,
        key: &str,
        expression: &str,
        job: Arc<dyn CronJob>,
    ) -> anyhow::Result<EntryId> {
        let schedule = parse_expression(expression)?;
        let next = schedule.upcoming(Utc).next();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries_mut().insert(
            id,
            Entry {
                key: key.to_string(),
                expression: expression.to_string(),
                schedule,
                next,
                job,
            },
        );
        self.inner.notify.notify_one();
        Ok(id)
    }

    pub fn remove_job(&self, id: EntryId) -> bool {
        let removed = self.entries_mut().remove(&id).is_some();
        if removed {
            self.inner.notify.notify_one();
        }
        removed
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.entries_mut()
            .iter()
            .map(|(id, e)| EntrySnapshot {
                id: *id,
                key: e.key.clone(),
                expression: e.expression.clone(),
                next_fire: e.next,
            })
            .collect()
    }

    /// Spawn every entry due at `now` and advance it; returns the earliest upcoming fire time.
    fn fire_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut due = Vec::new();
        let mut earliest: Option<DateTime<Utc>> = None;
        {
            let mut entries = self.entries_mut();
            for (id, entry) in entries.iter_mut() {
                let Some(next) = entry.next else {
                    continue;
                };
                if next <= now {
                    due.push((*id, entry.key.clone(), entry.job.clone()));
                    entry.next = entry.schedule.after(&now).next();
                }
                if let Some(next) = entry.next {
                    earliest = Some(earliest.map_or(next, |e| e.min(next)));
                }
            }
        }

        for (id, key, job) in due {
            tracing::debug!(
                event = "funcgate.crontab.fire",
                entry_id = id,
                key = %key,
                "firing cron entry"
            );
            // Fire-and-forget: shutdown does not wait for in-flight jobs.
            tokio::spawn(async move { job.run().await });
        }
        earliest
    }

    /// Fire entries at their scheduled times until `shutdown_rx` flips to `true`.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let now = Utc::now();
            let wait = self
                .fire_due(now)
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(MAX_IDLE)
                .min(MAX_IDLE);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.notify.notified() => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        tracing::info!(event = "funcgate.crontab.scheduler_stopped", "cron scheduler stopped");
    }
}

/// What a cron entry does when it fires: queue one task for the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledInvocation {
    pub schedule_id: String,
    pub expression: String,
    pub task: TaskSpec,
}

struct QueueTaskJob {
    queue: Arc<dyn JobQueue>,
    invocation: ScheduledInvocation,
}

#[async_trait]
impl CronJob for QueueTaskJob {
    async fn run(&self) {
        let schedule_id = &self.invocation.schedule_id;
        match self.queue.queue_task(self.invocation.task.clone()).await {
            Ok(task) => tracing::info!(
                event = "funcgate.crontab.task_queued",
                schedule_id = %schedule_id,
                task_id = %task.id,
                "cron fire queued task"
            ),
            Err(err) => tracing::warn!(
                event = "funcgate.crontab.fire_failed",
                schedule_id = %schedule_id,
                error = %err,
                "cron fire failed to queue task"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub replaced: Vec<String>,
    /// Remote schedules without a cron expression or with an undecodable payload.
    pub skipped: usize,
    /// Schedules whose entry could not be registered this cycle.
    pub failed: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

struct Registered {
    entry_id: EntryId,
    invocation: ScheduledInvocation,
}

pub struct CronReconciler {
    queue: Arc<dyn JobQueue>,
    scheduler: CronScheduler,
    timeouts: TimeoutPolicy,
    registered: tokio::sync::Mutex<HashMap<String, Registered>>,
}

impl CronReconciler {
    pub fn new(queue: Arc<dyn JobQueue>, scheduler: CronScheduler, timeouts: TimeoutPolicy) -> Self {
        Self {
            queue,
            scheduler,
            timeouts,
            registered: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    /// Remote schedules that carry a cron expression, keyed by schedule id.
    async fn fetch_cron_schedules(
        &self,
    ) -> anyhow::Result<(BTreeMap<String, ScheduledInvocation>, usize)> {
        let schedules = self
            .queue
            .list_schedules()
            .await
            .context("list remote schedules")?;

        let mut wanted = BTreeMap::new();
        let mut skipped = 0usize;
        for schedule in schedules {
            let cron = match schedule.cron_payload() {
                Ok(cron) => cron,
                Err(err) => {
                    tracing::debug!(
                        event = "funcgate.crontab.payload_invalid",
                        schedule_id = %schedule.id,
                        error = %err,
                        "undecodable schedule payload; skipping"
                    );
                    skipped += 1;
                    continue;
                }
            };
            if !cron.is_cron() {
                tracing::debug!(
                    event = "funcgate.crontab.not_cron",
                    schedule_id = %schedule.id,
                    "not a cron schedule; skipping"
                );
                skipped += 1;
                continue;
            }

            let resolved = ResolvedSchedule { schedule, cron };
            let task = resolved.task_spec(&self.timeouts);
            let ResolvedSchedule { schedule, cron } = resolved;
            wanted.insert(
                schedule.id.clone(),
                ScheduledInvocation {
                    schedule_id: schedule.id,
                    expression: cron.schedule,
                    task,
                },
            );
        }
        Ok((wanted, skipped))
    }

    fn register(&self, invocation: &ScheduledInvocation) -> anyhow::Result<EntryId> {
        let job = Arc::new(QueueTaskJob {
            queue: self.queue.clone(),
            invocation: invocation.clone(),
        });
        self.scheduler
            .add_job(&invocation.schedule_id, &invocation.expression, job)
    }

    /// One reconciliation pass. On a listing failure nothing local is touched.
    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileOutcome> {
        let (wanted, skipped) = self.fetch_cron_schedules().await?;
        let mut outcome = ReconcileOutcome {
            skipped,
            ..Default::default()
        };

        let mut registered = self.registered.lock().await;

        let stale: Vec<String> = registered
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for schedule_id in stale {
            if let Some(old) = registered.remove(&schedule_id) {
                self.scheduler.remove_job(old.entry_id);
                tracing::info!(
                    event = "funcgate.crontab.removed",
                    schedule_id = %schedule_id,
                    entry_id = old.entry_id,
                    "removed stale cron entry"
                );
                outcome.removed.push(schedule_id);
            }
        }

        for (schedule_id, invocation) in wanted {
            let replacing = match registered.get(&schedule_id) {
                Some(current) if current.invocation == invocation => continue,
                Some(_) => true,
                None => false,
            };
            if replacing {
                if let Some(old) = registered.remove(&schedule_id) {
                    self.scheduler.remove_job(old.entry_id);
                }
            }

            match self.register(&invocation) {
                Ok(entry_id) => {
                    let event = if replacing {
                        "funcgate.crontab.replaced"
                    } else {
                        "funcgate.crontab.added"
                    };
                    tracing::info!(
                        event,
                        schedule_id = %schedule_id,
                        entry_id,
                        expression = %invocation.expression,
                        "registered cron entry"
                    );
                    registered.insert(
                        schedule_id.clone(),
                        Registered {
                            entry_id,
                            invocation,
                        },
                    );
                    if replacing {
                        outcome.replaced.push(schedule_id);
                    } else {
                        outcome.added.push(schedule_id);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        event = "funcgate.crontab.register_failed",
                        schedule_id = %schedule_id,
                        error = %format!("{err:#}"),
                        "failed to register cron entry"
                    );
                    if replacing {
                        outcome.removed.push(schedule_id.clone());
                    }
                    outcome.failed.push(schedule_id);
                }
            }
        }

        Ok(outcome)
    }

    /// Schedule ids currently registered, sorted.
    pub async fn active_schedule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registered.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconcile now and then every `interval` until `shutdown_rx` flips to `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            event = "funcgate.crontab.started",
            interval_secs = interval.as_secs(),
            "crontab reconciler started"
        );
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tracing::debug!(event = "funcgate.crontab.cycle", "reconciling cron entries");
            match self.reconcile_once().await {
                Ok(outcome) => {
                    if !outcome.is_noop() || !outcome.failed.is_empty() {
                        tracing::info!(
                            event = "funcgate.crontab.reconciled",
                            added = outcome.added.len(),
                            removed = outcome.removed.len(),
                            replaced = outcome.replaced.len(),
                            failed = outcome.failed.len(),
                            skipped = outcome.skipped,
                            "crontab reconciled"
                        );
                    }
                    for entry in self.scheduler.entries() {
                        tracing::debug!(
                            event = "funcgate.crontab.active_entry",
                            entry_id = entry.id,
                            schedule_id = %entry.key,
                            expression = %entry.expression,
                            next_fire = ?entry.next_fire,
                            "active cron entry"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        event = "funcgate.crontab.fetch_failed",
                        error = %format!("{err:#}"),
                        "error retrieving remote schedules; keeping current entries"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        tracing::info!(event = "funcgate.crontab.stopped", "crontab reconciler stopped");
    }
}
