//! Polling job scheduler.
//!
//! A [`JobScheduler`] owns a set of named [`JobDefinition`]s and a store. Each
//! poll it releases abandoned locks, then claims and dispatches due jobs until
//! either nothing is eligible or every execution slot is busy. Several
//! schedulers, in one process or many, may share a store: claims are atomic in
//! the store, so no job is ever dispatched twice at once.
//!
//! Two limits apply. `max_concurrency` bounds how many jobs this scheduler runs
//! at a time across all handlers. A definition's `concurrency` bounds how many
//! jobs of that name hold a lock at a time, counted across every scheduler
//! sharing the store.
//!
//! # Examples
//!
//! ```rust
//! use framecast::{
//!     config::SchedulerConfig,
//!     scheduler::{JobContext, JobDefinition, JobHandler, JobScheduler},
//!     store::memory::MemoryStore,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> framecast::Result<()> {
//! let handler: JobHandler = Arc::new(|ctx: JobContext| {
//!     Box::pin(async move {
//!         ctx.progress(50).await?;
//!         Ok(None)
//!     })
//! });
//!
//! let scheduler = Arc::new(
//!     JobScheduler::new(Arc::new(MemoryStore::new()), SchedulerConfig::default())
//!         .define(JobDefinition::new("thumbnail", handler)),
//! );
//! scheduler.start().await?;
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    FramecastError, Result,
    config::SchedulerConfig,
    cron::CronSchedule,
    job::{Job, JobId},
    orchestrator::ProgressSink,
    priority::JobPriority,
    store::{ClaimRequest, HandlerCap, JobStore, RunOutcome},
};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

/// Result of a handler run. `Some` output is merged into the job's data.
pub type JobOutput = Option<serde_json::Value>;

pub type JobHandler = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<JobOutput>> + Send>> + Send + Sync,
>;

/// A named unit of work the scheduler can run.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    /// Per-name running cap. `None` uses the scheduler's default.
    pub concurrency: Option<u32>,
    pub handler: JobHandler,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, handler: JobHandler) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            handler,
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// A recurring definition registered with [`JobScheduler::every`].
#[derive(Debug, Clone)]
struct RecurringEntry {
    name: String,
    schedule: CronSchedule,
    priority: JobPriority,
}

/// What a running handler sees of its job.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    store: Arc<dyn JobStore>,
    worker: Arc<str>,
    heartbeat: bool,
    last_progress: Arc<AtomicU8>,
}

impl JobContext {
    fn new(job: Job, store: Arc<dyn JobStore>, worker: Arc<str>, heartbeat: bool) -> Self {
        let progress = job.progress;
        Self {
            job: Arc::new(job),
            store,
            worker,
            heartbeat,
            last_progress: Arc::new(AtomicU8::new(progress)),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Decodes the job's data.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.data.clone())?)
    }

    /// Records progress. Values at or below the last recorded one are dropped
    /// without a store round trip.
    pub async fn progress(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        let previous = self.last_progress.fetch_max(percent, Ordering::SeqCst);
        if percent <= previous {
            return Ok(());
        }

        let heartbeat = self.heartbeat.then(Utc::now);
        self.store
            .update_progress(self.job.id, &self.worker, percent, heartbeat)
            .await
    }
}

#[async_trait]
impl ProgressSink for JobContext {
    async fn report(&self, percent: u8) -> Result<()> {
        self.progress(percent).await
    }
}

struct PollLoop {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    worker: Arc<str>,
    definitions: HashMap<String, Arc<JobDefinition>>,
    recurring: Vec<RecurringEntry>,
    slots: Arc<Semaphore>,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let worker: Arc<str> = match &config.worker_name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::from(format!("framecast-{}", uuid::Uuid::new_v4()).as_str()),
        };
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

        Self {
            store,
            config,
            worker,
            definitions: HashMap::new(),
            recurring: Vec::new(),
            slots,
            poll_loop: Mutex::new(None),
        }
    }

    /// Registers a definition, replacing any earlier one with the same name.
    pub fn define(mut self, definition: JobDefinition) -> Self {
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        self
    }

    /// Runs the definition `name` on `schedule`. The recurring record is
    /// written when the scheduler starts.
    pub fn every(mut self, name: impl Into<String>, schedule: CronSchedule) -> Self {
        self.recurring.push(RecurringEntry {
            name: name.into(),
            schedule,
            priority: JobPriority::Low,
        });
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Jobs currently executing in this scheduler.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency.max(1) - self.slots.available_permits()
    }

    pub async fn is_running(&self) -> bool {
        self.poll_loop.lock().await.is_some()
    }

    fn handler_caps(&self) -> Vec<HandlerCap> {
        self.definitions
            .values()
            .map(|definition| {
                HandlerCap::new(
                    definition.name.clone(),
                    definition
                        .concurrency
                        .unwrap_or(self.config.default_concurrency)
                        .max(1),
                )
            })
            .collect()
    }

    /// Writes recurring records and starts polling. Calling it again while the
    /// scheduler runs is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut poll_loop = self.poll_loop.lock().await;
        if poll_loop.is_some() {
            debug!(worker = %self.worker, "Scheduler already started");
            return Ok(());
        }
        self.config.validate()?;

        for entry in &self.recurring {
            if !self.is_defined(&entry.name) {
                return Err(FramecastError::UnknownHandler {
                    name: entry.name.clone(),
                });
            }
        }

        let register = async {
            let now = Utc::now();
            for entry in &self.recurring {
                let job = Job::recurring(entry.name.clone(), &entry.schedule, now)?
                    .with_priority(entry.priority);
                let id = self.store.upsert_recurring(job).await?;
                info!(
                    handler = %entry.name,
                    schedule = %entry.schedule.expression,
                    job_id = %id,
                    "Registered recurring job"
                );
            }
            Ok::<_, FramecastError>(())
        };

        tokio::time::timeout(self.config.start_timeout, register)
            .await
            .map_err(|_| FramecastError::Timeout {
                message: format!(
                    "Scheduler start did not finish within {:?}",
                    self.config.start_timeout
                ),
            })??;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        *poll_loop = Some(PollLoop {
            shutdown_tx,
            handle,
        });

        info!(
            worker = %self.worker,
            handlers = self.definitions.len(),
            max_concurrency = self.config.max_concurrency,
            poll_interval = ?self.config.poll_interval,
            "Scheduler started"
        );
        Ok(())
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(worker = %self.worker, "Poll loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(worker = %self.worker, "Error polling for jobs: {}", e);
                    }
                }
            }
        }
    }

    /// Performs one poll: releases stale locks, then claims and dispatches as
    /// many due jobs as there are free slots. Returns how many were dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(self.config.lock_lifetime).map_err(|e| {
            FramecastError::Scheduler {
                message: format!("Invalid lock lifetime: {}", e),
            }
        })?;

        let released = self.store.release_stale_locks(now - lifetime).await?;
        if released > 0 {
            warn!(count = released, "Released stale job locks");
        }

        let caps = self.handler_caps();
        let mut dispatched = 0;

        loop {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!(worker = %self.worker, "All execution slots busy");
                break;
            };

            let request = ClaimRequest {
                worker: self.worker.to_string(),
                now: Utc::now(),
                handlers: caps.clone(),
            };
            let Some(job) = self.store.claim_next(&request).await? else {
                break;
            };

            let Some(definition) = self.definitions.get(&job.name).cloned() else {
                // Claims are limited to defined names, so this only happens if
                // a definition is replaced concurrently.
                let reason = FramecastError::UnknownHandler {
                    name: job.name.clone(),
                }
                .to_string();
                self.store
                    .fail_job(job.id, &self.worker, &reason, Utc::now())
                    .await?;
                continue;
            };

            debug!(job_id = %job.id, handler = %job.name, "Dispatching job");
            let execution = Execution {
                store: Arc::clone(&self.store),
                worker: Arc::clone(&self.worker),
                heartbeat: self.config.heartbeat_on_progress,
            };
            tokio::spawn(async move {
                let _permit = permit;
                execution.execute(job, definition).await;
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Waits until no job is executing in this scheduler.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let slots = u32::try_from(self.config.max_concurrency.max(1)).unwrap_or(u32::MAX);
        let all = tokio::time::timeout(timeout, self.slots.acquire_many(slots))
            .await
            .map_err(|_| FramecastError::Timeout {
                message: format!(
                    "{} job(s) still running after {:?}",
                    self.in_flight(),
                    timeout
                ),
            })?
            .map_err(|e| FramecastError::Scheduler {
                message: e.to_string(),
            })?;
        drop(all);
        Ok(())
    }

    /// Stops polling and waits for in-flight jobs to finish.
    ///
    /// Running handlers are never aborted. If they outlast the shutdown
    /// timeout this returns a timeout error; their locks expire and the jobs are
    /// reclaimed by another scheduler.
    pub async fn shutdown(&self) -> Result<()> {
        let poll_loop = self.poll_loop.lock().await.take();
        if let Some(poll_loop) = poll_loop {
            let _ = poll_loop.shutdown_tx.send(()).await;
            if let Err(e) = poll_loop.handle.await {
                warn!(worker = %self.worker, "Poll loop ended abnormally: {}", e);
            }
        }

        let running = self.in_flight();
        if running > 0 {
            info!(worker = %self.worker, running, "Waiting for in-flight jobs");
        }
        self.wait_idle(self.config.shutdown_timeout).await?;
        info!(worker = %self.worker, "Scheduler stopped");
        Ok(())
    }
}

/// Everything a dispatched job needs once it leaves the poll loop.
struct Execution {
    store: Arc<dyn JobStore>,
    worker: Arc<str>,
    heartbeat: bool,
}

impl Execution {
    async fn execute(self, job: Job, definition: Arc<JobDefinition>) {
        let job_id = job.id;
        let name = job.name.clone();
        let started = std::time::Instant::now();
        let recurring = job.cron_schedule();

        let context = JobContext::new(
            job,
            Arc::clone(&self.store),
            Arc::clone(&self.worker),
            self.heartbeat,
        );

        // A panicking handler fails its job instead of taking the slot down
        let result = match tokio::spawn((definition.handler)(context)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(FramecastError::Scheduler {
                message: format!("Handler for '{}' panicked", name),
            }),
            Err(e) => Err(FramecastError::Scheduler {
                message: format!("Handler for '{}' was cancelled: {}", name, e),
            }),
        };

        let finished_at = Utc::now();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let write = match recurring {
            Ok(Some(schedule)) => {
                let outcome = match &result {
                    Ok(_) => {
                        info!(job_id = %job_id, handler = %name, elapsed_ms, "Recurring job run completed");
                        RunOutcome::Succeeded
                    }
                    Err(e) => {
                        error!(job_id = %job_id, handler = %name, elapsed_ms, "Recurring job run failed: {}", e);
                        RunOutcome::Failed(e.to_string())
                    }
                };
                match schedule.require_next_execution(finished_at) {
                    Ok(next_run_at) => {
                        debug!(job_id = %job_id, %next_run_at, "Rescheduling recurring job");
                        self.store
                            .reschedule_recurring(job_id, &self.worker, outcome, finished_at, next_run_at)
                            .await
                    }
                    Err(e) => {
                        self.store
                            .fail_job(job_id, &self.worker, &e.to_string(), finished_at)
                            .await
                    }
                }
            }
            Ok(None) => match result {
                Ok(output) => {
                    info!(job_id = %job_id, handler = %name, elapsed_ms, "Job completed");
                    self.store
                        .complete_job(job_id, &self.worker, output, finished_at)
                        .await
                }
                Err(e) => {
                    if e.is_validation() {
                        warn!(job_id = %job_id, handler = %name, elapsed_ms, "Job rejected: {}", e);
                    } else {
                        error!(job_id = %job_id, handler = %name, elapsed_ms, "Job failed: {}", e);
                    }
                    self.store
                        .fail_job(job_id, &self.worker, &e.to_string(), finished_at)
                        .await
                }
            },
            Err(e) => {
                self.store
                    .fail_job(job_id, &self.worker, &e.to_string(), finished_at)
                    .await
            }
        };

        if let Err(e) = write {
            error!(job_id = %job_id, handler = %name, "Failed to record job outcome: {}", e);
        }
    }
}
