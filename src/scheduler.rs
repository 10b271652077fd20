//! # Task Scheduler
//!
//! Runs recurring background tasks, one loop per task id. Each loop waits the
//! optional initial delay, then invokes the task under its timeout with a fixed
//! start-to-start frequency. A failed or timed-out invocation is retried after
//! an exponential backoff with jitter, never later than the next regular start.
//! Invocations of one task never overlap, and a task id is scheduled at most once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{RetryPolicyConfig, ScheduleDefinition};

/// Error type returned by task bodies.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A named unit of recurring work.
#[derive(Clone)]
pub struct TaskInvocation {
    pub id: String,
    pub func: TaskFn,
}

impl TaskInvocation {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            func: Arc::new(move || Box::pin(func()) as TaskFuture),
        }
    }
}

impl std::fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {id} is already scheduled")]
    AlreadyScheduled { id: String },
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("task {id} failed: {message}")]
    TaskFailed { id: String, message: String },
    #[error("task {id} timed out after {timeout:?}")]
    TimedOut { id: String, timeout: Duration },
}

/// Something that can run a task, once or on a schedule.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: TaskInvocation) -> Result<(), SchedulerError>;
}

/// Exponential backoff with jitter for failed invocations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_seconds),
            max: Duration::from_secs(config.max_seconds),
            jitter_factor: config.jitter_factor,
        }
    }

    /// Delay before retry number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.compute_backoff(failures, &mut rng)
    }

    fn compute_backoff<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let exponent = failures.saturating_sub(1).min(30) as i32;
        let backoff = (self.base.as_secs_f64() * 2_f64.powi(exponent)).min(self.max.as_secs_f64());
        let jitter_span = self.jitter_factor * backoff;
        let jitter = if jitter_span > 0.0 {
            rng.gen_range(0.0..jitter_span)
        } else {
            0.0
        };
        Duration::from_secs_f64(backoff + jitter)
    }
}

struct SchedulerInner {
    shutdown: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    retry: RetryPolicy,
}

/// Owner of every scheduled loop; cancelling it stops them all.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(HashMap::new()),
                retry,
            }),
        }
    }

    /// Runner that schedules tasks according to `schedule`.
    pub fn create_scheduled_task_runner(&self, schedule: ScheduleDefinition) -> ScheduledTaskRunner {
        ScheduledTaskRunner {
            scheduler: self.clone(),
            schedule,
        }
    }

    /// Ids of the loops that are still running.
    pub async fn running_tasks(&self) -> Vec<String> {
        let tasks = self.inner.tasks.lock().await;
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancels every loop, abandoning in-flight invocations, and waits for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<(String, JoinHandle<()>)> =
            self.inner.tasks.lock().await.drain().collect();

        for (id, handle) in handles {
            if let Err(err) = handle.await {
                error!(task_id = %id, error = ?err, "Scheduled task panicked");
            }
        }
        info!("Task scheduler stopped");
    }

    async fn spawn(
        &self,
        task: TaskInvocation,
        schedule: ScheduleDefinition,
    ) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }

        let mut tasks = self.inner.tasks.lock().await;
        if tasks
            .get(&task.id)
            .is_some_and(|handle| !handle.is_finished())
        {
            return Err(SchedulerError::AlreadyScheduled { id: task.id });
        }

        let id = task.id.clone();
        let span = info_span!("scheduled_task", task_id = %id);
        let handle = tokio::spawn(
            run_loop(
                task,
                schedule,
                self.inner.retry.clone(),
                self.inner.shutdown.clone(),
            )
            .instrument(span),
        );
        tasks.insert(id, handle);
        Ok(())
    }
}

/// Schedules tasks on a [`TaskScheduler`] with a fixed [`ScheduleDefinition`].
#[derive(Clone)]
pub struct ScheduledTaskRunner {
    scheduler: TaskScheduler,
    schedule: ScheduleDefinition,
}

impl ScheduledTaskRunner {
    pub fn schedule(&self) -> &ScheduleDefinition {
        &self.schedule
    }
}

#[async_trait]
impl TaskRunner for ScheduledTaskRunner {
    async fn run(&self, task: TaskInvocation) -> Result<(), SchedulerError> {
        info!(
            task_id = %task.id,
            frequency_ms = self.schedule.frequency.as_millis() as u64,
            timeout_ms = self.schedule.timeout.as_millis() as u64,
            "Scheduling task"
        );
        self.scheduler.spawn(task, self.schedule.clone()).await
    }
}

async fn run_loop(
    task: TaskInvocation,
    schedule: ScheduleDefinition,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) {
    if let Some(delay) = schedule.initial_delay {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }

    let mut consecutive_failures: u32 = 0;

    loop {
        let started = Instant::now();
        let regular_next = started + schedule.frequency;

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(task_id = %task.id, "Task cancelled");
                return;
            }
            outcome = timeout(schedule.timeout, (task.func)()) => outcome,
        };

        let elapsed = started.elapsed();
        histogram!("scheduler_task_duration_ms", "task" => task.id.clone())
            .record(elapsed.as_secs_f64() * 1_000.0);

        let wake_at = match outcome {
            Ok(Ok(())) => {
                consecutive_failures = 0;
                counter!("scheduler_task_runs_total", "task" => task.id.clone(), "outcome" => "success")
                    .increment(1);
                debug!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                regular_next
            }
            Ok(Err(err)) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                counter!("scheduler_task_runs_total", "task" => task.id.clone(), "outcome" => "failure")
                    .increment(1);
                let retry_at = retry_instant(&retry, consecutive_failures, regular_next);
                warn!(
                    task_id = %task.id,
                    error = %err,
                    consecutive_failures,
                    retry_in_ms = retry_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Task failed"
                );
                retry_at
            }
            Err(_) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                counter!("scheduler_task_runs_total", "task" => task.id.clone(), "outcome" => "timeout")
                    .increment(1);
                let retry_at = retry_instant(&retry, consecutive_failures, regular_next);
                warn!(
                    task_id = %task.id,
                    timeout_ms = schedule.timeout.as_millis() as u64,
                    consecutive_failures,
                    "Task timed out"
                );
                retry_at
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(task_id = %task.id, "Task cancelled");
                return;
            }
            _ = sleep_until(wake_at) => {}
        }
    }
}

fn retry_instant(retry: &RetryPolicy, failures: u32, regular_next: Instant) -> Instant {
    (Instant::now() + retry.backoff(failures)).min(regular_next)
}

/// Runs each task once, inline, and reports its outcome.
#[derive(Debug, Clone, Default)]
pub struct OneShotTaskRunner {
    timeout: Option<Duration>,
}

impl OneShotTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl TaskRunner for OneShotTaskRunner {
    async fn run(&self, task: TaskInvocation) -> Result<(), SchedulerError> {
        let result = match self.timeout {
            Some(limit) => timeout(limit, (task.func)())
                .await
                .map_err(|_| SchedulerError::TimedOut {
                    id: task.id.clone(),
                    timeout: limit,
                })?,
            None => (task.func)().await,
        };

        result.map_err(|err| SchedulerError::TaskFailed {
            id: task.id,
            message: err.to_string(),
        })
    }
}
