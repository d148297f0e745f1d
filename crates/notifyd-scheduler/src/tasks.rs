//! Task definitions — one notification's recurring send job.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use notifyd_core::{NotifydError, Result};
use tokio::sync::watch;

/// Work function: one pass over the notification.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Called with the error of a failed pass.
pub type ErrFn = Arc<dyn Fn(NotifydError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Mutable schedule of a task, guarded by the task lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    /// When the first pass runs.
    pub first_run: DateTime<Utc>,
    /// Pause between the end of one pass and the start of the next.
    pub interval: Duration,
    /// When the task is removed regardless of progress.
    pub expiry: DateTime<Utc>,
}

/// A scheduled task, keyed by notification id.
pub struct Task {
    id: i64,
    timing: Mutex<TaskTiming>,
    work: Option<TaskFn>,
    on_error: Option<ErrFn>,
    cancel: watch::Sender<bool>,
    run_count: AtomicU32,
}

impl Task {
    /// Create a task without a work function. Use [`Task::with_work`] before registering.
    pub fn new(
        id: i64,
        first_run: DateTime<Utc>,
        interval: Duration,
        expiry: DateTime<Utc>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id,
            timing: Mutex::new(TaskTiming {
                first_run,
                interval,
                expiry,
            }),
            work: None,
            on_error: None,
            cancel,
            run_count: AtomicU32::new(0),
        }
    }

    /// Set the work function run on every pass.
    pub fn with_work<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.work = Some(Arc::new(move || f().boxed()));
        self
    }

    /// Set the callback invoked when a pass fails.
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NotifydError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err| f(err).boxed()));
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Snapshot of the current schedule.
    pub fn timing(&self) -> TaskTiming {
        *self.lock()
    }

    pub fn first_run(&self) -> DateTime<Utc> {
        self.lock().first_run
    }

    pub fn interval(&self) -> Duration {
        self.lock().interval
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.lock().expiry
    }

    /// Mutate the schedule under the task lock.
    ///
    /// Timers already armed keep their original deadlines.
    pub fn update<F: FnOnce(&mut TaskTiming)>(&self, f: F) {
        let mut timing = self.lock();
        f(&mut timing);
    }

    /// How many passes have completed.
    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.work.is_none() {
            return Err(NotifydError::invalid_task("task function cannot be empty"));
        }
        if self.interval().is_zero() {
            return Err(NotifydError::invalid_task("task interval must be defined"));
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskTiming> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub(crate) fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Run one pass: the work function, then the error callback if it failed.
    pub(crate) async fn run(&self) {
        let Some(work) = &self.work else {
            return;
        };
        let result = work().await;
        self.run_count.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = result {
            tracing::warn!("⚠️ Task {} pass failed: {err}", self.id);
            if let Some(on_error) = &self.on_error {
                on_error(err).await;
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("timing", &self.timing())
            .field("has_work", &self.work.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .field("cancelled", &self.is_cancelled())
            .field("run_count", &self.run_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn timing_now(interval: Duration) -> Task {
        let now = Utc::now();
        Task::new(1, now, interval, now + chrono::Duration::hours(1))
    }

    #[test]
    fn test_validate() {
        let task = timing_now(Duration::from_secs(60));
        assert!(matches!(task.validate(), Err(NotifydError::InvalidTask(_))));

        let task = timing_now(Duration::ZERO).with_work(|| async { Ok(()) });
        assert!(matches!(task.validate(), Err(NotifydError::InvalidTask(_))));

        let task = timing_now(Duration::from_secs(60)).with_work(|| async { Ok(()) });
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_update_changes_timing() {
        let task = timing_now(Duration::from_secs(60));
        let later = Utc::now() + chrono::Duration::hours(5);
        task.update(|t| t.expiry = later);
        assert_eq!(task.expiry(), later);
        assert_eq!(task.interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_run_invokes_error_callback() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let task = timing_now(Duration::from_secs(60))
            .with_work(|| async { Err(NotifydError::database("boom")) })
            .on_error(move |err| {
                let seen = seen.clone();
                async move {
                    assert!(matches!(err, NotifydError::Database(_)));
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });

        task.run().await;
        task.run().await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(task.run_count(), 2);
    }

    #[test]
    fn test_cancel_flag() {
        let task = timing_now(Duration::from_secs(60));
        let rx = task.cancelled();
        assert!(!task.is_cancelled());
        task.cancel();
        assert!(task.is_cancelled());
        assert!(*rx.borrow());
    }
}
