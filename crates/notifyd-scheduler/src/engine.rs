//! Scheduler engine — one cancellable timer pair per notification task.
//!
//! Every registered task gets an execution timer (first run, then every
//! `interval` after the previous pass returns) and an expiry timer that drops
//! the task from the table. Both timers are plain tokio tasks that sleep, so an
//! idle scheduler costs nothing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notifyd_core::{NotifydError, Result};
use tokio::sync::watch;

use crate::tasks::Task;

/// Result of [`Scheduler::exists`].
#[derive(Debug, Clone)]
pub enum Presence {
    Found(Arc<Task>),
    Absent,
}

impl Presence {
    pub fn is_found(&self) -> bool {
        matches!(self, Presence::Found(_))
    }

    pub fn task(self) -> Option<Arc<Task>> {
        match self {
            Presence::Found(task) => Some(task),
            Presence::Absent => None,
        }
    }
}

/// In-memory task table keyed by notification id.
///
/// Cloning is cheap and every clone sees the same table. Registering a task
/// spawns its timers, so [`Scheduler::add_task`] must be called inside a tokio
/// runtime.
#[derive(Clone, Default)]
pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<i64, Arc<Task>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `id` and arm its timers.
    ///
    /// An existing task with the same id is cancelled and replaced.
    pub fn add_task(&self, id: i64, task: Task) -> Result<Arc<Task>> {
        if task.id() != id {
            return Err(NotifydError::invalid_task(format!(
                "task id {} does not match {id}",
                task.id()
            )));
        }
        task.validate()?;

        let task = Arc::new(task);
        let previous = self.write().insert(id, task.clone());
        if let Some(previous) = previous {
            previous.cancel();
            tracing::debug!("Task {id} replaced, previous timers cancelled");
        }

        let timing = task.timing();
        self.arm_execution(task.clone(), delay_until(timing.first_run));
        self.arm_expiry(task.clone(), delay_until(timing.expiry));

        tracing::info!(
            "📅 Task {id} scheduled: first run {}, every {}s, expires {}",
            timing.first_run.to_rfc3339(),
            timing.interval.as_secs(),
            timing.expiry.to_rfc3339()
        );
        Ok(task)
    }

    /// The task registered under `id`.
    pub fn lookup(&self, id: i64) -> Result<Arc<Task>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(NotifydError::IdNotFound(id))
    }

    pub fn exists(&self, id: i64) -> Presence {
        match self.lookup(id) {
            Ok(task) => Presence::Found(task),
            Err(_) => Presence::Absent,
        }
    }

    /// Cancel and drop the task under `id`. No-op if absent.
    pub fn remove(&self, id: i64) {
        let task = self.read().get(&id).cloned();
        if let Some(task) = task {
            if self.remove_task(&task) {
                tracing::info!("🗑️ Task {id} removed");
            }
        }
    }

    /// Remove every tracked task.
    pub fn stop_all(&self) {
        let tasks: Vec<Arc<Task>> = self.read().values().cloned().collect();
        let mut removed = 0;
        for task in &tasks {
            if self.remove_task(task) {
                removed += 1;
            }
        }
        tracing::info!("🛑 Scheduler stopped, {removed} task(s) removed");
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel `task`, then delete it from the table if it is still the
    /// registered instance. Lock order: task, then table.
    fn remove_task(&self, task: &Arc<Task>) -> bool {
        task.cancel();
        let _timing = task.lock();
        let mut tasks = self.write();
        match tasks.get(&task.id()) {
            Some(current) if Arc::ptr_eq(current, task) => {
                tasks.remove(&task.id());
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, task: &Arc<Task>) -> bool {
        self.read()
            .get(&task.id())
            .is_some_and(|current| Arc::ptr_eq(current, task))
    }

    fn arm_execution(&self, task: Arc<Task>, first_delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut cancelled = task.cancelled();
            let mut delay = first_delay;
            loop {
                if !sleep_or_cancel(delay, &mut cancelled).await || task.is_cancelled() {
                    return;
                }
                if !scheduler.is_current(&task) {
                    return;
                }
                tracing::debug!("⏰ Task {} firing", task.id());
                task.run().await;
                // Next pass is armed only once this one has returned.
                delay = task.interval();
            }
        });
    }

    fn arm_expiry(&self, task: Arc<Task>, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut cancelled = task.cancelled();
            if sleep_or_cancel(delay, &mut cancelled).await && scheduler.remove_task(&task) {
                tracing::info!("⌛ Task {} expired", task.id());
            }
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("ids", &self.ids()).finish()
    }
}

impl Scheduler {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, Arc<Task>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, Arc<Task>>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Time left until `at`, zero if it already passed.
pub(crate) fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Sleep for `delay`. Returns false if the task was cancelled first.
async fn sleep_or_cancel(delay: Duration, cancelled: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancelled.wait_for(|c| *c) => false,
    }
}
