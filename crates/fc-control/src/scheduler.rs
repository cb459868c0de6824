//! Scheduled task engine
//!
//! Owns the recurring tasks and their interval timers. Every enabled task
//! holds exactly one [`TimerHandle`]; replacing or dropping the handle
//! cancels the old timer. A per-entry generation number is bumped on every
//! re-arm so a fire that was already running when its task was updated
//! completes, but never schedules anything itself.
//!
//! The full task set is written to the [`TaskStore`] after each mutation.
//! Store failures are logged and the in-memory change stands.
//!
//! Persistence is synchronous and held under `persist_lock`, including the
//! save that follows a timer fire. The task file is a few kilobytes, so the
//! runtime worker is blocked for one small write per fire; a store backed by
//! slower media should move the save onto `spawn_blocking` and keep the lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use fc_core::error::{PersistenceError, SchedulerError};
use fc_core::ipc::FleetEvent;
use fc_core::records::{ScheduledTask, TaskStats, TaskUpdate};
use fc_core::time;
use fc_core::timer::{self as timers, TimerHandle};
use fc_core::traits::TaskStore;
use fc_core::types::{Target, TaskId};

use crate::dispatch::Dispatcher;
use crate::events::{self, EventSender};

struct TaskEntry {
    task: ScheduledTask,
    generation: u64,
    timer: Option<TimerHandle>,
}

/// Recurring command scheduler
pub struct TaskScheduler {
    tasks: DashMap<TaskId, TaskEntry>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn TaskStore>,
    events: EventSender,
    shutdown: CancellationToken,
    closed: AtomicBool,
    generation: AtomicU64,
    persist_lock: Mutex<()>,
    self_ref: Weak<TaskScheduler>,
}

/// Check an interval in minutes
fn validate_interval(minutes: i64) -> Result<u32, SchedulerError> {
    if minutes <= 0 {
        return Err(SchedulerError::InvalidInterval(minutes));
    }
    u32::try_from(minutes).map_err(|_| SchedulerError::InvalidInterval(minutes))
}

fn period(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes) * 60)
}

impl TaskScheduler {
    /// Create an empty scheduler. Timers are children of `shutdown`.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn TaskStore>,
        events: EventSender,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            tasks: DashMap::new(),
            dispatcher,
            store,
            events,
            shutdown,
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(1),
            persist_lock: Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    /// Load persisted tasks and arm timers for the enabled ones.
    ///
    /// Tasks with an invalid interval are dropped with a warning. Returns
    /// the number of tasks restored.
    pub fn restore(&self) -> Result<usize, PersistenceError> {
        let stored = self.store.load()?;
        let mut restored = 0;

        for task in stored {
            if task.interval_minutes == 0 {
                tracing::warn!("Skipping stored task {} with zero interval", task.id);
                continue;
            }
            let generation = self.next_generation();
            let timer = task
                .enabled
                .then(|| self.arm(&task.id, task.interval_minutes, generation));
            self.tasks.insert(
                task.id.clone(),
                TaskEntry {
                    task,
                    generation,
                    timer,
                },
            );
            restored += 1;
        }

        tracing::info!("Restored {} scheduled tasks", restored);
        Ok(restored)
    }

    /// Create an enabled task firing every `interval_minutes`
    pub fn create(
        &self,
        name: &str,
        command: &str,
        interval_minutes: i64,
        target: Target,
    ) -> Result<ScheduledTask, SchedulerError> {
        self.ensure_running()?;
        let interval_minutes = validate_interval(interval_minutes)?;

        let task = ScheduledTask {
            id: TaskId::generate(),
            name: name.to_string(),
            command: command.to_string(),
            interval_minutes,
            target,
            enabled: true,
            created_at: time::now(),
            last_run: None,
            run_count: 0,
        };

        let generation = self.next_generation();
        let timer = self.arm(&task.id, interval_minutes, generation);
        self.tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                generation,
                timer: Some(timer),
            },
        );

        tracing::info!(
            "Created task {} '{}' every {}m -> {}",
            task.id,
            task.name,
            task.interval_minutes,
            task.target
        );
        self.persist();
        Ok(task)
    }

    /// Apply a partial update.
    ///
    /// The old timer is cancelled before the fields change and a new one is
    /// armed only if the task ends up enabled. An invalid interval rejects
    /// the whole update and leaves the task untouched.
    pub fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<ScheduledTask, SchedulerError> {
        self.ensure_running()?;
        let interval = update.interval_minutes.map(validate_interval).transpose()?;

        let task = {
            let mut entry = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;

            entry.timer = None;
            let generation = self.next_generation();
            entry.generation = generation;

            let TaskUpdate {
                name,
                command,
                target,
                enabled,
                ..
            } = update;
            if let Some(name) = name {
                entry.task.name = name;
            }
            if let Some(command) = command {
                entry.task.command = command;
            }
            if let Some(minutes) = interval {
                entry.task.interval_minutes = minutes;
            }
            if let Some(target) = target {
                entry.task.target = target;
            }
            if let Some(enabled) = enabled {
                entry.task.enabled = enabled;
            }

            if entry.task.enabled {
                entry.timer = Some(self.arm(id, entry.task.interval_minutes, generation));
            }
            entry.task.clone()
        };

        tracing::info!("Updated task {}", id);
        self.persist();
        Ok(task)
    }

    /// Cancel the timer and remove the task
    pub fn delete(&self, id: &TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.ensure_running()?;
        let (_, entry) = self
            .tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        drop(entry.timer);

        tracing::info!("Deleted task {}", id);
        self.persist();
        Ok(entry.task)
    }

    /// Flip `enabled`, arming or cancelling the timer
    pub fn toggle(&self, id: &TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.ensure_running()?;
        let task = {
            let mut entry = self
                .tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;

            entry.timer = None;
            let generation = self.next_generation();
            entry.generation = generation;
            entry.task.enabled = !entry.task.enabled;
            if entry.task.enabled {
                entry.timer = Some(self.arm(id, entry.task.interval_minutes, generation));
            }
            entry.task.clone()
        };

        tracing::info!(
            "Task {} {}",
            id,
            if task.enabled { "enabled" } else { "disabled" }
        );
        self.persist();
        Ok(task)
    }

    /// Fire a task immediately, whether or not it is enabled.
    ///
    /// Goes through the same path as a timer fire; the task's own timer is
    /// left as it is.
    pub fn run_now(&self, id: &TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.ensure_running()?;
        let (target, command) = {
            let entry = self
                .tasks
                .get(id)
                .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
            (entry.task.target.clone(), entry.task.command.clone())
        };

        self.execute(id, &target, &command);
        self.get(id)
    }

    /// Get one task
    pub fn get(&self, id: &TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.tasks
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))
    }

    /// Every task, oldest first
    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.iter().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        tasks
    }

    /// Counts snapshot
    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for entry in self.tasks.iter() {
            stats.total += 1;
            if entry.task.enabled {
                stats.enabled += 1;
            }
            if entry.timer.as_ref().is_some_and(|t| !t.is_cancelled()) {
                stats.armed_timers += 1;
            }
        }
        stats
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every timer. No task fires and no mutation is accepted afterwards.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        for mut entry in self.tasks.iter_mut() {
            entry.timer = None;
        }
        tracing::info!("Scheduler shut down");
    }

    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn arm(&self, id: &TaskId, minutes: u32, generation: u64) -> TimerHandle {
        let scheduler = self.self_ref.clone();
        let id = id.clone();
        timers::spawn_every(&self.shutdown, period(minutes), move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.fire(&id, generation);
            }
        })
    }

    /// Timer callback
    fn fire(&self, id: &TaskId, generation: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (target, command) = {
            let Some(entry) = self.tasks.get(id) else {
                return;
            };
            if entry.generation != generation || !entry.task.enabled {
                tracing::debug!("Ignoring stale fire of task {}", id);
                return;
            }
            (entry.task.target.clone(), entry.task.command.clone())
        };

        self.execute(id, &target, &command);
    }

    /// Dispatch, then record the run and persist
    fn execute(&self, id: &TaskId, target: &Target, command: &str) {
        let delivered = match self.dispatcher.send(target, command, &[]) {
            Ok(report) => report.delivered(),
            Err(e) => {
                tracing::warn!("Task {} could not dispatch '{}': {}", id, command, e);
                0
            }
        };

        let run_count = {
            let Some(mut entry) = self.tasks.get_mut(id) else {
                return;
            };
            entry.task.last_run = Some(time::now());
            entry.task.run_count += 1;
            entry.task.run_count
        };

        tracing::debug!("Task {} fired (run {}, {} delivered)", id, run_count, delivered);
        self.persist();
        events::publish(
            &self.events,
            FleetEvent::TaskFired {
                task_id: id.clone(),
                run_count,
                delivered,
            },
        );
    }

    fn persist(&self) {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.list();
        if let Err(e) = self.store.save(&snapshot) {
            tracing::warn!("Failed to persist scheduled tasks: {}", e);
        }
    }
}
