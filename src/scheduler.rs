//! Step- and time-triggered callbacks tied to agent progress.
//!
//! Step triggers are purely event-driven: the engine calls
//! [`Scheduler::notify_step`] at every safe persistence point. Interval
//! tasks run on tokio timers owned by the scheduler; missed ticks are not
//! catch-up-fired. All callbacks run under the scheduler's root
//! cancellation token.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// What fired a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Step,
    Interval,
    Cron,
    File,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Step => write!(f, "step"),
            TriggerKind::Interval => write!(f, "interval"),
            TriggerKind::Cron => write!(f, "cron"),
            TriggerKind::File => write!(f, "file"),
        }
    }
}

/// Callback for step triggers; receives the triggering step count.
pub type StepCallback = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback for interval triggers.
pub type TaskCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer invoked on every trigger with (task id, spec, kind).
pub type TriggerObserver = Arc<dyn Fn(&str, &str, TriggerKind) + Send + Sync>;

/// Scheduler options.
#[derive(Clone, Default)]
pub struct SchedulerOptions {
    pub on_trigger: Option<TriggerObserver>,
}

struct StepTask {
    every: u64,
    last_triggered: u64,
    callback: StepCallback,
}

struct IntervalTask {
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    step_tasks: HashMap<String, StepTask>,
    listeners: HashMap<u64, StepCallback>,
    next_listener_id: u64,
    interval_tasks: HashMap<String, IntervalTask>,
}

/// Per-agent task scheduler.
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    root: CancellationToken,
    on_trigger: Option<TriggerObserver>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Scheduler {
            inner: Arc::new(Mutex::new(Inner::default())),
            root: CancellationToken::new(),
            on_trigger: options.on_trigger,
        }
    }

    /// Registers a callback fired whenever the step count has grown by at
    /// least `every` since the last firing.
    pub fn every_steps(&self, every: u64, callback: StepCallback) -> Result<String> {
        if every == 0 {
            return Err(Error::Input("every must be positive".into()));
        }
        let id = format!("step-{}", Uuid::new_v4());
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .step_tasks
            .insert(
                id.clone(),
                StepTask {
                    every,
                    last_triggered: 0,
                    callback,
                },
            );
        Ok(id)
    }

    /// Installs a listener called once per step notification. The returned
    /// handle removes it.
    pub fn on_step(&self, callback: StepCallback) -> ListenerHandle {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, callback);
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers a step count. Due tasks are selected serially and their
    /// callbacks dispatched in parallel.
    pub fn notify_step(&self, step_count: u64) {
        let mut due: Vec<(String, u64, StepCallback)> = Vec::new();
        let mut listeners: Vec<StepCallback> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("scheduler lock poisoned");
            listeners.extend(inner.listeners.values().cloned());
            for (id, task) in inner.step_tasks.iter_mut() {
                if step_count.saturating_sub(task.last_triggered) >= task.every {
                    task.last_triggered = step_count;
                    due.push((id.clone(), task.every, task.callback.clone()));
                }
            }
        }

        for callback in listeners {
            let root = self.root.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = root.cancelled() => {}
                    _ = callback(step_count) => {}
                }
            });
        }

        for (id, every, callback) in due {
            let root = self.root.clone();
            let observer = self.on_trigger.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = root.cancelled() => {}
                    _ = callback(step_count) => {
                        debug!(task = %id, step = step_count, "step task fired");
                        if let Some(observer) = observer {
                            observer(&id, &format!("step:{every}"), TriggerKind::Step);
                        }
                    }
                }
            });
        }
    }

    /// Registers a periodic callback. Missed ticks are skipped, never
    /// replayed.
    pub fn every_interval(&self, period: Duration, callback: TaskCallback) -> Result<String> {
        if period.is_zero() {
            return Err(Error::Input("interval must be positive".into()));
        }
        let id = format!("interval-{}", Uuid::new_v4());
        let cancel = self.root.child_token();

        let task_id = id.clone();
        let task_cancel = cancel.clone();
        let observer = self.on_trigger.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        callback().await;
                        if let Some(observer) = &observer {
                            observer(
                                &task_id,
                                &format!("interval:{}ms", period.as_millis()),
                                TriggerKind::Interval,
                            );
                        }
                    }
                }
            }
        });

        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .interval_tasks
            .insert(id.clone(), IntervalTask { cancel });
        Ok(id)
    }

    /// Removes one task by id.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        if inner.step_tasks.remove(task_id).is_some() {
            return Ok(());
        }
        if let Some(task) = inner.interval_tasks.remove(task_id) {
            task.cancel.cancel();
            return Ok(());
        }
        Err(Error::NotFound(format!("task: {task_id}")))
    }

    /// Removes every task and listener.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        for (_, task) in inner.interval_tasks.drain() {
            task.cancel.cancel();
        }
        inner.step_tasks.clear();
        inner.listeners.clear();
    }

    /// Cancels in-flight callbacks and every task.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.clear();
    }

    pub fn step_task_count(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .step_tasks
            .len()
    }

    pub fn interval_task_count(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .interval_tasks
            .len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .listeners
            .len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(SchedulerOptions::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Removes an [`on_step`](Scheduler::on_step) listener when invoked.
pub struct ListenerHandle {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl ListenerHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .lock()
                .expect("scheduler lock poisoned")
                .listeners
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_callback(counter: Arc<AtomicU64>) -> StepCallback {
        Arc::new(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn every_steps_fires_floor_n_over_every() {
        let scheduler = Scheduler::default();
        let count = Arc::new(AtomicU64::new(0));
        scheduler
            .every_steps(3, counting_callback(count.clone()))
            .unwrap();

        for step in 1..=10 {
            scheduler.notify_step(step);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Steps 3, 6, 9.
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn every_steps_rejects_zero() {
        let scheduler = Scheduler::default();
        let err = scheduler
            .every_steps(0, counting_callback(Arc::new(AtomicU64::new(0))))
            .unwrap_err();
        assert_eq!(err.kind(), "input");
    }

    #[tokio::test]
    async fn on_step_fires_every_notification_until_cancelled() {
        let scheduler = Scheduler::default();
        let count = Arc::new(AtomicU64::new(0));
        let handle = scheduler.on_step(counting_callback(count.clone()));

        for step in 1..=3 {
            scheduler.notify_step(step);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        scheduler.notify_step(4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.listener_count(), 0);
    }

    #[tokio::test]
    async fn interval_task_fires_periodically() {
        let scheduler = Scheduler::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        scheduler
            .every_interval(
                Duration::from_millis(40),
                Arc::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(220)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!((3..=7).contains(&fired), "fired {fired} times");
    }

    #[tokio::test]
    async fn cancel_stops_tasks() {
        let scheduler = Scheduler::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = scheduler
            .every_interval(
                Duration::from_millis(30),
                Arc::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.cancel(&id).unwrap();
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);

        assert_eq!(scheduler.cancel(&id).unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn observer_sees_triggers() {
        let seen: Arc<Mutex<Vec<(String, String, TriggerKind)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let scheduler = Scheduler::new(SchedulerOptions {
            on_trigger: Some(Arc::new(move |id, spec, kind| {
                sink.lock().unwrap().push((id.to_string(), spec.to_string(), kind));
            })),
        });

        let id = scheduler
            .every_steps(2, Arc::new(|_| async {}.boxed()))
            .unwrap();
        scheduler.notify_step(2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, id);
        assert_eq!(seen[0].1, "step:2");
        assert_eq!(seen[0].2, TriggerKind::Step);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let scheduler = Scheduler::default();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        scheduler
            .every_interval(
                Duration::from_millis(20),
                Arc::new(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            )
            .unwrap();
        scheduler
            .every_steps(1, counting_callback(Arc::new(AtomicU64::new(0))))
            .unwrap();

        scheduler.shutdown();
        let baseline = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), baseline);
        assert_eq!(scheduler.step_task_count(), 0);
        assert_eq!(scheduler.interval_task_count(), 0);
    }
}
