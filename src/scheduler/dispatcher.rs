//! Dispatcher and the public scheduler handle.
//!
//! All shared state (queue, running set, registry, counters) lives behind one
//! mutex. Admission runs synchronously under that lock whenever a task is
//! enqueued, reprioritized, resumed, or settles. A background tick repeats
//! the admission pass so tasks held back by memory pressure start once the
//! pressure drops.
//!
//! Work itself runs as independent Tokio tasks. The lock is never held across
//! an `.await`; a finished attempt re-enters the lock only to record its
//! outcome.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::pressure::{MemoryPressure, PressureContext, PressurePolicy, PressureSource, QueueDepthPressure};
use super::queue::PriorityQueue;
use super::registry::CancellationRegistry;
use super::stats::LifetimeCounters;
use crate::config::{RetryPlacement, SchedulerConfig};
use crate::domain::{Priority, StatsSnapshot, TaskEvent, TaskRecord, TaskSpec, TaskState};
use crate::error::{Result, SchedulerError};
use crate::id::generate_task_id;

/// What remains of a task once it reaches a terminal state.
#[derive(Debug, Clone, Copy)]
struct RetiredTask {
    state: TaskState,
    attempts: u32,
}

struct DispatcherState {
    /// Live tasks only (queued or running)
    tasks: HashMap<String, TaskRecord>,
    queue: PriorityQueue,
    running: HashSet<String>,
    registry: CancellationRegistry,
    counters: LifetimeCounters,
    /// Most recent terminal tasks, bounded by `retired_capacity`
    retired: HashMap<String, RetiredTask>,
    retired_order: VecDeque<String>,
    enqueued: u64,
    paused: bool,
    closed: bool,
}

impl DispatcherState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            queue: PriorityQueue::new(),
            running: HashSet::new(),
            registry: CancellationRegistry::new(),
            counters: LifetimeCounters::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            enqueued: 0,
            paused: false,
            closed: false,
        }
    }

    fn pressure_context(&self) -> PressureContext {
        PressureContext {
            queued: self.queue.len(),
            running: self.running.len(),
        }
    }

    fn is_known(&self, id: &str) -> bool {
        self.tasks.contains_key(id) || self.retired.contains_key(id)
    }

    /// Running tasks whose priority is below the floor for `pressure`.
    fn running_below_floor(&self, policy: &PressurePolicy, pressure: MemoryPressure) -> usize {
        self.running
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|record| !policy.admits(pressure, record.priority))
            .count()
    }

    fn retire(&mut self, id: &str, retired: RetiredTask, capacity: usize) {
        self.retired.insert(id.to_string(), retired);
        self.retired_order.push_back(id.to_string());
        while self.retired_order.len() > capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    pressure: Arc<dyn PressureSource>,
    state: Mutex<DispatcherState>,
    runtime: Handle,
    events: broadcast::Sender<TaskEvent>,
    /// Number of live tasks, for `wait_idle`
    active: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_active(&self, state: &DispatcherState) {
        self.active.send_replace(state.tasks.len());
    }

    /// Admit queued tasks while slots are free.
    ///
    /// Tasks at or above the pressure floor are admitted first. A task below
    /// the floor only starts once nothing eligible is waiting, and only while
    /// fewer than `throttled_slots` below-floor tasks are running.
    fn admit(self: &Arc<Self>, state: &mut DispatcherState) {
        if state.paused || state.closed || state.queue.is_empty() {
            return;
        }

        let policy = &self.config.pressure.policy;
        while state.running.len() < self.config.max_concurrency {
            let pressure = self.pressure.sample(&state.pressure_context());

            if let Some(id) = state.queue.pop_eligible(policy.min_priority(pressure)) {
                self.dispatch(state, id);
                continue;
            }

            let Some((head, priority)) = state.queue.peek() else {
                break;
            };
            let throttled = state.running_below_floor(policy, pressure);
            if !policy.has_throttled_slot(throttled) {
                tracing::trace!(
                    task_id = %head,
                    priority = %priority,
                    pressure = %pressure,
                    throttled = throttled,
                    "Admission throttled by memory pressure"
                );
                break;
            }

            let Some(id) = state.queue.pop() else {
                break;
            };
            tracing::debug!(
                task_id = %id,
                priority = %priority,
                pressure = %pressure,
                "Admitting task through throttled slot"
            );
            self.dispatch(state, id);
        }
    }

    /// Move a popped task into the running set and spawn its attempt.
    fn dispatch(self: &Arc<Self>, state: &mut DispatcherState, id: String) {
        let Some(record) = state.tasks.get_mut(&id) else {
            tracing::warn!(task_id = %id, "Queued id has no task record");
            return;
        };

        // Caller cancelled its own token while the task waited
        if record.token.is_cancelled() {
            self.finish(state, &id, TaskState::Cancelled, None);
            return;
        }

        record.state = TaskState::Running;
        record.attempts += 1;
        let attempt = record.attempts;
        let run = Arc::clone(&record.run);
        let token = record.token.clone();
        state.running.insert(id.clone());

        tracing::debug!(
            task_id = %id,
            attempt = attempt,
            running = state.running.len(),
            "Task started"
        );
        self.emit(TaskEvent::Started {
            task_id: id.clone(),
            attempt,
        });

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = AssertUnwindSafe(async move { (*run)(token).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(eyre::eyre!("task panicked: {}", panic_message(&*panic))));
            inner.settle(&id, outcome);
        });
    }

    /// Record the outcome of one attempt and refill the freed slot.
    fn settle(self: &Arc<Self>, id: &str, outcome: eyre::Result<()>) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.running.remove(id) {
            tracing::warn!(task_id = %id, "Settled task was not running");
            return;
        }

        let Some(record) = state.tasks.get(id) else {
            tracing::warn!(task_id = %id, "Settled task has no record");
            return;
        };
        let cancelled = record.cancel_requested || record.token.is_cancelled();
        let retry = !state.closed && record.can_retry(self.config.default_max_retries);

        match outcome {
            // Cancellation requested before settlement wins over the natural outcome
            _ if cancelled => self.finish(state, id, TaskState::Cancelled, None),
            Ok(()) => self.finish(state, id, TaskState::Completed, None),
            Err(err) if retry => self.requeue(state, id, format!("{:#}", err)),
            Err(err) => self.finish(state, id, TaskState::Failed, Some(format!("{:#}", err))),
        }

        self.admit(state);
        self.publish_active(state);
    }

    fn requeue(&self, state: &mut DispatcherState, id: &str, error: String) {
        let Some(record) = state.tasks.get_mut(id) else {
            return;
        };

        record.state = TaskState::Queued;
        match self.config.retry_placement {
            RetryPlacement::Tail => record.queue_seq = state.queue.push(id, record.priority),
            RetryPlacement::Preserve => state.queue.push_at(id, record.priority, record.queue_seq),
        }
        state.counters.record_retry();

        tracing::warn!(
            task_id = %id,
            attempt = record.attempts,
            error = %error,
            "Task attempt failed, retrying"
        );
        self.emit(TaskEvent::Retrying {
            task_id: id.to_string(),
            attempt: record.attempts,
            error,
        });
    }

    /// Move a live task to a terminal state and drop it from every registry.
    fn finish(&self, state: &mut DispatcherState, id: &str, terminal: TaskState, error: Option<String>) {
        if !terminal.is_terminal() {
            return;
        }
        let Some(record) = state.tasks.remove(id) else {
            return;
        };
        state.queue.remove(id);
        state.running.remove(id);
        state.registry.unregister(id);
        state.counters.record_terminal(terminal);
        state.retire(
            id,
            RetiredTask {
                state: terminal,
                attempts: record.attempts,
            },
            self.config.retired_capacity,
        );
        // Releases the caller-token watcher, if any
        record.token.cancel();

        let task_id = id.to_string();
        let attempts = record.attempts;
        match terminal {
            TaskState::Completed => {
                tracing::info!(task_id = %id, attempts = attempts, "Task completed");
                self.emit(TaskEvent::Completed { task_id, attempts });
            }
            TaskState::Failed => {
                let error = error.unwrap_or_default();
                tracing::error!(task_id = %id, attempts = attempts, error = %error, "Task failed");
                self.emit(TaskEvent::Failed {
                    task_id,
                    attempts,
                    error,
                });
            }
            TaskState::Cancelled => {
                tracing::info!(task_id = %id, attempts = attempts, "Task cancelled");
                self.emit(TaskEvent::Cancelled { task_id });
            }
            TaskState::Queued | TaskState::Running => {}
        }
    }

    /// Cancel one live task. Queued tasks are removed at once; running tasks
    /// get their token signalled and settle as cancelled later.
    fn cancel_locked(&self, state: &mut DispatcherState, id: &str) -> bool {
        if state.queue.remove(id) {
            self.finish(state, id, TaskState::Cancelled, None);
            return true;
        }

        if !state.running.contains(id) {
            return false;
        }

        if let Some(record) = state.tasks.get_mut(id)
            && !record.cancel_requested
        {
            record.cancel_requested = true;
            state.registry.signal(id);
            tracing::debug!(task_id = %id, "Cancellation signalled to running task");
        }
        true
    }

    /// Finish `id` as cancelled as soon as its caller's token fires, instead
    /// of waiting for an admission pass to reach it.
    fn watch_caller_token(self: &Arc<Self>, id: String, token: CancellationToken) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = token.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        inner.drop_if_queued(&id);
                    }
                }
            }
        });
    }

    fn drop_if_queued(self: &Arc<Self>, id: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.queue.remove(id) {
            return;
        }
        tracing::debug!(task_id = %id, "Caller token cancelled while queued");
        self.finish(state, id, TaskState::Cancelled, None);
        self.admit(state);
        self.publish_active(state);
    }

    fn tick(self: &Arc<Self>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        self.admit(state);
        self.publish_active(state);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Stops the tick and any caller-token watchers
        self.shutdown.cancel();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn spawn_ticker(inner: &Arc<Inner>, interval: Duration) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();

    inner.runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.tick();
                }
            }
        }

        tracing::debug!("Dispatcher tick stopped");
    });
}

/// Handle to a running scheduler. Cheap to clone; every clone drives the
/// same dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler whose memory pressure is derived from queue depth.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let source = QueueDepthPressure::new(config.pressure.queue_depth);
        Self::with_pressure_source(config, Arc::new(source))
    }

    /// Create a scheduler with an injected pressure source.
    pub fn with_pressure_source(config: SchedulerConfig, pressure: Arc<dyn PressureSource>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (active, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            config,
            pressure,
            state: Mutex::new(DispatcherState::new()),
            runtime,
            events,
            active,
            shutdown: CancellationToken::new(),
        });

        if let Some(interval) = inner.config.poll_interval() {
            spawn_ticker(&inner, interval);
        }

        tracing::info!(
            max_concurrency = inner.config.max_concurrency,
            default_max_retries = inner.config.default_max_retries,
            retry_placement = ?inner.config.retry_placement,
            "Scheduler started"
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Queue a task and return its effective id.
    ///
    /// Admission may start the task before this returns.
    pub fn enqueue(&self, mut spec: TaskSpec) -> Result<String> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(SchedulerError::ShutDown);
        }
        if spec.tags.iter().any(|tag| tag.is_empty()) {
            return Err(SchedulerError::InvalidTask("tags must not be empty".to_string()));
        }

        let id = match spec.id.take() {
            Some(id) if id.is_empty() => {
                return Err(SchedulerError::InvalidTask("task id must not be empty".to_string()));
            }
            Some(id) if state.is_known(&id) => return Err(SchedulerError::DuplicateId(id)),
            Some(id) => {
                state.enqueued += 1;
                id
            }
            None => {
                state.enqueued += 1;
                loop {
                    let id = generate_task_id(state.enqueued);
                    if !state.is_known(&id) {
                        break id;
                    }
                }
            }
        };

        let caller_linked = spec.cancellation.is_some();
        let mut record = TaskRecord::from_spec(id.clone(), spec);
        let priority = record.priority;
        record.queue_seq = state.queue.push(&id, priority);
        state.registry.register(&id, record.token.clone(), &record.tags);
        if caller_linked {
            self.inner.watch_caller_token(id.clone(), record.token.clone());
        }
        state.tasks.insert(id.clone(), record);

        tracing::debug!(
            task_id = %id,
            priority = %priority,
            queued = state.queue.len(),
            "Task queued"
        );
        self.inner.emit(TaskEvent::Queued {
            task_id: id.clone(),
            priority,
        });

        self.inner.admit(state);
        self.inner.publish_active(state);
        Ok(id)
    }

    /// Cancel a queued or running task. False if the id is unknown or terminal.
    pub fn cancel(&self, id: &str) -> bool {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let cancelled = self.inner.cancel_locked(state, id);
        if cancelled {
            self.inner.admit(state);
            self.inner.publish_active(state);
        }
        cancelled
    }

    /// Cancel every queued or running task carrying `tag`. Returns how many
    /// tasks were affected.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let mut count = 0;
        for id in state.registry.ids_for_tag(tag) {
            if self.inner.cancel_locked(state, &id) {
                count += 1;
            }
        }

        if count > 0 {
            tracing::info!(tag = %tag, count = count, "Cancelled tasks by tag");
            self.inner.admit(state);
            self.inner.publish_active(state);
        }
        count
    }

    /// Move a queued task to the tail of `priority`'s class.
    ///
    /// False if the task is not currently queued (running, terminal, unknown).
    pub fn prioritize(&self, id: &str, priority: Priority) -> bool {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let Some(seq) = state.queue.reprioritize(id, priority) else {
            return false;
        };
        if let Some(record) = state.tasks.get_mut(id) {
            record.priority = priority;
            record.queue_seq = seq;
        }

        tracing::debug!(task_id = %id, priority = %priority, "Task reprioritized");
        self.inner.emit(TaskEvent::Reprioritized {
            task_id: id.to_string(),
            priority,
        });

        self.inner.admit(state);
        self.inner.publish_active(state);
        true
    }

    /// Consistent snapshot of queue, running set and lifetime counters.
    pub fn stats(&self) -> StatsSnapshot {
        let state = self.inner.lock();
        let memory_pressure: MemoryPressure = self.inner.pressure.sample(&state.pressure_context());

        let mut running_ids: Vec<String> = state.running.iter().cloned().collect();
        running_ids.sort();

        let mut by_priority = state.queue.breakdown();
        for id in &running_ids {
            if let Some(record) = state.tasks.get(id) {
                by_priority.increment(record.priority);
            }
        }

        StatsSnapshot {
            running: state.running.len(),
            queued: state.queue.len(),
            completed: state.counters.completed,
            failed: state.counters.failed,
            cancelled: state.counters.cancelled,
            retried: state.counters.retried,
            by_priority,
            running_ids,
            queued_ids: state.queue.ids(),
            memory_pressure,
            paused: state.paused,
        }
    }

    pub fn is_task_running(&self, id: &str) -> bool {
        self.inner.lock().running.contains(id)
    }

    pub fn is_task_queued(&self, id: &str) -> bool {
        self.inner.lock().queue.contains(id)
    }

    /// Current or terminal state of a task this scheduler has seen.
    pub fn task_state(&self, id: &str) -> Option<TaskState> {
        let state = self.inner.lock();
        state
            .tasks
            .get(id)
            .map(|record| record.state)
            .or_else(|| state.retired.get(id).map(|retired| retired.state))
    }

    /// How many times a task has been dispatched.
    pub fn attempts(&self, id: &str) -> Option<u32> {
        let state = self.inner.lock();
        state
            .tasks
            .get(id)
            .map(|record| record.attempts)
            .or_else(|| state.retired.get(id).map(|retired| retired.attempts))
    }

    /// Subscribe to lifecycle events. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Stop admitting tasks. Running work is unaffected.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        tracing::info!("Scheduler paused");
    }

    pub fn resume(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.paused = false;
        tracing::info!("Scheduler resumed");
        self.inner.admit(state);
        self.inner.publish_active(state);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Run an admission pass now, e.g. after pushing a new pressure reading.
    pub fn pressure_changed(&self) {
        self.inner.tick();
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        // Sender lives in `inner`, which `self` keeps alive
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    /// Refuse new work, cancel everything queued, signal everything running,
    /// and wait for running work to settle. Returns the number of tasks
    /// cancelled or signalled.
    ///
    /// Running work that ignores its token keeps shutdown waiting.
    pub async fn shutdown(&self) -> usize {
        let cancelled = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            state.closed = true;

            let queued = state.queue.drain();
            let running: Vec<String> = state.running.iter().cloned().collect();

            let mut count = 0;
            for id in queued {
                self.inner.finish(state, &id, TaskState::Cancelled, None);
                count += 1;
            }
            for id in running {
                if self.inner.cancel_locked(state, &id) {
                    count += 1;
                }
            }

            self.inner.publish_active(state);
            count
        };

        self.inner.shutdown.cancel();
        self.wait_idle().await;

        tracing::info!(cancelled = cancelled, "Scheduler shut down");
        cancelled
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().closed
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::FixedPressure;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn config(max_concurrency: usize) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_concurrency(max_concurrency)
            .with_poll_interval(0)
    }

    fn recording_task(log: &Arc<Mutex<Vec<String>>>, name: &str) -> TaskSpec {
        let log = Arc::clone(log);
        let label = name.to_string();
        TaskSpec::new(move |_token| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                log.lock().unwrap().push(label);
                Ok(())
            }
        })
        .with_id(name)
    }

    fn explode() -> eyre::Result<()> {
        panic!("boom")
    }

    /// Yield to spawned work until `cond` holds.
    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    /// Task that blocks until the gate is opened or its token fires.
    fn gated_task(gate: &Arc<Notify>) -> TaskSpec {
        let gate = Arc::clone(gate);
        TaskSpec::new(move |token| {
            let gate = Arc::clone(&gate);
            async move {
                tokio::select! {
                    _ = gate.notified() => Ok(()),
                    _ = token.cancelled() => Err(eyre::eyre!("cancelled")),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_new_requires_valid_config() {
        let err = Scheduler::new(SchedulerConfig::default().with_max_concurrency(0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = Scheduler::new(SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_enqueue_generates_id() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let id = scheduler.enqueue(TaskSpec::new(|_| async { Ok(()) })).unwrap();
        assert!(id.starts_with("task-"));
        scheduler.wait_idle().await;
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_and_duplicate_ids() {
        let scheduler = Scheduler::new(config(1)).unwrap();

        let err = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id(""))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTask(_)));

        scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id("dup"))
            .unwrap();
        scheduler.wait_idle().await;

        // Terminal ids are not reused either
        let err = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id("dup"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_tag() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let err = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_tag(""))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_dispatch_order_priority_then_fifo() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.pause();
        scheduler
            .enqueue(recording_task(&log, "a").with_priority(Priority::Low))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "b").with_priority(Priority::High))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "c").with_priority(Priority::Normal))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "d").with_priority(Priority::High))
            .unwrap();
        scheduler.resume();
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["b", "d", "c", "a"]);
    }

    #[tokio::test]
    async fn test_running_never_exceeds_max_concurrency() {
        let scheduler = Scheduler::new(config(2)).unwrap();
        let gate = Arc::new(Notify::new());

        for _ in 0..5 {
            scheduler.enqueue(gated_task(&gate)).unwrap();
        }

        let stats = scheduler.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.queued, 3);

        while scheduler.stats().active() > 0 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
            assert!(scheduler.stats().running <= 2);
        }
        assert_eq!(scheduler.stats().completed, 5);
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let id = scheduler
            .enqueue(
                TaskSpec::new(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(eyre::eyre!("always fails"))
                    }
                })
                .with_max_retries(2),
            )
            .unwrap();
        scheduler.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Failed));
        assert_eq!(scheduler.attempts(&id), Some(3));
        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 2);
    }

    #[tokio::test]
    async fn test_default_retry_cap_applies() {
        let scheduler = Scheduler::new(config(1).with_default_max_retries(1)).unwrap();
        let id = scheduler
            .enqueue(TaskSpec::new(|_| async { Err(eyre::eyre!("nope")) }).retry_on_fail())
            .unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.attempts(&id), Some(2));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let id = scheduler
            .enqueue(
                TaskSpec::new(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(eyre::eyre!("flaky"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .with_max_retries(3),
            )
            .unwrap();
        scheduler.wait_idle().await;

        assert_eq!(scheduler.task_state(&id), Some(TaskState::Completed));
        assert_eq!(scheduler.attempts(&id), Some(2));
    }

    #[tokio::test]
    async fn test_retry_placement_tail_and_preserve() {
        for (placement, expected) in [
            (RetryPlacement::Tail, vec!["flaky", "other", "flaky"]),
            (RetryPlacement::Preserve, vec!["flaky", "flaky", "other"]),
        ] {
            let scheduler = Scheduler::new(config(1).with_retry_placement(placement)).unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));

            let flaky_log = Arc::clone(&log);
            let calls = Arc::new(AtomicU32::new(0));
            scheduler.pause();
            scheduler
                .enqueue(
                    TaskSpec::new(move |_| {
                        let log = Arc::clone(&flaky_log);
                        let calls = Arc::clone(&calls);
                        async move {
                            log.lock().unwrap().push("flaky".to_string());
                            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(eyre::eyre!("first attempt fails"))
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .with_id("flaky")
                    .with_max_retries(1),
                )
                .unwrap();
            scheduler.enqueue(recording_task(&log, "other")).unwrap();
            scheduler.resume();
            scheduler.wait_idle().await;

            assert_eq!(*log.lock().unwrap(), expected, "placement {:?}", placement);
        }
    }

    #[tokio::test]
    async fn test_panicking_task_counts_as_failure() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let id = scheduler
            .enqueue(TaskSpec::new(|_| async { explode() }))
            .unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn test_cancel_queued_never_runs() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let blocker = scheduler.enqueue(gated_task(&gate)).unwrap();
        scheduler.enqueue(recording_task(&log, "victim")).unwrap();
        assert!(scheduler.is_task_queued("victim"));

        assert!(scheduler.cancel("victim"));
        assert!(!scheduler.is_task_queued("victim"));
        assert_eq!(scheduler.task_state("victim"), Some(TaskState::Cancelled));
        assert!(!scheduler.cancel("victim"));

        assert!(scheduler.cancel(&blocker));
        scheduler.wait_idle().await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(scheduler.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn test_cancel_unknown_returns_false() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        assert!(!scheduler.cancel("ghost"));
        assert!(!scheduler.prioritize("ghost", Priority::High));
    }

    #[tokio::test]
    async fn test_cancel_running_is_cooperative() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());

        let id = scheduler.enqueue(gated_task(&gate)).unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.is_task_running(&id));

        assert!(scheduler.cancel(&id));
        // Still running until the work observes its token
        assert!(scheduler.is_task_running(&id));
        // Repeated cancel is accepted but not double counted
        assert!(scheduler.cancel(&id));

        scheduler.wait_idle().await;
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Cancelled));
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_race_records_cancelled() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        let id = scheduler
            .enqueue(TaskSpec::new(move |_token| {
                let (s, r) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    s.notify_one();
                    // Ignores the token and succeeds anyway
                    r.notified().await;
                    Ok(())
                }
            }))
            .unwrap();

        started.notified().await;
        assert!(scheduler.cancel(&id));
        release.notify_one();
        scheduler.wait_idle().await;

        assert_eq!(scheduler.task_state(&id), Some(TaskState::Cancelled));
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancelled_running_task_is_not_retried() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());

        let id = scheduler.enqueue(gated_task(&gate).with_max_retries(5)).unwrap();
        tokio::task::yield_now().await;
        scheduler.cancel(&id);
        scheduler.wait_idle().await;

        assert_eq!(scheduler.attempts(&id), Some(1));
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_caller_token_cancelled_before_admission() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let blocker = scheduler.enqueue(gated_task(&gate)).unwrap();
        scheduler
            .enqueue(recording_task(&log, "linked").with_cancellation(token.clone()))
            .unwrap();
        token.cancel();

        scheduler.cancel(&blocker);
        scheduler.wait_idle().await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(scheduler.task_state("linked"), Some(TaskState::Cancelled));
        assert_eq!(scheduler.attempts("linked"), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_by_tag_counts_queued_and_running() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());

        let running = scheduler.enqueue(gated_task(&gate).with_tag("search")).unwrap();
        scheduler.enqueue(gated_task(&gate).with_tag("search")).unwrap();
        scheduler.enqueue(gated_task(&gate).with_tag("search")).unwrap();
        let other = scheduler.enqueue(gated_task(&gate).with_tag("prefetch")).unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.is_task_running(&running));

        assert_eq!(scheduler.cancel_by_tag("search"), 3);
        assert_eq!(scheduler.cancel_by_tag("missing"), 0);

        assert!(scheduler.is_task_queued(&other));
        scheduler.cancel(&other);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.stats().cancelled, 4);
    }

    #[tokio::test]
    async fn test_prioritize_queued_task() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.pause();
        scheduler
            .enqueue(recording_task(&log, "a").with_priority(Priority::Low))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "n").with_priority(Priority::Normal))
            .unwrap();
        assert!(scheduler.prioritize("a", Priority::High));
        scheduler.resume();
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "n"]);
        assert!(!scheduler.prioritize("a", Priority::Low));
    }

    #[tokio::test]
    async fn test_prioritize_running_task_returns_false() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());
        let id = scheduler.enqueue(gated_task(&gate)).unwrap();
        tokio::task::yield_now().await;

        assert!(!scheduler.prioritize(&id, Priority::High));
        scheduler.cancel(&id);
        scheduler.wait_idle().await;
    }

    #[tokio::test]
    async fn test_pressure_throttles_tasks_below_floor() {
        let pressure = Arc::new(FixedPressure::new(MemoryPressure::High));
        let scheduler = Scheduler::with_pressure_source(config(4), pressure.clone()).unwrap();
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        // Below the floor, but the throttled slot is free
        let slow = scheduler.enqueue(gated_task(&gate).with_priority(Priority::Low)).unwrap();
        assert!(scheduler.is_task_running(&slow));

        scheduler
            .enqueue(recording_task(&log, "normal").with_priority(Priority::Normal))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "high").with_priority(Priority::High))
            .unwrap();
        wait_until(|| scheduler.stats().completed == 1).await;

        assert_eq!(*log.lock().unwrap(), vec!["high"]);
        let stats = scheduler.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.memory_pressure, MemoryPressure::High);

        pressure.set(MemoryPressure::Medium);
        scheduler.pressure_changed();
        wait_until(|| scheduler.stats().completed == 2).await;
        assert_eq!(*log.lock().unwrap(), vec!["high", "normal"]);

        // The throttled slot is still held by `slow`
        scheduler
            .enqueue(recording_task(&log, "low").with_priority(Priority::Low))
            .unwrap();
        assert!(scheduler.is_task_queued("low"));

        gate.notify_one();
        scheduler.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["high", "normal", "low"]);
        assert_eq!(scheduler.stats().completed, 4);
    }

    #[tokio::test]
    async fn test_eligible_work_goes_before_throttled_work() {
        let pressure = Arc::new(FixedPressure::new(MemoryPressure::Medium));
        let scheduler = Scheduler::with_pressure_source(config(1), pressure).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.pause();
        scheduler
            .enqueue(recording_task(&log, "low").with_priority(Priority::Low))
            .unwrap();
        scheduler
            .enqueue(recording_task(&log, "normal").with_priority(Priority::Normal))
            .unwrap();
        scheduler.resume();
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["normal", "low"]);
    }

    #[tokio::test]
    async fn test_queue_depth_pressure_backlog_drains() {
        let mut config = config(2);
        config.pressure.queue_depth.medium = 4;
        config.pressure.queue_depth.high = 8;
        let scheduler = Scheduler::new(config).unwrap();

        scheduler.pause();
        for _ in 0..12 {
            scheduler
                .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_priority(Priority::Low))
                .unwrap();
        }
        assert_eq!(scheduler.stats().memory_pressure, MemoryPressure::High);

        scheduler.resume();
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 12);
        assert_eq!(stats.memory_pressure, MemoryPressure::Low);
    }

    #[tokio::test]
    async fn test_ticker_readmits_after_pressure_drops() {
        let pressure = Arc::new(FixedPressure::new(MemoryPressure::High));
        let scheduler =
            Scheduler::with_pressure_source(config(2).with_poll_interval(5), pressure.clone()).unwrap();
        let gate = Arc::new(Notify::new());

        scheduler.enqueue(gated_task(&gate).with_priority(Priority::Low)).unwrap();
        let id = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_priority(Priority::Low))
            .unwrap();
        assert!(scheduler.is_task_queued(&id));

        pressure.set(MemoryPressure::Low);
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.task_state(&id) != Some(TaskState::Completed) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_caller_token_drops_queued_task_while_slots_busy() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());
        let caller = CancellationToken::new();

        let blocker = scheduler.enqueue(gated_task(&gate)).unwrap();
        let waiting = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_cancellation(caller.clone()))
            .unwrap();
        assert!(scheduler.is_task_queued(&waiting));

        caller.cancel();
        wait_until(|| !scheduler.is_task_queued(&waiting)).await;

        assert!(scheduler.is_task_running(&blocker));
        assert_eq!(scheduler.task_state(&waiting), Some(TaskState::Cancelled));
        let stats = scheduler.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.by_priority.normal, 1);
        assert_eq!(stats.cancelled, 1);

        gate.notify_one();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_retired_history_is_bounded() {
        let scheduler = Scheduler::new(config(1).with_retired_capacity(2)).unwrap();

        for id in ["first", "second", "third"] {
            scheduler
                .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id(id))
                .unwrap();
        }
        scheduler.wait_idle().await;

        assert_eq!(scheduler.task_state("first"), None);
        assert_eq!(scheduler.attempts("first"), None);
        assert_eq!(scheduler.task_state("second"), Some(TaskState::Completed));
        assert_eq!(scheduler.task_state("third"), Some(TaskState::Completed));
        assert_eq!(scheduler.stats().completed, 3);

        // A forgotten id may be enqueued again
        scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id("first"))
            .unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.task_state("first"), Some(TaskState::Completed));
        assert_eq!(scheduler.task_state("second"), None);
    }

    #[tokio::test]
    async fn test_stats_breakdown_and_ids() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());

        let running = scheduler.enqueue(gated_task(&gate).with_priority(Priority::Low)).unwrap();
        let queued_normal = scheduler
            .enqueue(gated_task(&gate).with_priority(Priority::Normal))
            .unwrap();
        let queued_high = scheduler.enqueue(gated_task(&gate).with_priority(Priority::High)).unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.running_ids, vec![running.clone()]);
        assert_eq!(stats.queued_ids, vec![queued_high, queued_normal]);
        assert_eq!(stats.by_priority.low, 1);
        assert_eq!(stats.by_priority.normal, 1);
        assert_eq!(stats.by_priority.high, 1);
        assert_eq!(stats.memory_pressure, MemoryPressure::Low);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let mut events = scheduler.subscribe();

        let id = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }).with_id("evt"))
            .unwrap();
        scheduler.wait_idle().await;

        let queued = events.recv().await.unwrap();
        assert!(matches!(queued, TaskEvent::Queued { .. }));
        let started = events.recv().await.unwrap();
        assert_eq!(
            started,
            TaskEvent::Started {
                task_id: id.clone(),
                attempt: 1
            }
        );
        let completed = events.recv().await.unwrap();
        assert_eq!(completed, TaskEvent::Completed { task_id: id, attempts: 1 });
    }

    #[tokio::test]
    async fn test_pause_holds_admission() {
        let scheduler = Scheduler::new(config(2)).unwrap();
        scheduler.pause();
        assert!(scheduler.is_paused());

        let id = scheduler.enqueue(TaskSpec::new(|_| async { Ok(()) })).unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.is_task_queued(&id));
        assert!(scheduler.stats().paused);

        scheduler.resume();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.task_state(&id), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let scheduler = Scheduler::new(config(1)).unwrap();
        let gate = Arc::new(Notify::new());

        let running = scheduler.enqueue(gated_task(&gate)).unwrap();
        let queued = scheduler.enqueue(gated_task(&gate)).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(scheduler.shutdown().await, 2);
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.task_state(&running), Some(TaskState::Cancelled));
        assert_eq!(scheduler.task_state(&queued), Some(TaskState::Cancelled));

        let err = scheduler
            .enqueue(TaskSpec::new(|_| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ShutDown));
    }
}
