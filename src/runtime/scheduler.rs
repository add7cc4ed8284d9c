//! Cooperative single-threaded scheduler.
//!
//! The scheduler owns every task. Each tick walks the task list in insertion
//! order and calls each task's [`Task::step`] exactly once. A step must never
//! block: a task that cannot make progress returns [`Step::Pending`] and is
//! visited again on the next tick.
//!
//! Tasks never hold references to each other. They are addressed through
//! [`TaskId`]s, which are never reused, and talk to each other by posting a
//! message through [`Context::deliver`]. The scheduler hands the message to
//! the recipient right after the sender's step returns, or drops it when the
//! recipient is gone.
//!
//! Removal is deferred: a finished task is only marked during the tick and
//! its [`Task::cleanup`] runs once the walk is over, so the walk neither
//! skips nor double-visits survivors. Tasks spawned during a tick are first
//! visited on the following tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock;

/// Upper bound on how long the loop sleeps when every task is waiting on a deadline.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Generation-tagged handle to a task. Ids grow monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Visit again next tick.
    Pending,
    /// Finished; remove and clean up.
    Done,
    /// Unrecoverable failure; remove and clean up.
    Fatal,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is at capacity ({0} tasks)")]
    Full(usize),
}

/// A unit of cooperative work over shared state `S`, receiving messages `M`.
pub trait Task<S, M> {
    fn name(&self) -> &'static str;

    fn step(&mut self, cx: &mut Context<'_, S, M>) -> Step;

    /// Called with a message posted to this task by another task.
    fn deliver(&mut self, _message: M) {}

    /// Runs exactly once, between ticks, after the task was removed.
    fn cleanup(&mut self, _shared: &mut S) {}

    /// Monotonic deadline (ms) before which the task has nothing to do.
    fn wake_at(&self) -> Option<u64> {
        None
    }
}

struct Entry<S, M> {
    id: TaskId,
    task: Option<Box<dyn Task<S, M>>>,
    removed: bool,
}

/// What a task can see and do during its step.
pub struct Context<'a, S, M> {
    pub shared: &'a mut S,
    now: u64,
    current: TaskId,
    entries: &'a [Entry<S, M>],
    spawned: &'a mut Vec<Entry<S, M>>,
    outbox: &'a mut Vec<(TaskId, M)>,
    next_id: &'a mut u64,
    capacity: usize,
    remove: bool,
}

impl<S, M> Context<'_, S, M> {
    /// Monotonic time at the start of the current tick.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    /// Marks the running task for removal once its step returns.
    pub fn remove_current(&mut self) {
        self.remove = true;
    }

    /// Adds a task; it is first visited on the next tick.
    pub fn spawn<T: Task<S, M> + 'static>(&mut self, task: T) -> Result<TaskId, SchedulerError> {
        let live = self.entries.iter().filter(|e| !e.removed).count() + self.spawned.len();
        if live >= self.capacity {
            return Err(SchedulerError::Full(self.capacity));
        }
        let id = TaskId(*self.next_id);
        *self.next_id += 1;
        self.spawned.push(Entry {
            id,
            task: Some(Box::new(task)),
            removed: false,
        });
        Ok(id)
    }

    /// Posts `message` to `to`. Dropped if `to` is gone by then.
    pub fn deliver(&mut self, to: TaskId, message: M) {
        self.outbox.push((to, message));
    }

    /// Whether `id` names a task that has not been removed.
    pub fn is_alive(&self, id: TaskId) -> bool {
        if id == self.current {
            return !self.remove;
        }
        find(self.entries, id).is_some_and(|i| !self.entries[i].removed)
            || self.spawned.iter().any(|e| e.id == id)
    }
}

fn find<S, M>(entries: &[Entry<S, M>], id: TaskId) -> Option<usize> {
    entries.binary_search_by_key(&id, |e| e.id).ok()
}

pub struct Scheduler<S, M> {
    entries: Vec<Entry<S, M>>,
    spawned: Vec<Entry<S, M>>,
    outbox: Vec<(TaskId, M)>,
    next_id: u64,
    capacity: usize,
    idle_sleep: Duration,
    shared: S,
}

impl<S, M> Scheduler<S, M> {
    pub fn new(shared: S, capacity: usize, idle_sleep: Duration) -> Self {
        Self {
            entries: Vec::new(),
            spawned: Vec::new(),
            outbox: Vec::new(),
            next_id: 1,
            capacity,
            idle_sleep,
            shared,
        }
    }

    /// Appends a task from outside a tick.
    pub fn add<T: Task<S, M> + 'static>(&mut self, task: T) -> Result<TaskId, SchedulerError> {
        if self.len() >= self.capacity {
            return Err(SchedulerError::Full(self.capacity));
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            task: Some(Box::new(task)),
            removed: false,
        });
        Ok(id)
    }

    /// Live tasks, including any spawned during the last tick.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.removed).count() + self.spawned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: TaskId) -> bool {
        find(&self.entries, id).is_some_and(|i| !self.entries[i].removed)
    }

    pub fn shared(&self) -> &S {
        &self.shared
    }

    /// Visits every task present at the start of the tick once, then reaps
    /// removed tasks and admits spawned ones.
    pub fn tick(&mut self) {
        let now = clock::now_ms();
        let count = self.entries.len();

        for i in 0..count {
            if self.entries[i].removed {
                continue;
            }
            let Some(mut task) = self.entries[i].task.take() else {
                continue;
            };
            let id = self.entries[i].id;

            let mut cx = Context {
                shared: &mut self.shared,
                now,
                current: id,
                entries: &self.entries,
                spawned: &mut self.spawned,
                outbox: &mut self.outbox,
                next_id: &mut self.next_id,
                capacity: self.capacity,
                remove: false,
            };
            let step = task.step(&mut cx);
            let remove = cx.remove;

            if step == Step::Fatal {
                warn!(task = task.name(), id = %id, "task failed");
            }
            self.entries[i].task = Some(task);
            if remove || step != Step::Pending {
                self.entries[i].removed = true;
            }

            self.flush_outbox();
        }

        self.reap();
        self.entries.append(&mut self.spawned);
    }

    /// Runs ticks until no task remains or `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!(tasks = self.len(), "stop requested");
                break;
            }
            if self.is_empty() {
                break;
            }
            self.tick();
            std::thread::sleep(self.idle_duration());
        }
        self.shutdown();
    }

    /// Cleans up and drops every remaining task.
    pub fn shutdown(&mut self) {
        self.entries.append(&mut self.spawned);
        for entry in self.entries.drain(..) {
            if let Some(mut task) = entry.task {
                task.cleanup(&mut self.shared);
            }
        }
        self.outbox.clear();
    }

    /// How long to yield after a tick. Only stretched past the base idle
    /// sleep when every task advertises a future wake deadline.
    fn idle_duration(&self) -> Duration {
        let now = clock::now_ms();
        let mut earliest: Option<u64> = None;
        for entry in &self.entries {
            let Some(task) = &entry.task else { continue };
            match task.wake_at() {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => return self.idle_sleep,
            }
        }
        match earliest {
            Some(at) => Duration::from_millis(at - now)
                .min(MAX_IDLE_SLEEP)
                .max(self.idle_sleep),
            None => self.idle_sleep,
        }
    }

    fn flush_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        for (to, message) in std::mem::take(&mut self.outbox) {
            let target = match find(&self.entries, to) {
                Some(i) if !self.entries[i].removed => self.entries[i].task.as_mut(),
                Some(_) => None,
                None => self
                    .spawned
                    .iter_mut()
                    .find(|e| e.id == to)
                    .and_then(|e| e.task.as_mut()),
            };
            match target {
                Some(task) => task.deliver(message),
                None => debug!(to = %to, "message dropped, recipient gone"),
            }
        }
    }

    fn reap(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| e.removed) {
            if let Some(mut task) = entry.task.take() {
                task.cleanup(&mut self.shared);
            }
        }
        self.entries.retain(|e| !e.removed);
    }
}
