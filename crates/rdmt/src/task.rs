//! Task orchestration.
//!
//! A task groups a fixed number of requests into one unit of work. Each
//! attached request occupies a slot; when every slot has completed the task's
//! callback runs exactly once with the aggregate result, which is the first
//! non-success code recorded. Nothing is retried automatically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CompletionCode, RdmtError, Result};

/// Identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What the task is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskContext {
    /// Attaching to a server.
    Mount,
    /// Detaching from a server.
    Unmount,
    /// Client-issued I/O.
    Client,
    /// Background compaction.
    Compactor,
    /// Background rebuild.
    Rebuild,
    /// Application-defined tag.
    Custom(u32),
}

/// Lifecycle of one request slot in a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Free for attachment.
    Empty,
    /// A request is in flight.
    Submitted,
    /// The request finished.
    Completed,
}

/// Handle tying a request to a task slot.
///
/// The generation changes on every [`TaskTable::reset`], so completions of
/// requests attached before a reset are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskSlot {
    /// Owning task.
    pub task: TaskId,
    /// Slot index.
    pub slot: usize,
    /// Task generation at attach time.
    pub generation: u64,
}

/// Result delivered to the callback when a task finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// The task.
    pub task: TaskId,
    /// Its context tag.
    pub context: TaskContext,
    /// Number of requests in the task.
    pub total: usize,
    /// First non-success code among the requests, or success.
    pub result: CompletionCode,
    /// Error returned by the callback, if it failed.
    pub callback_error: Option<String>,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// The task.
    pub task: TaskId,
    /// Its context tag.
    pub context: TaskContext,
    /// Number of request slots.
    pub total: usize,
    /// Requests attached so far.
    pub submitted: usize,
    /// Requests finished so far.
    pub completed: usize,
    /// Aggregate result so far.
    pub result: CompletionCode,
    /// Whether the completion callback already ran.
    pub finished: bool,
    /// Per-slot status.
    pub slots: Vec<SlotStatus>,
}

/// Completion callback of a task.
pub type TaskCallback = Box<dyn FnMut(&TaskOutcome) -> Result<()> + Send>;

struct Task {
    context: TaskContext,
    slots: Vec<SlotStatus>,
    submitted: usize,
    completed: usize,
    result: CompletionCode,
    generation: u64,
    finished: bool,
    callback: Option<TaskCallback>,
}

impl Task {
    fn finish(&mut self, id: TaskId) -> TaskOutcome {
        self.finished = true;
        let mut outcome = TaskOutcome {
            task: id,
            context: self.context,
            total: self.slots.len(),
            result: self.result,
            callback_error: None,
        };
        if let Some(callback) = self.callback.as_mut() {
            if let Err(e) = callback(&outcome) {
                warn!(task = %id, "task callback failed: {}", e);
                outcome.callback_error = Some(e.to_string());
            }
        }
        info!(task = %id, context = ?self.context, result = %self.result, "task finished");
        outcome
    }
}

/// Table of live tasks.
#[derive(Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    next_id: u64,
}

impl TaskTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task of `count` request slots.
    ///
    /// A zero-count task finishes on the next [`TaskTable::sweep`].
    pub fn create(&mut self, context: TaskContext, count: usize) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.insert(
            id,
            Task {
                context,
                slots: vec![SlotStatus::Empty; count],
                submitted: 0,
                completed: 0,
                result: CompletionCode::Success,
                generation: 0,
                finished: false,
                callback: None,
            },
        );
        debug!(task = %id, ?context, count, "task created");
        id
    }

    /// Installs the completion callback.
    pub fn set_callback(&mut self, id: TaskId, callback: TaskCallback) -> Result<()> {
        self.task_mut(id)?.callback = Some(callback);
        Ok(())
    }

    /// Marks the first free slot submitted and returns it.
    pub fn attach(&mut self, id: TaskId) -> Result<TaskSlot> {
        let task = self.task_mut(id)?;
        let slot = task
            .slots
            .iter()
            .position(|s| *s == SlotStatus::Empty)
            .ok_or(RdmtError::TaskFull {
                task_id: id.0,
                total: task.slots.len(),
            })?;
        task.slots[slot] = SlotStatus::Submitted;
        task.submitted += 1;
        Ok(TaskSlot {
            task: id,
            slot,
            generation: task.generation,
        })
    }

    /// Returns a submitted slot to `Empty` when its request was never issued.
    pub fn detach(&mut self, slot: TaskSlot) {
        if let Some(task) = self.tasks.get_mut(&slot.task) {
            if task.generation == slot.generation
                && task.slots.get(slot.slot) == Some(&SlotStatus::Submitted)
            {
                task.slots[slot.slot] = SlotStatus::Empty;
                task.submitted -= 1;
            }
        }
    }

    /// Records a request result. Returns the outcome when this completion
    /// finished the task.
    pub fn complete(&mut self, slot: TaskSlot, code: CompletionCode) -> Option<TaskOutcome> {
        let Some(task) = self.tasks.get_mut(&slot.task) else {
            debug!(task = %slot.task, "completion for a destroyed task ignored");
            return None;
        };
        if task.generation != slot.generation {
            debug!(task = %slot.task, "completion from before a reset ignored");
            return None;
        }
        match task.slots.get(slot.slot) {
            Some(SlotStatus::Submitted) => {}
            other => {
                warn!(task = %slot.task, slot = slot.slot, status = ?other, "unexpected slot completion");
                return None;
            }
        }
        task.slots[slot.slot] = SlotStatus::Completed;
        task.completed += 1;
        if !code.is_success() && task.result.is_success() {
            task.result = code;
        }
        if task.completed == task.slots.len() && !task.finished {
            Some(task.finish(slot.task))
        } else {
            None
        }
    }

    /// Zeroes the counters and frees every slot for reuse with `count` slots.
    pub fn reset(&mut self, id: TaskId, count: usize) -> Result<()> {
        let task = self.task_mut(id)?;
        task.slots = vec![SlotStatus::Empty; count];
        task.submitted = 0;
        task.completed = 0;
        task.result = CompletionCode::Success;
        task.generation += 1;
        task.finished = false;
        debug!(task = %id, count, "task reset");
        Ok(())
    }

    /// Removes a task. Later completions for it are ignored.
    pub fn destroy(&mut self, id: TaskId) -> Result<()> {
        self.tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(RdmtError::UnknownTask { task_id: id.0 })
    }

    /// Snapshot of a task.
    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        let task = self
            .tasks
            .get(&id)
            .ok_or(RdmtError::UnknownTask { task_id: id.0 })?;
        Ok(TaskStatus {
            task: id,
            context: task.context,
            total: task.slots.len(),
            submitted: task.submitted,
            completed: task.completed,
            result: task.result,
            finished: task.finished,
            slots: task.slots.clone(),
        })
    }

    /// Finishes every zero-count task that has not finished yet.
    pub fn sweep(&mut self) -> Vec<TaskOutcome> {
        self.tasks
            .iter_mut()
            .filter(|(_, t)| t.slots.is_empty() && !t.finished)
            .map(|(id, t)| t.finish(*id))
            .collect()
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when no task is live.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or(RdmtError::UnknownTask { task_id: id.0 })
    }
}

impl std::fmt::Debug for TaskTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTable")
            .field("tasks", &self.tasks.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: Arc<AtomicUsize>) -> TaskCallback {
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_callback_once_when_all_complete() {
        let mut tasks = TaskTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = tasks.create(TaskContext::Client, 3);
        tasks.set_callback(id, counting_callback(fired.clone())).unwrap();

        let slots: Vec<_> = (0..3).map(|_| tasks.attach(id).unwrap()).collect();
        assert!(tasks.complete(slots[2], CompletionCode::Success).is_none());
        assert!(tasks.complete(slots[0], CompletionCode::Success).is_none());
        let outcome = tasks.complete(slots[1], CompletionCode::Success).unwrap();
        assert_eq!(outcome.result, CompletionCode::Success);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // a repeated completion is ignored
        assert!(tasks.complete(slots[1], CompletionCode::Success).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_error_wins() {
        let mut tasks = TaskTable::new();
        let id = tasks.create(TaskContext::Rebuild, 3);
        let a = tasks.attach(id).unwrap();
        let b = tasks.attach(id).unwrap();
        let c = tasks.attach(id).unwrap();
        tasks.complete(a, CompletionCode::Success);
        tasks.complete(b, CompletionCode::RemoteAccess);
        let outcome = tasks.complete(c, CompletionCode::Truncated).unwrap();
        assert_eq!(outcome.result, CompletionCode::RemoteAccess);
    }

    #[test]
    fn test_attach_beyond_total_fails() {
        let mut tasks = TaskTable::new();
        let id = tasks.create(TaskContext::Mount, 1);
        tasks.attach(id).unwrap();
        let err = tasks.attach(id).unwrap_err();
        assert!(matches!(err, RdmtError::TaskFull { total: 1, .. }));
    }

    #[test]
    fn test_zero_count_task_finishes_on_sweep() {
        let mut tasks = TaskTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = tasks.create(TaskContext::Mount, 0);
        tasks.set_callback(id, counting_callback(fired.clone())).unwrap();

        let outcomes = tasks.sweep();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].task, id);
        assert!(tasks.sweep().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_ignores_stale_completions() {
        let mut tasks = TaskTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = tasks.create(TaskContext::Compactor, 1);
        tasks.set_callback(id, counting_callback(fired.clone())).unwrap();
        let stale = tasks.attach(id).unwrap();

        tasks.reset(id, 2).unwrap();
        assert!(tasks.complete(stale, CompletionCode::LocalError).is_none());
        let status = tasks.status(id).unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.completed, 0);
        assert_eq!(status.slots, vec![SlotStatus::Empty; 2]);

        let a = tasks.attach(id).unwrap();
        let b = tasks.attach(id).unwrap();
        tasks.complete(a, CompletionCode::Success);
        let outcome = tasks.complete(b, CompletionCode::Success).unwrap();
        assert_eq!(outcome.result, CompletionCode::Success);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_error_recorded_not_retried() {
        let mut tasks = TaskTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = tasks.create(TaskContext::Custom(7), 1);
        tasks
            .set_callback(
                id,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RdmtError::Config("callback refused".into()))
                }),
            )
            .unwrap();
        let slot = tasks.attach(id).unwrap();
        let outcome = tasks.complete(slot, CompletionCode::Success).unwrap();
        assert!(outcome.callback_error.unwrap().contains("callback refused"));
        assert!(tasks.status(id).unwrap().finished);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detach_frees_slot() {
        let mut tasks = TaskTable::new();
        let id = tasks.create(TaskContext::Client, 1);
        let slot = tasks.attach(id).unwrap();
        tasks.detach(slot);
        let status = tasks.status(id).unwrap();
        assert_eq!(status.submitted, 0);
        assert!(tasks.attach(id).is_ok());
    }

    #[test]
    fn test_destroy() {
        let mut tasks = TaskTable::new();
        let id = tasks.create(TaskContext::Unmount, 1);
        let slot = tasks.attach(id).unwrap();
        tasks.destroy(id).unwrap();
        assert!(tasks.complete(slot, CompletionCode::Success).is_none());
        assert!(matches!(
            tasks.destroy(id),
            Err(RdmtError::UnknownTask { .. })
        ));
        assert!(tasks.status(id).is_err());
        assert!(tasks.is_empty());
    }
}
