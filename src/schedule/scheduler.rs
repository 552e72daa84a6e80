//! Cooperative task scheduler
//!
//! A pure state machine: it decides which task owns the processor and
//! tracks signal state, but never touches guest memory or the CPU. The
//! machine drives it from its run loop and from trap callbacks; guest
//! visible side effects happen in the observer.
//!
//! Design:
//! - At most one Active task
//! - FIFO ready queue, no priorities, no preemption
//! - Every transition is checked against the state table, then announced

use super::events::{SchedulerEvent, SchedulerEventKind, SchedulerObserver};
use super::task::{Signals, Stack, TaskContext, TaskId, TaskState};
use crate::error::{BridgeError, BridgeResult};
use crate::machine::CpuContext;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// Result of a signal wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Signals were already pending; the task keeps running
    Ready(u32),
    /// The task is now Waiting
    Blocked,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub spawned: u64,
    pub switches: u64,
    pub wakeups: u64,
    pub exited: u64,
    pub removed: u64,
}

#[derive(Default)]
pub struct Scheduler {
    tasks: BTreeMap<TaskId, TaskContext>,
    ready: VecDeque<TaskId>,
    /// Blocked tasks, oldest first
    waiting: Vec<TaskId>,
    active: Option<TaskId>,
    next_id: u64,
    observer: Option<Box<dyn SchedulerObserver>>,
    /// Events not yet delivered to a busy observer
    held: VecDeque<SchedulerEvent>,
    stats: SchedulerStats,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("active", &self.active)
            .field("ready", &self.ready)
            .field("waiting", &self.waiting)
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn SchedulerObserver>) {
        self.observer = Some(observer);
    }

    pub fn take_observer(&mut self) -> Option<Box<dyn SchedulerObserver>> {
        self.observer.take()
    }

    fn emit(&mut self, kind: SchedulerEventKind, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let event = SchedulerEvent {
            kind,
            task: id,
            name: task.name.clone(),
            wait_mask: task.signals.wait,
            guest_task: task.guest_task,
        };
        trace!("event {event}");
        if self.observer.is_some() {
            self.held.push_back(event);
            self.flush_events();
        }
    }

    /// Deliver held events while the observer is free. Returns how many
    /// are still held.
    pub fn flush_events(&mut self) -> usize {
        let Some(observer) = self.observer.as_mut() else {
            self.held.clear();
            return 0;
        };
        while !observer.is_busy() {
            let Some(event) = self.held.pop_front() else {
                break;
            };
            observer.on_event(&event);
        }
        if !self.held.is_empty() {
            debug!("observer busy, holding {} event(s)", self.held.len());
        }
        self.held.len()
    }

    /// Events waiting for a busy observer
    pub fn held_events(&self) -> usize {
        self.held.len()
    }

    fn task_mut(&mut self, id: TaskId) -> BridgeResult<&mut TaskContext> {
        self.tasks.get_mut(&id).ok_or(BridgeError::UnknownTask(id))
    }

    /// Checked state change; queue bookkeeping is left to the caller
    fn transition(&mut self, id: TaskId, to: TaskState) -> BridgeResult<()> {
        let task = self.task_mut(id)?;
        let from = task.state;
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition { task: id, from, to });
        }
        task.state = to;
        debug!("{id} '{}': {from:?} -> {to:?}", task.name);
        Ok(())
    }

    // ========== Task set ==========

    /// Add a Ready task and queue it
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        cpu: CpuContext,
        stack: Option<Stack>,
        guest_task: Option<u32>,
    ) -> TaskId {
        let id = TaskId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        let mut task = TaskContext::new(id, name, cpu);
        task.stack = stack;
        task.guest_task = guest_task;
        self.tasks.insert(id, task);
        self.ready.push_back(id);
        self.stats.spawned += 1;
        self.emit(SchedulerEventKind::NewTask, id);
        id
    }

    /// Tear down a task.
    ///
    /// The active task is terminated first; Ready and Waiting tasks are
    /// simply dropped from their queue.
    pub fn remove_task(&mut self, id: TaskId) -> BridgeResult<TaskContext> {
        if self.active == Some(id) {
            return self.exit_active();
        }
        let task = self.task_mut(id)?;
        task.state = TaskState::Terminated;
        self.ready.retain(|t| *t != id);
        self.waiting.retain(|t| *t != id);
        self.emit(SchedulerEventKind::RemoveTask, id);
        self.stats.removed += 1;
        self.tasks.remove(&id).ok_or(BridgeError::UnknownTask(id))
    }

    /// Active -> Terminated; returns the discarded context
    pub fn exit_active(&mut self) -> BridgeResult<TaskContext> {
        let id = self.active.ok_or(BridgeError::NoActiveTask)?;
        self.transition(id, TaskState::Terminated)?;
        self.active = None;
        self.emit(SchedulerEventKind::RemoveTask, id);
        self.stats.exited += 1;
        self.tasks.remove(&id).ok_or(BridgeError::UnknownTask(id))
    }

    // ========== Transitions ==========

    /// Ready -> Active for a specific task
    pub fn activate(&mut self, id: TaskId) -> BridgeResult<()> {
        if let Some(active) = self.active {
            return Err(BridgeError::TaskAlreadyActive { active });
        }
        self.transition(id, TaskState::Active)?;
        self.ready.retain(|t| *t != id);
        self.active = Some(id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.activations += 1;
        }
        self.stats.switches += 1;
        self.emit(SchedulerEventKind::ActiveTask, id);
        Ok(())
    }

    /// Activate the head of the ready queue. None means idle.
    pub fn activate_next(&mut self) -> BridgeResult<Option<TaskId>> {
        if let Some(active) = self.active {
            return Err(BridgeError::TaskAlreadyActive { active });
        }
        let Some(id) = self.ready.front().copied() else {
            return Ok(None);
        };
        self.activate(id)?;
        Ok(Some(id))
    }

    /// Active -> Ready, back of the queue
    pub fn yield_active(&mut self) -> BridgeResult<TaskId> {
        let id = self.active.ok_or(BridgeError::NoActiveTask)?;
        self.transition(id, TaskState::Ready)?;
        self.active = None;
        self.ready.push_back(id);
        self.emit(SchedulerEventKind::ReadyTask, id);
        Ok(id)
    }

    /// Active -> Waiting on `mask`
    pub fn block_active(&mut self, mask: u32) -> BridgeResult<TaskId> {
        let id = self.active.ok_or(BridgeError::NoActiveTask)?;
        self.transition(id, TaskState::Waiting)?;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.signals.wait = mask;
        }
        self.active = None;
        self.waiting.push(id);
        self.emit(SchedulerEventKind::WaitingTask, id);
        Ok(id)
    }

    /// Waiting -> Ready; emits WakeUp then ReadyTask
    pub fn wake(&mut self, id: TaskId) -> BridgeResult<()> {
        self.transition(id, TaskState::Ready)?;
        self.waiting.retain(|t| *t != id);
        self.ready.push_back(id);
        self.stats.wakeups += 1;
        self.emit(SchedulerEventKind::WakeUp, id);
        self.emit(SchedulerEventKind::ReadyTask, id);
        Ok(())
    }

    /// Apply one transition by target state, keeping the queues straight
    pub fn request(&mut self, id: TaskId, to: TaskState) -> BridgeResult<()> {
        let from = self.state(id).ok_or(BridgeError::UnknownTask(id))?;
        let illegal = BridgeError::InvalidTransition { task: id, from, to };
        match (from, to) {
            (TaskState::Ready, TaskState::Active) => self.activate(id),
            (TaskState::Waiting, TaskState::Ready) => self.wake(id),
            (TaskState::Active, TaskState::Ready) => self.yield_active().map(|_| ()),
            (TaskState::Active, TaskState::Waiting) => self.block_active(0).map(|_| ()),
            (TaskState::Active, TaskState::Terminated) => self.exit_active().map(|_| ()),
            _ => Err(illegal),
        }
    }

    // ========== Signals ==========

    /// Wait on `mask` for the active task.
    ///
    /// Pending bits are consumed and returned at once; otherwise the task
    /// blocks and gets the received bits as its resume value later.
    pub fn wait(&mut self, mask: u32) -> BridgeResult<WaitOutcome> {
        let id = self.active.ok_or(BridgeError::NoActiveTask)?;
        let task = self.task_mut(id)?;
        let got = task.signals.recvd & mask;
        if got != 0 {
            task.signals.recvd &= !got;
            return Ok(WaitOutcome::Ready(got));
        }
        self.block_active(mask)?;
        Ok(WaitOutcome::Blocked)
    }

    /// Post `bits` to a task. Returns true if that woke it.
    pub fn signal(&mut self, id: TaskId, bits: u32) -> BridgeResult<bool> {
        let task = self.task_mut(id)?;
        task.signals.recvd |= bits;
        if task.state != TaskState::Waiting {
            return Ok(false);
        }
        let got = task.signals.recvd & task.signals.wait;
        if got == 0 {
            return Ok(false);
        }
        task.signals.recvd &= !got;
        task.signals.wait = 0;
        task.resume_value = Some(got);
        self.wake(id)?;
        Ok(true)
    }

    /// Clear and return pending bits in `mask` (SetSignal style)
    pub fn take_signals(&mut self, id: TaskId, mask: u32) -> BridgeResult<u32> {
        let task = self.task_mut(id)?;
        let got = task.signals.recvd & mask;
        task.signals.recvd &= !got;
        Ok(got)
    }

    pub fn alloc_signal(&mut self, id: TaskId, preferred: Option<u8>) -> BridgeResult<Option<u8>> {
        Ok(self.task_mut(id)?.signals.alloc_signal(preferred))
    }

    pub fn free_signal(&mut self, id: TaskId, bit: u8) -> BridgeResult<()> {
        self.task_mut(id)?.signals.free_signal(bit);
        Ok(())
    }

    // ========== Contexts ==========

    /// Park live registers in a task that just left the processor
    pub fn save_context(&mut self, id: TaskId, cpu: CpuContext) -> BridgeResult<()> {
        self.task_mut(id)?.cpu = cpu;
        Ok(())
    }

    pub fn take_resume_value(&mut self, id: TaskId) -> Option<u32> {
        self.tasks.get_mut(&id).and_then(|t| t.resume_value.take())
    }

    pub fn add_cycles(&mut self, id: TaskId, cycles: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.cycles += cycles as u64;
        }
    }

    // ========== Queries ==========

    pub fn active(&self) -> Option<TaskId> {
        self.active
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskContext> {
        self.tasks.get(&id)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|t| t.state)
    }

    pub fn signals(&self, id: TaskId) -> Option<Signals> {
        self.tasks.get(&id).map(|t| t.signals)
    }

    pub fn find(&self, name: &str) -> Option<TaskId> {
        self.tasks.values().find(|t| t.name == name).map(|t| t.id)
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.ready.iter().copied().collect()
    }

    pub fn waiting_tasks(&self) -> Vec<TaskId> {
        self.waiting.clone()
    }

    /// Nothing active and nothing ready
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.ready.is_empty()
    }

    /// Idle while tasks still wait
    pub fn is_deadlocked(&self) -> bool {
        self.is_idle() && !self.waiting.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}
