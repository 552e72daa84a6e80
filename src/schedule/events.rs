//! Scheduler events
//!
//! Every task state transition is announced to a single observer, in the
//! order the transitions happen. Observers mirror the change into guest
//! memory (see [`ExecListMirror`](super::exec_mirror::ExecListMirror)) or
//! just record it.

use super::task::TaskId;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SchedulerEventKind {
    /// Task created, starts Ready
    NewTask,
    /// Ready -> Active
    ActiveTask,
    /// Active -> Ready
    ReadyTask,
    /// Active -> Waiting
    WaitingTask,
    /// Waiting -> Ready; always followed by `ReadyTask`
    WakeUp,
    /// Task left the scheduler
    RemoveTask,
}

impl std::fmt::Display for SchedulerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerEventKind::NewTask => "new",
            SchedulerEventKind::ActiveTask => "active",
            SchedulerEventKind::ReadyTask => "ready",
            SchedulerEventKind::WaitingTask => "waiting",
            SchedulerEventKind::WakeUp => "wakeup",
            SchedulerEventKind::RemoveTask => "remove",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerEvent {
    pub kind: SchedulerEventKind,
    pub task: TaskId,
    pub name: String,
    /// Signal mask the task waits on (WaitingTask only)
    pub wait_mask: u32,
    /// Guest task structure, if the task has one
    pub guest_task: Option<u32>,
}

impl SchedulerEvent {
    pub fn new(kind: SchedulerEventKind, task: TaskId) -> Self {
        Self {
            kind,
            task,
            name: String::new(),
            wait_mask: 0,
            guest_task: None,
        }
    }
}

impl std::fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.task)?;
        if !self.name.is_empty() {
            write!(f, " '{}'", self.name)?;
        }
        if self.kind == SchedulerEventKind::WaitingTask {
            write!(f, " mask={:08x}", self.wait_mask)?;
        }
        Ok(())
    }
}

/// Receives scheduler transitions synchronously
pub trait SchedulerObserver {
    fn on_event(&mut self, event: &SchedulerEvent);

    /// The scheduler holds events for a busy observer and delivers them,
    /// in order, once it is free
    fn is_busy(&self) -> bool {
        false
    }
}

impl<T: SchedulerObserver> SchedulerObserver for Rc<RefCell<T>> {
    fn on_event(&mut self, event: &SchedulerEvent) {
        match self.try_borrow_mut() {
            Ok(mut inner) => inner.on_event(event),
            Err(_) => warn!("scheduler observer busy, dropped {event}"),
        }
    }

    fn is_busy(&self) -> bool {
        self.try_borrow_mut().is_err()
    }
}

/// Keeps every event, for inspection
#[derive(Debug, Default)]
pub struct EventRecorder {
    pub events: Vec<SchedulerEvent>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(kind, task)` pairs in arrival order
    pub fn sequence(&self) -> Vec<(SchedulerEventKind, TaskId)> {
        self.events.iter().map(|e| (e.kind, e.task)).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl SchedulerObserver for EventRecorder {
    fn on_event(&mut self, event: &SchedulerEvent) {
        self.events.push(event.clone());
    }
}

/// Forwards each event to several observers, in order
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Box<dyn SchedulerObserver>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl SchedulerObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl SchedulerObserver for Fanout {
    fn on_event(&mut self, event: &SchedulerEvent) {
        for observer in &mut self.observers {
            observer.on_event(event);
        }
    }

    fn is_busy(&self) -> bool {
        self.observers.iter().any(|o| o.is_busy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut event = SchedulerEvent::new(SchedulerEventKind::WaitingTask, TaskId(3));
        event.name = "worker".into();
        event.wait_mask = 0x100;
        assert_eq!(event.to_string(), "waiting Task(3) 'worker' mask=00000100");
        let event = SchedulerEvent::new(SchedulerEventKind::ActiveTask, TaskId(1));
        assert_eq!(event.to_string(), "active Task(1)");
    }

    #[test]
    fn test_fanout_keeps_order() {
        let a = Rc::new(RefCell::new(EventRecorder::new()));
        let b = Rc::new(RefCell::new(EventRecorder::new()));
        let mut fan = Fanout::new().with(a.clone()).with(b.clone());
        assert_eq!(fan.len(), 2);
        fan.on_event(&SchedulerEvent::new(SchedulerEventKind::NewTask, TaskId(1)));
        fan.on_event(&SchedulerEvent::new(SchedulerEventKind::ActiveTask, TaskId(1)));
        let expected = vec![
            (SchedulerEventKind::NewTask, TaskId(1)),
            (SchedulerEventKind::ActiveTask, TaskId(1)),
        ];
        assert_eq!(a.borrow().sequence(), expected);
        assert_eq!(b.borrow().sequence(), expected);
    }
}
