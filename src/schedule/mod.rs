//! Task scheduling
//!
//! Cooperative multitasking for guest tasks. The [`Scheduler`] is the
//! state machine, [`events`] carries its transitions to an observer, and
//! [`exec_mirror`] is the observer that keeps guest task lists in sync.

pub mod events;
pub mod exec_mirror;
pub mod scheduler;
pub mod task;

pub use events::{EventRecorder, Fanout, SchedulerEvent, SchedulerEventKind, SchedulerObserver};
pub use exec_mirror::ExecListMirror;
pub use scheduler::{Scheduler, SchedulerStats, WaitOutcome};
pub use task::{Signals, Stack, TaskContext, TaskId, TaskState};
