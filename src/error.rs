//! Error Types
//!
//! Every fallible bridge operation returns [`BridgeResult`]. Guest-caused
//! faults on the word/long path never surface here: those are recorded by
//! the address space and read as zero.

use crate::memory::{AccessMode, RegionId, Width};
use crate::schedule::{TaskId, TaskState};
use crate::trap::TrapId;
use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the runtime bridge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Region registration collides with an existing region
    #[error("region '{name}' [{base:#08x}, {end:#08x}) overlaps '{other}'")]
    Overlap {
        name: String,
        base: u32,
        end: u32,
        other: String,
    },

    /// Host-side block access against an unmapped or non-flat range
    #[error("invalid memory access {mode}({width}) @{addr:#08x}: {reason}")]
    InvalidMemoryAccess {
        mode: AccessMode,
        width: Width,
        addr: u32,
        reason: &'static str,
    },

    /// No free trap id left in the fixed pool
    #[error("trap pool exhausted ({capacity} ids bound)")]
    TrapExhausted { capacity: usize },

    /// Trap id is free or currently executing
    #[error("invalid trap id {0}")]
    InvalidTrap(TrapId),

    /// Allocator could not satisfy a request
    #[error("out of memory: {requested} bytes requested, {free} free")]
    OutOfMemory { requested: u32, free: u32 },

    /// Memory or a trampoline released twice
    #[error("double free @{addr:#08x}")]
    DoubleFree { addr: u32 },

    /// Region handle does not name a registered region
    #[error("invalid region {0}")]
    InvalidRegion(RegionId),

    /// Structure table violates its layout rules
    #[error("malformed structure '{name}': {reason}")]
    MalformedStructure { name: String, reason: String },

    /// Named field not present in the region's structure
    #[error("unknown field '{field}' in '{structure}'")]
    UnknownField { structure: String, field: String },

    /// Illegal scheduler state transition
    #[error("invalid transition for {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// Another task already holds the processor
    #[error("{active} is already active")]
    TaskAlreadyActive { active: TaskId },

    #[error("no active task")]
    NoActiveTask,

    /// Only waiting tasks remain and nothing can wake them
    #[error("deadlock: {waiting} task(s) waiting, none ready")]
    Deadlock { waiting: usize },

    /// A task tried to block from inside a nested run
    #[error("cannot suspend task inside nested run (level {nesting})")]
    NestedSuspend { nesting: usize },

    #[error("trampoline {0} already released")]
    TrampolineReleased(u64),

    #[error("unknown trampoline {0}")]
    UnknownTrampoline(u64),

    /// Processor core stopped on an instruction it cannot execute
    #[error("cpu fault @{pc:#08x} (opcode {opcode:#06x}): {reason}")]
    CpuFault {
        pc: u32,
        opcode: u16,
        reason: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Setup-time structural errors that must abort startup
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BridgeError::Overlap { .. } | BridgeError::MalformedStructure { .. }
        )
    }

    /// Resource exhaustion the caller may retry after releasing resources
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            BridgeError::TrapExhausted { .. } | BridgeError::OutOfMemory { .. }
        )
    }
}
