//! Task contexts
//!
//! A task is one guest thread of execution: a register snapshot, a stack
//! region and its scheduling state. Only the active task's registers live
//! in the CPU; everyone else's are parked here.

use crate::error::BridgeResult;
use crate::machine::CpuContext;
use crate::memory::{Allocator, AddressSpace, RegionId, RegionKind};
use serde::Serialize;
use tracing::debug;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Runnable, queued for the processor
    Ready,
    /// Owns the processor
    Active,
    /// Blocked on signals
    Waiting,
    /// Exited; context is discarded
    Terminated,
}

impl TaskState {
    /// Legal edges of the task state machine
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Ready, Active)
                | (Active, Ready)
                | (Active, Waiting)
                | (Active, Terminated)
                | (Waiting, Ready)
        )
    }
}

// ============================================================================
// Stack
// ============================================================================

/// A task stack carved out of guest RAM
///
/// The stack size is kept in the top long word, so the first usable slot
/// for the initial stack pointer is `upper - 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    pub region: RegionId,
    pub lower: u32,
    pub upper: u32,
}

impl Stack {
    /// Allocate and register a stack region of `size` bytes
    pub fn alloc(
        mem: &AddressSpace,
        alloc: &mut dyn Allocator,
        name: &str,
        size: u32,
    ) -> BridgeResult<Self> {
        let size = (size.max(16) + 3) & !3;
        let region = mem.alloc_region(alloc, &format!("stack:{name}"), size, RegionKind::Flat)?;
        let lower = mem.region_info(region).map(|r| r.start).unwrap_or_default();
        let stack = Self {
            region,
            lower,
            upper: lower + size,
        };
        mem.write32(stack.upper - 4, size);
        debug!("stack '{name}' [{lower:06x}, {:06x})", stack.upper);
        Ok(stack)
    }

    pub fn size(&self) -> u32 {
        self.upper - self.lower
    }

    pub fn initial_sp(&self) -> u32 {
        self.upper - 8
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.lower && addr < self.upper
    }

    pub fn free(self, mem: &AddressSpace, alloc: &mut dyn Allocator) -> BridgeResult<()> {
        mem.free_region(alloc, self.region)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Signals reserved for the system
pub const SYSTEM_SIGNALS: u32 = 0x0000_FFFF;

/// Per-task signal bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Signals {
    pub alloc: u32,
    pub wait: u32,
    pub recvd: u32,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            alloc: SYSTEM_SIGNALS,
            wait: 0,
            recvd: 0,
        }
    }
}

impl Signals {
    /// Allocate a signal bit; `preferred` is honoured if free
    pub fn alloc_signal(&mut self, preferred: Option<u8>) -> Option<u8> {
        let bit = match preferred {
            Some(bit) if bit < 32 => (self.alloc & (1 << bit) == 0).then_some(bit)?,
            Some(_) => return None,
            None => (0..32u8).rev().find(|b| self.alloc & (1 << b) == 0)?,
        };
        let mask = 1u32 << bit;
        self.alloc |= mask;
        self.recvd &= !mask;
        Some(bit)
    }

    pub fn free_signal(&mut self, bit: u8) {
        if bit < 32 {
            self.alloc &= !(1 << bit);
        }
    }
}

// ============================================================================
// Task context
// ============================================================================

/// Everything the scheduler keeps about one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Saved registers while not active
    pub cpu: CpuContext,
    pub stack: Option<Stack>,
    /// Address of the guest-side task structure, if one is mirrored
    pub guest_task: Option<u32>,
    pub signals: Signals,
    /// Value for D0 when the task is next resumed
    pub resume_value: Option<u32>,
    /// CPU cycles spent in this task
    pub cycles: u64,
    /// Number of times this task was activated
    pub activations: u64,
}

impl TaskContext {
    pub fn new(id: TaskId, name: impl Into<String>, cpu: CpuContext) -> Self {
        Self {
            id,
            name: name.into(),
            state: TaskState::Ready,
            cpu,
            stack: None,
            guest_task: None,
            signals: Signals::default(),
            resume_value: None,
            cycles: 0,
            activations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FirstFitAllocator;

    #[test]
    fn test_transition_table() {
        use TaskState::*;
        assert!(Ready.can_transition_to(Active));
        assert!(!Ready.can_transition_to(Waiting));
        assert!(!Ready.can_transition_to(Terminated));
        assert!(Active.can_transition_to(Ready));
        assert!(Active.can_transition_to(Waiting));
        assert!(Active.can_transition_to(Terminated));
        assert!(!Active.can_transition_to(Active));
        assert!(Waiting.can_transition_to(Ready));
        assert!(!Waiting.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Ready));
    }

    #[test]
    fn test_signal_allocation() {
        let mut sigs = Signals::default();
        assert_eq!(sigs.alloc_signal(None), Some(31));
        assert_eq!(sigs.alloc_signal(Some(31)), None);
        assert_eq!(sigs.alloc_signal(Some(20)), Some(20));
        // system signals are taken
        assert_eq!(sigs.alloc_signal(Some(4)), None);
        sigs.free_signal(20);
        assert_eq!(sigs.alloc_signal(Some(20)), Some(20));
        assert_eq!(sigs.alloc_signal(Some(40)), None);
    }

    #[test]
    fn test_stack_layout() {
        let mem = AddressSpace::default();
        let mut alloc = FirstFitAllocator::new(0x1000, 0x10000);
        let stack = Stack::alloc(&mem, &mut alloc, "t", 0x100).unwrap();
        assert_eq!(stack.size(), 0x100);
        assert_eq!(stack.initial_sp(), stack.upper - 8);
        assert_eq!(mem.read32(stack.upper - 4), 0x100);
        assert!(stack.contains(stack.initial_sp()));
        stack.free(&mem, &mut alloc).unwrap();
        assert!(alloc.is_all_free());
        assert_eq!(mem.resolve(stack.lower), None);
    }
}
