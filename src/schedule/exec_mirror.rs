//! Guest task list mirror
//!
//! Keeps the exec-style `TaskReady`/`TaskWait` lists and `ThisTask` in
//! guest memory in step with the scheduler. Lists are standard doubly
//! linked exec lists with a tail sentinel inside the header; task nodes
//! are the `tc_Node` at the start of each guest task structure.

use super::events::{SchedulerEvent, SchedulerEventKind, SchedulerObserver};
use crate::error::{BridgeError, BridgeResult};
use crate::memory::structure::{StructDef, layouts};
use crate::memory::AddressSpace;
use tracing::{trace, warn};

/// `tc_State` values
pub const TS_RUN: u8 = 2;
pub const TS_READY: u8 = 3;
pub const TS_WAIT: u8 = 4;
pub const TS_REMOVED: u8 = 6;

/// Longest list walked before assuming corruption
const MAX_LIST_NODES: usize = 4096;

const LN_SUCC: u32 = 0;
const LN_PRED: u32 = 4;
const LH_HEAD: u32 = 0;
const LH_TAIL: u32 = 4;
const LH_TAILPRED: u32 = 8;

fn offset_of(def: &StructDef, field: &str) -> BridgeResult<u32> {
    def.field(field)
        .map(|f| f.offset)
        .ok_or_else(|| BridgeError::UnknownField {
            structure: def.name().to_string(),
            field: field.to_string(),
        })
}

#[derive(Debug)]
pub struct ExecListMirror {
    mem: AddressSpace,
    this_task: u32,
    ready: u32,
    wait: u32,
    tc_state: u32,
    tc_sig_wait: u32,
}

impl ExecListMirror {
    /// Mirror into the `ExecLists` structure at `lists`
    pub fn new(mem: AddressSpace, lists: u32) -> BridgeResult<Self> {
        let exec = layouts::exec_lists()?;
        let task = layouts::task()?;
        let mirror = Self {
            this_task: lists + offset_of(&exec, "ThisTask")?,
            ready: lists + offset_of(&exec, "TaskReady.lh_Head")?,
            wait: lists + offset_of(&exec, "TaskWait.lh_Head")?,
            tc_state: offset_of(&task, "tc_State")?,
            tc_sig_wait: offset_of(&task, "tc_SigWait")?,
            mem,
        };
        mirror.mem.write32(mirror.this_task, 0);
        mirror.new_list(mirror.ready);
        mirror.new_list(mirror.wait);
        Ok(mirror)
    }

    pub fn this_task(&self) -> u32 {
        self.mem.read32(self.this_task)
    }

    /// Node addresses on the ready list, head first
    pub fn ready_list(&self) -> Vec<u32> {
        self.walk(self.ready)
    }

    pub fn wait_list(&self) -> Vec<u32> {
        self.walk(self.wait)
    }

    pub fn task_state(&self, task: u32) -> u8 {
        self.mem.read8(task + self.tc_state)
    }

    // ========== List primitives ==========

    fn new_list(&self, list: u32) {
        self.mem.write32(list + LH_HEAD, list + LH_TAIL);
        self.mem.write32(list + LH_TAIL, 0);
        self.mem.write32(list + LH_TAILPRED, list);
    }

    fn add_head(&self, list: u32, node: u32) {
        let head = self.mem.read32(list + LH_HEAD);
        self.mem.write32(node + LN_SUCC, head);
        self.mem.write32(node + LN_PRED, list);
        self.mem.write32(head + LN_PRED, node);
        self.mem.write32(list + LH_HEAD, node);
    }

    fn add_tail(&self, list: u32, node: u32) {
        let pred = self.mem.read32(list + LH_TAILPRED);
        self.mem.write32(node + LN_SUCC, list + LH_TAIL);
        self.mem.write32(node + LN_PRED, pred);
        self.mem.write32(pred + LN_SUCC, node);
        self.mem.write32(list + LH_TAILPRED, node);
    }

    /// Unlink `node` if it is on a list
    fn remove(&self, node: u32) {
        let succ = self.mem.read32(node + LN_SUCC);
        let pred = self.mem.read32(node + LN_PRED);
        if succ == 0 || pred == 0 {
            return;
        }
        self.mem.write32(pred + LN_SUCC, succ);
        self.mem.write32(succ + LN_PRED, pred);
        self.mem.write32(node + LN_SUCC, 0);
        self.mem.write32(node + LN_PRED, 0);
    }

    fn walk(&self, list: u32) -> Vec<u32> {
        let mut nodes = Vec::new();
        let mut node = self.mem.read32(list + LH_HEAD);
        while node != 0 && node != list + LH_TAIL {
            if nodes.len() >= MAX_LIST_NODES {
                warn!("list @{list:06x} does not terminate");
                break;
            }
            nodes.push(node);
            node = self.mem.read32(node + LN_SUCC);
        }
        nodes
    }

    fn set_state(&self, task: u32, state: u8) {
        self.mem.write8(task + self.tc_state, state);
    }

    fn leave_cpu(&self, task: u32) {
        if self.this_task() == task {
            self.mem.write32(self.this_task, 0);
        }
    }
}

impl SchedulerObserver for ExecListMirror {
    fn on_event(&mut self, event: &SchedulerEvent) {
        let Some(task) = event.guest_task else {
            return;
        };
        trace!("mirror {event} @{task:06x}");
        match event.kind {
            SchedulerEventKind::NewTask => {
                self.set_state(task, TS_READY);
                self.add_tail(self.ready, task);
            }
            SchedulerEventKind::ActiveTask => {
                self.remove(task);
                self.set_state(task, TS_RUN);
                self.mem.write32(self.this_task, task);
            }
            SchedulerEventKind::ReadyTask => {
                self.leave_cpu(task);
                self.set_state(task, TS_READY);
                self.add_tail(self.ready, task);
            }
            SchedulerEventKind::WaitingTask => {
                self.leave_cpu(task);
                self.set_state(task, TS_WAIT);
                self.mem.write32(task + self.tc_sig_wait, event.wait_mask);
                self.add_head(self.wait, task);
            }
            SchedulerEventKind::WakeUp => {
                self.remove(task);
                self.mem.write32(task + self.tc_sig_wait, 0);
            }
            SchedulerEventKind::RemoveTask => {
                self.leave_cpu(task);
                self.remove(task);
                self.set_state(task, TS_REMOVED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Region;
    use crate::schedule::TaskId;

    const LISTS: u32 = 0x100;
    const T1: u32 = 0x200;
    const T2: u32 = 0x300;

    fn mirror() -> ExecListMirror {
        let mem = AddressSpace::default();
        mem.register(Region::flat("ram", 0, 0x1000).unwrap()).unwrap();
        ExecListMirror::new(mem, LISTS).unwrap()
    }

    fn event(kind: SchedulerEventKind, task: u32, wait_mask: u32) -> SchedulerEvent {
        let mut event = SchedulerEvent::new(kind, TaskId(task as u64));
        event.guest_task = Some(task);
        event.wait_mask = wait_mask;
        event
    }

    #[test]
    fn test_empty_lists() {
        let m = mirror();
        assert!(m.ready_list().is_empty());
        assert!(m.wait_list().is_empty());
        assert_eq!(m.this_task(), 0);
    }

    #[test]
    fn test_follows_transitions() {
        let mut m = mirror();
        m.on_event(&event(SchedulerEventKind::NewTask, T1, 0));
        m.on_event(&event(SchedulerEventKind::NewTask, T2, 0));
        assert_eq!(m.ready_list(), vec![T1, T2]);

        m.on_event(&event(SchedulerEventKind::ActiveTask, T1, 0));
        assert_eq!(m.this_task(), T1);
        assert_eq!(m.ready_list(), vec![T2]);
        assert_eq!(m.task_state(T1), TS_RUN);

        m.on_event(&event(SchedulerEventKind::WaitingTask, T1, 0x100));
        assert_eq!(m.wait_list(), vec![T1]);
        assert_eq!(m.this_task(), 0);
        assert_eq!(m.task_state(T1), TS_WAIT);
        assert_eq!(m.mem.read32(T1 + 22), 0x100);

        m.on_event(&event(SchedulerEventKind::ActiveTask, T2, 0));
        m.on_event(&event(SchedulerEventKind::WakeUp, T1, 0));
        m.on_event(&event(SchedulerEventKind::ReadyTask, T1, 0));
        assert!(m.wait_list().is_empty());
        assert_eq!(m.ready_list(), vec![T1]);
        assert_eq!(m.this_task(), T2);
        assert_eq!(m.task_state(T1), TS_READY);

        m.on_event(&event(SchedulerEventKind::RemoveTask, T2, 0));
        assert_eq!(m.this_task(), 0);
        assert_eq!(m.task_state(T2), TS_REMOVED);
    }

    #[test]
    fn test_events_without_guest_task_ignored() {
        let mut m = mirror();
        m.on_event(&SchedulerEvent::new(SchedulerEventKind::NewTask, TaskId(1)));
        assert!(m.ready_list().is_empty());
    }
}
