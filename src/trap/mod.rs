//! Trap Registry
//!
//! Binds line-A opcodes (`0xA000 | id`) to host callbacks. When the CPU
//! fetches one it stops and hands the opcode back to its caller, which
//! dispatches the bound callback between run cycles, never inside one.
//!
//! Design:
//! - Fixed id space: the opcode encoding only has 12 bits for the id
//! - O(1) setup/free through a slab free list
//! - A callback is checked out while it runs, so it may freely use the
//!   context that owns the registry, including freeing its own id or
//!   re-entering itself through a nested run
//! - One-shot and freed ids are released after the outermost invocation
//!   returns, not before

pub mod opcodes;
pub mod trampoline;

pub use trampoline::{DataRef, FinalizedTrampoline, Label, Trampoline, TrampolineId};

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use slab::Slab;
use std::rc::Rc;
use tracing::{debug, trace};

/// Size of the trap id space
pub const MAX_TRAPS: usize = (opcodes::TRAP_MASK as usize) + 1;

/// Trap identifier; the low 12 bits of its opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrapId(pub u16);

impl TrapId {
    pub fn opcode(self) -> u16 {
        opcodes::TRAP_BASE | (self.0 & opcodes::TRAP_MASK)
    }

    /// Id encoded by a trap opcode, None for any other instruction
    pub fn from_opcode(opcode: u16) -> Option<TrapId> {
        (opcode & !opcodes::TRAP_MASK == opcodes::TRAP_BASE)
            .then_some(TrapId(opcode & opcodes::TRAP_MASK))
    }
}

impl std::fmt::Display for TrapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trap({})", self.0)
    }
}

/// Trap behaviour flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrapFlags {
    /// Release the id after the first trigger
    pub one_shot: bool,
    /// Pop a return address from A7 into PC after the callback
    pub auto_return: bool,
}

impl TrapFlags {
    pub const PERSISTENT: TrapFlags = TrapFlags {
        one_shot: false,
        auto_return: false,
    };

    pub const AUTO_RETURN: TrapFlags = TrapFlags {
        one_shot: false,
        auto_return: true,
    };

    pub const ONE_SHOT: TrapFlags = TrapFlags {
        one_shot: true,
        auto_return: false,
    };

    pub const ONE_SHOT_RETURN: TrapFlags = TrapFlags {
        one_shot: true,
        auto_return: true,
    };
}

/// What a callback learns about the trap that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapCall {
    pub id: TrapId,
    pub opcode: u16,
    /// Address of the trap opcode
    pub pc: u32,
}

/// Host callback bound to a trap.
///
/// Shared so a callback can be entered again while it runs, e.g. a library
/// function whose guest hook calls the same function.
pub type TrapFn<C> = Rc<dyn Fn(&mut C, &TrapCall) -> BridgeResult<()>>;

struct TrapSlot<C> {
    name: String,
    flags: TrapFlags,
    callback: TrapFn<C>,
    /// Invocations currently on the host stack
    depth: u32,
    /// One-shot trap already triggered
    fired: bool,
    /// Freed while running; drop when the outermost call returns
    release_pending: bool,
    hits: u64,
}

/// Usage snapshot of one bound trap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrapInfo {
    pub id: TrapId,
    pub name: String,
    pub flags: TrapFlags,
    pub hits: u64,
    pub running: bool,
}

/// Fixed-capacity pool of trap ids, generic over the callback context
pub struct TrapRegistry<C> {
    slots: Slab<TrapSlot<C>>,
    capacity: usize,
}

impl<C> std::fmt::Debug for TrapRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapRegistry")
            .field("bound", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<C> TrapRegistry<C> {
    /// Capacity is clamped to the opcode space
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_TRAPS);
        Self {
            slots: Slab::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids currently bound (including ones pending release)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.slots.len()
    }

    /// Bind a callback to a free id
    pub fn setup(
        &mut self,
        name: impl Into<String>,
        flags: TrapFlags,
        callback: impl Fn(&mut C, &TrapCall) -> BridgeResult<()> + 'static,
    ) -> BridgeResult<TrapId> {
        self.setup_shared(name, flags, Rc::new(callback))
    }

    pub fn setup_shared(
        &mut self,
        name: impl Into<String>,
        flags: TrapFlags,
        callback: TrapFn<C>,
    ) -> BridgeResult<TrapId> {
        // slab keys never exceed the peak occupancy, so this keeps ids in range
        if self.slots.len() >= self.capacity {
            return Err(BridgeError::TrapExhausted {
                capacity: self.capacity,
            });
        }
        let name = name.into();
        let key = self.slots.insert(TrapSlot {
            name,
            flags,
            callback,
            depth: 0,
            fired: false,
            release_pending: false,
            hits: 0,
        });
        let id = TrapId(key as u16);
        debug!("setup {id} '{}' {flags:?}", self.slots[key].name);
        Ok(id)
    }

    /// Release an id. A running trap is released when its outermost
    /// invocation returns.
    pub fn free(&mut self, id: TrapId) -> BridgeResult<()> {
        let key = id.0 as usize;
        let slot = self
            .slots
            .get_mut(key)
            .filter(|s| !s.release_pending)
            .ok_or(BridgeError::InvalidTrap(id))?;
        if slot.depth > 0 {
            slot.release_pending = true;
            debug!("free {id} deferred until return");
        } else {
            let slot = self.slots.remove(key);
            debug!("free {id} '{}'", slot.name);
        }
        Ok(())
    }

    /// Bound and not pending release
    pub fn is_bound(&self, id: TrapId) -> bool {
        self.slots
            .get(id.0 as usize)
            .is_some_and(|s| !s.release_pending)
    }

    pub fn name(&self, id: TrapId) -> Option<&str> {
        self.slots.get(id.0 as usize).map(|s| s.name.as_str())
    }

    pub fn flags(&self, id: TrapId) -> Option<TrapFlags> {
        self.slots.get(id.0 as usize).map(|s| s.flags)
    }

    /// Invocations of `id` currently running
    pub fn depth(&self, id: TrapId) -> u32 {
        self.slots.get(id.0 as usize).map_or(0, |s| s.depth)
    }

    pub fn info(&self) -> Vec<TrapInfo> {
        self.slots
            .iter()
            .map(|(key, s)| TrapInfo {
                id: TrapId(key as u16),
                name: s.name.clone(),
                flags: s.flags,
                hits: s.hits,
                running: s.depth > 0,
            })
            .collect()
    }

    /// Hand out the callback for one invocation. May nest.
    pub fn checkout(&mut self, id: TrapId) -> BridgeResult<(TrapFn<C>, TrapFlags)> {
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .filter(|s| !s.release_pending && !s.fired)
            .ok_or(BridgeError::InvalidTrap(id))?;
        if slot.flags.one_shot {
            slot.fired = true;
        }
        slot.depth += 1;
        slot.hits += 1;
        if slot.depth > 1 {
            trace!("{id} '{}' entered at depth {}", slot.name, slot.depth);
        }
        Ok((Rc::clone(&slot.callback), slot.flags))
    }

    /// End one invocation; one-shot and freed ids go away once the
    /// outermost invocation has returned
    pub fn checkin(&mut self, id: TrapId) {
        let key = id.0 as usize;
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if slot.depth == 0 {
            return;
        }
        slot.depth -= 1;
        if slot.depth == 0 && (slot.fired || slot.release_pending) {
            let slot = self.slots.remove(key);
            trace!("released {id} '{}' after trigger", slot.name);
        }
    }

    /// Run the callback bound to `id` with the faulting `pc`.
    ///
    /// For use when the context does not own this registry; a machine that
    /// does uses `checkout`/`checkin` around the call instead.
    pub fn trigger(&mut self, id: TrapId, pc: u32, ctx: &mut C) -> BridgeResult<TrapFlags> {
        let (callback, flags) = self.checkout(id)?;
        let call = TrapCall {
            id,
            opcode: id.opcode(),
            pc,
        };
        let result = callback(ctx, &call);
        self.checkin(id);
        result.map(|_| flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_mapping() {
        assert_eq!(TrapId(0x123).opcode(), 0xA123);
        assert_eq!(TrapId::from_opcode(0xAFFF), Some(TrapId(0xFFF)));
        assert_eq!(TrapId::from_opcode(0x4E75), None);
        assert_eq!(TrapId::from_opcode(0xB000), None);
    }

    #[test]
    fn test_trigger_passes_pc() {
        let mut traps: TrapRegistry<Vec<u32>> = TrapRegistry::new(8);
        let id = traps
            .setup("log", TrapFlags::PERSISTENT, |log: &mut Vec<u32>, call: &TrapCall| {
                log.push(call.pc);
                Ok(())
            })
            .unwrap();
        let mut log = Vec::new();
        traps.trigger(id, 0x1000, &mut log).unwrap();
        traps.trigger(id, 0x2000, &mut log).unwrap();
        assert_eq!(log, vec![0x1000, 0x2000]);
        assert!(traps.is_bound(id));
        assert_eq!(traps.info()[0].hits, 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut traps: TrapRegistry<()> = TrapRegistry::new(4);
        let ids: Vec<_> = (0..4)
            .map(|i| traps.setup(format!("t{i}"), TrapFlags::PERSISTENT, |_, _| Ok(())).unwrap())
            .collect();
        assert_eq!(
            traps.setup("x", TrapFlags::PERSISTENT, |_, _| Ok(())),
            Err(BridgeError::TrapExhausted { capacity: 4 })
        );
        for id in &ids {
            traps.free(*id).unwrap();
        }
        assert!(traps.is_empty());
        for _ in 0..4 {
            let id = traps.setup("again", TrapFlags::PERSISTENT, |_, _| Ok(())).unwrap();
            assert!((id.0 as usize) < 4);
        }
        assert_eq!(traps.available(), 0);
    }

    #[test]
    fn test_one_shot_freed_after_trigger() {
        let mut traps: TrapRegistry<u32> = TrapRegistry::new(4);
        let id = traps
            .setup("once", TrapFlags::ONE_SHOT, |n: &mut u32, _: &TrapCall| {
                *n += 1;
                Ok(())
            })
            .unwrap();
        let mut n = 0;
        traps.trigger(id, 0, &mut n).unwrap();
        assert_eq!(n, 1);
        assert!(!traps.is_bound(id));
        assert_eq!(traps.trigger(id, 0, &mut n), Err(BridgeError::InvalidTrap(id)));
    }

    #[test]
    fn test_free_unknown_and_double_free() {
        let mut traps: TrapRegistry<()> = TrapRegistry::new(4);
        assert_eq!(traps.free(TrapId(2)), Err(BridgeError::InvalidTrap(TrapId(2))));
        let id = traps.setup("t", TrapFlags::PERSISTENT, |_, _| Ok(())).unwrap();
        traps.free(id).unwrap();
        assert!(traps.free(id).is_err());
    }

    #[test]
    fn test_free_while_running_is_deferred() {
        let mut traps: TrapRegistry<()> = TrapRegistry::new(4);
        let id = traps.setup("self", TrapFlags::PERSISTENT, |_, _| Ok(())).unwrap();
        traps.checkout(id).unwrap();
        traps.checkout(id).unwrap();
        assert_eq!(traps.depth(id), 2);
        traps.free(id).unwrap();
        assert!(!traps.is_bound(id));
        // no new invocations once freed
        assert!(traps.checkout(id).is_err());
        traps.checkin(id);
        // the id is still occupied until the outermost call returns
        assert_eq!(traps.len(), 1);
        traps.checkin(id);
        assert!(traps.is_empty());
    }

    #[test]
    fn test_reentrant_trigger_counts_down() {
        struct Ctx {
            traps: TrapRegistry<Ctx>,
            id: TrapId,
            trail: Vec<u32>,
        }
        let mut ctx = Ctx {
            traps: TrapRegistry::new(4),
            id: TrapId(0),
            trail: Vec::new(),
        };
        ctx.id = ctx
            .traps
            .setup("countdown", TrapFlags::PERSISTENT, |c: &mut Ctx, call: &TrapCall| {
                c.trail.push(call.pc);
                if call.pc > 0 {
                    let (callback, _) = c.traps.checkout(c.id)?;
                    let inner = TrapCall { pc: call.pc - 1, ..*call };
                    let result = callback(c, &inner);
                    c.traps.checkin(c.id);
                    result?;
                }
                Ok(())
            })
            .unwrap();
        let id = ctx.id;
        let (callback, _) = ctx.traps.checkout(id).unwrap();
        let call = TrapCall { id, opcode: id.opcode(), pc: 3 };
        callback(&mut ctx, &call).unwrap();
        ctx.traps.checkin(id);
        assert_eq!(ctx.trail, vec![3, 2, 1, 0]);
        assert_eq!(ctx.traps.depth(id), 0);
        assert_eq!(ctx.traps.info()[0].hits, 4);
        assert!(ctx.traps.is_bound(id));
    }

    #[test]
    fn test_one_shot_refuses_second_entry_and_releases_after_outermost() {
        let mut traps: TrapRegistry<()> = TrapRegistry::new(4);
        let id = traps.setup("once", TrapFlags::ONE_SHOT, |_, _| Ok(())).unwrap();
        traps.checkout(id).unwrap();
        assert_eq!(traps.checkout(id).err(), Some(BridgeError::InvalidTrap(id)));
        // freeing from inside the callback is still allowed
        traps.free(id).unwrap();
        assert_eq!(traps.len(), 1);
        traps.checkin(id);
        assert!(traps.is_empty());
    }

    #[test]
    fn test_callback_error_keeps_binding() {
        let mut traps: TrapRegistry<()> = TrapRegistry::new(4);
        let id = traps
            .setup("fail", TrapFlags::PERSISTENT, |_, _| Err(BridgeError::NoActiveTask))
            .unwrap();
        assert_eq!(traps.trigger(id, 0, &mut ()), Err(BridgeError::NoActiveTask));
        assert!(traps.is_bound(id));
    }
}
