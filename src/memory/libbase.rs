//! Library base jump tables
//!
//! A library base sits between a negative-offset jump table and the
//! positive library structure. Each 6-byte slot at `base - (i+1)*6` holds
//! either `jmp abs.l` to guest code, or a trap opcode followed by `rts`
//! for a host-implemented function.

use super::structure::StructDef;
use crate::error::{BridgeError, BridgeResult};
use crate::trap::{TrapId, opcodes};
use serde::Serialize;
use std::sync::Arc;

/// Bytes per jump table entry
pub const SLOT_SIZE: u32 = 6;

/// Library vector offset of slot `index`
pub fn lvo(index: u16) -> i32 {
    -((index as i32 + 1) * SLOT_SIZE as i32)
}

/// Slot index for a library vector offset
pub fn slot_index(lvo: i32) -> Option<u16> {
    if lvo >= 0 || lvo % SLOT_SIZE as i32 != 0 {
        return None;
    }
    u16::try_from(-lvo / SLOT_SIZE as i32 - 1).ok()
}

/// Decoded contents of one jump table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpSlot {
    /// Host function reached through a trap
    Trap(TrapId),
    /// Native guest routine; left untouched by the bridge
    Jump(u32),
    /// Anything else
    Unset,
}

impl JumpSlot {
    pub fn encode(self) -> [u8; SLOT_SIZE as usize] {
        let mut out = [0u8; SLOT_SIZE as usize];
        match self {
            JumpSlot::Trap(id) => {
                out[0..2].copy_from_slice(&id.opcode().to_be_bytes());
                out[2..4].copy_from_slice(&opcodes::RTS.to_be_bytes());
            }
            JumpSlot::Jump(addr) => {
                out[0..2].copy_from_slice(&opcodes::JMP_ABS_L.to_be_bytes());
                out[2..6].copy_from_slice(&addr.to_be_bytes());
            }
            JumpSlot::Unset => {}
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() < SLOT_SIZE as usize {
            return JumpSlot::Unset;
        }
        let op = u16::from_be_bytes([bytes[0], bytes[1]]);
        if let Some(id) = TrapId::from_opcode(op) {
            return JumpSlot::Trap(id);
        }
        if op == opcodes::JMP_ABS_L {
            return JumpSlot::Jump(u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]));
        }
        JumpSlot::Unset
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            JumpSlot::Trap(_) => SlotKind::Trap,
            JumpSlot::Jump(_) => SlotKind::Jump,
            JumpSlot::Unset => SlotKind::Unknown,
        }
    }
}

/// Slot classification used in trace annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotKind {
    Trap,
    Jump,
    Unknown,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::Trap => write!(f, "TRAP"),
            SlotKind::Jump => write!(f, "JUMP"),
            SlotKind::Unknown => write!(f, "LIB?!"),
        }
    }
}

/// Geometry of a library base region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLayout {
    pub num_slots: u16,
    /// Jump table bytes below the base (4-byte aligned)
    pub neg_size: u32,
    /// Structure bytes at and above the base
    pub pos_size: u32,
    pub structure: Arc<StructDef>,
}

impl LibraryLayout {
    /// `pos_size` grows to at least the structure size
    pub fn new(num_slots: u16, structure: Arc<StructDef>, pos_size: u32) -> BridgeResult<Self> {
        let neg_size = (num_slots as u32 * SLOT_SIZE + 3) & !3;
        let pos_size = pos_size.max(structure.size());
        if neg_size + pos_size > u16::MAX as u32 * 2 {
            return Err(BridgeError::MalformedStructure {
                name: structure.name().to_string(),
                reason: format!("library too large: neg {neg_size} pos {pos_size}"),
            });
        }
        Ok(Self {
            num_slots,
            neg_size,
            pos_size,
            structure,
        })
    }

    pub fn total_size(&self) -> u32 {
        self.neg_size + self.pos_size
    }

    /// Offset of slot `index` from the region start
    pub fn slot_offset(&self, index: u16) -> Option<u32> {
        (index < self.num_slots).then(|| self.neg_size - (index as u32 + 1) * SLOT_SIZE)
    }

    /// Slot covering a byte offset below the base (counted from the base)
    pub fn slot_for_neg_offset(&self, below_base: u32) -> Option<u16> {
        if below_base == 0 || below_base > self.num_slots as u32 * SLOT_SIZE {
            return None;
        }
        u16::try_from((below_base - 1) / SLOT_SIZE).ok()
    }
}
