//! Trampolines
//!
//! Short guest code sequences synthesized by host code: load registers,
//! call a guest routine, call back into the host through embedded traps,
//! and finally return and clean up after themselves.
//!
//! A [`Trampoline`] is append-only until [`Trampoline::finalize`], which
//! allocates one backing region, binds every embedded trap, patches the
//! opcodes and resolves labels. Cleanups, backing memory and trap bindings
//! are then released together, once, by whichever comes first: the
//! final-return trap, an explicit [`Machine::release_trampoline`], or
//! [`Machine::shutdown`].

use super::opcodes;
use super::{TrapCall, TrapFlags, TrapFn, TrapId};
use crate::error::{BridgeError, BridgeResult};
use crate::machine::Machine;
use crate::memory::{RegionId, RegionKind};
use std::rc::Rc;
use tracing::{debug, warn};

/// Callback for a trap embedded in a trampoline
pub type EmbeddedFn = TrapFn<Machine>;

/// Host cleanup run once when the trampoline is released
pub type CleanupFn = Box<dyn FnOnce(&mut Machine) -> BridgeResult<()>>;

/// Machine-wide trampoline handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrampolineId(pub u64);

impl std::fmt::Display for TrampolineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trampoline({})", self.0)
    }
}

/// Code position, resolved to an address at finalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Offset into the trampoline's data area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRef(u32);

#[derive(Debug, Clone, Copy)]
enum Item {
    Word(u16),
    Long(u32),
    DataAddr(DataRef),
    LabelAddr(Label),
    Trap(usize),
    FinalTrap,
}

impl Item {
    fn size(&self) -> u32 {
        match self {
            Item::Word(_) | Item::Trap(_) | Item::FinalTrap => 2,
            Item::Long(_) | Item::DataAddr(_) | Item::LabelAddr(_) => 4,
        }
    }
}

struct Embedded {
    name: String,
    flags: TrapFlags,
    callback: EmbeddedFn,
}

/// Trampoline under construction
pub struct Trampoline {
    name: String,
    code: Vec<Item>,
    code_size: u32,
    data: Vec<u8>,
    /// Code offset per label, None until marked
    labels: Vec<Option<u32>>,
    traps: Vec<Embedded>,
    cleanups: Vec<CleanupFn>,
    has_final: bool,
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("name", &self.name)
            .field("code_size", &self.code_size)
            .field("data_size", &self.data.len())
            .field("traps", &self.traps.len())
            .field("final_return", &self.has_final)
            .finish()
    }
}

impl Trampoline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            code_size: 0,
            data: Vec::new(),
            labels: Vec::new(),
            traps: Vec::new(),
            cleanups: Vec::new(),
            has_final: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current code offset
    pub fn code_offset(&self) -> u32 {
        self.code_size
    }

    fn push(&mut self, item: Item) {
        self.code_size += item.size();
        self.code.push(item);
    }

    // ========== Raw emission ==========

    pub fn emit_word(&mut self, word: u16) {
        self.push(Item::Word(word));
    }

    pub fn emit_long(&mut self, long: u32) {
        self.push(Item::Long(long));
    }

    /// Reserve a data long initialised to `value`
    pub fn dc_l(&mut self, value: u32) -> DataRef {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        let at = DataRef(self.data.len() as u32);
        self.data.extend_from_slice(&value.to_be_bytes());
        at
    }

    /// Append raw data bytes (word aligned)
    pub fn data_bytes(&mut self, bytes: &[u8]) -> DataRef {
        if self.data.len() % 2 != 0 {
            self.data.push(0);
        }
        let at = DataRef(self.data.len() as u32);
        self.data.extend_from_slice(bytes);
        at
    }

    // ========== Labels ==========

    /// Label to be marked later
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current code offset
    pub fn mark(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.code_size);
        }
    }

    /// Label at the current code offset
    pub fn label_here(&mut self) -> Label {
        let label = self.new_label();
        self.mark(label);
        label
    }

    // ========== Instructions ==========

    pub fn nop(&mut self) {
        self.emit_word(opcodes::NOP);
    }

    pub fn rts(&mut self) {
        self.emit_word(opcodes::RTS);
    }

    pub fn set_dx_l(&mut self, n: u8, value: u32) {
        self.emit_word(opcodes::move_l_imm_dn(n));
        self.emit_long(value);
    }

    pub fn set_ax_l(&mut self, n: u8, value: u32) {
        self.emit_word(opcodes::movea_l_imm_an(n));
        self.emit_long(value);
    }

    /// `movea.l #data,An`
    pub fn set_ax_data(&mut self, n: u8, data: DataRef) {
        self.emit_word(opcodes::movea_l_imm_an(n));
        self.push(Item::DataAddr(data));
    }

    /// Store An into a data long
    pub fn write_ax_l(&mut self, n: u8, data: DataRef) {
        self.emit_word(opcodes::move_l_an_abs(n));
        self.push(Item::DataAddr(data));
    }

    pub fn write_dx_l(&mut self, n: u8, data: DataRef) {
        self.emit_word(opcodes::move_l_dn_abs(n));
        self.push(Item::DataAddr(data));
    }

    /// Load An from a data long
    pub fn read_ax_l(&mut self, n: u8, data: DataRef) {
        self.emit_word(opcodes::movea_l_abs_an(n));
        self.push(Item::DataAddr(data));
    }

    pub fn read_dx_l(&mut self, n: u8, data: DataRef) {
        self.emit_word(opcodes::move_l_abs_dn(n));
        self.push(Item::DataAddr(data));
    }

    /// `movem.l d1-d7/a0-a6,-(sp)`
    pub fn save_all_but_d0(&mut self) {
        self.emit_word(opcodes::MOVEM_L_TO_SP);
        self.emit_word(opcodes::predecrement_mask(opcodes::MASK_ALL_BUT_D0));
    }

    /// `movem.l (sp)+,d1-d7/a0-a6`
    pub fn restore_all_but_d0(&mut self) {
        self.emit_word(opcodes::MOVEM_L_FROM_SP);
        self.emit_word(opcodes::MASK_ALL_BUT_D0);
    }

    pub fn jsr(&mut self, addr: u32) {
        self.emit_word(opcodes::JSR_ABS_L);
        self.emit_long(addr);
    }

    pub fn jmp(&mut self, addr: u32) {
        self.emit_word(opcodes::JMP_ABS_L);
        self.emit_long(addr);
    }

    pub fn jsr_label(&mut self, label: Label) {
        self.emit_word(opcodes::JSR_ABS_L);
        self.push(Item::LabelAddr(label));
    }

    pub fn jmp_label(&mut self, label: Label) {
        self.emit_word(opcodes::JMP_ABS_L);
        self.push(Item::LabelAddr(label));
    }

    // ========== Traps ==========

    /// Embed a host call-out; execution continues after it
    pub fn trap(
        &mut self,
        name: impl Into<String>,
        callback: impl Fn(&mut Machine, &TrapCall) -> BridgeResult<()> + 'static,
    ) {
        self.embed(name.into(), TrapFlags::PERSISTENT, Rc::new(callback));
    }

    /// Embed a host call-out that returns like `rts` afterwards
    pub fn trap_returning(
        &mut self,
        name: impl Into<String>,
        callback: impl Fn(&mut Machine, &TrapCall) -> BridgeResult<()> + 'static,
    ) {
        self.embed(name.into(), TrapFlags::AUTO_RETURN, Rc::new(callback));
    }

    fn embed(&mut self, name: String, flags: TrapFlags, callback: EmbeddedFn) {
        self.traps.push(Embedded {
            name,
            flags,
            callback,
        });
        self.push(Item::Trap(self.traps.len() - 1));
    }

    /// Emit the final return.
    ///
    /// When reached, `cleanup` runs first, then the trampoline's memory and
    /// traps are released, then control returns to the address on the
    /// stack. Several exits may share the one final trap; their cleanups
    /// run in emission order. A trampoline released before reaching it
    /// still runs its cleanups, once.
    pub fn final_return(
        &mut self,
        cleanup: impl FnOnce(&mut Machine) -> BridgeResult<()> + 'static,
    ) {
        self.cleanups.push(Box::new(cleanup));
        self.has_final = true;
        self.push(Item::FinalTrap);
    }

    // ========== Finalize ==========

    /// Allocate, bind and write the trampoline into guest memory
    pub fn finalize(self, machine: &mut Machine) -> BridgeResult<FinalizedTrampoline> {
        let Trampoline {
            name,
            code,
            code_size,
            data,
            labels,
            traps,
            cleanups,
            has_final,
        } = self;

        let label_offsets = labels
            .iter()
            .enumerate()
            .map(|(i, l)| {
                l.ok_or_else(|| BridgeError::MalformedStructure {
                    name: name.clone(),
                    reason: format!("label {i} never marked"),
                })
            })
            .collect::<BridgeResult<Vec<u32>>>()?;

        if code_size == 0 {
            return Err(BridgeError::MalformedStructure {
                name,
                reason: "empty trampoline".into(),
            });
        }

        let data_offset = (code_size + 3) & !3;
        let total = data_offset + data.len() as u32;
        let id = machine.next_trampoline_id();

        let region = machine.alloc_region(&format!("tramp:{name}"), total, RegionKind::Flat)?;
        let start = machine.mem().region_info(region).map(|r| r.start).unwrap_or_default();

        // bind traps, undoing everything on failure
        let mut bound: Vec<TrapId> = Vec::with_capacity(traps.len() + 1);
        let bind_all = |machine: &mut Machine| -> BridgeResult<Option<TrapId>> {
            for t in traps {
                let id = machine
                    .traps_mut()
                    .setup_shared(format!("{name}.{}", t.name), t.flags, t.callback)?;
                bound.push(id);
            }
            if !has_final {
                return Ok(None);
            }
            let final_id = machine.traps_mut().setup(
                format!("{name}.final"),
                TrapFlags::ONE_SHOT_RETURN,
                move |m: &mut Machine, _call: &TrapCall| m.release_trampoline(id),
            )?;
            Ok(Some(final_id))
        };
        let final_trap = match bind_all(machine) {
            Ok(final_trap) => final_trap,
            Err(e) => {
                for trap in &bound {
                    if let Err(free_err) = machine.traps_mut().free(*trap) {
                        warn!("{id} '{name}': rollback: {free_err}");
                    }
                }
                machine.free_region(region)?;
                return Err(e);
            }
        };

        let resolve_trap = |idx: usize| bound.get(idx).copied();
        let mut bytes = Vec::with_capacity(total as usize);
        for item in &code {
            match *item {
                Item::Word(w) => bytes.extend_from_slice(&w.to_be_bytes()),
                Item::Long(l) => bytes.extend_from_slice(&l.to_be_bytes()),
                Item::DataAddr(DataRef(off)) => {
                    bytes.extend_from_slice(&(start + data_offset + off).to_be_bytes())
                }
                Item::LabelAddr(Label(i)) => {
                    let addr = label_offsets.get(i).map_or(start, |off| start + off);
                    bytes.extend_from_slice(&addr.to_be_bytes())
                }
                Item::Trap(idx) => {
                    let op = resolve_trap(idx).map_or(opcodes::RESET, |t| t.opcode());
                    bytes.extend_from_slice(&op.to_be_bytes());
                }
                Item::FinalTrap => {
                    let op = final_trap.map_or(opcodes::RESET, |t| t.opcode());
                    bytes.extend_from_slice(&op.to_be_bytes());
                }
            }
        }
        bytes.resize(data_offset as usize, 0);
        bytes.extend_from_slice(&data);
        machine.mem().write_block(start, &bytes)?;

        let mut traps = bound.clone();
        traps.extend(final_trap);
        machine.register_trampoline(TrampolineRecord {
            id,
            name: name.clone(),
            region,
            start,
            traps,
            cleanups,
        });
        debug!(
            "{id} '{name}' @{start:06x}: {code_size} code + {} data bytes, {} trap(s)",
            data.len(),
            bound.len() + final_trap.is_some() as usize
        );

        Ok(FinalizedTrampoline {
            id,
            name,
            code_addr: start,
            data_addr: start + data_offset,
            size: total,
            labels: label_offsets.iter().map(|off| start + off).collect(),
        })
    }
}

/// Book-keeping the machine keeps per live trampoline; dropped on release
pub struct TrampolineRecord {
    pub id: TrampolineId,
    pub name: String,
    pub region: RegionId,
    pub start: u32,
    /// Embedded traps plus the final trap
    pub traps: Vec<TrapId>,
    /// Run once on release, in emission order
    pub cleanups: Vec<CleanupFn>,
}

impl std::fmt::Debug for TrampolineRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("start", &self.start)
            .field("traps", &self.traps)
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}

/// A trampoline living in guest memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTrampoline {
    pub id: TrampolineId,
    pub name: String,
    /// Entry point
    pub code_addr: u32,
    pub data_addr: u32,
    pub size: u32,
    labels: Vec<u32>,
}

impl FinalizedTrampoline {
    pub fn label_addr(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0).copied()
    }

    pub fn data_ref_addr(&self, data: DataRef) -> u32 {
        self.data_addr + data.0
    }
}
