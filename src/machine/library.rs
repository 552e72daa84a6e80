//! Host-implemented libraries
//!
//! A library is a library-base region: its jump table below the base and
//! a `Library` structure above it. Implemented functions get their own
//! auto-return trap in their slot. Every other slot shares one trap that
//! logs the call and returns 0, so a guest calling an unimplemented
//! function keeps running.

use super::{Machine, Reg};
use crate::error::{BridgeError, BridgeResult};
use crate::memory::libbase::{self, JumpSlot, LibraryLayout};
use crate::memory::structure::{StructDef, layouts};
use crate::memory::{RegionId, RegionKind};
use crate::trap::{TrapCall, TrapFlags, TrapFn, TrapId};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `ln_Type` of a library node
const NT_LIBRARY: u32 = 9;

/// Host implementation of a library function
pub type LibraryFn = TrapFn<Machine>;

struct FunctionDef {
    lvo: i32,
    name: String,
    callback: LibraryFn,
}

/// Description of a library to create
pub struct LibrarySpec {
    pub name: String,
    pub version: u16,
    pub revision: u16,
    pub num_slots: u16,
    /// Positive size; grows to the structure size if smaller
    pub pos_size: u32,
    /// Positive part; must carry the `lib_*` fields. Defaults to `Library`.
    pub structure: Option<Arc<StructDef>>,
    functions: Vec<FunctionDef>,
}

impl std::fmt::Debug for LibrarySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibrarySpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("num_slots", &self.num_slots)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl LibrarySpec {
    pub fn new(name: impl Into<String>, num_slots: u16) -> Self {
        Self {
            name: name.into(),
            version: 0,
            revision: 0,
            num_slots,
            pos_size: 0,
            structure: None,
            functions: Vec::new(),
        }
    }

    pub fn version(mut self, version: u16, revision: u16) -> Self {
        self.version = version;
        self.revision = revision;
        self
    }

    pub fn pos_size(mut self, pos_size: u32) -> Self {
        self.pos_size = pos_size;
        self
    }

    pub fn structure(mut self, def: Arc<StructDef>) -> Self {
        self.structure = Some(def);
        self
    }

    /// Implement the function at library vector offset `lvo`
    pub fn function(
        mut self,
        lvo: i32,
        name: impl Into<String>,
        callback: impl Fn(&mut Machine, &TrapCall) -> BridgeResult<()> + 'static,
    ) -> Self {
        self.functions.push(FunctionDef {
            lvo,
            name: name.into(),
            callback: Rc::new(callback),
        });
        self
    }
}

/// A library living in guest memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub name: String,
    pub region: RegionId,
    /// Library base; LVOs are relative to it
    pub base: u32,
    pub num_slots: u16,
    /// Slot index -> dedicated trap
    traps: Vec<(u16, TrapId)>,
    /// Shared trap of unimplemented slots
    missing: Option<TrapId>,
    name_region: RegionId,
}

impl Library {
    /// Address a guest `jsr`s to for `lvo`
    pub fn lvo_addr(&self, lvo: i32) -> u32 {
        self.base.wrapping_add(lvo as u32)
    }

    pub fn trap_for(&self, lvo: i32) -> Option<TrapId> {
        let index = libbase::slot_index(lvo)?;
        self.traps.iter().find(|(i, _)| *i == index).map(|(_, t)| *t)
    }

    fn all_traps(&self) -> impl Iterator<Item = TrapId> + '_ {
        self.traps.iter().map(|(_, t)| *t).chain(self.missing)
    }
}

impl Machine {
    /// Allocate a library base, bind its jump table and fill its header
    pub fn create_library(&mut self, spec: LibrarySpec) -> BridgeResult<Library> {
        let LibrarySpec {
            name,
            version,
            revision,
            num_slots,
            pos_size,
            structure,
            functions,
        } = spec;
        let structure = match structure {
            Some(def) => def,
            None => Arc::new(layouts::library()?),
        };
        let layout = LibraryLayout::new(num_slots, structure, pos_size)?;
        let (neg_size, pos_size) = (layout.neg_size, layout.pos_size);

        let mut indexed: Vec<(u16, FunctionDef)> = Vec::with_capacity(functions.len());
        for f in functions {
            let index = libbase::slot_index(f.lvo)
                .filter(|i| *i < num_slots)
                .ok_or_else(|| BridgeError::MalformedStructure {
                    name: name.clone(),
                    reason: format!("function '{}' at invalid LVO {}", f.name, f.lvo),
                })?;
            if let Some((_, first)) = indexed.iter().find(|(i, _)| *i == index) {
                return Err(BridgeError::MalformedStructure {
                    name: name.clone(),
                    reason: format!("functions '{}' and '{}' share LVO {}", first.name, f.name, f.lvo),
                });
            }
            indexed.push((index, f));
        }

        let region = self.alloc_region(&name, layout.total_size(), RegionKind::LibraryBase(layout))?;
        let mut lib = Library {
            name: name.clone(),
            region,
            base: self.region_start(region)? + neg_size,
            num_slots,
            traps: Vec::new(),
            missing: None,
            name_region: RegionId::NULL,
        };
        match self.fill_library(&mut lib, indexed, version, revision, neg_size, pos_size) {
            Ok(()) => {
                info!(
                    "library '{name}' v{version}.{revision} base @{:06x}: {} slots, {} implemented",
                    lib.base,
                    num_slots,
                    lib.traps.len()
                );
                Ok(lib)
            }
            Err(e) => {
                warn!("library '{name}' setup failed: {e}");
                self.release_library(&lib);
                Err(e)
            }
        }
    }

    fn fill_library(
        &mut self,
        lib: &mut Library,
        functions: Vec<(u16, FunctionDef)>,
        version: u16,
        revision: u16,
        neg_size: u32,
        pos_size: u32,
    ) -> BridgeResult<()> {
        let name_len = lib.name.len() as u32 + 1;
        lib.name_region = self.alloc_region(&format!("{}:name", lib.name), name_len, RegionKind::Flat)?;
        let name_addr = self.region_start(lib.name_region)?;
        self.mem.write_cstring(name_addr, &lib.name)?;

        let region = lib.region;
        self.mem.write_field(region, "lib_Node.ln_Type", NT_LIBRARY)?;
        self.mem.write_field(region, "lib_Node.ln_Name", name_addr)?;
        self.mem.write_field(region, "lib_NegSize", neg_size)?;
        self.mem.write_field(region, "lib_PosSize", pos_size)?;
        self.mem.write_field(region, "lib_Version", version as u32)?;
        self.mem.write_field(region, "lib_Revision", revision as u32)?;

        for (index, f) in functions {
            let id = self.traps.setup_shared(
                format!("{}.{}", lib.name, f.name),
                TrapFlags::AUTO_RETURN,
                f.callback,
            )?;
            lib.traps.push((index, id));
            self.mem.set_jump_slot(region, index, JumpSlot::Trap(id))?;
            debug!("{}: {} @ LVO {} -> {id}", lib.name, f.name, libbase::lvo(index));
        }

        if (lib.traps.len() as u16) < lib.num_slots {
            let id = self.unimplemented_trap(&lib.name, lib.base)?;
            lib.missing = Some(id);
            for index in 0..lib.num_slots {
                if lib.traps.iter().all(|(i, _)| *i != index) {
                    self.mem.set_jump_slot(region, index, JumpSlot::Trap(id))?;
                }
            }
        }
        Ok(())
    }

    fn unimplemented_trap(&mut self, lib_name: &str, base: u32) -> BridgeResult<TrapId> {
        let lib_name = lib_name.to_string();
        self.traps.setup(
            format!("{lib_name}.unimplemented"),
            TrapFlags::AUTO_RETURN,
            move |m: &mut Machine, call: &TrapCall| {
                // the trap opcode sits at the start of its slot
                let lvo = call.pc.wrapping_sub(base) as i32;
                warn!("{lib_name}: unimplemented function at LVO {lvo}, returning 0");
                m.set_reg(Reg::D0, 0);
                Ok(())
            },
        )
    }

    /// Point a slot at guest code. The bridge leaves jump slots alone.
    pub fn set_native_vector(&mut self, lib: &mut Library, lvo: i32, addr: u32) -> BridgeResult<()> {
        let index = libbase::slot_index(lvo)
            .filter(|i| *i < lib.num_slots)
            .ok_or_else(|| BridgeError::MalformedStructure {
                name: lib.name.clone(),
                reason: format!("invalid LVO {lvo}"),
            })?;
        if let Some(pos) = lib.traps.iter().position(|(i, _)| *i == index) {
            let (_, id) = lib.traps.remove(pos);
            self.traps.free(id)?;
        }
        self.mem.set_jump_slot(lib.region, index, JumpSlot::Jump(addr))
    }

    /// Release a library's traps and memory
    pub fn free_library(&mut self, lib: Library) -> BridgeResult<()> {
        let mut first_err = None;
        for id in lib.all_traps() {
            if let Err(e) = self.traps.free(id) {
                first_err.get_or_insert(e);
            }
        }
        self.free_region(lib.region)?;
        self.free_region(lib.name_region)?;
        debug!("freed library '{}'", lib.name);
        first_err.map_or(Ok(()), Err)
    }

    /// Best-effort cleanup of a partially built library
    fn release_library(&mut self, lib: &Library) {
        for id in lib.all_traps() {
            if let Err(e) = self.traps.free(id) {
                warn!("{}: rollback: {e}", lib.name);
            }
        }
        for region in [lib.region, lib.name_region] {
            if region != RegionId::NULL
                && let Err(e) = self.free_region(region)
            {
                warn!("{}: rollback: {e}", lib.name);
            }
        }
    }
}
