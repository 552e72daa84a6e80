//! Guest Address Space
//!
//! The region registry: a set of disjoint named regions that together form
//! the memory the emulated processor sees. Every read and write, from the
//! CPU core or from host library code, goes through [`AddressSpace`].
//!
//! Design principles:
//! - Regions never overlap; every address resolves to at most one region
//! - Guest faults never crash the host: unmapped word/long accesses are
//!   recorded and read as zero
//! - Block operations are host-side and strict: they fail on anything
//!   that is not a plain byte buffer
//! - All state is inspectable through an optional observer

pub mod alloc;
pub mod libbase;
pub mod region;
pub mod structure;
pub mod trace;

pub use alloc::{Allocator, FirstFitAllocator};
pub use libbase::{JumpSlot, LibraryLayout, SlotKind};
pub use region::{Region, RegionKind};
pub use structure::{FieldDescriptor, StructDef, ValueConversion};
pub use trace::{TraceCategory, TraceEvent, Tracer};

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

/// Handle to a registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(pub u64);

impl RegionId {
    pub const NULL: RegionId = RegionId(0);
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Region({})", self.0)
    }
}

/// Access width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Long => 4,
        }
    }

    /// Trace code: 0, 1, 2
    pub fn code(self) -> u8 {
        match self {
            Width::Byte => 0,
            Width::Word => 1,
            Width::Long => 2,
        }
    }

    pub fn from_bytes(bytes: u32) -> Option<Width> {
        match bytes {
            1 => Some(Width::Byte),
            2 => Some(Width::Word),
            4 => Some(Width::Long),
            _ => None,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Long => 0xFFFF_FFFF,
        }
    }
}

impl std::fmt::Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Access direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessMode {
    Read,
    Write,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "R"),
            AccessMode::Write => write!(f, "W"),
        }
    }
}

/// What a traced access touched inside a typed region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Annotation {
    Field {
        structure: String,
        field: String,
        field_offset: u32,
        delta: u32,
        width: u32,
    },
    JumpSlot {
        index: u16,
        lvo: i32,
        delta: u32,
        kind: SlotKind,
    },
}

impl std::fmt::Display for Annotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Annotation::Field {
                structure,
                field,
                delta,
                width,
                ..
            } => write!(f, "{structure}.{field}+{delta} ({width})"),
            Annotation::JumpSlot {
                lvo, delta, kind, ..
            } => write!(f, "{kind} {lvo}+{delta}"),
        }
    }
}

/// One observed access
#[derive(Debug, Clone)]
pub struct MemAccess<'a> {
    pub mode: AccessMode,
    pub width: Width,
    pub addr: u32,
    pub value: u32,
    /// Owning region name; None for invalid accesses
    pub region: Option<&'a str>,
    pub annotation: Option<Annotation>,
}

/// Receives every read and write
pub trait MemoryObserver {
    fn on_access(&mut self, access: &MemAccess<'_>);

    /// A busy observer gets its accesses later, in order
    fn is_busy(&self) -> bool {
        false
    }
}

impl<T: MemoryObserver> MemoryObserver for Rc<RefCell<T>> {
    fn on_access(&mut self, access: &MemAccess<'_>) {
        match self.try_borrow_mut() {
            Ok(mut inner) => inner.on_access(access),
            Err(_) => warn!("memory observer busy, dropped access @{:06x}", access.addr),
        }
    }

    fn is_busy(&self) -> bool {
        self.try_borrow_mut().is_err()
    }
}

/// An access held back until the observer is free
#[derive(Debug, Clone)]
struct HeldAccess {
    mode: AccessMode,
    width: Width,
    addr: u32,
    value: u32,
    region: Option<String>,
    annotation: Option<Annotation>,
}

impl HeldAccess {
    fn of(access: &MemAccess<'_>) -> Self {
        Self {
            mode: access.mode,
            width: access.width,
            addr: access.addr,
            value: access.value,
            region: access.region.map(str::to_string),
            annotation: access.annotation.clone(),
        }
    }

    fn as_access(&self) -> MemAccess<'_> {
        MemAccess {
            mode: self.mode,
            width: self.width,
            addr: self.addr,
            value: self.value,
            region: self.region.as_deref(),
            annotation: self.annotation.clone(),
        }
    }
}

/// A recorded access to unmapped memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidAccess {
    pub mode: AccessMode,
    pub width: Width,
    pub addr: u32,
    /// Value written, or 0 for reads
    pub value: u32,
}

/// Region metadata snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub name: String,
    pub start: u32,
    pub size: u32,
    /// Structure origin (library base for library regions)
    pub origin: u32,
    pub kind: &'static str,
}

impl RegionInfo {
    fn of(region: &Region) -> Self {
        Self {
            id: region.id(),
            name: region.name().to_string(),
            start: region.start(),
            size: region.size(),
            origin: region.origin(),
            kind: region.kind().label(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    regions: HashMap<RegionId, Region>,
    /// start address -> region
    by_start: BTreeMap<u32, RegionId>,
    next_id: u64,
    invalid_total: u64,
    invalid_log: VecDeque<InvalidAccess>,
    invalid_log_limit: usize,
}

impl Registry {
    fn region_at(&self, addr: u32) -> Option<&Region> {
        let (_, id) = self.by_start.range(..=addr).next_back()?;
        self.regions.get(id).filter(|r| r.contains(addr))
    }

    fn region_at_mut(&mut self, addr: u32) -> Option<&mut Region> {
        let (_, id) = self.by_start.range(..=addr).next_back()?;
        self.regions.get_mut(id).filter(|r| r.contains(addr))
    }

    /// Region covering the whole span or a reason why not
    fn locate(&self, addr: u32, len: u32) -> Result<&Region, &'static str> {
        let region = self.region_at(addr).ok_or("unmapped")?;
        if region.covers(addr, len) {
            Ok(region)
        } else {
            Err("crosses region end")
        }
    }

    fn record_invalid(&mut self, access: InvalidAccess, reason: &str) {
        self.invalid_total += 1;
        warn!(
            "invalid memory access {}({}) @{:06x} = {:08x}: {reason}",
            access.mode, access.width, access.addr, access.value
        );
        if self.invalid_log_limit > 0 {
            if self.invalid_log.len() >= self.invalid_log_limit {
                self.invalid_log.pop_front();
            }
            self.invalid_log.push_back(access);
        }
    }

    fn overlapping(&self, start: u32, end: u64) -> Option<&Region> {
        // predecessor reaching into the new range
        if let Some((_, id)) = self.by_start.range(..=start).next_back()
            && let Some(r) = self.regions.get(id)
            && r.end() > start as u64
        {
            return Some(r);
        }
        // successor starting inside the new range
        let (_, id) = self.by_start.range(start..).next()?;
        self.regions
            .get(id)
            .filter(|r| (r.start() as u64) < end)
    }
}

/// Shared handle to the guest address space.
///
/// Cloning is cheap and every clone sees the same regions. Access methods
/// take `&self`; the registry is borrowed only for the duration of one
/// operation.
#[derive(Clone)]
pub struct AddressSpace {
    inner: Rc<RefCell<Registry>>,
    observer: Rc<RefCell<Option<Box<dyn MemoryObserver>>>>,
    /// Accesses made while the observer was busy
    held: Rc<RefCell<VecDeque<HeldAccess>>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("regions", &self.regions())
            .field("invalid_accesses", &self.invalid_count())
            .finish()
    }
}

impl AddressSpace {
    /// Empty address space keeping the last `invalid_log_limit` invalid accesses
    pub fn new(invalid_log_limit: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Registry {
                next_id: 1,
                invalid_log_limit,
                ..Default::default()
            })),
            observer: Rc::new(RefCell::new(None)),
            held: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    // ========== Region registry ==========

    /// Add a region. Fails with `Overlap` and leaves the registry
    /// unchanged if any byte of it is already mapped.
    pub fn register(&self, mut region: Region) -> BridgeResult<RegionId> {
        let mut reg = self.inner.borrow_mut();
        if let Some(other) = reg.overlapping(region.start(), region.end()) {
            return Err(BridgeError::Overlap {
                name: region.name().to_string(),
                base: region.start(),
                end: region.end().min(u32::MAX as u64) as u32,
                other: other.name().to_string(),
            });
        }
        let id = RegionId(reg.next_id);
        reg.next_id += 1;
        region.id = id;
        debug!(
            "map {} [{:06x}, {:06x}) {} as {id}",
            region.name(),
            region.start(),
            region.end(),
            region.kind().label()
        );
        reg.by_start.insert(region.start(), id);
        reg.regions.insert(id, region);
        Ok(id)
    }

    /// Remove a region; its range becomes unmapped
    pub fn unregister(&self, id: RegionId) -> BridgeResult<Region> {
        let mut reg = self.inner.borrow_mut();
        let region = reg.regions.remove(&id).ok_or(BridgeError::InvalidRegion(id))?;
        reg.by_start.remove(&region.start());
        debug!("unmap {} [{:06x}, {:06x})", region.name(), region.start(), region.end());
        Ok(region)
    }

    /// Region owning `addr`
    pub fn resolve(&self, addr: u32) -> Option<RegionId> {
        self.inner.borrow().region_at(addr).map(|r| r.id())
    }

    pub fn region_info(&self, id: RegionId) -> Option<RegionInfo> {
        self.inner.borrow().regions.get(&id).map(RegionInfo::of)
    }

    /// All regions ordered by start address
    pub fn regions(&self) -> Vec<RegionInfo> {
        let reg = self.inner.borrow();
        reg.by_start
            .values()
            .filter_map(|id| reg.regions.get(id))
            .map(RegionInfo::of)
            .collect()
    }

    pub fn num_regions(&self) -> usize {
        self.inner.borrow().regions.len()
    }

    /// Run `f` against a registered region
    pub fn with_region<R>(&self, id: RegionId, f: impl FnOnce(&Region) -> R) -> BridgeResult<R> {
        let reg = self.inner.borrow();
        reg.regions.get(&id).map(f).ok_or(BridgeError::InvalidRegion(id))
    }

    pub fn with_region_mut<R>(
        &self,
        id: RegionId,
        f: impl FnOnce(&mut Region) -> R,
    ) -> BridgeResult<R> {
        let mut reg = self.inner.borrow_mut();
        reg.regions
            .get_mut(&id)
            .map(f)
            .ok_or(BridgeError::InvalidRegion(id))
    }

    /// Allocate a range and register a region over it
    pub fn alloc_region(
        &self,
        alloc: &mut dyn Allocator,
        name: &str,
        size: u32,
        kind: RegionKind,
    ) -> BridgeResult<RegionId> {
        let addr = alloc.alloc(size, name)?;
        let registered = Region::new(name, addr, size, kind).and_then(|r| self.register(r));
        if registered.is_err() {
            alloc.free(addr)?;
        }
        registered
    }

    /// Unregister a region and return its range to the allocator
    pub fn free_region(&self, alloc: &mut dyn Allocator, id: RegionId) -> BridgeResult<()> {
        let region = self.unregister(id)?;
        alloc.free(region.start())?;
        Ok(())
    }

    // ========== Word/long access (guest path) ==========

    fn observing(&self) -> bool {
        // mutably borrowed only while an observer is being called
        self.observer.try_borrow().map(|o| o.is_some()).unwrap_or(true)
    }

    fn notify(&self, access: MemAccess<'_>) {
        let Ok(mut slot) = self.observer.try_borrow_mut() else {
            // the observer itself touched memory; deliver once it returns
            self.held.borrow_mut().push_back(HeldAccess::of(&access));
            return;
        };
        let Some(observer) = slot.as_mut() else {
            return;
        };
        if observer.is_busy() || !self.held.borrow().is_empty() {
            self.held.borrow_mut().push_back(HeldAccess::of(&access));
        } else {
            observer.on_access(&access);
        }
        self.deliver_held(observer);
    }

    fn deliver_held(&self, observer: &mut Box<dyn MemoryObserver>) {
        while !observer.is_busy() {
            let Some(next) = self.held.borrow_mut().pop_front() else {
                break;
            };
            observer.on_access(&next.as_access());
        }
    }

    /// Accesses waiting for a busy observer
    pub fn held_accesses(&self) -> usize {
        self.held.borrow().len()
    }

    /// Read; unmapped addresses are recorded and read as 0
    pub fn read(&self, width: Width, addr: u32) -> u32 {
        let observing = self.observing();
        let located = {
            let reg = self.inner.borrow();
            reg.locate(addr, width.bytes()).map(|region| {
                let seen = observing.then(|| (region.name().to_string(), region.annotate(addr)));
                (region.read(addr, width), seen)
            })
        };
        match located {
            Ok((value, seen)) => {
                if let Some((name, annotation)) = seen {
                    self.notify(MemAccess {
                        mode: AccessMode::Read,
                        width,
                        addr,
                        value,
                        region: Some(&name),
                        annotation,
                    });
                }
                value
            }
            Err(reason) => {
                self.fault(AccessMode::Read, width, addr, 0, reason, observing);
                0
            }
        }
    }

    /// Write; unmapped addresses are recorded and the write dropped
    pub fn write(&self, width: Width, addr: u32, value: u32) {
        let value = value & width.mask();
        let observing = self.observing();
        let located = {
            let mut reg = self.inner.borrow_mut();
            match reg.region_at_mut(addr) {
                Some(region) if region.covers(addr, width.bytes()) => {
                    region.write(addr, width, value);
                    Ok(observing.then(|| (region.name().to_string(), region.annotate(addr))))
                }
                Some(_) => Err("crosses region end"),
                None => Err("unmapped"),
            }
        };
        match located {
            Ok(Some((name, annotation))) => self.notify(MemAccess {
                mode: AccessMode::Write,
                width,
                addr,
                value,
                region: Some(&name),
                annotation,
            }),
            Ok(None) => {}
            Err(reason) => self.fault(AccessMode::Write, width, addr, value, reason, observing),
        }
    }

    fn fault(
        &self,
        mode: AccessMode,
        width: Width,
        addr: u32,
        value: u32,
        reason: &str,
        observing: bool,
    ) {
        self.inner.borrow_mut().record_invalid(
            InvalidAccess {
                mode,
                width,
                addr,
                value,
            },
            reason,
        );
        if observing {
            self.notify(MemAccess {
                mode,
                width,
                addr,
                value,
                region: None,
                annotation: None,
            });
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        self.read(Width::Byte, addr) as u8
    }

    pub fn read16(&self, addr: u32) -> u16 {
        self.read(Width::Word, addr) as u16
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.read(Width::Long, addr)
    }

    pub fn write8(&self, addr: u32, value: u8) {
        self.write(Width::Byte, addr, value as u32)
    }

    pub fn write16(&self, addr: u32, value: u16) {
        self.write(Width::Word, addr, value as u32)
    }

    pub fn write32(&self, addr: u32, value: u32) {
        self.write(Width::Long, addr, value)
    }

    // ========== Block access (host path) ==========

    fn block_error(mode: AccessMode, addr: u32, reason: &'static str) -> BridgeError {
        BridgeError::InvalidMemoryAccess {
            mode,
            width: Width::Byte,
            addr,
            reason,
        }
    }

    pub fn read_block(&self, addr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let reg = self.inner.borrow();
        let region = reg
            .locate(addr, len)
            .map_err(|reason| Self::block_error(AccessMode::Read, addr, reason))?;
        if !region.is_byte_addressable() {
            return Err(Self::block_error(AccessMode::Read, addr, "not a flat region"));
        }
        Ok(region.bytes(addr, len).to_vec())
    }

    pub fn write_block(&self, addr: u32, data: &[u8]) -> BridgeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(data.len())
            .map_err(|_| Self::block_error(AccessMode::Write, addr, "block too large"))?;
        let mut reg = self.inner.borrow_mut();
        let region = reg
            .region_at_mut(addr)
            .ok_or_else(|| Self::block_error(AccessMode::Write, addr, "unmapped"))?;
        if !region.covers(addr, len) {
            return Err(Self::block_error(AccessMode::Write, addr, "crosses region end"));
        }
        if !region.is_byte_addressable() {
            return Err(Self::block_error(AccessMode::Write, addr, "not a flat region"));
        }
        region.bytes_mut(addr, len).copy_from_slice(data);
        Ok(())
    }

    /// Fill `[addr, addr+len)` with `value`
    pub fn clear_block(&self, addr: u32, len: u32, value: u8) -> BridgeResult<()> {
        self.write_block(addr, &vec![value; len as usize])
    }

    /// NUL-terminated string; the terminator must lie in the same region
    pub fn read_cstring(&self, addr: u32) -> BridgeResult<String> {
        let reg = self.inner.borrow();
        let region = reg
            .region_at(addr)
            .ok_or_else(|| Self::block_error(AccessMode::Read, addr, "unmapped"))?;
        if !region.is_byte_addressable() {
            return Err(Self::block_error(AccessMode::Read, addr, "not a flat region"));
        }
        let tail = region.tail(addr);
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Self::block_error(AccessMode::Read, addr, "unterminated string"))?;
        // Latin-1 to UTF-8
        Ok(tail[..nul].iter().map(|&b| b as char).collect())
    }

    /// Write `s` plus terminator; returns bytes written
    pub fn write_cstring(&self, addr: u32, s: &str) -> BridgeResult<u32> {
        let mut bytes: Vec<u8> = s
            .chars()
            .map(|c| u8::try_from(c as u32).unwrap_or(b'?'))
            .collect();
        bytes.push(0);
        self.write_block(addr, &bytes)?;
        Ok(bytes.len() as u32)
    }

    // ========== Structured access ==========

    /// Absolute address and scalar width of a named field
    pub fn field_location(&self, id: RegionId, field: &str) -> BridgeResult<(u32, Width)> {
        self.with_region(id, |region| {
            let def = region.structure().ok_or_else(|| BridgeError::UnknownField {
                structure: region.name().to_string(),
                field: field.to_string(),
            })?;
            let desc = def.field(field).ok_or_else(|| BridgeError::UnknownField {
                structure: def.name().to_string(),
                field: field.to_string(),
            })?;
            let width = desc.access_width().ok_or_else(|| BridgeError::MalformedStructure {
                name: def.name().to_string(),
                reason: format!("field '{field}' is {} bytes, not a scalar", desc.width),
            })?;
            Ok((region.origin() + desc.offset, width))
        })?
    }

    /// Read a named field through the traced path
    pub fn read_field(&self, id: RegionId, field: &str) -> BridgeResult<u32> {
        let (addr, width) = self.field_location(id, field)?;
        Ok(self.read(width, addr))
    }

    pub fn write_field(&self, id: RegionId, field: &str, value: u32) -> BridgeResult<()> {
        let (addr, width) = self.field_location(id, field)?;
        self.write(width, addr, value);
        Ok(())
    }

    /// Read a named field and apply its value conversion
    pub fn read_field_converted(&self, id: RegionId, field: &str) -> BridgeResult<i64> {
        let raw = self.read_field(id, field)?;
        self.with_region(id, |region| {
            let desc = region.structure().and_then(|def| def.field(field));
            match desc.and_then(|d| d.conversion.map(|c| (c, d.width))) {
                Some((conv, width)) => conv.apply(raw, width),
                None => raw as i64,
            }
        })
    }

    // ========== Jump tables ==========

    fn slot_location(region: &Region, index: u16) -> BridgeResult<u32> {
        let layout = region.library_layout().ok_or_else(|| BridgeError::MalformedStructure {
            name: region.name().to_string(),
            reason: "not a library base".into(),
        })?;
        let offset = layout.slot_offset(index).ok_or_else(|| BridgeError::MalformedStructure {
            name: region.name().to_string(),
            reason: format!("slot {index} out of range ({} slots)", layout.num_slots),
        })?;
        Ok(region.start() + offset)
    }

    pub fn jump_slot(&self, id: RegionId, index: u16) -> BridgeResult<JumpSlot> {
        self.with_region(id, |region| {
            let addr = Self::slot_location(region, index)?;
            Ok(JumpSlot::decode(region.bytes(addr, libbase::SLOT_SIZE)))
        })?
    }

    pub fn set_jump_slot(&self, id: RegionId, index: u16, slot: JumpSlot) -> BridgeResult<()> {
        self.with_region_mut(id, |region| {
            let addr = Self::slot_location(region, index)?;
            region
                .bytes_mut(addr, libbase::SLOT_SIZE)
                .copy_from_slice(&slot.encode());
            Ok(())
        })?
    }

    // ========== Diagnostics ==========

    pub fn set_observer(&self, observer: Box<dyn MemoryObserver>) {
        *self.observer.borrow_mut() = Some(observer);
    }

    pub fn take_observer(&self) -> Option<Box<dyn MemoryObserver>> {
        self.observer.borrow_mut().take()
    }

    /// Total invalid accesses since creation
    pub fn invalid_count(&self) -> u64 {
        self.inner.borrow().invalid_total
    }

    /// Most recent invalid accesses, oldest first
    pub fn invalid_accesses(&self) -> Vec<InvalidAccess> {
        self.inner.borrow().invalid_log.iter().copied().collect()
    }

    pub fn clear_invalid_log(&self) {
        self.inner.borrow_mut().invalid_log.clear();
    }

    /// Long words around `addr`, for error reports
    pub fn dump_longs(&self, addr: u32, count: u32) -> Vec<(u32, Option<u32>)> {
        let reg = self.inner.borrow();
        (0..count)
            .map(|i| {
                let a = addr.wrapping_add(i * 4);
                (a, reg.locate(a, 4).ok().map(|r| r.read(a, Width::Long)))
            })
            .collect()
    }
}
