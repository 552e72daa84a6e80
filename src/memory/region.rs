//! Memory regions
//!
//! A region is a named, bounded slice of the guest address space backed by
//! its own byte buffer. Its capability set decides which operations it
//! accepts and how accesses inside it are annotated for tracing.

use super::libbase::{JumpSlot, LibraryLayout, SLOT_SIZE};
use super::structure::StructDef;
use super::{Annotation, RegionId, Width};
use crate::error::{BridgeError, BridgeResult};
use std::sync::Arc;

/// Capability set of a region
#[derive(Debug, Clone)]
pub enum RegionKind {
    /// Byte-addressable buffer
    Flat,
    /// Flat buffer with a field table starting at the region start
    Structured(Arc<StructDef>),
    /// Jump table below the base, library structure above it
    LibraryBase(LibraryLayout),
}

impl RegionKind {
    pub fn label(&self) -> &'static str {
        match self {
            RegionKind::Flat => "flat",
            RegionKind::Structured(_) => "struct",
            RegionKind::LibraryBase(_) => "library",
        }
    }
}

#[derive(Debug)]
pub struct Region {
    pub(super) id: RegionId,
    name: String,
    start: u32,
    kind: RegionKind,
    data: Vec<u8>,
}

impl Region {
    /// Create an unregistered region.
    ///
    /// Structured regions need room for their structure; library regions
    /// are sized exactly by their layout.
    pub fn new(
        name: impl Into<String>,
        start: u32,
        size: u32,
        kind: RegionKind,
    ) -> BridgeResult<Self> {
        let name = name.into();
        let malformed = |reason: String| BridgeError::MalformedStructure {
            name: name.clone(),
            reason,
        };
        if size == 0 {
            return Err(malformed("zero-sized region".into()));
        }
        if start as u64 + size as u64 > 1 << 32 {
            return Err(malformed(format!(
                "region {start:#x}+{size:#x} wraps the address space"
            )));
        }
        match &kind {
            RegionKind::Structured(def) if def.size() > size => {
                return Err(malformed(format!(
                    "structure '{}' needs {} bytes, region has {size}",
                    def.name(),
                    def.size()
                )));
            }
            RegionKind::LibraryBase(layout) if layout.total_size() != size => {
                return Err(malformed(format!(
                    "library layout needs {} bytes, region has {size}",
                    layout.total_size()
                )));
            }
            _ => {}
        }
        Ok(Self {
            id: RegionId::NULL,
            name,
            start,
            kind,
            data: vec![0; size as usize],
        })
    }

    pub fn flat(name: impl Into<String>, start: u32, size: u32) -> BridgeResult<Self> {
        Self::new(name, start, size, RegionKind::Flat)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// One past the last address (may be 2^32)
    pub fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }

    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    /// Address that structure offsets are relative to
    pub fn origin(&self) -> u32 {
        match &self.kind {
            RegionKind::LibraryBase(layout) => self.start + layout.neg_size,
            _ => self.start,
        }
    }

    /// Block operations are allowed on flat and structured regions
    pub fn is_byte_addressable(&self) -> bool {
        !matches!(self.kind, RegionKind::LibraryBase(_))
    }

    pub fn structure(&self) -> Option<&StructDef> {
        match &self.kind {
            RegionKind::Flat => None,
            RegionKind::Structured(def) => Some(def.as_ref()),
            RegionKind::LibraryBase(layout) => Some(layout.structure.as_ref()),
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && (addr as u64) < self.end()
    }

    /// True if `[addr, addr+len)` lies inside this region
    pub fn covers(&self, addr: u32, len: u32) -> bool {
        self.contains(addr) && addr as u64 + len as u64 <= self.end()
    }

    pub fn read(&self, addr: u32, width: Width) -> u32 {
        let off = (addr - self.start) as usize;
        let bytes = &self.data[off..off + width.bytes() as usize];
        match width {
            Width::Byte => bytes[0] as u32,
            Width::Word => u16::from_be_bytes([bytes[0], bytes[1]]) as u32,
            Width::Long => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    pub fn write(&mut self, addr: u32, width: Width, value: u32) {
        let off = (addr - self.start) as usize;
        match width {
            Width::Byte => self.data[off] = value as u8,
            Width::Word => self.data[off..off + 2].copy_from_slice(&(value as u16).to_be_bytes()),
            Width::Long => self.data[off..off + 4].copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn bytes(&self, addr: u32, len: u32) -> &[u8] {
        let off = (addr - self.start) as usize;
        &self.data[off..off + len as usize]
    }

    pub fn bytes_mut(&mut self, addr: u32, len: u32) -> &mut [u8] {
        let off = (addr - self.start) as usize;
        &mut self.data[off..off + len as usize]
    }

    /// Bytes from `addr` to the region end
    pub fn tail(&self, addr: u32) -> &[u8] {
        &self.data[(addr - self.start) as usize..]
    }

    /// Field or jump slot touched by an access at `addr`
    pub fn annotate(&self, addr: u32) -> Option<Annotation> {
        match &self.kind {
            RegionKind::Flat => None,
            RegionKind::Structured(def) => Self::field_annotation(def, addr - self.start),
            RegionKind::LibraryBase(layout) => {
                let base = self.origin();
                if addr >= base {
                    return Self::field_annotation(&layout.structure, addr - base);
                }
                let index = layout.slot_for_neg_offset(base - addr)?;
                let slot_addr = base - (index as u32 + 1) * SLOT_SIZE;
                let slot = JumpSlot::decode(self.bytes(slot_addr, SLOT_SIZE));
                Some(Annotation::JumpSlot {
                    index,
                    lvo: super::libbase::lvo(index),
                    delta: addr - slot_addr,
                    kind: slot.kind(),
                })
            }
        }
    }

    fn field_annotation(def: &StructDef, offset: u32) -> Option<Annotation> {
        def.field_at(offset).map(|hit| Annotation::Field {
            structure: def.name().to_string(),
            field: hit.field.name.clone(),
            field_offset: hit.field.offset,
            delta: hit.delta,
            width: hit.field.width,
        })
    }

    pub fn library_layout(&self) -> Option<&LibraryLayout> {
        match &self.kind {
            RegionKind::LibraryBase(layout) => Some(layout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::structure::layouts;

    #[test]
    fn test_big_endian_access() {
        let mut region = Region::flat("ram", 0x100, 0x10).unwrap();
        region.write(0x100, Width::Long, 0xDEAD_BEEF);
        assert_eq!(region.read(0x100, Width::Byte), 0xDE);
        assert_eq!(region.read(0x102, Width::Word), 0xBEEF);
        assert_eq!(region.bytes(0x100, 4), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_bounds() {
        let region = Region::flat("ram", 0x100, 0x10).unwrap();
        assert!(region.contains(0x10F));
        assert!(!region.contains(0x110));
        assert!(region.covers(0x10C, 4));
        assert!(!region.covers(0x10E, 4));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Region::flat("zero", 0, 0).is_err());
        assert!(Region::flat("wrap", 0xFFFF_FFF0, 0x20).is_err());
        assert!(Region::flat("top", 0xFFFF_FFF0, 0x10).is_ok());

        let lib = Arc::new(layouts::library().unwrap());
        assert!(Region::new("small", 0, 10, RegionKind::Structured(lib)).is_err());
    }

    #[test]
    fn test_library_annotation() {
        let layout = LibraryLayout::new(2, Arc::new(layouts::library().unwrap()), 0).unwrap();
        let size = layout.total_size();
        let mut region = Region::new("test.library", 0x1000, size, RegionKind::LibraryBase(layout)).unwrap();
        let base = region.origin();
        assert_eq!(base, 0x1000 + 12);

        let slot0 = base - 6;
        region
            .bytes_mut(slot0, 6)
            .copy_from_slice(&JumpSlot::Jump(0x2000).encode());

        match region.annotate(slot0 + 2) {
            Some(Annotation::JumpSlot { index, lvo, delta, kind }) => {
                assert_eq!(index, 0);
                assert_eq!(lvo, -6);
                assert_eq!(delta, 2);
                assert_eq!(kind, super::super::libbase::SlotKind::Jump);
            }
            other => panic!("unexpected annotation {other:?}"),
        }

        match region.annotate(base + 20) {
            Some(Annotation::Field { field, .. }) => assert_eq!(field, "lib_Version"),
            other => panic!("unexpected annotation {other:?}"),
        }
        assert!(!region.is_byte_addressable());
    }
}
