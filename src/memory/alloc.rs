//! Guest memory allocation
//!
//! The address space never carves ranges itself; it asks an [`Allocator`].
//! [`FirstFitAllocator`] keeps a sorted free list over `[begin, end)`,
//! hands out long-aligned chunks and merges neighbours on free.

use crate::error::{BridgeError, BridgeResult};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Address range provider for regions
pub trait Allocator {
    /// Reserve `size` bytes; `label` names the chunk in diagnostics
    fn alloc(&mut self, size: u32, label: &str) -> BridgeResult<u32>;

    /// Release a chunk returned by `alloc`, returning its size
    fn free(&mut self, addr: u32) -> BridgeResult<u32>;

    fn free_bytes(&self) -> u32;

    fn total_bytes(&self) -> u32;

    fn is_all_free(&self) -> bool {
        self.free_bytes() == self.total_bytes()
    }

    /// Live chunks as `(addr, size, label)`
    fn live_chunks(&self) -> Vec<(u32, u32, String)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    addr: u32,
    size: u32,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.addr as u64 + self.size as u64
    }
}

#[derive(Debug)]
pub struct FirstFitAllocator {
    begin: u32,
    size: u32,
    /// Sorted by address, never adjacent
    free_list: Vec<Chunk>,
    live: BTreeMap<u32, (u32, String)>,
    free_bytes: u32,
    /// High-water mark of allocated bytes
    peak: u32,
}

impl FirstFitAllocator {
    /// Manage `[begin, end)`. Address 0 is never handed out.
    pub fn new(begin: u32, end: u32) -> Self {
        let begin = ((begin.max(4)) + 3) & !3;
        let size = end.saturating_sub(begin) & !3;
        Self {
            begin,
            size,
            free_list: if size > 0 {
                vec![Chunk { addr: begin, size }]
            } else {
                Vec::new()
            },
            live: BTreeMap::new(),
            free_bytes: size,
            peak: 0,
        }
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn num_allocs(&self) -> usize {
        self.live.len()
    }

    pub fn free_chunks(&self) -> usize {
        self.free_list.len()
    }

    /// Log every live chunk; returns how many there were
    pub fn dump_orphans(&self) -> usize {
        for (addr, (size, label)) in &self.live {
            warn!("orphan @{addr:06x} +{size:06x} {label}");
        }
        self.live.len()
    }

    fn insert_free(&mut self, chunk: Chunk) {
        let idx = self.free_list.partition_point(|c| c.addr < chunk.addr);
        self.free_list.insert(idx, chunk);

        // merge with next, then with prev
        if idx + 1 < self.free_list.len() && self.free_list[idx].end() == self.free_list[idx + 1].addr as u64 {
            self.free_list[idx].size += self.free_list[idx + 1].size;
            self.free_list.remove(idx + 1);
        }
        if idx > 0 && self.free_list[idx - 1].end() == self.free_list[idx].addr as u64 {
            self.free_list[idx - 1].size += self.free_list[idx].size;
            self.free_list.remove(idx);
        }
    }
}

impl Allocator for FirstFitAllocator {
    fn alloc(&mut self, size: u32, label: &str) -> BridgeResult<u32> {
        let size = size.max(1).checked_add(3).map(|s| s & !3).ok_or(BridgeError::OutOfMemory {
            requested: size,
            free: self.free_bytes,
        })?;

        let Some(idx) = self.free_list.iter().position(|c| c.size >= size) else {
            warn!("no memory for {size:06x} bytes ({label}), {:06x} free", self.free_bytes);
            return Err(BridgeError::OutOfMemory {
                requested: size,
                free: self.free_bytes,
            });
        };

        let chunk = &mut self.free_list[idx];
        let addr = chunk.addr;
        if chunk.size == size {
            self.free_list.remove(idx);
        } else {
            chunk.addr += size;
            chunk.size -= size;
        }

        self.live.insert(addr, (size, label.to_string()));
        self.free_bytes -= size;
        self.peak = self.peak.max(self.size - self.free_bytes);
        debug!("alloc @{addr:06x} +{size:06x} {label} (free {:06x})", self.free_bytes);
        Ok(addr)
    }

    fn free(&mut self, addr: u32) -> BridgeResult<u32> {
        let (size, label) = self
            .live
            .remove(&addr)
            .ok_or(BridgeError::DoubleFree { addr })?;
        self.insert_free(Chunk { addr, size });
        self.free_bytes += size;
        debug!("free  @{addr:06x} +{size:06x} {label} (free {:06x})", self.free_bytes);
        Ok(size)
    }

    fn free_bytes(&self) -> u32 {
        self.free_bytes
    }

    fn total_bytes(&self) -> u32 {
        self.size
    }

    fn live_chunks(&self) -> Vec<(u32, u32, String)> {
        self.live
            .iter()
            .map(|(addr, (size, label))| (*addr, *size, label.clone()))
            .collect()
    }
}
