//! Bridge tracing
//!
//! A bounded ring buffer of recent bridge activity plus running counters.
//! The [`Tracer`] plugs in as the address-space observer and as a
//! scheduler observer; the machine records trap dispatches into it.
//!
//! Design:
//! - Counters always run, events are only kept while enabled
//! - Category filter to keep the buffer focused
//! - Oldest events drop first once the buffer is full

use super::{AccessMode, Annotation, MemAccess, MemoryObserver};
use crate::config::TraceConfig;
use crate::schedule::events::{SchedulerEvent, SchedulerObserver};
use crate::trap::TrapId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

/// Default ring buffer capacity
const TRACE_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceCategory {
    /// Mapped reads and writes
    Memory,
    /// Accesses to unmapped addresses
    Invalid,
    /// Trap dispatch
    Trap,
    /// Task state transitions
    Scheduler,
    Custom,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Memory => write!(f, "MEM"),
            TraceCategory::Invalid => write!(f, "INVALID"),
            TraceCategory::Trap => write!(f, "TRAP"),
            TraceCategory::Scheduler => write!(f, "SCHED"),
            TraceCategory::Custom => write!(f, "CUSTOM"),
        }
    }
}

/// A single trace record
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Monotonic sequence number
    pub seq: u64,
    pub category: TraceCategory,
    pub name: String,
    pub detail: Option<String>,
    pub addr: Option<u32>,
    pub value: Option<u32>,
    pub annotation: Option<Annotation>,
}

impl TraceEvent {
    pub fn instant(category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            seq: 0,
            category,
            name: name.into(),
            detail: None,
            addr: None,
            value: None,
            annotation: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, addr: u32, value: u32) -> Self {
        self.addr = Some(addr);
        self.value = Some(value);
        self
    }

    pub fn with_annotation(mut self, annotation: Option<Annotation>) -> Self {
        self.annotation = annotation;
        self
    }

    /// Field name if this is a field-annotated access
    pub fn field_name(&self) -> Option<&str> {
        match &self.annotation {
            Some(Annotation::Field { field, .. }) => Some(field),
            _ => None,
        }
    }
}

/// Running totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceCounters {
    pub reads: u64,
    pub writes: u64,
    pub invalid: u64,
    pub traps: u64,
    /// ActiveTask events
    pub switches: u64,
    pub scheduler_events: u64,
}

#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    capacity: usize,
    events: VecDeque<TraceEvent>,
    next_seq: u64,
    pub counters: TraceCounters,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    /// Disabled tracer with the default buffer size
    pub fn new() -> Self {
        Self::with_capacity(TRACE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            enabled: false,
            filter: None,
            capacity,
            events: VecDeque::with_capacity(capacity.min(TRACE_BUFFER_SIZE)),
            next_seq: 0,
            counters: TraceCounters::default(),
        }
    }

    pub fn from_config(config: &TraceConfig) -> Self {
        let mut tracer = Self::with_capacity(config.buffer_size);
        tracer.enabled = config.enabled;
        tracer.filter = config.categories.clone();
        tracer
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record an event, evicting the oldest when full
    pub fn trace(&mut self, mut event: TraceEvent) {
        if !self.should_trace(event.category) {
            return;
        }
        event.seq = self.next_seq;
        self.next_seq += 1;
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Record a trap dispatch
    pub fn record_trap(&mut self, name: &str, id: TrapId, pc: u32) {
        self.counters.traps += 1;
        self.trace(
            TraceEvent::instant(TraceCategory::Trap, name)
                .with_detail(id.to_string())
                .at(pc, id.opcode() as u32),
        );
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The `n` most recent events, oldest first
    pub fn recent(&self, n: usize) -> Vec<&TraceEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).collect()
    }

    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.category == category).collect()
    }

    /// Events whose annotation names `field`
    pub fn events_for_field(&self, field: &str) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.field_name() == Some(field))
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn reset_stats(&mut self) {
        self.counters = TraceCounters::default();
    }

    /// Buffer contents as JSON lines
    pub fn to_json_lines(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl MemoryObserver for Tracer {
    fn on_access(&mut self, access: &MemAccess<'_>) {
        let Some(region) = access.region else {
            self.counters.invalid += 1;
            self.trace(
                TraceEvent::instant(TraceCategory::Invalid, format!("{}({})", access.mode, access.width))
                    .at(access.addr, access.value),
            );
            return;
        };
        match access.mode {
            AccessMode::Read => self.counters.reads += 1,
            AccessMode::Write => self.counters.writes += 1,
        }
        if self.should_trace(TraceCategory::Memory) {
            trace!(
                "{}({}) @{:06x} = {:08x} [{}]{}",
                access.mode,
                access.width,
                access.addr,
                access.value,
                region,
                access
                    .annotation
                    .as_ref()
                    .map(|a| format!(" {a}"))
                    .unwrap_or_default()
            );
            self.trace(
                TraceEvent::instant(TraceCategory::Memory, format!("{}({})", access.mode, access.width))
                    .with_detail(region)
                    .at(access.addr, access.value)
                    .with_annotation(access.annotation.clone()),
            );
        }
    }
}

impl SchedulerObserver for Tracer {
    fn on_event(&mut self, event: &SchedulerEvent) {
        self.counters.scheduler_events += 1;
        if event.kind == crate::schedule::events::SchedulerEventKind::ActiveTask {
            self.counters.switches += 1;
        }
        self.trace(
            TraceEvent::instant(TraceCategory::Scheduler, event.kind.to_string())
                .with_detail(event.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Width;
    use crate::schedule::TaskId;
    use crate::schedule::events::SchedulerEventKind;

    fn access(region: Option<&str>, mode: AccessMode) -> MemAccess<'_> {
        MemAccess {
            mode,
            width: Width::Long,
            addr: 0x1000,
            value: 42,
            region,
            annotation: None,
        }
    }

    #[test]
    fn test_disabled_only_counts() {
        let mut tracer = Tracer::new();
        tracer.on_access(&access(Some("ram"), AccessMode::Read));
        assert_eq!(tracer.counters.reads, 1);
        assert!(tracer.is_empty());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut tracer = Tracer::with_capacity(3);
        tracer.enable();
        for i in 0..5 {
            tracer.trace(TraceEvent::instant(TraceCategory::Custom, format!("e{i}")));
        }
        assert_eq!(tracer.len(), 3);
        let names: Vec<_> = tracer.events().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["e2", "e3", "e4"]);
        assert_eq!(tracer.recent(1)[0].seq, 4);
    }

    #[test]
    fn test_filter() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_filter(Some(vec![TraceCategory::Invalid]));
        tracer.on_access(&access(Some("ram"), AccessMode::Write));
        tracer.on_access(&access(None, AccessMode::Read));
        assert_eq!(tracer.len(), 1);
        assert_eq!(tracer.events_by_category(TraceCategory::Invalid).len(), 1);
        assert_eq!(tracer.counters.writes, 1);
        assert_eq!(tracer.counters.invalid, 1);
    }

    #[test]
    fn test_scheduler_and_trap_events() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.on_event(&SchedulerEvent::new(SchedulerEventKind::ActiveTask, TaskId(1)));
        tracer.record_trap("exec.Wait", TrapId(3), 0x2000);
        assert_eq!(tracer.counters.switches, 1);
        assert_eq!(tracer.counters.traps, 1);
        let trap = &tracer.events_by_category(TraceCategory::Trap)[0];
        assert_eq!(trap.value, Some(0xA003));
        assert!(tracer.to_json_lines().contains("exec.Wait"));
    }
}
