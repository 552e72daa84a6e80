//! Machine Configuration
//!
//! Tunables for a [`Machine`](crate::machine::Machine). Configuration is
//! handed in programmatically or as a JSON document; every field has a
//! default so partial documents are accepted.

use crate::error::{BridgeError, BridgeResult};
use crate::machine::RAM_BEGIN;
use crate::memory::trace::TraceCategory;
use crate::trap::MAX_TRAPS;
use serde::{Deserialize, Serialize};

/// Trace buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Record events into the tracer ring buffer
    pub enabled: bool,
    /// Ring buffer capacity
    pub buffer_size: usize,
    /// Categories to keep (None = all)
    pub categories: Option<Vec<TraceCategory>>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: 1000,
            categories: None,
        }
    }
}

/// Machine-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Total emulated RAM in KiB, including the reserved low area
    pub ram_size_kib: u32,
    /// Instructions per CPU run slice before control returns to the loop
    pub run_cycles: u32,
    /// Number of trap ids in the pool
    pub trap_capacity: usize,
    /// Stack size for spawned tasks
    pub default_stack_size: u32,
    /// Invalid accesses retained for inspection
    pub invalid_access_log: usize,
    pub trace: TraceConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size_kib: 1024,
            run_cycles: 1000,
            trap_capacity: MAX_TRAPS,
            default_stack_size: 4096,
            invalid_access_log: 64,
            trace: TraceConfig::default(),
        }
    }
}

impl MachineConfig {
    /// Parse a JSON document, filling gaps with defaults
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: MachineConfig =
            serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// RAM size in bytes
    pub fn ram_bytes(&self) -> u32 {
        self.ram_size_kib.saturating_mul(1024)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.ram_bytes() <= RAM_BEGIN {
            return Err(BridgeError::Config(format!(
                "ram_size_kib {} leaves no room above the reserved area",
                self.ram_size_kib
            )));
        }
        if self.trap_capacity == 0 || self.trap_capacity > MAX_TRAPS {
            return Err(BridgeError::Config(format!(
                "trap_capacity must be in 1..={MAX_TRAPS}, got {}",
                self.trap_capacity
            )));
        }
        if self.run_cycles == 0 {
            return Err(BridgeError::Config("run_cycles must be non-zero".into()));
        }
        if self.default_stack_size < 16 {
            return Err(BridgeError::Config(format!(
                "default_stack_size {} too small",
                self.default_stack_size
            )));
        }
        Ok(())
    }
}
