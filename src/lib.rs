//! amirun - an OS-API-level runtime bridge for 68k home-computer programs
//!
//! Guest programs run on an emulated processor core; their calls into the
//! operating system land on line-A trap opcodes that the bridge hands to
//! host-implemented library functions.
//!
//! Layout:
//! - [`memory`]: region registry, structured and library-base regions,
//!   allocator, tracer
//! - [`trap`]: trap registry and the trampoline builder
//! - [`schedule`]: cooperative task scheduler and its event stream
//! - [`machine`]: CPU core, run loop, libraries and tasks tied together
//!
//! Design principles:
//! - Guest faults never crash the host: bad accesses are recorded, bad
//!   instructions end the run with an error report
//! - Everything runs on one thread; shared state is `Rc<RefCell<_>>`
//! - Every resource handed to guest code (region, trap id, stack) has an
//!   owner that releases it

pub mod config;
pub mod error;
pub mod logging;
pub mod machine;
pub mod memory;
pub mod schedule;
pub mod trap;

#[cfg(test)]
mod invariants_test;

pub use config::{MachineConfig, TraceConfig};
pub use error::{BridgeError, BridgeResult};
pub use machine::{Code, Cpu, Library, LibrarySpec, Machine, MockCpu, Reg, RunState, TaskExit};
pub use memory::{AddressSpace, Region, RegionId, RegionKind, StructDef, Tracer};
pub use schedule::{Scheduler, SchedulerEvent, SchedulerEventKind, TaskId, TaskState};
pub use trap::{Trampoline, TrapFlags, TrapId, TrapRegistry};
