//! The machine
//!
//! Ties a processor core to the address space, the trap registry, the
//! allocator and the scheduler, and drives the run loop between them.
//!
//! Memory map:
//! - `[0, 0x1000)` machine area: exit trap at 0x400, quick traps at 0x800
//! - `[0x1000, ram end)` handed out by the allocator
//!
//! Control flow:
//! - The core runs until it fetches a trap opcode, then the machine
//!   dispatches the bound callback with `&mut Machine`
//! - `run` enters guest code with the exit-trap address as return
//!   address; reaching it ends the run. Runs nest (a callback may call
//!   `run`), each level saving and restoring the full CPU context
//! - `schedule` drives tasks; a callback that blocks or yields the active
//!   task ends that task's slice

pub mod cpu;
pub mod library;
pub mod mock;

pub use cpu::{Cpu, CpuContext, CpuExit, CpuRun, Reg};
pub use library::{Library, LibraryFn, LibrarySpec};
pub use mock::MockCpu;

use crate::config::MachineConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::structure::layouts;
use crate::memory::{
    AccessMode, AddressSpace, Allocator, FirstFitAllocator, Region, RegionId, RegionKind,
    StructDef, Tracer, Width,
};
use crate::schedule::{ExecListMirror, Fanout, Scheduler, Stack, TaskId, WaitOutcome};
use crate::trap::trampoline::TrampolineRecord;
use crate::trap::{TrapCall, TrapFlags, TrapId, TrapRegistry, TrampolineId, opcodes};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Return address of every run; holds the exit trap
pub const RUN_EXIT_ADDR: u32 = 0x400;
/// First quick trap slot
pub const QUICK_TRAP_BASE: u32 = 0x800;
pub const QUICK_TRAP_SLOTS: usize = 64;
/// Trap opcode + rts
pub const QUICK_TRAP_SIZE: u32 = 4;
/// First address handed out by the allocator
pub const RAM_BEGIN: u32 = 0x1000;

/// Stack longs logged in an error report
const STACK_DUMP_LONGS: u32 = 8;

/// `ln_Type` of a task node
const NT_TASK: u32 = 1;

// ============================================================================
// Runs
// ============================================================================

/// Entry point and register setup for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Code {
    pub pc: u32,
    /// Stack pointer; None keeps the current stack (or the boot stack)
    pub sp: Option<u32>,
    pub set_regs: Vec<(Reg, u32)>,
    /// Registers captured into the `RunState` when the run ends
    pub get_regs: Vec<Reg>,
}

impl Code {
    pub fn at(pc: u32) -> Self {
        Self {
            pc,
            ..Default::default()
        }
    }

    pub fn with_sp(mut self, sp: u32) -> Self {
        self.sp = Some(sp);
        self
    }

    pub fn set(mut self, reg: Reg, value: u32) -> Self {
        self.set_regs.push((reg, value));
        self
    }

    pub fn get(mut self, reg: Reg) -> Self {
        self.get_regs.push(reg);
        self
    }
}

/// Outcome of one `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub name: String,
    pub pc: u32,
    pub sp: u32,
    /// 1 for a top-level run, more when nested
    pub nesting: usize,
    pub cycles: u64,
    /// Reached the exit trap
    pub done: bool,
    pub regs: Vec<(Reg, u32)>,
    pub error: Option<BridgeError>,
}

impl RunState {
    fn new(name: &str, pc: u32, sp: u32, nesting: usize) -> Self {
        Self {
            name: name.to_string(),
            pc,
            sp,
            nesting,
            cycles: 0,
            done: false,
            regs: Vec::new(),
            error: None,
        }
    }

    /// Captured register value
    pub fn reg(&self, reg: Reg) -> Option<u32> {
        self.regs.iter().find(|(r, _)| *r == reg).map(|(_, v)| *v)
    }
}

/// How a run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    /// Exit trap reached
    Exit,
    /// The running task left the processor
    Switched,
}

/// A task that left the scheduler during `schedule`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub id: TaskId,
    pub name: String,
    /// D0 at exit
    pub result: u32,
    pub cycles: u64,
    pub error: Option<BridgeError>,
}

// ============================================================================
// Machine
// ============================================================================

pub struct Machine {
    config: MachineConfig,
    cpu: Box<dyn Cpu>,
    mem: AddressSpace,
    alloc: Box<dyn Allocator>,
    traps: TrapRegistry<Machine>,
    scheduler: Scheduler,
    trampolines: HashMap<TrampolineId, TrampolineRecord>,
    next_trampoline: u64,
    quick_traps: Vec<Option<TrapId>>,
    exit_trap: TrapId,
    boot_stack: Stack,
    task_def: Arc<StructDef>,
    /// Depth of `run` calls
    nesting: usize,
    /// Set by the exit trap for the innermost loop
    exit_requested: bool,
    /// Set by `jump_to` during a callback
    redirected: bool,
    /// Task whose slice is executing
    running_task: Option<TaskId>,
    tracer: Option<Rc<RefCell<Tracer>>>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu.name())
            .field("mem", &self.mem)
            .field("traps", &self.traps)
            .field("scheduler", &self.scheduler)
            .field("nesting", &self.nesting)
            .finish()
    }
}

impl Machine {
    /// Build a machine around `cpu`
    pub fn new(config: MachineConfig, mut cpu: Box<dyn Cpu>) -> BridgeResult<Self> {
        config.validate()?;
        let mem = AddressSpace::new(config.invalid_access_log);
        mem.register(Region::flat("machine", 0, RAM_BEGIN)?)?;
        let mut alloc: Box<dyn Allocator> =
            Box::new(FirstFitAllocator::new(RAM_BEGIN, config.ram_bytes()));

        let mut traps = TrapRegistry::new(config.trap_capacity);
        let exit_trap = traps.setup("run_exit", TrapFlags::PERSISTENT, |m: &mut Machine, _: &TrapCall| {
            m.exit_requested = true;
            Ok(())
        })?;
        mem.write16(RUN_EXIT_ADDR, exit_trap.opcode());
        mem.write16(RUN_EXIT_ADDR + 2, opcodes::RESET);

        let boot_stack = Stack::alloc(&mem, alloc.as_mut(), "boot", config.default_stack_size)?;
        cpu.reset();
        cpu.write_reg(Reg::SP, boot_stack.initial_sp());

        let mut scheduler = Scheduler::new();
        let tracer = config
            .trace
            .enabled
            .then(|| Rc::new(RefCell::new(Tracer::from_config(&config.trace))));
        if let Some(tracer) = &tracer {
            mem.set_observer(Box::new(tracer.clone()));
            scheduler.set_observer(Box::new(tracer.clone()));
        }

        info!(
            "machine up: {} with {} KiB RAM, {} trap ids",
            cpu.name(),
            config.ram_size_kib,
            traps.capacity()
        );
        Ok(Self {
            task_def: Arc::new(layouts::task()?),
            config,
            cpu,
            mem,
            alloc,
            traps,
            scheduler,
            trampolines: HashMap::new(),
            next_trampoline: 0,
            quick_traps: vec![None; QUICK_TRAP_SLOTS],
            exit_trap,
            boot_stack,
            nesting: 0,
            exit_requested: false,
            redirected: false,
            running_task: None,
            tracer,
        })
    }

    /// Machine driven by the reference core
    pub fn with_mock_cpu(config: MachineConfig) -> BridgeResult<Self> {
        Self::new(config, Box::new(MockCpu::new()))
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn mem(&self) -> &AddressSpace {
        &self.mem
    }

    pub fn cpu(&self) -> &dyn Cpu {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn Cpu {
        self.cpu.as_mut()
    }

    pub fn alloc(&self) -> &dyn Allocator {
        self.alloc.as_ref()
    }

    pub fn alloc_mut(&mut self) -> &mut dyn Allocator {
        self.alloc.as_mut()
    }

    pub fn traps(&self) -> &TrapRegistry<Machine> {
        &self.traps
    }

    pub fn traps_mut(&mut self) -> &mut TrapRegistry<Machine> {
        &mut self.traps
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn tracer(&self) -> Option<Rc<RefCell<Tracer>>> {
        self.tracer.clone()
    }

    pub fn exit_trap(&self) -> TrapId {
        self.exit_trap
    }

    pub fn boot_stack(&self) -> Stack {
        self.boot_stack
    }

    /// Current `run` depth
    pub fn nesting(&self) -> usize {
        self.nesting
    }

    pub fn reg(&self, reg: Reg) -> u32 {
        self.cpu.read_reg(reg)
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.cpu.write_reg(reg, value);
    }

    pub fn push32(&mut self, value: u32) {
        let sp = self.cpu.read_reg(Reg::SP).wrapping_sub(4);
        self.mem.write32(sp, value);
        self.cpu.write_reg(Reg::SP, sp);
    }

    pub fn pop32(&mut self) -> u32 {
        let sp = self.cpu.read_reg(Reg::SP);
        let value = self.mem.read32(sp);
        self.cpu.write_reg(Reg::SP, sp.wrapping_add(4));
        value
    }

    // ========== Regions ==========

    pub fn alloc_region(&mut self, name: &str, size: u32, kind: RegionKind) -> BridgeResult<RegionId> {
        self.mem.alloc_region(self.alloc.as_mut(), name, size, kind)
    }

    pub fn free_region(&mut self, id: RegionId) -> BridgeResult<()> {
        self.mem.free_region(self.alloc.as_mut(), id)
    }

    /// Allocate a structured region sized for `def`
    pub fn alloc_struct(&mut self, name: &str, def: Arc<StructDef>) -> BridgeResult<RegionId> {
        let size = def.size();
        self.alloc_region(name, size, RegionKind::Structured(def))
    }

    pub fn region_start(&self, id: RegionId) -> BridgeResult<u32> {
        self.mem
            .region_info(id)
            .map(|r| r.start)
            .ok_or(BridgeError::InvalidRegion(id))
    }

    // ========== Traps ==========

    pub fn setup_trap(
        &mut self,
        name: impl Into<String>,
        flags: TrapFlags,
        callback: impl Fn(&mut Machine, &TrapCall) -> BridgeResult<()> + 'static,
    ) -> BridgeResult<TrapId> {
        self.traps.setup(name, flags, callback)
    }

    pub fn free_trap(&mut self, id: TrapId) -> BridgeResult<()> {
        self.traps.free(id)
    }

    /// Continue at `addr` after the current callback, skipping its
    /// synthetic return
    pub fn jump_to(&mut self, addr: u32) {
        self.cpu.write_reg(Reg::Pc, addr);
        self.redirected = true;
    }

    fn dispatch_trap(&mut self, opcode: u16, pc: u32) -> BridgeResult<()> {
        let id = TrapId::from_opcode(opcode).ok_or(BridgeError::CpuFault {
            pc,
            opcode,
            reason: "not a trap opcode",
        })?;
        let (callback, flags) = self.traps.checkout(id)?;
        if let Some(tracer) = &self.tracer
            && let Ok(mut tracer) = tracer.try_borrow_mut()
        {
            tracer.record_trap(self.traps.name(id).unwrap_or("?"), id, pc);
        }

        let outer = std::mem::replace(&mut self.redirected, false);
        let result = callback(self, &TrapCall { id, opcode, pc });
        self.traps.checkin(id);
        let redirected = std::mem::replace(&mut self.redirected, outer);

        if result.is_ok() && flags.auto_return && !redirected {
            let ret = self.pop32();
            self.cpu.write_reg(Reg::Pc, ret);
        }
        result
    }

    // ========== Quick traps ==========

    /// Bind `callback` to a guest-callable address (`jsr` to it)
    pub fn setup_quick_trap(
        &mut self,
        name: &str,
        callback: impl Fn(&mut Machine, &TrapCall) -> BridgeResult<()> + 'static,
    ) -> BridgeResult<u32> {
        let slot = self
            .quick_traps
            .iter()
            .position(Option::is_none)
            .ok_or(BridgeError::TrapExhausted {
                capacity: QUICK_TRAP_SLOTS,
            })?;
        let id = self
            .traps
            .setup(format!("quick:{name}"), TrapFlags::PERSISTENT, callback)?;
        let addr = QUICK_TRAP_BASE + slot as u32 * QUICK_TRAP_SIZE;
        self.mem.write16(addr, id.opcode());
        self.mem.write16(addr + 2, opcodes::RTS);
        self.quick_traps[slot] = Some(id);
        debug!("quick trap '{name}' @{addr:06x} -> {id}");
        Ok(addr)
    }

    pub fn free_quick_trap(&mut self, addr: u32) -> BridgeResult<()> {
        let offset = addr.wrapping_sub(QUICK_TRAP_BASE);
        let slot = (offset % QUICK_TRAP_SIZE == 0)
            .then_some((offset / QUICK_TRAP_SIZE) as usize)
            .and_then(|i| self.quick_traps.get_mut(i))
            .ok_or(BridgeError::InvalidMemoryAccess {
                mode: AccessMode::Write,
                width: Width::Word,
                addr,
                reason: "not a quick trap slot",
            })?;
        let id = slot.take().ok_or(BridgeError::DoubleFree { addr })?;
        self.mem.write16(addr, opcodes::RESET);
        self.traps.free(id)
    }

    // ========== Runs ==========

    /// Run guest code at `code.pc` until it returns.
    ///
    /// Errors end the run and are reported in the returned state; they
    /// never leave the CPU context of the caller modified.
    pub fn run(&mut self, code: Code, name: &str) -> RunState {
        self.nesting += 1;
        let nesting = self.nesting;
        let saved = self.cpu.context();
        let saved_exit = std::mem::replace(&mut self.exit_requested, false);

        let in_use = nesting > 1 || self.running_task.is_some();
        let sp = code.sp.unwrap_or(if in_use {
            saved.sp()
        } else {
            self.boot_stack.initial_sp()
        });
        let sp = sp.wrapping_sub(4);
        self.mem.write32(sp, RUN_EXIT_ADDR);
        self.cpu.write_reg(Reg::SP, sp);
        self.cpu.write_reg(Reg::Pc, code.pc);
        for (reg, value) in &code.set_regs {
            self.cpu.write_reg(*reg, *value);
        }

        debug!("run #{nesting} '{name}' @{:06x} sp={sp:06x}", code.pc);
        let mut state = RunState::new(name, code.pc, sp, nesting);
        match self.run_loop(&mut state, None) {
            Ok(_) => state.done = true,
            Err(e) => {
                self.report_error(&e, &state);
                state.error = Some(e);
            }
        }
        state.regs = code
            .get_regs
            .iter()
            .map(|reg| (*reg, self.cpu.read_reg(*reg)))
            .collect();
        debug!(
            "run #{nesting} '{name}' {} after {} cycles",
            if state.done { "done" } else { "failed" },
            state.cycles
        );

        self.cpu.set_context(&saved);
        self.exit_requested = saved_exit;
        self.nesting -= 1;
        state
    }

    fn run_loop(&mut self, state: &mut RunState, task: Option<TaskId>) -> BridgeResult<LoopEnd> {
        let active_before = self.scheduler.active();
        loop {
            let run = self.cpu.execute(&self.mem, self.config.run_cycles);
            state.cycles += run.cycles as u64;
            if let Some(task) = task {
                self.scheduler.add_cycles(task, run.cycles);
            }
            match run.exit {
                CpuExit::CycleLimit => {}
                CpuExit::Fault { pc, opcode, reason } => {
                    return Err(BridgeError::CpuFault { pc, opcode, reason });
                }
                CpuExit::Trap { opcode, pc } => {
                    self.dispatch_trap(opcode, pc)?;
                    if self.exit_requested {
                        self.exit_requested = false;
                        return Ok(LoopEnd::Exit);
                    }
                    if self.scheduler.active() != active_before {
                        if task.is_some() {
                            return Ok(LoopEnd::Switched);
                        }
                        return Err(BridgeError::NestedSuspend {
                            nesting: self.nesting,
                        });
                    }
                }
            }
        }
    }

    /// Log an error with the CPU state and the top of the stack
    fn report_error(&self, err: &BridgeError, state: &RunState) {
        error!(
            "run '{}' (level {}) failed after {} cycles: {err}",
            state.name, state.nesting, state.cycles
        );
        let ctx = self.cpu.context();
        for line in format!("{ctx:?}").lines() {
            error!("  {line}");
        }
        let sp = ctx.sp();
        for (addr, value) in self.mem.dump_longs(sp, STACK_DUMP_LONGS) {
            match value {
                Some(value) => error!("  SP+{:02x} @{addr:06x}: {value:08x}", addr.wrapping_sub(sp)),
                None => error!("  SP+{:02x} @{addr:06x}: --------", addr.wrapping_sub(sp)),
            }
        }
    }

    // ========== Trampolines ==========

    pub fn next_trampoline_id(&mut self) -> TrampolineId {
        self.next_trampoline += 1;
        TrampolineId(self.next_trampoline)
    }

    pub fn register_trampoline(&mut self, record: TrampolineRecord) {
        self.trampolines.insert(record.id, record);
    }

    pub fn trampoline(&self, id: TrampolineId) -> Option<&TrampolineRecord> {
        self.trampolines.get(&id)
    }

    /// Trampolines not yet released
    pub fn live_trampolines(&self) -> usize {
        self.trampolines.len()
    }

    /// Run a trampoline's cleanups, then free its traps and memory.
    ///
    /// The record is dropped, so only the first call succeeds. Later calls
    /// for an id this machine issued fail with `TrampolineReleased`.
    pub fn release_trampoline(&mut self, id: TrampolineId) -> BridgeResult<()> {
        let Some(record) = self.trampolines.remove(&id) else {
            let issued = id.0 > 0 && id.0 <= self.next_trampoline;
            return Err(if issued {
                BridgeError::TrampolineReleased(id.0)
            } else {
                BridgeError::UnknownTrampoline(id.0)
            });
        };
        let TrampolineRecord {
            name,
            region,
            traps,
            cleanups,
            ..
        } = record;

        let mut first_err = None;
        for cleanup in cleanups {
            if let Err(e) = cleanup(self) {
                warn!("{id} '{name}' cleanup failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        for trap in traps {
            if let Err(e) = self.traps.free(trap) {
                warn!("{id}: {e}");
            }
        }
        if let Err(e) = self.free_region(region) {
            first_err.get_or_insert(e);
        }
        debug!("released {id} '{name}'");
        first_err.map_or(Ok(()), Err)
    }

    // ========== Tasks ==========

    /// Create a Ready task entering at `code.pc` on a fresh stack.
    ///
    /// The task also gets a guest `Task` structure. Returning from the
    /// entry point ends the task.
    pub fn spawn_task(&mut self, name: &str, code: Code, stack_size: Option<u32>) -> BridgeResult<TaskId> {
        let size = stack_size.unwrap_or(self.config.default_stack_size);
        let stack = Stack::alloc(&self.mem, self.alloc.as_mut(), name, size)?;
        let task_region = match self.alloc_struct(&format!("task:{name}"), self.task_def.clone()) {
            Ok(region) => region,
            Err(e) => {
                stack.free(&self.mem, self.alloc.as_mut())?;
                return Err(e);
            }
        };
        let task_addr = self.region_start(task_region)?;
        self.mem.write_field(task_region, "tc_Node.ln_Type", NT_TASK)?;
        self.mem.write_field(task_region, "tc_SigAlloc", crate::schedule::task::SYSTEM_SIGNALS)?;
        self.mem.write_field(task_region, "tc_SPLower", stack.lower)?;
        self.mem.write_field(task_region, "tc_SPUpper", stack.upper)?;

        // the exit address sits on whichever stack the task starts with
        let sp = code.sp.unwrap_or(stack.initial_sp()).wrapping_sub(4);
        self.mem.write32(sp, RUN_EXIT_ADDR);
        let mut ctx = CpuContext::default();
        ctx.set(Reg::Pc, code.pc);
        ctx.set(Reg::SP, sp);
        for (reg, value) in &code.set_regs {
            ctx.set(*reg, *value);
        }
        self.mem.write_field(task_region, "tc_SPReg", ctx.sp())?;

        let id = self
            .scheduler
            .add_task(name, ctx, Some(stack), Some(task_addr));
        info!("spawned {id} '{name}' @{:06x}", code.pc);
        Ok(id)
    }

    /// Tear down a task in any state
    pub fn remove_task(&mut self, id: TaskId) -> BridgeResult<()> {
        let ctx = self.scheduler.remove_task(id)?;
        self.release_task_memory(ctx.stack, ctx.guest_task)
    }

    fn release_task_memory(&mut self, stack: Option<Stack>, guest_task: Option<u32>) -> BridgeResult<()> {
        if let Some(stack) = stack {
            stack.free(&self.mem, self.alloc.as_mut())?;
        }
        if let Some(region) = guest_task.and_then(|addr| self.mem.resolve(addr)) {
            self.free_region(region)?;
        }
        Ok(())
    }

    /// Install an exec list mirror over a freshly allocated `ExecLists`
    pub fn install_exec_mirror(&mut self) -> BridgeResult<Rc<RefCell<ExecListMirror>>> {
        let region = self.alloc_struct("exec_lists", Arc::new(layouts::exec_lists()?))?;
        let mirror = Rc::new(RefCell::new(ExecListMirror::new(
            self.mem.clone(),
            self.region_start(region)?,
        )?));
        let mut fanout = Fanout::new().with(mirror.clone());
        if let Some(tracer) = &self.tracer {
            fanout = fanout.with(tracer.clone());
        }
        self.scheduler.set_observer(Box::new(fanout));
        Ok(mirror)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.scheduler.active()
    }

    /// Wait on signals for the calling task.
    ///
    /// With signals pending D0 receives them at once. Otherwise the task
    /// blocks and D0 is set when it resumes.
    pub fn wait_signals(&mut self, mask: u32) -> BridgeResult<WaitOutcome> {
        if self.nesting > 0 {
            return Err(BridgeError::NestedSuspend {
                nesting: self.nesting,
            });
        }
        let outcome = self.scheduler.wait(mask)?;
        if let WaitOutcome::Ready(bits) = outcome {
            self.cpu.write_reg(Reg::D0, bits);
        }
        Ok(outcome)
    }

    pub fn signal_task(&mut self, id: TaskId, bits: u32) -> BridgeResult<bool> {
        self.scheduler.signal(id, bits)
    }

    /// Give up the processor; the task is queued behind all ready tasks
    pub fn yield_task(&mut self) -> BridgeResult<TaskId> {
        if self.nesting > 0 {
            return Err(BridgeError::NestedSuspend {
                nesting: self.nesting,
            });
        }
        self.scheduler.yield_active()
    }

    /// Drive tasks until none remain.
    ///
    /// Fails with `Deadlock` if only waiting tasks are left.
    pub fn schedule(&mut self) -> BridgeResult<Vec<TaskExit>> {
        if self.nesting > 0 || self.running_task.is_some() {
            return Err(BridgeError::NestedSuspend {
                nesting: self.nesting,
            });
        }
        let saved = self.cpu.context();
        let mut exits = Vec::new();
        let result = loop {
            match self.scheduler.activate_next() {
                Ok(Some(id)) => match self.run_task_slice(id) {
                    Ok(Some(exit)) => exits.push(exit),
                    Ok(None) => {}
                    Err(e) => break Err(e),
                },
                Ok(None) if self.scheduler.is_deadlocked() => {
                    let waiting = self.scheduler.waiting_tasks().len();
                    for exit in &exits {
                        info!("{} '{}' exited before deadlock", exit.id, exit.name);
                    }
                    break Err(BridgeError::Deadlock { waiting });
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.cpu.set_context(&saved);
        result.map(|_| exits)
    }

    /// Run the active task until it exits or leaves the processor
    fn run_task_slice(&mut self, id: TaskId) -> BridgeResult<Option<TaskExit>> {
        let (ctx, name) = self
            .scheduler
            .task(id)
            .map(|t| (t.cpu, t.name.clone()))
            .ok_or(BridgeError::UnknownTask(id))?;
        self.cpu.set_context(&ctx);
        if let Some(value) = self.scheduler.take_resume_value(id) {
            self.cpu.write_reg(Reg::D0, value);
        }

        self.running_task = Some(id);
        let mut state = RunState::new(&name, ctx.pc(), ctx.sp(), 0);
        let end = self.run_loop(&mut state, Some(id));
        self.running_task = None;

        let error = match end {
            Ok(LoopEnd::Switched) => {
                // removed tasks have nothing left to save
                if self.scheduler.task(id).is_some() {
                    self.scheduler.save_context(id, self.cpu.context())?;
                }
                return Ok(None);
            }
            Ok(LoopEnd::Exit) => None,
            Err(e) => {
                self.report_error(&e, &state);
                Some(e)
            }
        };

        let result = self.cpu.read_reg(Reg::D0);
        let ctx = if self.scheduler.active() == Some(id) {
            self.scheduler.exit_active()?
        } else {
            self.scheduler.remove_task(id)?
        };
        self.release_task_memory(ctx.stack, ctx.guest_task)?;
        info!("{id} '{name}' exited with d0={result:08x} after {} cycles", ctx.cycles);
        Ok(Some(TaskExit {
            id,
            name,
            result,
            cycles: ctx.cycles,
            error,
        }))
    }

    // ========== Shutdown ==========

    /// Release trampolines and tasks, then log leaked allocations.
    /// Returns the number of chunks still allocated.
    pub fn shutdown(&mut self) -> usize {
        let mut live: Vec<TrampolineId> = self.trampolines.keys().copied().collect();
        live.sort();
        for id in live {
            if let Err(e) = self.release_trampoline(id) {
                warn!("shutdown: {e}");
            }
        }
        let tasks: Vec<TaskId> = self
            .scheduler
            .ready_tasks()
            .into_iter()
            .chain(self.scheduler.waiting_tasks())
            .chain(self.scheduler.active())
            .collect();
        for id in tasks {
            if let Err(e) = self.remove_task(id) {
                warn!("shutdown: {e}");
            }
        }
        let held = self.scheduler.flush_events();
        if held > 0 {
            warn!("shutdown: {held} scheduler event(s) never delivered");
        }
        // the boot stack lives as long as the machine
        let orphans: Vec<_> = self
            .alloc
            .live_chunks()
            .into_iter()
            .filter(|(addr, _, _)| *addr != self.boot_stack.lower)
            .collect();
        for (addr, size, label) in &orphans {
            warn!("orphan @{addr:06x} +{size:06x} {label}");
        }
        orphans.len()
    }
}
