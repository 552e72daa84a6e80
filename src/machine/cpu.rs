//! Processor core interface
//!
//! The bridge treats the CPU as an opaque stepping engine. It runs until it
//! fetches a trap opcode or exhausts its cycle budget, then hands control
//! back. All fetches and data accesses go through the [`AddressSpace`]
//! passed to [`Cpu::execute`]; a core keeps no private copy of memory.

use crate::memory::AddressSpace;
use serde::Serialize;

/// Canonical register names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Reg {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    Pc,
    Sr,
}

pub const NUM_REGS: usize = 18;

impl Reg {
    pub const SP: Reg = Reg::A7;

    pub const ALL: [Reg; NUM_REGS] = [
        Reg::D0,
        Reg::D1,
        Reg::D2,
        Reg::D3,
        Reg::D4,
        Reg::D5,
        Reg::D6,
        Reg::D7,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::A4,
        Reg::A5,
        Reg::A6,
        Reg::A7,
        Reg::Pc,
        Reg::Sr,
    ];

    /// Data register `n` (0..=7)
    pub fn d(n: u8) -> Reg {
        Self::ALL[(n & 7) as usize]
    }

    /// Address register `n` (0..=7)
    pub fn a(n: u8) -> Reg {
        Self::ALL[8 + (n & 7) as usize]
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reg::Pc => write!(f, "PC"),
            Reg::Sr => write!(f, "SR"),
            r if r.index() < 8 => write!(f, "D{}", r.index()),
            r => write!(f, "A{}", r.index() - 8),
        }
    }
}

/// Full register snapshot
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CpuContext {
    regs: [u32; NUM_REGS],
}

impl CpuContext {
    pub fn get(&self, reg: Reg) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set(&mut self, reg: Reg, value: u32) {
        self.regs[reg.index()] = value;
    }

    pub fn pc(&self) -> u32 {
        self.get(Reg::Pc)
    }

    pub fn sp(&self) -> u32 {
        self.get(Reg::SP)
    }
}

impl std::fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, reg) in Reg::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(if i % 8 == 0 { "\n" } else { " " })?;
            }
            write!(f, "{reg}={:08x}", self.get(*reg))?;
        }
        Ok(())
    }
}

/// Why the core stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// Fetched a line-A opcode at `pc`; PC now points past it
    Trap { opcode: u16, pc: u32 },
    /// Cycle budget used up
    CycleLimit,
    /// Instruction the core cannot execute
    Fault {
        pc: u32,
        opcode: u16,
        reason: &'static str,
    },
}

/// Result of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRun {
    pub exit: CpuExit,
    pub cycles: u32,
}

/// Stepping engine consumed by the machine
pub trait Cpu {
    fn name(&self) -> &str;

    /// Run until a trap opcode is fetched or `max_cycles` are spent
    fn execute(&mut self, mem: &AddressSpace, max_cycles: u32) -> CpuRun;

    fn read_reg(&self, reg: Reg) -> u32;

    fn write_reg(&mut self, reg: Reg, value: u32);

    fn context(&self) -> CpuContext {
        let mut ctx = CpuContext::default();
        for reg in Reg::ALL {
            ctx.set(reg, self.read_reg(reg));
        }
        ctx
    }

    fn set_context(&mut self, ctx: &CpuContext) {
        for reg in Reg::ALL {
            self.write_reg(reg, ctx.get(reg));
        }
    }

    fn reset(&mut self) {
        self.set_context(&CpuContext::default());
    }
}
