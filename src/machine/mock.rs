//! Reference processor core
//!
//! A tiny interpreter for the 68k subset that synthesized code and the
//! test programs use. It is enough to drive trampolines, library calls,
//! nested runs and task switches without a full instruction decoder.
//!
//! Every instruction costs one cycle. Unknown instructions stop the core
//! with [`CpuExit::Fault`] and leave PC on the offending opcode.

use super::cpu::{Cpu, CpuContext, CpuExit, CpuRun, Reg};
use crate::memory::AddressSpace;
use crate::trap::{TrapId, opcodes};

#[derive(Debug, Default)]
pub struct MockCpu {
    ctx: CpuContext,
    /// Instructions executed since reset
    executed: u64,
}

/// Outcome of a single step
enum Step {
    Next,
    Exit(CpuExit),
}

impl MockCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    fn push32(&mut self, mem: &AddressSpace, value: u32) {
        let sp = self.ctx.sp().wrapping_sub(4);
        mem.write32(sp, value);
        self.ctx.set(Reg::SP, sp);
    }

    fn pop32(&mut self, mem: &AddressSpace) -> u32 {
        let sp = self.ctx.sp();
        let value = mem.read32(sp);
        self.ctx.set(Reg::SP, sp.wrapping_add(4));
        value
    }

    fn step(&mut self, mem: &AddressSpace) -> Step {
        let pc = self.ctx.pc();
        let op = mem.read16(pc);

        if TrapId::from_opcode(op).is_some() {
            self.ctx.set(Reg::Pc, pc.wrapping_add(2));
            return Step::Exit(CpuExit::Trap { opcode: op, pc });
        }

        let ext = |off: u32| mem.read32(pc.wrapping_add(off));
        let reg_hi = ((op >> 9) & 7) as u8;
        let reg_lo = (op & 7) as u8;

        let next = match op {
            opcodes::NOP => pc.wrapping_add(2),
            opcodes::RTS => self.pop32(mem),
            opcodes::JMP_ABS_L => ext(2),
            opcodes::JSR_ABS_L => {
                let target = ext(2);
                self.push32(mem, pc.wrapping_add(6));
                target
            }
            opcodes::MOVEM_L_TO_SP => {
                // predecrement order: bit 15 = d0 .. bit 0 = a7
                let mask = mem.read16(pc.wrapping_add(2));
                for i in (0..16u16).rev() {
                    if mask & (0x8000 >> i) != 0 {
                        let value = self.ctx.get(Reg::ALL[i as usize]);
                        self.push32(mem, value);
                    }
                }
                pc.wrapping_add(4)
            }
            opcodes::MOVEM_L_FROM_SP => {
                let mask = mem.read16(pc.wrapping_add(2));
                for i in 0..15u16 {
                    if mask & (1 << i) != 0 {
                        let value = self.pop32(mem);
                        self.ctx.set(Reg::ALL[i as usize], value);
                    }
                }
                pc.wrapping_add(4)
            }
            _ if op & 0xF1FF == opcodes::move_l_imm_dn(0) => {
                self.ctx.set(Reg::d(reg_hi), ext(2));
                pc.wrapping_add(6)
            }
            _ if op & 0xF1FF == opcodes::movea_l_imm_an(0) => {
                self.ctx.set(Reg::a(reg_hi), ext(2));
                pc.wrapping_add(6)
            }
            _ if op & 0xF1FF == opcodes::move_l_abs_dn(0) => {
                let value = mem.read32(ext(2));
                self.ctx.set(Reg::d(reg_hi), value);
                pc.wrapping_add(6)
            }
            _ if op & 0xF1FF == opcodes::movea_l_abs_an(0) => {
                let value = mem.read32(ext(2));
                self.ctx.set(Reg::a(reg_hi), value);
                pc.wrapping_add(6)
            }
            _ if op & 0xFFF8 == opcodes::move_l_dn_abs(0) => {
                mem.write32(ext(2), self.ctx.get(Reg::d(reg_lo)));
                pc.wrapping_add(6)
            }
            _ if op & 0xFFF8 == opcodes::move_l_an_abs(0) => {
                mem.write32(ext(2), self.ctx.get(Reg::a(reg_lo)));
                pc.wrapping_add(6)
            }
            _ if op & 0xF100 == 0x7000 => {
                self.ctx.set(Reg::d(reg_hi), op as u8 as i8 as i32 as u32);
                pc.wrapping_add(2)
            }
            _ if op & 0xF1F8 == opcodes::addq_l_dn(0, 8) => {
                let q = match reg_hi {
                    0 => 8,
                    q => q as u32,
                };
                let dn = Reg::d(reg_lo);
                self.ctx.set(dn, self.ctx.get(dn).wrapping_add(q));
                pc.wrapping_add(2)
            }
            opcodes::RESET => {
                return Step::Exit(CpuExit::Fault {
                    pc,
                    opcode: op,
                    reason: "reset",
                });
            }
            _ => {
                return Step::Exit(CpuExit::Fault {
                    pc,
                    opcode: op,
                    reason: "unsupported instruction",
                });
            }
        };
        self.ctx.set(Reg::Pc, next);
        Step::Next
    }
}

impl Cpu for MockCpu {
    fn name(&self) -> &str {
        "mock68k"
    }

    fn execute(&mut self, mem: &AddressSpace, max_cycles: u32) -> CpuRun {
        let mut cycles = 0;
        while cycles < max_cycles {
            let step = self.step(mem);
            cycles += 1;
            self.executed += 1;
            if let Step::Exit(exit) = step {
                // a faulting instruction does not complete
                if matches!(exit, CpuExit::Fault { .. }) {
                    cycles -= 1;
                    self.executed -= 1;
                }
                return CpuRun { exit, cycles };
            }
        }
        CpuRun {
            exit: CpuExit::CycleLimit,
            cycles,
        }
    }

    fn read_reg(&self, reg: Reg) -> u32 {
        self.ctx.get(reg)
    }

    fn write_reg(&mut self, reg: Reg, value: u32) {
        self.ctx.set(reg, value);
    }

    fn context(&self) -> CpuContext {
        self.ctx
    }

    fn set_context(&mut self, ctx: &CpuContext) {
        self.ctx = *ctx;
    }

    fn reset(&mut self) {
        self.ctx = CpuContext::default();
        self.executed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Region;

    fn setup(code: &[u16]) -> (MockCpu, AddressSpace) {
        let mem = AddressSpace::default();
        mem.register(Region::flat("ram", 0, 0x1000).unwrap()).unwrap();
        let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
        mem.write_block(0x100, &bytes).unwrap();
        let mut cpu = MockCpu::new();
        cpu.write_reg(Reg::Pc, 0x100);
        cpu.write_reg(Reg::SP, 0x800);
        (cpu, mem)
    }

    #[test]
    fn test_stops_on_trap() {
        let (mut cpu, mem) = setup(&[opcodes::NOP, 0xA005, opcodes::NOP]);
        let run = cpu.execute(&mem, 100);
        assert_eq!(
            run.exit,
            CpuExit::Trap {
                opcode: 0xA005,
                pc: 0x102
            }
        );
        assert_eq!(run.cycles, 2);
        assert_eq!(cpu.read_reg(Reg::Pc), 0x104);
    }

    #[test]
    fn test_moves_and_arithmetic() {
        let (mut cpu, mem) = setup(&[
            opcodes::move_l_imm_dn(1),
            0x1234,
            0x5678,
            opcodes::moveq(2, -2),
            opcodes::addq_l_dn(2, 3),
            opcodes::move_l_dn_abs(1),
            0x0000,
            0x0200,
            opcodes::movea_l_abs_an(3),
            0x0000,
            0x0200,
            0xA000,
        ]);
        cpu.execute(&mem, 100);
        assert_eq!(cpu.read_reg(Reg::D1), 0x1234_5678);
        assert_eq!(cpu.read_reg(Reg::D2), 1);
        assert_eq!(mem.read32(0x200), 0x1234_5678);
        assert_eq!(cpu.read_reg(Reg::A3), 0x1234_5678);
    }

    #[test]
    fn test_jsr_rts() {
        // jsr 0x110; trap; ...; 0x110: moveq #5,d0; rts
        let (mut cpu, mem) = setup(&[
            opcodes::JSR_ABS_L,
            0x0000,
            0x0110,
            0xA001,
            0,
            0,
            0,
            0,
            opcodes::moveq(0, 5),
            opcodes::RTS,
        ]);
        let run = cpu.execute(&mem, 100);
        assert_eq!(
            run.exit,
            CpuExit::Trap {
                opcode: 0xA001,
                pc: 0x106
            }
        );
        assert_eq!(cpu.read_reg(Reg::D0), 5);
        assert_eq!(cpu.read_reg(Reg::SP), 0x800);
    }

    #[test]
    fn test_movem_preserves_registers() {
        let (mut cpu, mem) = setup(&[
            opcodes::MOVEM_L_TO_SP,
            opcodes::predecrement_mask(opcodes::MASK_ALL_BUT_D0),
            opcodes::moveq(1, 0),
            opcodes::moveq(0, 9),
            opcodes::MOVEM_L_FROM_SP,
            opcodes::MASK_ALL_BUT_D0,
            0xA000,
        ]);
        cpu.write_reg(Reg::D1, 77);
        cpu.write_reg(Reg::A6, 0xBEEF);
        cpu.execute(&mem, 100);
        assert_eq!(cpu.read_reg(Reg::D1), 77);
        assert_eq!(cpu.read_reg(Reg::A6), 0xBEEF);
        assert_eq!(cpu.read_reg(Reg::D0), 9);
        assert_eq!(cpu.read_reg(Reg::SP), 0x800);
        // d1 sits at the lowest address
        assert_eq!(mem.read32(0x800 - 14 * 4), 77);
    }

    #[test]
    fn test_fault_and_cycle_limit() {
        let (mut cpu, mem) = setup(&[opcodes::NOP, opcodes::RESET]);
        let run = cpu.execute(&mem, 100);
        assert!(matches!(run.exit, CpuExit::Fault { pc: 0x102, .. }));
        assert_eq!(run.cycles, 1);
        assert_eq!(cpu.read_reg(Reg::Pc), 0x102);

        let (mut cpu, mem) = setup(&[opcodes::NOP; 8]);
        let run = cpu.execute(&mem, 3);
        assert_eq!(run.exit, CpuExit::CycleLimit);
        assert_eq!(cpu.read_reg(Reg::Pc), 0x106);
    }
}
