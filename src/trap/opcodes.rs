//! 68k encodings emitted by the bridge
//!
//! Only the handful of instructions synthesized code needs. All values are
//! first opcode words; operands follow in the instruction stream.

/// Line-A opcode space reserved for traps
pub const TRAP_BASE: u16 = 0xA000;
pub const TRAP_MASK: u16 = 0x0FFF;

pub const NOP: u16 = 0x4E71;
pub const RTS: u16 = 0x4E75;
pub const RESET: u16 = 0x4E70;

/// `jmp (xxx).L`
pub const JMP_ABS_L: u16 = 0x4EF9;
/// `jsr (xxx).L`
pub const JSR_ABS_L: u16 = 0x4EB9;

/// `movem.l <list>,-(a7)`; mask word follows in predecrement order
pub const MOVEM_L_TO_SP: u16 = 0x48E7;
/// `movem.l (a7)+,<list>`; mask word follows in normal order
pub const MOVEM_L_FROM_SP: u16 = 0x4CDF;

/// d1-d7/a0-a6, normal order (bit 0 = d0 .. bit 15 = a7)
pub const MASK_ALL_BUT_D0: u16 = 0x7FFE;

/// `move.l #imm,Dn`
pub fn move_l_imm_dn(n: u8) -> u16 {
    0x203C | ((n as u16 & 7) << 9)
}

/// `movea.l #imm,An`
pub fn movea_l_imm_an(n: u8) -> u16 {
    0x207C | ((n as u16 & 7) << 9)
}

/// `move.l Dn,(xxx).L`
pub fn move_l_dn_abs(n: u8) -> u16 {
    0x23C0 | (n as u16 & 7)
}

/// `move.l An,(xxx).L`
pub fn move_l_an_abs(n: u8) -> u16 {
    0x23C8 | (n as u16 & 7)
}

/// `move.l (xxx).L,Dn`
pub fn move_l_abs_dn(n: u8) -> u16 {
    0x2039 | ((n as u16 & 7) << 9)
}

/// `movea.l (xxx).L,An`
pub fn movea_l_abs_an(n: u8) -> u16 {
    0x2079 | ((n as u16 & 7) << 9)
}

/// `moveq #imm,Dn`
pub fn moveq(n: u8, imm: i8) -> u16 {
    0x7000 | ((n as u16 & 7) << 9) | (imm as u8 as u16)
}

/// `addq.l #q,Dn` for q in 1..=8
pub fn addq_l_dn(n: u8, q: u8) -> u16 {
    0x5080 | (((q & 7) as u16) << 9) | (n as u16 & 7)
}

/// Reverse a movem mask into predecrement order
pub fn predecrement_mask(mask: u16) -> u16 {
    mask.reverse_bits()
}
