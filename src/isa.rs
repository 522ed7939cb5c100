//! The closed instruction set: opcode numbering, operand shapes, operand
//! decoding, gas costs, and the terminator flag.
//!
//! Organised by operand shape: opcodes are grouped into numbered ranges
//! (no-args, one-immediate, two-register, three-register, and so on), with
//! gaps left between ranges for future growth within a shape.

pub mod op {
    // no-args (0-1)
    pub const TRAP: u8 = 0;
    pub const FALLTHROUGH: u8 = 1;
    // one imm (10)
    pub const ECALLI: u8 = 10;
    // reg+ext_imm (20)
    pub const LOAD_IMM_64: u8 = 20;
    // two imm (30-33)
    pub const STORE_IMM_U8: u8 = 30;
    pub const STORE_IMM_U16: u8 = 31;
    pub const STORE_IMM_U32: u8 = 32;
    pub const STORE_IMM_U64: u8 = 33;
    // one offset (40)
    pub const JUMP: u8 = 40;
    // reg+imm (50-62)
    pub const JUMP_IND: u8 = 50;
    pub const LOAD_IMM: u8 = 51;
    pub const LOAD_U8: u8 = 52;
    pub const LOAD_I8: u8 = 53;
    pub const LOAD_U16: u8 = 54;
    pub const LOAD_I16: u8 = 55;
    pub const LOAD_U32: u8 = 56;
    pub const LOAD_I32: u8 = 57;
    pub const LOAD_U64: u8 = 58;
    pub const STORE_U8: u8 = 59;
    pub const STORE_U16: u8 = 60;
    pub const STORE_U32: u8 = 61;
    pub const STORE_U64: u8 = 62;
    // reg+two imm (70-73)
    pub const STORE_IMM_IND_U8: u8 = 70;
    pub const STORE_IMM_IND_U16: u8 = 71;
    pub const STORE_IMM_IND_U32: u8 = 72;
    pub const STORE_IMM_IND_U64: u8 = 73;
    // reg+imm+offset (80-90)
    pub const LOAD_IMM_JUMP: u8 = 80;
    pub const BRANCH_EQ_IMM: u8 = 81;
    pub const BRANCH_NE_IMM: u8 = 82;
    pub const BRANCH_LT_U_IMM: u8 = 83;
    pub const BRANCH_LE_U_IMM: u8 = 84;
    pub const BRANCH_GE_U_IMM: u8 = 85;
    pub const BRANCH_GT_U_IMM: u8 = 86;
    pub const BRANCH_LT_S_IMM: u8 = 87;
    pub const BRANCH_LE_S_IMM: u8 = 88;
    pub const BRANCH_GE_S_IMM: u8 = 89;
    pub const BRANCH_GT_S_IMM: u8 = 90;
    // two reg (100-111)
    pub const MOVE_REG: u8 = 100;
    pub const SBRK: u8 = 101;
    pub const COUNT_SET_BITS_64: u8 = 102;
    pub const COUNT_SET_BITS_32: u8 = 103;
    pub const LEADING_ZERO_BITS_64: u8 = 104;
    pub const LEADING_ZERO_BITS_32: u8 = 105;
    pub const TRAILING_ZERO_BITS_64: u8 = 106;
    pub const TRAILING_ZERO_BITS_32: u8 = 107;
    pub const SIGN_EXTEND_8: u8 = 108;
    pub const SIGN_EXTEND_16: u8 = 109;
    pub const ZERO_EXTEND_16: u8 = 110;
    pub const REVERSE_BYTES: u8 = 111;
    // two reg+imm (120-161)
    pub const LOAD_IND_U8: u8 = 120;
    pub const LOAD_IND_I8: u8 = 121;
    pub const LOAD_IND_U16: u8 = 122;
    pub const LOAD_IND_I16: u8 = 123;
    pub const LOAD_IND_U32: u8 = 124;
    pub const LOAD_IND_I32: u8 = 125;
    pub const LOAD_IND_U64: u8 = 126;
    pub const STORE_IND_U8: u8 = 127;
    pub const STORE_IND_U16: u8 = 128;
    pub const STORE_IND_U32: u8 = 129;
    pub const STORE_IND_U64: u8 = 130;
    pub const ADD_IMM_32: u8 = 131;
    pub const ADD_IMM_64: u8 = 132;
    pub const AND_IMM: u8 = 133;
    pub const XOR_IMM: u8 = 134;
    pub const OR_IMM: u8 = 135;
    pub const MUL_IMM_32: u8 = 136;
    pub const MUL_IMM_64: u8 = 137;
    pub const SET_LT_U_IMM: u8 = 138;
    pub const SET_LT_S_IMM: u8 = 139;
    pub const SET_GT_U_IMM: u8 = 140;
    pub const SET_GT_S_IMM: u8 = 141;
    pub const SHLO_L_IMM_32: u8 = 142;
    pub const SHLO_L_IMM_64: u8 = 143;
    pub const SHLO_R_IMM_32: u8 = 144;
    pub const SHLO_R_IMM_64: u8 = 145;
    pub const SHAR_R_IMM_32: u8 = 146;
    pub const SHAR_R_IMM_64: u8 = 147;
    pub const ROT_L_IMM_32: u8 = 148;
    pub const ROT_L_IMM_64: u8 = 149;
    pub const ROT_R_IMM_32: u8 = 150;
    pub const ROT_R_IMM_64: u8 = 151;
    pub const CMOV_IZ_IMM: u8 = 152;
    pub const CMOV_NZ_IMM: u8 = 153;
    // two reg+offset (170-175)
    pub const BRANCH_EQ: u8 = 170;
    pub const BRANCH_NE: u8 = 171;
    pub const BRANCH_LT_U: u8 = 172;
    pub const BRANCH_LT_S: u8 = 173;
    pub const BRANCH_GE_U: u8 = 174;
    pub const BRANCH_GE_S: u8 = 175;
    // two reg+two imm (180)
    pub const LOAD_IMM_JUMP_IND: u8 = 180;
    // three reg (190-230)
    pub const ADD_32: u8 = 190;
    pub const ADD_64: u8 = 191;
    pub const SUB_32: u8 = 192;
    pub const SUB_64: u8 = 193;
    pub const MUL_32: u8 = 194;
    pub const MUL_64: u8 = 195;
    pub const DIV_U_32: u8 = 196;
    pub const DIV_U_64: u8 = 197;
    pub const DIV_S_32: u8 = 198;
    pub const DIV_S_64: u8 = 199;
    pub const REM_U_32: u8 = 200;
    pub const REM_U_64: u8 = 201;
    pub const REM_S_32: u8 = 202;
    pub const REM_S_64: u8 = 203;
    pub const SHLO_L_32: u8 = 204;
    pub const SHLO_L_64: u8 = 205;
    pub const SHLO_R_32: u8 = 206;
    pub const SHLO_R_64: u8 = 207;
    pub const SHAR_R_32: u8 = 208;
    pub const SHAR_R_64: u8 = 209;
    pub const AND: u8 = 210;
    pub const XOR: u8 = 211;
    pub const OR: u8 = 212;
    pub const MUL_UPPER_S_S: u8 = 213;
    pub const MUL_UPPER_U_U: u8 = 214;
    pub const MUL_UPPER_S_U: u8 = 215;
    pub const SET_LT_U: u8 = 216;
    pub const SET_LT_S: u8 = 217;
    pub const CMOV_IZ: u8 = 218;
    pub const CMOV_NZ: u8 = 219;
    pub const ROT_L_64: u8 = 220;
    pub const ROT_L_32: u8 = 221;
    pub const ROT_R_64: u8 = 222;
    pub const ROT_R_32: u8 = 223;
    pub const AND_INV: u8 = 224;
    pub const OR_INV: u8 = 225;
    pub const XNOR: u8 = 226;
    pub const MAX: u8 = 227;
    pub const MAX_U: u8 = 228;
    pub const MIN: u8 = 229;
    pub const MIN_U: u8 = 230;
}

/// One of the twelve closed operand shapes every opcode decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    NoArgs,
    OneImm,
    OneOffset,
    RegImm,
    RegExtImm,
    RegImmOffset,
    RegTwoImm,
    TwoImm,
    TwoReg,
    TwoRegImm,
    TwoRegOffset,
    TwoRegTwoImm,
    ThreeReg,
}

/// Decoded operands for one instruction, shape-tagged. `target` fields are
/// already-resolved absolute PCs (`pc + sign_ext(offset)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    NoArgs,
    OneImm { vx: i64 },
    OneOffset { target: u32 },
    RegImm { ra: usize, vx: i64 },
    RegExtImm { ra: usize, vx: u64 },
    RegImmOffset { ra: usize, vx: i64, target: u32 },
    RegTwoImm { ra: usize, vx: i64, vy: i64 },
    TwoImm { vx: i64, vy: i64 },
    TwoReg { rd: usize, ra: usize },
    TwoRegImm { ra: usize, rb: usize, vx: i64 },
    TwoRegOffset { ra: usize, rb: usize, target: u32 },
    TwoRegTwoImm { ra: usize, rb: usize, vx: i64, vy: i64 },
    ThreeReg { ra: usize, rb: usize, rd: usize },
}

/// Classify an opcode byte into its operand shape. Returns `None` for
/// unrecognised bytes, which dispatch as `PanicReason::UnknownOpcode`.
pub fn shape_of(opcode: u8) -> Option<Shape> {
    use op::*;
    Some(match opcode {
        TRAP | FALLTHROUGH => Shape::NoArgs,
        ECALLI => Shape::OneImm,
        LOAD_IMM_64 => Shape::RegExtImm,
        STORE_IMM_U8..=STORE_IMM_U64 => Shape::TwoImm,
        JUMP => Shape::OneOffset,
        JUMP_IND..=STORE_U64 => Shape::RegImm,
        STORE_IMM_IND_U8..=STORE_IMM_IND_U64 => Shape::RegTwoImm,
        LOAD_IMM_JUMP..=BRANCH_GT_S_IMM => Shape::RegImmOffset,
        MOVE_REG..=REVERSE_BYTES => Shape::TwoReg,
        LOAD_IND_U8..=CMOV_NZ_IMM => Shape::TwoRegImm,
        BRANCH_EQ..=BRANCH_GE_S => Shape::TwoRegOffset,
        LOAD_IMM_JUMP_IND => Shape::TwoRegTwoImm,
        ADD_32..=MIN_U => Shape::ThreeReg,
        _ => return None,
    })
}

pub fn is_known_opcode(opcode: u8) -> bool {
    shape_of(opcode).is_some()
}

/// Opcodes that end a basic block (branch, jump, trap, fallthrough).
pub fn is_terminator(opcode: u8) -> bool {
    use op::*;
    matches!(
        opcode,
        TRAP | FALLTHROUGH
            | JUMP
            | JUMP_IND
            | LOAD_IMM_JUMP
            | LOAD_IMM_JUMP_IND
            | BRANCH_EQ_IMM
            | BRANCH_NE_IMM
            | BRANCH_LT_U_IMM
            | BRANCH_LE_U_IMM
            | BRANCH_GE_U_IMM
            | BRANCH_GT_U_IMM
            | BRANCH_LT_S_IMM
            | BRANCH_LE_S_IMM
            | BRANCH_GE_S_IMM
            | BRANCH_GT_S_IMM
            | BRANCH_EQ
            | BRANCH_NE
            | BRANCH_LT_U
            | BRANCH_LT_S
            | BRANCH_GE_U
            | BRANCH_GE_S
    )
}

/// Gas cost of an opcode. Unknown opcodes cost nothing — they never execute,
/// dispatch panics before any cost is charged.
pub fn gas_cost(opcode: u8) -> i64 {
    use crate::consts::gas::*;
    use op::*;
    match opcode {
        TRAP | FALLTHROUGH | ECALLI | JUMP => ATOM,
        DIV_U_32 | DIV_U_64 | DIV_S_32 | DIV_S_64 | REM_U_32 | REM_U_64 | REM_S_32 | REM_S_64 | MUL_UPPER_S_S
        | MUL_UPPER_U_U | MUL_UPPER_S_U => ARITHMETIC_EXPENSIVE,
        SBRK => MEMORY_GROW,
        LOAD_U8..=STORE_U64
        | LOAD_IND_U8..=LOAD_IND_U64
        | STORE_IND_U8..=STORE_IND_U64
        | STORE_IMM_U8..=STORE_IMM_U64
        | STORE_IMM_IND_U8..=STORE_IMM_IND_U64 => MEMORY_ACCESS,
        BRANCH_EQ_IMM..=BRANCH_GT_S_IMM | BRANCH_EQ..=BRANCH_GE_S | JUMP_IND | LOAD_IMM_JUMP | LOAD_IMM_JUMP_IND => {
            BRANCHING
        }
        _ => ARITHMETIC,
    }
}

/// Decode the operands of `opcode` at `pc`, given `skip = program.skip(pc)`.
/// Each shape has its own fixed prefix (register nibbles, a length byte for
/// variable-width immediates) followed by the immediate/offset bytes
/// themselves, little-endian and sign-extended from however many bytes
/// `skip` leaves for them.
pub fn decode_operands(program: &crate::program::Program, pc: u32, opcode: u8, skip: usize) -> Operands {
    let code = &program.instructions;
    let p = pc as usize;
    match shape_of(opcode).expect("caller checks is_known_opcode first") {
        Shape::NoArgs => Operands::NoArgs,
        Shape::OneImm => {
            let lx = skip.min(4);
            let vx = crate::codec::read_le_signed(code, p + 1, lx);
            Operands::OneImm { vx }
        }
        Shape::OneOffset => {
            let lx = skip.min(4);
            let off = crate::codec::read_le_signed(code, p + 1, lx);
            Operands::OneOffset {
                target: pc.wrapping_add(off as i32 as u32),
            }
        }
        Shape::RegImm => {
            let ra = crate::codec::clamp_register(code.get(p + 1).copied().unwrap_or(0) & 0xF);
            let lx = skip.saturating_sub(1).min(4);
            let vx = crate::codec::read_le_signed(code, p + 2, lx);
            Operands::RegImm { ra, vx }
        }
        Shape::RegExtImm => {
            let ra = crate::codec::clamp_register(code.get(p + 1).copied().unwrap_or(0) & 0xF);
            let vx = crate::codec::read_le_unsigned(code, p + 2, 8);
            Operands::RegExtImm { ra, vx }
        }
        Shape::RegImmOffset => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let lx = (((b1 >> 4) & 7) as usize).min(4);
            let ly = skip.saturating_sub(lx + 1);
            let vx = crate::codec::read_le_signed(code, p + 2, lx);
            let off = crate::codec::read_le_signed(code, p + 2 + lx, ly);
            Operands::RegImmOffset {
                ra,
                vx,
                target: pc.wrapping_add(off as i32 as u32),
            }
        }
        Shape::RegTwoImm => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let lx = (((b1 >> 4) & 7) as usize).min(4);
            let ly = skip.saturating_sub(lx + 1);
            let vx = crate::codec::read_le_signed(code, p + 2, lx);
            let vy = crate::codec::read_le_signed(code, p + 2 + lx, ly);
            Operands::RegTwoImm { ra, vx, vy }
        }
        Shape::TwoImm => {
            let lx = (code.get(p + 1).copied().unwrap_or(0) as usize).min(4);
            let ly = skip.saturating_sub(lx + 1);
            let vx = crate::codec::read_le_signed(code, p + 2, lx);
            let vy = crate::codec::read_le_signed(code, p + 2 + lx, ly);
            Operands::TwoImm { vx, vy }
        }
        Shape::TwoReg => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let rd = crate::codec::clamp_register(b1 & 0xF);
            let ra = crate::codec::clamp_register((b1 >> 4) & 0xF);
            Operands::TwoReg { rd, ra }
        }
        Shape::TwoRegImm => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let rb = crate::codec::clamp_register((b1 >> 4) & 0xF);
            let lx = skip.saturating_sub(1).min(4);
            let vx = crate::codec::read_le_signed(code, p + 2, lx);
            Operands::TwoRegImm { ra, rb, vx }
        }
        Shape::TwoRegOffset => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let rb = crate::codec::clamp_register((b1 >> 4) & 0xF);
            let lx = skip.saturating_sub(1).min(4);
            let off = crate::codec::read_le_signed(code, p + 2, lx);
            Operands::TwoRegOffset {
                ra,
                rb,
                target: pc.wrapping_add(off as i32 as u32),
            }
        }
        Shape::TwoRegTwoImm => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let rb = crate::codec::clamp_register((b1 >> 4) & 0xF);
            let lx = (code.get(p + 2).copied().unwrap_or(0) & 7) as usize;
            let ly = skip.saturating_sub(lx + 2);
            let vx = crate::codec::read_le_signed(code, p + 3, lx);
            let vy = crate::codec::read_le_signed(code, p + 3 + lx, ly);
            Operands::TwoRegTwoImm { ra, rb, vx, vy }
        }
        Shape::ThreeReg => {
            let b1 = code.get(p + 1).copied().unwrap_or(0);
            let ra = crate::codec::clamp_register(b1 & 0xF);
            let rb = crate::codec::clamp_register((b1 >> 4) & 0xF);
            let rd = crate::codec::clamp_register(code.get(p + 2).copied().unwrap_or(0) & 0xF);
            Operands::ThreeReg { ra, rb, rd }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_opcode_has_a_shape() {
        assert_eq!(shape_of(op::TRAP), Some(Shape::NoArgs));
        assert_eq!(shape_of(op::ECALLI), Some(Shape::OneImm));
        assert_eq!(shape_of(op::ADD_64), Some(Shape::ThreeReg));
        assert_eq!(shape_of(253), None);
    }

    #[test]
    fn terminators_match_spec_list() {
        assert!(is_terminator(op::TRAP));
        assert!(is_terminator(op::JUMP));
        assert!(is_terminator(op::BRANCH_EQ));
        assert!(!is_terminator(op::ADD_64));
    }
}
