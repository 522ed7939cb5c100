//! Per-opcode semantic actions. Shared by the interpreter's block executor
//! and (conceptually) the recompiler's helper thunks — see `recompiler/codegen.rs`.
//!
//! ALU edge cases (division, rotation, sign extension) are grounded on
//! `tsrkit_pvm/interpreter/instructions/tables/{ii_reg,iii_reg}.py`.

use crate::codec::{sign_extend_32, smod, wrap_unsigned};
use crate::consts::{HALT_SENTINEL, REGISTER_COUNT};
use crate::error::{PanicReason, TerminationStatus};
use crate::isa::{op, Operands};
use crate::memory::{Memory, Permission};
use crate::program::Program;

pub type Registers = [u64; REGISTER_COUNT];

/// What happened after executing one instruction.
pub enum Outcome {
    /// Fall through to `next_pc` (sequential or satisfied/unsatisfied branch).
    Continue { next_pc: u32 },
    /// The engine must stop and return this status to the supervisor.
    Terminate(TerminationStatus),
}

fn panic(reason: PanicReason) -> Outcome {
    Outcome::Terminate(TerminationStatus::Panic(reason))
}

/// Execute one instruction. `pc` is the opcode's own position; `fallthrough_pc`
/// is `pc + 1 + skip(pc)`, precomputed by the caller (block compiler or
/// interpreter) since only it knows `skip`.
#[allow(clippy::too_many_lines)]
pub fn execute(
    opcode: u8,
    operands: Operands,
    pc: u32,
    fallthrough_pc: u32,
    regs: &mut Registers,
    memory: &mut Memory,
    program: &Program,
) -> Outcome {
    macro_rules! cont {
        () => {
            Outcome::Continue { next_pc: fallthrough_pc }
        };
    }
    macro_rules! mem_try {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(status) => return Outcome::Terminate(status),
            }
        };
    }

    match (opcode, operands) {
        (op::TRAP, _) => panic(PanicReason::ExplicitTrap),
        (op::FALLTHROUGH, _) => cont!(),

        (op::ECALLI, Operands::OneImm { vx }) => Outcome::Terminate(TerminationStatus::Host(vx as u64)),

        (op::JUMP, Operands::OneOffset { target }) => {
            if target == pc {
                cont!()
            } else {
                branch_to(program, target)
            }
        }

        (op::LOAD_IMM_64, Operands::RegExtImm { ra, vx }) => {
            regs[ra] = vx;
            cont!()
        }

        (op::STORE_IMM_U8, Operands::TwoImm { vx, vy }) => {
            mem_try!(memory.write(vx as u32, &(vy as u8).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_U16, Operands::TwoImm { vx, vy }) => {
            mem_try!(memory.write(vx as u32, &(vy as u16).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_U32, Operands::TwoImm { vx, vy }) => {
            mem_try!(memory.write(vx as u32, &(vy as u32).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_U64, Operands::TwoImm { vx, vy }) => {
            mem_try!(memory.write(vx as u32, &(vy as u64).to_le_bytes()));
            cont!()
        }

        (op::JUMP_IND, Operands::RegImm { ra, vx }) => {
            let a = (regs[ra].wrapping_add(vx as u64)) as u32 as u64;
            indirect_jump(program, a)
        }
        (op::LOAD_IMM, Operands::RegImm { ra, vx }) => {
            regs[ra] = vx as u64;
            cont!()
        }
        (op::LOAD_U8, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 1));
            regs[ra] = bytes[0] as u64;
            cont!()
        }
        (op::LOAD_I8, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 1));
            regs[ra] = bytes[0] as i8 as i64 as u64;
            cont!()
        }
        (op::LOAD_U16, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 2));
            regs[ra] = u16::from_le_bytes([bytes[0], bytes[1]]) as u64;
            cont!()
        }
        (op::LOAD_I16, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 2));
            regs[ra] = u16::from_le_bytes([bytes[0], bytes[1]]) as i16 as i64 as u64;
            cont!()
        }
        (op::LOAD_U32, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 4));
            regs[ra] = u32::from_le_bytes(bytes.try_into().unwrap()) as u64;
            cont!()
        }
        (op::LOAD_I32, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 4));
            regs[ra] = i32::from_le_bytes(bytes.try_into().unwrap()) as i64 as u64;
            cont!()
        }
        (op::LOAD_U64, Operands::RegImm { ra, vx }) => {
            let bytes = mem_try!(memory.read(vx as u32, 8));
            regs[ra] = u64::from_le_bytes(bytes.try_into().unwrap());
            cont!()
        }
        (op::STORE_U8, Operands::RegImm { ra, vx }) => {
            mem_try!(memory.write(vx as u32, &(regs[ra] as u8).to_le_bytes()));
            cont!()
        }
        (op::STORE_U16, Operands::RegImm { ra, vx }) => {
            mem_try!(memory.write(vx as u32, &(regs[ra] as u16).to_le_bytes()));
            cont!()
        }
        (op::STORE_U32, Operands::RegImm { ra, vx }) => {
            mem_try!(memory.write(vx as u32, &(regs[ra] as u32).to_le_bytes()));
            cont!()
        }
        (op::STORE_U64, Operands::RegImm { ra, vx }) => {
            mem_try!(memory.write(vx as u32, &regs[ra].to_le_bytes()));
            cont!()
        }

        (op::STORE_IMM_IND_U8, Operands::RegTwoImm { ra, vx, vy }) => {
            let addr = regs[ra].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(vy as u8).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_IND_U16, Operands::RegTwoImm { ra, vx, vy }) => {
            let addr = regs[ra].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(vy as u16).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_IND_U32, Operands::RegTwoImm { ra, vx, vy }) => {
            let addr = regs[ra].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(vy as u32).to_le_bytes()));
            cont!()
        }
        (op::STORE_IMM_IND_U64, Operands::RegTwoImm { ra, vx, vy }) => {
            let addr = regs[ra].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(vy as u64).to_le_bytes()));
            cont!()
        }

        (op::LOAD_IMM_JUMP, Operands::RegImmOffset { ra, vx, target }) => {
            regs[ra] = vx as u64;
            branch_if(program, true, target, fallthrough_pc)
        }
        (op::BRANCH_EQ_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] == vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_NE_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] != vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_LT_U_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] < vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_LE_U_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] <= vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_GE_U_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] >= vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_GT_U_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, regs[ra] > vx as u64, target, fallthrough_pc)
        }
        (op::BRANCH_LT_S_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, (regs[ra] as i64) < vx, target, fallthrough_pc)
        }
        (op::BRANCH_LE_S_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, (regs[ra] as i64) <= vx, target, fallthrough_pc)
        }
        (op::BRANCH_GE_S_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, (regs[ra] as i64) >= vx, target, fallthrough_pc)
        }
        (op::BRANCH_GT_S_IMM, Operands::RegImmOffset { ra, vx, target }) => {
            branch_if(program, (regs[ra] as i64) > vx, target, fallthrough_pc)
        }

        (op::MOVE_REG, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra];
            cont!()
        }
        (op::SBRK, Operands::TwoReg { rd, ra }) => {
            let req = regs[ra] as u32;
            let base = memory.heap_break;
            memory.alter_accessibility(base, req, Permission::Write);
            memory.heap_break = base.wrapping_add(req);
            regs[rd] = memory.heap_break as u64;
            cont!()
        }
        (op::COUNT_SET_BITS_64, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra].count_ones() as u64;
            cont!()
        }
        (op::COUNT_SET_BITS_32, Operands::TwoReg { rd, ra }) => {
            regs[rd] = (regs[ra] as u32).count_ones() as u64;
            cont!()
        }
        (op::LEADING_ZERO_BITS_64, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra].leading_zeros() as u64;
            cont!()
        }
        (op::LEADING_ZERO_BITS_32, Operands::TwoReg { rd, ra }) => {
            regs[rd] = (regs[ra] as u32).leading_zeros() as u64;
            cont!()
        }
        (op::TRAILING_ZERO_BITS_64, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra].trailing_zeros() as u64;
            cont!()
        }
        (op::TRAILING_ZERO_BITS_32, Operands::TwoReg { rd, ra }) => {
            regs[rd] = (regs[ra] as u32).trailing_zeros() as u64;
            cont!()
        }
        (op::SIGN_EXTEND_8, Operands::TwoReg { rd, ra }) => {
            regs[rd] = (regs[ra] as u8) as i8 as i64 as u64;
            cont!()
        }
        (op::SIGN_EXTEND_16, Operands::TwoReg { rd, ra }) => {
            regs[rd] = (regs[ra] as u16) as i16 as i64 as u64;
            cont!()
        }
        (op::ZERO_EXTEND_16, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra] as u16 as u64;
            cont!()
        }
        (op::REVERSE_BYTES, Operands::TwoReg { rd, ra }) => {
            regs[rd] = regs[ra].swap_bytes();
            cont!()
        }

        (op::LOAD_IND_U8, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 1));
            regs[ra] = bytes[0] as u64;
            cont!()
        }
        (op::LOAD_IND_I8, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 1));
            regs[ra] = bytes[0] as i8 as i64 as u64;
            cont!()
        }
        (op::LOAD_IND_U16, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 2));
            regs[ra] = u16::from_le_bytes([bytes[0], bytes[1]]) as u64;
            cont!()
        }
        (op::LOAD_IND_I16, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 2));
            regs[ra] = u16::from_le_bytes([bytes[0], bytes[1]]) as i16 as i64 as u64;
            cont!()
        }
        (op::LOAD_IND_U32, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 4));
            regs[ra] = u32::from_le_bytes(bytes.try_into().unwrap()) as u64;
            cont!()
        }
        (op::LOAD_IND_I32, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 4));
            regs[ra] = i32::from_le_bytes(bytes.try_into().unwrap()) as i64 as u64;
            cont!()
        }
        (op::LOAD_IND_U64, Operands::TwoRegImm { ra, rb, vx }) => {
            let bytes = mem_try!(memory.read(regs[rb].wrapping_add(vx as u64) as u32, 8));
            regs[ra] = u64::from_le_bytes(bytes.try_into().unwrap());
            cont!()
        }
        (op::STORE_IND_U8, Operands::TwoRegImm { ra, rb, vx }) => {
            let addr = regs[rb].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(regs[ra] as u8).to_le_bytes()));
            cont!()
        }
        (op::STORE_IND_U16, Operands::TwoRegImm { ra, rb, vx }) => {
            let addr = regs[rb].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(regs[ra] as u16).to_le_bytes()));
            cont!()
        }
        (op::STORE_IND_U32, Operands::TwoRegImm { ra, rb, vx }) => {
            let addr = regs[rb].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &(regs[ra] as u32).to_le_bytes()));
            cont!()
        }
        (op::STORE_IND_U64, Operands::TwoRegImm { ra, rb, vx }) => {
            let addr = regs[rb].wrapping_add(vx as u64) as u32;
            mem_try!(memory.write(addr, &regs[ra].to_le_bytes()));
            cont!()
        }

        (op::ADD_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).wrapping_add(vx as u32));
            cont!()
        }
        (op::ADD_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].wrapping_add(vx as u64);
            cont!()
        }
        (op::AND_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb] & vx as u64;
            cont!()
        }
        (op::XOR_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb] ^ vx as u64;
            cont!()
        }
        (op::OR_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb] | vx as u64;
            cont!()
        }
        (op::MUL_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).wrapping_mul(vx as u32));
            cont!()
        }
        (op::MUL_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].wrapping_mul(vx as u64);
            cont!()
        }
        (op::SET_LT_U_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = (regs[rb] < vx as u64) as u64;
            cont!()
        }
        (op::SET_LT_S_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = ((regs[rb] as i64) < vx) as u64;
            cont!()
        }
        (op::SET_GT_U_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = (regs[rb] > vx as u64) as u64;
            cont!()
        }
        (op::SET_GT_S_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = ((regs[rb] as i64) > vx) as u64;
            cont!()
        }
        (op::SHLO_L_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).wrapping_shl(vx as u32 & 31));
            cont!()
        }
        (op::SHLO_L_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].wrapping_shl(vx as u32 & 63);
            cont!()
        }
        (op::SHLO_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).wrapping_shr(vx as u32 & 31));
            cont!()
        }
        (op::SHLO_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].wrapping_shr(vx as u32 & 63);
            cont!()
        }
        (op::SHAR_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32(((regs[rb] as u32 as i32).wrapping_shr(vx as u32 & 31)) as u32);
            cont!()
        }
        (op::SHAR_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = ((regs[rb] as i64).wrapping_shr(vx as u32 & 63)) as u64;
            cont!()
        }
        (op::ROT_L_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).rotate_left(vx as u32 & 31));
            cont!()
        }
        (op::ROT_L_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].rotate_left(vx as u32 & 63);
            cont!()
        }
        (op::ROT_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = sign_extend_32((regs[rb] as u32).rotate_right(vx as u32 & 31));
            cont!()
        }
        (op::ROT_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            regs[ra] = regs[rb].rotate_right(vx as u32 & 63);
            cont!()
        }
        (op::CMOV_IZ_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            if regs[rb] == 0 {
                regs[ra] = vx as u64;
            }
            cont!()
        }
        (op::CMOV_NZ_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            if regs[rb] != 0 {
                regs[ra] = vx as u64;
            }
            cont!()
        }

        (op::BRANCH_EQ, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, regs[ra] == regs[rb], target, fallthrough_pc)
        }
        (op::BRANCH_NE, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, regs[ra] != regs[rb], target, fallthrough_pc)
        }
        (op::BRANCH_LT_U, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, regs[ra] < regs[rb], target, fallthrough_pc)
        }
        (op::BRANCH_LT_S, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, (regs[ra] as i64) < (regs[rb] as i64), target, fallthrough_pc)
        }
        (op::BRANCH_GE_U, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, regs[ra] >= regs[rb], target, fallthrough_pc)
        }
        (op::BRANCH_GE_S, Operands::TwoRegOffset { ra, rb, target }) => {
            branch_if(program, (regs[ra] as i64) >= (regs[rb] as i64), target, fallthrough_pc)
        }

        (op::LOAD_IMM_JUMP_IND, Operands::TwoRegTwoImm { ra, rb, vx, vy }) => {
            regs[ra] = vx as u64;
            let a = (regs[rb].wrapping_add(vy as u64)) as u32 as u64;
            indirect_jump(program, a)
        }

        (op::ADD_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).wrapping_add(regs[rb] as u32));
            cont!()
        }
        (op::ADD_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].wrapping_add(regs[rb]);
            cont!()
        }
        (op::SUB_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).wrapping_sub(regs[rb] as u32));
            cont!()
        }
        (op::SUB_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].wrapping_sub(regs[rb]);
            cont!()
        }
        (op::MUL_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).wrapping_mul(regs[rb] as u32));
            cont!()
        }
        (op::MUL_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].wrapping_mul(regs[rb]);
            cont!()
        }
        (op::DIV_U_32, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as u32, regs[rb] as u32);
            regs[rd] = if b == 0 { u64::MAX } else { sign_extend_32(a / b) };
            cont!()
        }
        (op::DIV_U_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = if regs[rb] == 0 { u64::MAX } else { regs[ra] / regs[rb] };
            cont!()
        }
        (op::DIV_S_32, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as u32 as i32, regs[rb] as u32 as i32);
            regs[rd] = if b == 0 {
                u64::MAX
            } else if a == i32::MIN && b == -1 {
                wrap_unsigned(a as i64, 4)
            } else {
                wrap_unsigned((a / b) as i64, 4)
            };
            cont!()
        }
        (op::DIV_S_64, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as i64, regs[rb] as i64);
            regs[rd] = if b == 0 {
                u64::MAX
            } else if a == i64::MIN && b == -1 {
                a as u64
            } else {
                (a / b) as u64
            };
            cont!()
        }
        (op::REM_U_32, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as u32, regs[rb] as u32);
            regs[rd] = if b == 0 { sign_extend_32(a) } else { sign_extend_32(a % b) };
            cont!()
        }
        (op::REM_U_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = if regs[rb] == 0 { regs[ra] } else { regs[ra] % regs[rb] };
            cont!()
        }
        (op::REM_S_32, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as u32 as i32, regs[rb] as u32 as i32);
            regs[rd] = if b == 0 {
                wrap_unsigned(a as i64, 4)
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                wrap_unsigned(smod(a as i64, b as i64), 4)
            };
            cont!()
        }
        (op::REM_S_64, Operands::ThreeReg { ra, rb, rd }) => {
            let (a, b) = (regs[ra] as i64, regs[rb] as i64);
            regs[rd] = if b == 0 {
                a as u64
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                smod(a, b) as u64
            };
            cont!()
        }
        (op::SHLO_L_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).wrapping_shl(regs[rb] as u32 & 31));
            cont!()
        }
        (op::SHLO_L_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].wrapping_shl(regs[rb] as u32 & 63);
            cont!()
        }
        (op::SHLO_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).wrapping_shr(regs[rb] as u32 & 31));
            cont!()
        }
        (op::SHLO_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].wrapping_shr(regs[rb] as u32 & 63);
            cont!()
        }
        (op::SHAR_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32(((regs[ra] as u32 as i32).wrapping_shr(regs[rb] as u32 & 31)) as u32);
            cont!()
        }
        (op::SHAR_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = ((regs[ra] as i64).wrapping_shr(regs[rb] as u32 & 63)) as u64;
            cont!()
        }
        (op::AND, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra] & regs[rb];
            cont!()
        }
        (op::XOR, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra] ^ regs[rb];
            cont!()
        }
        (op::OR, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra] | regs[rb];
            cont!()
        }
        (op::MUL_UPPER_S_S, Operands::ThreeReg { ra, rb, rd }) => {
            let product = (regs[ra] as i64 as i128) * (regs[rb] as i64 as i128);
            regs[rd] = (product >> 64) as u64;
            cont!()
        }
        (op::MUL_UPPER_U_U, Operands::ThreeReg { ra, rb, rd }) => {
            let product = (regs[ra] as u128) * (regs[rb] as u128);
            regs[rd] = (product >> 64) as u64;
            cont!()
        }
        (op::MUL_UPPER_S_U, Operands::ThreeReg { ra, rb, rd }) => {
            let product = (regs[ra] as i64 as i128) * (regs[rb] as u128 as i128);
            regs[rd] = (product >> 64) as u64;
            cont!()
        }
        (op::SET_LT_U, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = (regs[ra] < regs[rb]) as u64;
            cont!()
        }
        (op::SET_LT_S, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = ((regs[ra] as i64) < (regs[rb] as i64)) as u64;
            cont!()
        }
        (op::CMOV_IZ, Operands::ThreeReg { ra, rb, rd }) => {
            if regs[rb] == 0 {
                regs[rd] = regs[ra];
            }
            cont!()
        }
        (op::CMOV_NZ, Operands::ThreeReg { ra, rb, rd }) => {
            if regs[rb] != 0 {
                regs[rd] = regs[ra];
            }
            cont!()
        }
        (op::ROT_L_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].rotate_left(regs[rb] as u32 & 63);
            cont!()
        }
        (op::ROT_L_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).rotate_left(regs[rb] as u32 & 31));
            cont!()
        }
        (op::ROT_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].rotate_right(regs[rb] as u32 & 63);
            cont!()
        }
        (op::ROT_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = sign_extend_32((regs[ra] as u32).rotate_right(regs[rb] as u32 & 31));
            cont!()
        }
        (op::AND_INV, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra] & !regs[rb];
            cont!()
        }
        (op::OR_INV, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra] | !regs[rb];
            cont!()
        }
        (op::XNOR, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = !(regs[ra] ^ regs[rb]);
            cont!()
        }
        (op::MAX, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = ((regs[ra] as i64).max(regs[rb] as i64)) as u64;
            cont!()
        }
        (op::MAX_U, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].max(regs[rb]);
            cont!()
        }
        (op::MIN, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = ((regs[ra] as i64).min(regs[rb] as i64)) as u64;
            cont!()
        }
        (op::MIN_U, Operands::ThreeReg { ra, rb, rd }) => {
            regs[rd] = regs[ra].min(regs[rb]);
            cont!()
        }

        _ => panic(PanicReason::UnknownOpcode),
    }
}

fn branch_to(program: &Program, target: u32) -> Outcome {
    if program.is_basic_block(target) {
        cont_to(target)
    } else {
        Outcome::Terminate(TerminationStatus::Panic(PanicReason::InvalidBranchTarget))
    }
}

fn branch_if(program: &Program, condition: bool, target: u32, fallthrough_pc: u32) -> Outcome {
    if !condition {
        return cont_to(fallthrough_pc);
    }
    branch_to(program, target)
}

fn indirect_jump(program: &Program, a: u64) -> Outcome {
    if a == HALT_SENTINEL {
        return Outcome::Terminate(TerminationStatus::Halt);
    }
    match program.resolve_jump_table(a) {
        Some(target) => cont_to(target),
        None => Outcome::Terminate(TerminationStatus::Panic(PanicReason::InvalidJumpTableIndex)),
    }
}

fn cont_to(pc: u32) -> Outcome {
    Outcome::Continue { next_pc: pc }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;

    fn trivial_program() -> Program {
        Program::decode(&[0, 1, 1, 0, 1])
    }

    #[test]
    fn trap_panics() {
        let program = trivial_program();
        let mut regs = [0u64; REGISTER_COUNT];
        let mut mem = Memory::empty();
        let outcome = execute(op::TRAP, Operands::NoArgs, 0, 1, &mut regs, &mut mem, &program);
        assert!(matches!(
            outcome,
            Outcome::Terminate(TerminationStatus::Panic(PanicReason::InvalidBranchTarget))
        ));
    }

    #[test]
    fn div_s_overflow_returns_dividend() {
        let program = trivial_program();
        let mut regs = [0u64; REGISTER_COUNT];
        regs[0] = i64::MIN as u64;
        regs[1] = u64::MAX; // -1
        let mut mem = Memory::empty();
        execute(
            op::DIV_S_64,
            Operands::ThreeReg { ra: 0, rb: 1, rd: 2 },
            0,
            1,
            &mut regs,
            &mut mem,
            &program,
        );
        assert_eq!(regs[2], i64::MIN as u64);
    }

    #[test]
    fn rem_s_overflow_is_zero() {
        let program = trivial_program();
        let mut regs = [0u64; REGISTER_COUNT];
        regs[0] = i64::MIN as u64;
        regs[1] = u64::MAX;
        let mut mem = Memory::empty();
        execute(
            op::REM_S_64,
            Operands::ThreeReg { ra: 0, rb: 1, rd: 2 },
            0,
            1,
            &mut regs,
            &mut mem,
            &program,
        );
        assert_eq!(regs[2], 0);
    }

    #[test]
    fn div_by_zero_yields_all_ones() {
        let program = trivial_program();
        let mut regs = [0u64; REGISTER_COUNT];
        regs[0] = 42;
        regs[1] = 0;
        let mut mem = Memory::empty();
        execute(
            op::DIV_U_64,
            Operands::ThreeReg { ra: 0, rb: 1, rd: 2 },
            0,
            1,
            &mut regs,
            &mut mem,
            &program,
        );
        assert_eq!(regs[2], u64::MAX);
    }
}
