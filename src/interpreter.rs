//! The decoded interpreter back-end: drives block-by-block execution,
//! accounts gas, and converts traps into a termination record.
//!
//! Grounded on `Interpreter.execute` (`tsrkit_pvm/interpreter/pvm.py`): the
//! `while True { block = ...; gas -= cost; if gas < 0 { OUT_OF_GAS } }` loop,
//! with `tracing` events standing in for the reference's `logger.debug/info`
//! calls around gas accounting and termination.

use tracing::{debug, trace, warn};

use crate::block::{BlockCache, BlockResult};
use crate::consts::REGISTER_COUNT;
use crate::error::TerminationStatus;
use crate::hostcall::HostHandler;
use crate::memory::Memory;
use crate::program::Program;

/// The full state the engine hands back to the supervisor on every
/// termination path.
pub struct Termination {
    pub status: TerminationStatus,
    pub pc: u32,
    pub gas_remaining: i64,
    pub registers: [u64; REGISTER_COUNT],
}

/// Drives a decoded `Program` against caller-supplied registers, memory, and
/// gas using the block-compiler cache.
pub struct Interpreter<'a> {
    program: &'a Program,
    blocks: BlockCache,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            blocks: BlockCache::new(),
        }
    }

    /// Run until HALT, PANIC, PAGE_FAULT, OUT_OF_GAS, or HOST.
    ///
    /// On `HOST`, the caller is expected to service the call (via a
    /// `HostHandler`, see [`Self::run_with_host`]) and may resume by calling
    /// `run` again with the same `pc`/`registers`/`memory`/`gas` it was
    /// handed back — `pc` already points past the `ecalli` instruction.
    pub fn run(&self, mut pc: u32, mut gas: i64, mut registers: [u64; REGISTER_COUNT], memory: &mut Memory) -> Termination {
        loop {
            let block = self.blocks.get(self.program, pc);
            trace!(pc, total_gas = block.total_gas, "executing basic block");
            let (result, gas_spent) = block.execute(&mut registers, memory, self.program);
            gas -= gas_spent;
            if gas < 0 {
                warn!(pc, gas, "gas exhausted");
                return Termination {
                    status: TerminationStatus::OutOfGas,
                    pc,
                    gas_remaining: gas,
                    registers,
                };
            }
            match result {
                BlockResult::Branched(next_pc) => {
                    pc = next_pc;
                }
                BlockResult::Terminate(status) => {
                    debug!(?status, pc, gas, "interpreter terminated");
                    return Termination {
                        status,
                        pc,
                        gas_remaining: gas,
                        registers,
                    };
                }
            }
        }
    }

    /// Run to completion, servicing `HOST` terminations with `handler`
    /// until a non-cooperative status is reached. The handler pays its own
    /// gas cost, may mutate registers/memory, and returns either CONTINUE
    /// (resume past the `ecalli`) or a terminal status.
    pub fn run_with_host<H: HostHandler>(
        &self,
        mut pc: u32,
        mut gas: i64,
        mut registers: [u64; REGISTER_COUNT],
        memory: &mut Memory,
        handler: &mut H,
    ) -> Termination {
        loop {
            let termination = self.run(pc, gas, registers, memory);
            let TerminationStatus::Host(index) = termination.status else {
                return termination;
            };
            gas = termination.gas_remaining;
            registers = termination.registers;
            pc = termination.pc;
            gas -= handler.gas_cost(index);
            if gas < 0 {
                return Termination {
                    status: TerminationStatus::OutOfGas,
                    pc,
                    gas_remaining: gas,
                    registers,
                };
            }
            match handler.call(index, &mut registers, memory) {
                crate::hostcall::HostOutcome::Continue => continue,
                crate::hostcall::HostOutcome::Terminate(status) => {
                    return Termination {
                        status,
                        pc,
                        gas_remaining: gas,
                        registers,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg_vec(regs: &[u64; REGISTER_COUNT]) -> Vec<u64> {
        regs.to_vec()
    }

    /// S3 — trap. Single-byte program, any positive gas. Expects PANIC and
    /// `gas_remaining = G - 1`.
    #[test]
    fn s3_trap_panics_and_charges_one_gas() {
        let program = Program::decode(&[0, 1, 1, 0, 1]); // opcode 0 = trap
        let interp = Interpreter::new(&program);
        let mut mem = Memory::empty();
        let result = interp.run(0, 1000, [0u64; REGISTER_COUNT], &mut mem);
        assert!(matches!(result.status, TerminationStatus::Panic(_)));
        assert_eq!(result.gas_remaining, 999);
    }

    /// S6 — indirect jump bounds check against an empty jump table.
    #[test]
    fn s6_indirect_jump_against_empty_table_panics() {
        // jump_ind r3, 0 ; jump table empty
        // shape reg+imm: opcode, byte(ra=3), imm bytes (0 length -> skip=1)
        let instructions = [crate::isa::op::JUMP_IND, 3];
        let bitmap = [true, true];
        let mut blob = vec![0u8, 1, instructions.len() as u8];
        blob.extend_from_slice(&instructions);
        let mut byte = 0u8;
        for (i, &b) in bitmap.iter().enumerate() {
            if b {
                byte |= 1 << i;
            }
        }
        blob.push(byte);
        let program = Program::decode(&blob);
        let interp = Interpreter::new(&program);
        let mut mem = Memory::empty();
        let mut registers = [0u64; REGISTER_COUNT];
        registers[3] = 3;
        let result = interp.run(0, 1000, registers, &mut mem);
        assert_eq!(
            result.status,
            TerminationStatus::Panic(crate::error::PanicReason::InvalidJumpTableIndex)
        );
    }

    /// Gas exhaustion on a tight self-looping add: a program that adds two
    /// registers forever must terminate OUT_OF_GAS with a negative deficit.
    #[test]
    fn out_of_gas_on_infinite_loop() {
        // add_64 rd=0, ra=1, rb=0 (three-reg: opcode, byte(ra|rb<<4), byte(rd)); then jump back to pc 0
        let add = [crate::isa::op::ADD_64, 0x01, 0]; // ra=1, rb=0, rd=0 => r0 += r1
        let jump_offset = (-3i32) as u32; // jump back to instruction 0 from pc=3
        let mut instructions = add.to_vec();
        instructions.push(crate::isa::op::JUMP);
        instructions.extend_from_slice(&jump_offset.to_le_bytes());
        let bit_len = instructions.len();
        let mut bitmap_bits = vec![false; bit_len];
        bitmap_bits[0] = true; // add_64 opcode
        bitmap_bits[3] = true; // jump opcode
        let mut blob = vec![0u8, 1, bit_len as u8];
        blob.extend_from_slice(&instructions);
        let mut byte = 0u8;
        let mut bit_idx = 0;
        for &b in &bitmap_bits {
            if b {
                byte |= 1 << bit_idx;
            }
            bit_idx += 1;
            if bit_idx == 8 {
                blob.push(byte);
                byte = 0;
                bit_idx = 0;
            }
        }
        if bit_idx != 0 {
            blob.push(byte);
        }
        let program = Program::decode(&blob);
        let interp = Interpreter::new(&program);
        let mut mem = Memory::empty();
        let mut registers = [0u64; REGISTER_COUNT];
        registers[1] = 1;
        let result = interp.run(0, 100, registers, &mut mem);
        assert_eq!(result.status, TerminationStatus::OutOfGas);
        assert!(result.gas_remaining < 0);
        assert!(reg_vec(&result.registers)[0] > 0);
    }
}
