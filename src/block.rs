//! Basic-block compiler: groups a linear run of instructions into a
//! `Block`, decoding operands and summing gas once so the interpreter's
//! inner loop dispatches through cached data rather than re-parsing bytes.
//!
//! Grounded on `InstMapper._compile_block`/`BlockInfo`
//! (`tsrkit_pvm/interpreter/instructions/inst_map.py`): a program-local
//! cache keyed by block-entry PC, populated lazily.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::TerminationStatus;
use crate::exec::{self, Outcome, Registers};
use crate::isa::{self, Operands};
use crate::memory::Memory;
use crate::program::Program;

struct CachedInstruction {
    opcode: u8,
    operands: Operands,
    pc: u32,
    fallthrough_pc: u32,
    gas: i64,
}

/// A compiled basic block: its instructions decoded once, its total gas
/// summed once.
pub struct Block {
    instructions: Vec<CachedInstruction>,
    pub total_gas: i64,
}

impl Block {
    /// Walk forward from `entry_pc` until a terminator, decoding operands
    /// and summing gas as we go.
    fn compile(program: &Program, entry_pc: u32) -> Self {
        let mut instructions = Vec::new();
        let mut total_gas = 0i64;
        let mut pc = entry_pc;
        loop {
            let opcode = program.opcode_at(pc);
            if !isa::is_known_opcode(opcode) {
                // unknown opcode ends the block; dispatch will panic on it
                instructions.push(CachedInstruction {
                    opcode,
                    operands: Operands::NoArgs,
                    pc,
                    fallthrough_pc: pc,
                    gas: 0,
                });
                break;
            }
            let skip = program.skip(pc);
            let operands = isa::decode_operands(program, pc, opcode, skip);
            let fallthrough_pc = pc + 1 + skip as u32;
            let gas = isa::gas_cost(opcode);
            total_gas += gas;
            let terminator = isa::is_terminator(opcode);
            instructions.push(CachedInstruction {
                opcode,
                operands,
                pc,
                fallthrough_pc,
                gas,
            });
            if terminator {
                break;
            }
            pc = fallthrough_pc;
        }
        Self { instructions, total_gas }
    }

    /// Execute every cached instruction in order, charging the block's
    /// total gas up front (checked by the caller before the last
    /// instruction runs, so the last instruction's effect is never
    /// observed without having been paid for). Exits immediately on any
    /// non-sequential outcome (HOST/PANIC/PAGE_FAULT/HALT/OUT_OF_GAS).
    pub fn execute(&self, regs: &mut Registers, memory: &mut Memory, program: &Program) -> (BlockResult, i64) {
        let mut gas_spent = 0i64;
        for inst in &self.instructions {
            gas_spent += inst.gas;
            if !isa::is_known_opcode(inst.opcode) {
                return (
                    BlockResult::Terminate(TerminationStatus::Panic(crate::error::PanicReason::UnknownOpcode)),
                    gas_spent,
                );
            }
            match exec::execute(
                inst.opcode,
                inst.operands,
                inst.pc,
                inst.fallthrough_pc,
                regs,
                memory,
                program,
            ) {
                Outcome::Continue { next_pc } if next_pc == inst.fallthrough_pc => continue,
                Outcome::Continue { next_pc } => return (BlockResult::Branched(next_pc), gas_spent),
                Outcome::Terminate(status) => return (BlockResult::Terminate(status), gas_spent),
            }
        }
        // block exhausted sequentially: every instruction but the last one
        // falls through by construction, so we only get here if the last
        // instruction itself fell through to its own fallthrough_pc
        let last = self.instructions.last().expect("compile() never emits an empty block");
        (BlockResult::Branched(last.fallthrough_pc), gas_spent)
    }
}

/// What happened after running a whole block.
pub enum BlockResult {
    /// Control continues at this PC (fallthrough past the terminator, or a
    /// satisfied/unsatisfied branch).
    Branched(u32),
    /// The engine must stop.
    Terminate(TerminationStatus),
}

/// Per-program cache of compiled blocks, keyed by entry PC.
pub struct BlockCache {
    blocks: RefCell<HashMap<u32, std::rc::Rc<Block>>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: RefCell::new(HashMap::new()),
        }
    }

    /// Fetch the compiled block starting at `pc`, compiling and caching it
    /// on first entry.
    pub fn get(&self, program: &Program, pc: u32) -> std::rc::Rc<Block> {
        if let Some(block) = self.blocks.borrow().get(&pc) {
            return block.clone();
        }
        let block = std::rc::Rc::new(Block::compile(program, pc));
        self.blocks.borrow_mut().insert(pc, block.clone());
        block
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::REGISTER_COUNT;

    #[test]
    fn single_trap_block_has_atom_gas() {
        let program = Program::decode(&[0, 1, 1, 0, 1]);
        let cache = BlockCache::new();
        let block = cache.get(&program, 0);
        assert_eq!(block.total_gas, crate::consts::gas::ATOM);
        let mut regs = [0u64; REGISTER_COUNT];
        let mut mem = Memory::empty();
        let (result, spent) = block.execute(&mut regs, &mut mem, &program);
        assert_eq!(spent, crate::consts::gas::ATOM);
        assert!(matches!(
            result,
            BlockResult::Terminate(TerminationStatus::Panic(_))
        ));
    }
}
