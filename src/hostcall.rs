//! Host-call dispatch boundary: the seam through which sandboxed programs
//! request services of the supervisor.
//!
//! Grounded on `tsrkit_pvm/common/status.py`'s `HostStatus` sentinel set.
//! The dispatcher is a pluggable trait the supervisor implements rather than
//! a hardcoded service table, so `Interpreter`/`Recompiler` stay ignorant of
//! what any given call index actually does.

use crate::consts::REGISTER_COUNT;
use crate::error::TerminationStatus;
use crate::memory::Memory;

/// Result sentinels a handler writes into register 7, all encoded as
/// `2^64 - k`.
pub mod sentinel {
    pub const NONE: u64 = u64::MAX; // 2^64 - 1
    pub const WHAT: u64 = u64::MAX - 1;
    pub const OOB: u64 = u64::MAX - 2;
    pub const WHO: u64 = u64::MAX - 3;
    pub const FULL: u64 = u64::MAX - 4;
    pub const CORE: u64 = u64::MAX - 5;
    pub const CASH: u64 = u64::MAX - 6;
    pub const LOW: u64 = u64::MAX - 7;
    pub const HUH: u64 = u64::MAX - 8;
    pub const OK: u64 = 0;
}

/// Register index handlers use to report their sentinel result.
pub const RESULT_REGISTER: usize = 7;

/// What a host-call handler decides after servicing a call.
pub enum HostOutcome {
    /// Resume execution after the `ecalli` instruction.
    Continue,
    /// Stop the engine and return this status to the original caller.
    Terminate(TerminationStatus),
}

/// Supervisor-provided host-call table. Implementations see the full guest
/// register file and memory and are responsible for honouring the same
/// read/write access contracts the engine itself enforces.
pub trait HostHandler {
    /// Gas cost the supervisor charges for servicing `index`, deducted
    /// before the call runs. Left to the handler rather than fixed here,
    /// since the cost of a service call depends on what it does.
    fn gas_cost(&self, index: u64) -> i64;

    /// Service the call identified by `index`.
    fn call(&mut self, index: u64, registers: &mut [u64; REGISTER_COUNT], memory: &mut Memory) -> HostOutcome;
}

/// A handler that answers every call with `sentinel::WHAT` and continues —
/// useful as a baseline in tests that only care about the interpreter's own
/// control flow, not a real service surface.
pub struct NullHandler;

impl HostHandler for NullHandler {
    fn gas_cost(&self, _index: u64) -> i64 {
        0
    }

    fn call(&mut self, _index: u64, registers: &mut [u64; REGISTER_COUNT], _memory: &mut Memory) -> HostOutcome {
        registers[RESULT_REGISTER] = sentinel::WHAT;
        HostOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S5 — host-call round-trip. `ecalli 5` then a terminating instruction;
    /// on resume after the supervisor sets r7 = OK, execution proceeds past
    /// the call rather than re-entering it.
    #[test]
    fn s5_host_call_round_trip() {
        use crate::interpreter::Interpreter;
        use crate::program::Program;

        let instructions = [crate::isa::op::ECALLI, 5, crate::isa::op::TRAP];
        let mut blob = vec![0u8, 1, instructions.len() as u8];
        blob.extend_from_slice(&instructions);
        blob.push(0b0000_0101); // opcode bits at positions 0 and 2

        let program = Program::decode(&blob);
        let interp = Interpreter::new(&program);
        let mut mem = Memory::empty();
        let registers = [0u64; REGISTER_COUNT];

        let first = interp.run(0, 1000, registers, &mut mem);
        assert_eq!(first.status, TerminationStatus::Host(5));
        assert_eq!(first.pc, 2);

        let mut registers = first.registers;
        registers[RESULT_REGISTER] = sentinel::OK;
        let second = interp.run(first.pc, first.gas_remaining, registers, &mut mem);
        assert_eq!(
            second.status,
            TerminationStatus::Panic(crate::error::PanicReason::ExplicitTrap)
        );
    }
}
