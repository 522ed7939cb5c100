//! Outer "code" container: read-only data, read-write data, stack size, and
//! the program blob, plus the initial register file for a service
//! invocation.
//!
//! Grounded on `Code`/`regs_from_pc` (`tsrkit_pvm/core/code.py`): the exact
//! field widths of the container (`o_len`/`w_len`: u24, `z`: u16, `s`: u24,
//! `c_len`: u32, all little-endian) were left unspecified by the
//! distillation and are resolved here per the original.

use crate::consts::{ARGS_ZONE_SIZE, HALT_SENTINEL, REGISTER_COUNT, ZONE_SIZE};
use crate::error::PvmError;
use crate::memory::Memory;
use crate::program::Program;

/// The outer code container for a service invocation.
pub struct Code {
    pub read: Vec<u8>,
    pub write: Vec<u8>,
    pub instructions: Vec<u8>,
    /// Jump-table entry width.
    pub z: u16,
    /// Stack size in bytes.
    pub stack_len: u32,
}

fn read_u24_le(buf: &[u8], offset: usize) -> u32 {
    crate::codec::read_le_unsigned(buf, offset, 3) as u32
}

impl Code {
    /// Decode the outer container:
    /// `o_len:u24, w_len:u24, z:u16, s:u24, o[o_len], w[w_len], c_len:u32, c[c_len]`.
    pub fn decode(buf: &[u8]) -> Result<Self, PvmError> {
        if buf.len() < 3 + 3 + 2 + 3 {
            return Err(PvmError::MalformedCode("truncated header"));
        }
        let mut offset = 0;
        let o_len = read_u24_le(buf, offset) as usize;
        offset += 3;
        let w_len = read_u24_le(buf, offset) as usize;
        offset += 3;
        let z = crate::codec::read_le_unsigned(buf, offset, 2) as u16;
        offset += 2;
        let stack_len = read_u24_le(buf, offset);
        offset += 3;

        let read = buf.get(offset..offset + o_len).ok_or(PvmError::MalformedCode("truncated read segment"))?.to_vec();
        offset += o_len;
        let write = buf
            .get(offset..offset + w_len)
            .ok_or(PvmError::MalformedCode("truncated write segment"))?
            .to_vec();
        offset += w_len;

        if buf.len() < offset + 4 {
            return Err(PvmError::MalformedCode("truncated code length"));
        }
        let c_len = crate::codec::read_le_unsigned(buf, offset, 4) as usize;
        offset += 4;
        let instructions = buf
            .get(offset..offset + c_len)
            .ok_or(PvmError::MalformedCode("truncated code segment"))?
            .to_vec();

        Ok(Self {
            read,
            write,
            instructions,
            z,
            stack_len,
        })
    }

    /// Build the initial registers and memory for invoking this code with
    /// `args`: the halt sentinel in r0, the read/write zone boundaries in
    /// r1/r7, and the argument length in r8.
    pub fn build_initial_state(&self, args: &[u8]) -> (Program, [u64; REGISTER_COUNT], Memory) {
        let program = Program::decode(&self.instructions);
        let memory = Memory::from_service_invocation(&self.read, &self.write, args, self.stack_len);

        let mut registers = [0u64; REGISTER_COUNT];
        registers[0] = HALT_SENTINEL;
        registers[1] = (1u64 << 32) - 2 * ZONE_SIZE - ARGS_ZONE_SIZE;
        registers[7] = (1u64 << 32) - ZONE_SIZE - ARGS_ZONE_SIZE;
        registers[8] = args.len() as u64;

        (program, registers, memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(read: &[u8], write: &[u8], z: u16, stack_len: u32, code: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(read.len() as u32).to_le_bytes()[..3]);
        out.extend_from_slice(&(write.len() as u32).to_le_bytes()[..3]);
        out.extend_from_slice(&z.to_le_bytes());
        out.extend_from_slice(&stack_len.to_le_bytes()[..3]);
        out.extend_from_slice(read);
        out.extend_from_slice(write);
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn round_trips_header_fields() {
        let blob = encode(b"abc", b"xy", 4, 1024, &[0, 1, 1, 0, 1]);
        let code = Code::decode(&blob).unwrap();
        assert_eq!(code.read, b"abc");
        assert_eq!(code.write, b"xy");
        assert_eq!(code.z, 4);
        assert_eq!(code.stack_len, 1024);
        assert_eq!(code.instructions, vec![0, 1, 1, 0, 1]);
    }

    #[test]
    fn initial_registers_match_service_invocation_layout() {
        let blob = encode(b"", b"", 1, 0, &[0, 1, 1, 0, 1]);
        let code = Code::decode(&blob).unwrap();
        let (_program, registers, _memory) = code.build_initial_state(b"hi");
        assert_eq!(registers[0], HALT_SENTINEL);
        assert_eq!(registers[8], 2);
    }
}
