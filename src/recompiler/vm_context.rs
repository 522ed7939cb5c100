//! The VM-context record: a flat, fixed-offset structure carrying jump-table
//! native addresses, the guest register snapshot, gas, and `heap_break`
//! across the native/guest boundary.
//!
//! Grounded on `VMContext` (`tsrkit_pvm/recompiler/vm_context.py`): same
//! field order (jump table, jump length, registers, gas, return address,
//! return stack, heap start), same "store right before the guest memory
//! window" placement, re-expressed as direct pointer arithmetic instead of
//! `ctypes.memmove`.

use crate::consts::REGISTER_COUNT;

/// Host x86-64 register a PVM register is pinned to, by PVM index.
///
/// `r0..r12` -> `rdi, rax, rsi, rbx, rdx, rbp, r8, r9, r10, r11, r12, r13,
/// r14`. `rcx` is the scratch register; `r15` holds the base of the guest
/// memory window. This pins every one of the 16 general-purpose registers,
/// leaving none free for the assembler to borrow — helper calls spill the
/// whole bank to the context record rather than reusing a free register.
pub const REGISTER_MAP: [X86Reg; REGISTER_COUNT] = [
    X86Reg::Rdi,
    X86Reg::Rax,
    X86Reg::Rsi,
    X86Reg::Rbx,
    X86Reg::Rdx,
    X86Reg::Rbp,
    X86Reg::R8,
    X86Reg::R9,
    X86Reg::R10,
    X86Reg::R11,
    X86Reg::R12,
    X86Reg::R13,
    X86Reg::R14,
];

pub const SCRATCH_REG: X86Reg = X86Reg::Rcx;
pub const MEM_BASE_REG: X86Reg = X86Reg::R15;

/// One of the 16 general-purpose x86-64 registers, carrying its raw 4-bit
/// encoding (register number within `ModRM`/`REX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X86Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl X86Reg {
    /// Raw 4-bit encoding (register number, `REX.B`/`REX.R` extension bit is
    /// bit 3 of this value).
    pub fn code(self) -> u8 {
        match self {
            Self::Rax => 0,
            Self::Rcx => 1,
            Self::Rdx => 2,
            Self::Rbx => 3,
            Self::Rsp => 4,
            Self::Rbp => 5,
            Self::Rsi => 6,
            Self::Rdi => 7,
            Self::R8 => 8,
            Self::R9 => 9,
            Self::R10 => 10,
            Self::R11 => 11,
            Self::R12 => 12,
            Self::R13 => 13,
            Self::R14 => 14,
            Self::R15 => 15,
        }
    }

    pub fn low_bits(self) -> u8 {
        self.code() & 0x7
    }

    pub fn needs_extension(self) -> bool {
        self.code() >= 8
    }
}

/// Byte layout of the context record, matching `VMContext.calculate_size`:
/// `[jump_table: u64; jump_len][jump_len: u64][regs: u64; 13][gas: i64]
/// [ret_addr: u64][ret_stack: u64][heap_start: u32][resume_pc: u64]`.
///
/// `resume_pc` has no counterpart in `vm_context.py` — it's this crate's own
/// channel for `ecalli`/`sbrk` call sites (whose native translation is a
/// shared trampoline, not per-site code) to tell the driver which guest PC
/// to report/resume at, alongside `ret_addr`/`ret_stack`'s existing
/// call-site data.
pub struct VmContextLayout {
    pub jump_len: usize,
}

impl VmContextLayout {
    pub const REGS_SIZE: usize = REGISTER_COUNT * 8;
    pub const FIXED_TAIL_SIZE: usize = 8 + 8 + 8 + 4 + 8; // gas, ret_addr, ret_stack, heap_start, resume_pc

    pub fn total_size(&self) -> usize {
        self.jump_len * 8 + 8 + Self::REGS_SIZE + Self::FIXED_TAIL_SIZE
    }

    fn jump_table_bytes(&self) -> usize {
        self.jump_len * 8
    }

    pub fn jump_len_offset(&self) -> usize {
        self.jump_table_bytes()
    }

    pub fn regs_offset(&self) -> usize {
        self.jump_len_offset() + 8
    }

    pub fn reg_offset(&self, pvm_index: usize) -> usize {
        self.regs_offset() + pvm_index * 8
    }

    pub fn gas_offset(&self) -> usize {
        self.regs_offset() + Self::REGS_SIZE
    }

    pub fn ret_addr_offset(&self) -> usize {
        self.gas_offset() + 8
    }

    pub fn ret_stack_offset(&self) -> usize {
        self.ret_addr_offset() + 8
    }

    pub fn heap_start_offset(&self) -> usize {
        self.ret_stack_offset() + 8
    }

    pub fn resume_pc_offset(&self) -> usize {
        self.heap_start_offset() + 4
    }
}

/// Host-side mirror of the context record, for the Rust code that sets it up
/// and reads it back around a native call (the generated code addresses the
/// same bytes through `r15` with a negative displacement).
pub struct VmContext {
    pub jump_table: Vec<u64>,
    pub regs: [u64; REGISTER_COUNT],
    pub gas: i64,
    pub ret_addr: u64,
    pub ret_stack: u64,
    pub heap_start: u32,
    pub resume_pc: u64,
}

impl VmContext {
    pub fn layout(&self) -> VmContextLayout {
        VmContextLayout {
            jump_len: self.jump_table.len(),
        }
    }

    /// Serialize in the exact order `VmContextLayout` describes.
    pub fn encode(&self) -> Vec<u8> {
        let layout = self.layout();
        let mut out = Vec::with_capacity(layout.total_size());
        for &addr in &self.jump_table {
            out.extend_from_slice(&addr.to_le_bytes());
        }
        out.extend_from_slice(&(self.jump_table.len() as u64).to_le_bytes());
        for &r in &self.regs {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out.extend_from_slice(&(self.gas as u64).to_le_bytes());
        out.extend_from_slice(&self.ret_addr.to_le_bytes());
        out.extend_from_slice(&self.ret_stack.to_le_bytes());
        out.extend_from_slice(&self.heap_start.to_le_bytes());
        out.extend_from_slice(&self.resume_pc.to_le_bytes());
        out
    }

    /// Read the record back out of a byte buffer written by generated code,
    /// given the jump-table length the program was assembled with.
    pub fn decode(buf: &[u8], jump_len: usize) -> Self {
        let layout = VmContextLayout { jump_len };
        let mut jump_table = Vec::with_capacity(jump_len);
        for i in 0..jump_len {
            jump_table.push(u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap()));
        }
        let mut regs = [0u64; REGISTER_COUNT];
        for (i, r) in regs.iter_mut().enumerate() {
            let off = layout.reg_offset(i);
            *r = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        }
        let gas_off = layout.gas_offset();
        let gas = u64::from_le_bytes(buf[gas_off..gas_off + 8].try_into().unwrap()) as i64;
        let ret_addr_off = layout.ret_addr_offset();
        let ret_addr = u64::from_le_bytes(buf[ret_addr_off..ret_addr_off + 8].try_into().unwrap());
        let ret_stack_off = layout.ret_stack_offset();
        let ret_stack = u64::from_le_bytes(buf[ret_stack_off..ret_stack_off + 8].try_into().unwrap());
        let heap_off = layout.heap_start_offset();
        let heap_start = u32::from_le_bytes(buf[heap_off..heap_off + 4].try_into().unwrap());
        let resume_pc_off = layout.resume_pc_offset();
        let resume_pc = u64::from_le_bytes(buf[resume_pc_off..resume_pc_off + 8].try_into().unwrap());
        Self {
            jump_table,
            regs,
            gas,
            ret_addr,
            ret_stack,
            heap_start,
            resume_pc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let ctx = VmContext {
            jump_table: vec![0x1000, 0x2000],
            regs: [7u64; REGISTER_COUNT],
            gas: -5,
            ret_addr: 0x3000,
            ret_stack: 0x4000,
            heap_start: 0x5000,
            resume_pc: 0x42,
        };
        let encoded = ctx.encode();
        let decoded = VmContext::decode(&encoded, 2);
        assert_eq!(decoded.jump_table, ctx.jump_table);
        assert_eq!(decoded.regs, ctx.regs);
        assert_eq!(decoded.gas, ctx.gas);
        assert_eq!(decoded.heap_start, ctx.heap_start);
    }

    #[test]
    fn register_map_uses_every_gpr_exactly_once_outside_scratch_and_base() {
        let mut codes: Vec<u8> = REGISTER_MAP.iter().map(|r| r.code()).collect();
        codes.push(SCRATCH_REG.code());
        codes.push(MEM_BASE_REG.code());
        codes.sort_unstable();
        assert_eq!(codes, (0u8..16).collect::<Vec<_>>());
    }
}
