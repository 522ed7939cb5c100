//! Native code generation: a minimal x86-64 assembler plus the per-opcode
//! translation rules, emitting one native label per basic-block entry and a
//! gas-subtract-and-trap sequence ahead of every opcode.
//!
//! Grounded on `REC_Program.assemble` and `PyAssembler`
//! (`tsrkit_pvm/recompiler/program.py`, `tsrkit_asm`): the byte-level
//! assembler is this crate's own (no `tsrkit_asm` binding exists on the Rust
//! side), but the translation plan — one label per block, per-instruction
//! gas subtraction with signed-overflow trap, helper calls for the handful
//! of opcodes whose semantics aren't a single native instruction — follows
//! `program.py`/`pvm.py` directly.

use std::collections::HashMap;

use crate::isa::{self, op, Operands};
use crate::program::Program;
use crate::recompiler::vm_context::{VmContextLayout, MEM_BASE_REG, REGISTER_MAP, SCRATCH_REG, X86Reg};

/// Addresses of the three process-global trampolines every compiled program
/// branches to.
#[derive(Debug, Clone, Copy)]
pub struct Trampolines {
    pub panic: u64,
    pub out_of_gas: u64,
    pub halt: u64,
    pub host_call: u64,
    pub sbrk: u64,
}

/// Index of a compiler-provided helper function used for opcodes whose
/// semantics (div/rem edge cases, multiply-upper-half across signedness
/// combinations) are cheaper to express once in Rust than to hand-encode
/// natively for every case; see `helpers.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    DivU32,
    DivU64,
    DivS32,
    DivS64,
    RemU32,
    RemU64,
    RemS32,
    RemS64,
    MulUpperSS,
    MulUpperUU,
    MulUpperSU,
}

/// Growable native-code buffer with label bookkeeping. Branch targets are
/// resolved by the caller via `label_fixups` lists rather than tracked
/// internally, since guest-PC fixups and trampoline fixups patch at
/// different times (block layout vs. immediately).
pub struct Assembler {
    pub code: Vec<u8>,
    /// guest PC -> native code offset, populated as blocks are emitted.
    pub block_offsets: HashMap<u32, usize>,
    /// Sorted (native offset, guest pc) breakpoints, one per opcode, used by
    /// the signal handler to map a faulting host PC back to a guest PC.
    pub breakpoints: Vec<(usize, u32)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            block_offsets: HashMap::new(),
            breakpoints: Vec::new(),
        }
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn push_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    fn push_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn push_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// `REX.W + opcode + ModRM` for a register-register form.
    fn rex_rr(&mut self, reg: X86Reg, rm: X86Reg, base_opcode: u8) {
        let rex = 0x48 | ((reg.needs_extension() as u8) << 2) | (rm.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(base_opcode);
        self.push_u8(0xC0 | (reg.low_bits() << 3) | rm.low_bits());
    }

    pub fn mov_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        // mov dst, src  (89 /r encodes src as reg, dst as rm)
        self.rex_rr(src, dst, 0x89);
    }

    pub fn mov_reg_imm64(&mut self, dst: X86Reg, imm: u64) {
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xB8 | dst.low_bits());
        self.push_u64(imm);
    }

    pub fn mov_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        // mov dst, imm32 (sign-extended), C7 /0
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xC7);
        self.push_u8(0xC0 | dst.low_bits());
        self.push_i32(imm);
    }

    /// `add dst, imm32` (sign-extended), `81 /0`.
    pub fn add_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x81);
        self.push_u8(0xC0 | dst.low_bits());
        self.push_i32(imm);
    }

    /// `mov dst, [base + disp32]`.
    pub fn load_mem(&mut self, dst: X86Reg, base: X86Reg, disp: i32) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (base.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x8B);
        self.push_u8(0x80 | (dst.low_bits() << 3) | base.low_bits());
        if base.low_bits() == X86Reg::Rsp.low_bits() {
            self.push_u8(0x24); // SIB: base=rsp/r12, no index
        }
        self.push_i32(disp);
    }

    /// `mov [base + disp32], src`.
    pub fn store_mem(&mut self, base: X86Reg, disp: i32, src: X86Reg) {
        let rex = 0x48 | ((src.needs_extension() as u8) << 2) | (base.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x89);
        self.push_u8(0x80 | (src.low_bits() << 3) | base.low_bits());
        if base.low_bits() == X86Reg::Rsp.low_bits() {
            self.push_u8(0x24);
        }
        self.push_i32(disp);
    }

    /// `mov index, imm32` — zero-extends to 64 bits, which is exactly what a
    /// guest 32-bit address needs against the 64-bit `r15` base (a
    /// sign-extended `disp32` would mis-address any guest address with its
    /// top bit set).
    pub fn mov_reg32_imm32(&mut self, dst: X86Reg, imm: u32) {
        if dst.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0xB8 | dst.low_bits());
        self.push_u32(imm);
    }

    /// Load `width` bytes from `[r15 + index]` into `dst`, zero- or
    /// sign-extending to 64 bits. `width` is 1/2/4/8; `signed` controls
    /// movzx/movsx (movsxd for width 4) vs. a plain zero-extending 32-bit
    /// load.
    pub fn load_guest_mem(&mut self, dst: X86Reg, index: X86Reg, width: u8, signed: bool) {
        let rex_w = matches!(width, 8) || (width == 4 && signed);
        let rex = 0x40 | ((rex_w as u8) << 3) | ((dst.needs_extension() as u8) << 2) | (index.needs_extension() as u8);
        self.push_u8(rex);
        match (width, signed) {
            (8, _) => self.push_u8(0x8B),           // mov r64, r/m64
            (4, false) => self.push_u8(0x8B),       // mov r32, r/m32 (zero-extends to r64)
            (4, true) => self.push_u8(0x63),        // movsxd r64, r/m32
            (1, false) => {
                self.push_u8(0x0F);
                self.push_u8(0xB6); // movzx r64, r/m8
            }
            (1, true) => {
                self.push_u8(0x0F);
                self.push_u8(0xBE); // movsx r64, r/m8
            }
            (2, false) => {
                self.push_u8(0x0F);
                self.push_u8(0xB7); // movzx r64, r/m16
            }
            (2, true) => {
                self.push_u8(0x0F);
                self.push_u8(0xBF); // movsx r64, r/m16
            }
            _ => unreachable!("unsupported load width"),
        }
        // ModRM: mod=00, reg=dst, rm=100 (SIB follows); SIB: scale=00, index=index, base=r15(111)
        self.push_u8(0x00 | (dst.low_bits() << 3) | 0b100);
        self.push_u8((0b00 << 6) | (index.low_bits() << 3) | MEM_BASE_REG.low_bits());
    }

    /// Store the low `width` bytes of `src` to `[r15 + index]`.
    pub fn store_guest_mem(&mut self, index: X86Reg, src: X86Reg, width: u8) {
        let rex = 0x48 | ((src.needs_extension() as u8) << 2) | (index.needs_extension() as u8);
        match width {
            1 => {
                // mov r/m8, r8 (88 /r) — omit REX.W, still need REX for extended regs
                if rex != 0x48 {
                    self.push_u8(rex & !0x48 | 0x40);
                }
                self.push_u8(0x88);
            }
            2 => {
                self.push_u8(0x66); // operand-size prefix
                self.push_u8(rex & !0x48 | 0x40);
                self.push_u8(0x89);
            }
            4 => {
                self.push_u8(rex & !0x48 | 0x40);
                self.push_u8(0x89);
            }
            8 => {
                self.push_u8(rex);
                self.push_u8(0x89);
            }
            _ => unreachable!("unsupported store width"),
        }
        self.push_u8(0x00 | (src.low_bits() << 3) | 0b100);
        self.push_u8((0b00 << 6) | (index.low_bits() << 3) | MEM_BASE_REG.low_bits());
    }

    pub fn add_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr(src, dst, 0x01);
    }

    pub fn sub_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr(src, dst, 0x29);
    }

    pub fn and_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr(src, dst, 0x21);
    }

    pub fn or_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr(src, dst, 0x09);
    }

    pub fn xor_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr(src, dst, 0x31);
    }

    pub fn cmp_reg_reg(&mut self, a: X86Reg, b: X86Reg) {
        self.rex_rr(b, a, 0x39);
    }

    /// `imul dst, src` (two-operand form, `0F AF /r`).
    pub fn imul_reg_reg(&mut self, dst: X86Reg, src: X86Reg) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0xAF);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// Subtract `cost` (gas) from `[ctx + gas_offset]`, trapping to
    /// `out_of_gas_target` on signed overflow — the per-instruction gas
    /// guard every opcode's translation is prefixed with.
    ///
    /// The trampoline lives in a separate allocation from this program's
    /// code, so a direct `Jcc rel32` to it isn't expressible until the code
    /// buffer's final load address is known; instead this emits the
    /// standard `jno skip; jmp_abs target; skip:` trick, which only needs
    /// intra-buffer (load-address-independent) relative offsets.
    pub fn emit_gas_charge(&mut self, gas_offset: i32, cost: i64, out_of_gas_target: u64) {
        // mov rax, [r15 + gas_offset]   (ctx precedes guest memory at a negative offset)
        self.load_mem(X86Reg::Rax, MEM_BASE_REG, gas_offset);
        // sub rax, cost
        self.push_u8(0x48);
        self.push_u8(0x2D);
        self.push_i32(cost as i32);
        self.store_mem(MEM_BASE_REG, gas_offset, X86Reg::Rax);
        // jno skip (rel8)
        self.push_u8(0x71);
        let rel8_pos = self.here();
        self.push_u8(0);
        let abs_jump_start = self.here();
        self.jmp_abs(out_of_gas_target);
        let skip_len = self.here() - abs_jump_start;
        self.code[rel8_pos] = skip_len as u8;
    }

    pub fn call_abs(&mut self, target: u64) {
        self.mov_reg_imm64(SCRATCH_REG, target);
        // call rcx (FF /2)
        self.push_u8(0xFF);
        self.push_u8(0xD0 | SCRATCH_REG.low_bits());
    }

    pub fn jmp_abs(&mut self, target: u64) {
        self.mov_reg_imm64(SCRATCH_REG, target);
        self.push_u8(0xFF);
        self.push_u8(0xE0 | SCRATCH_REG.low_bits());
    }

    pub fn ret(&mut self) {
        self.push_u8(0xC3);
    }

    pub fn push_reg(&mut self, reg: X86Reg) {
        if reg.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0x50 | reg.low_bits());
    }

    pub fn pop_reg(&mut self, reg: X86Reg) {
        if reg.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0x58 | reg.low_bits());
    }

    /// `call reg` (`FF /2`), for calling through a register that already
    /// holds the target (as opposed to `call_abs`, which loads an immediate
    /// target into the scratch register first).
    pub fn call_reg(&mut self, reg: X86Reg) {
        if reg.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0xFF);
        self.push_u8(0xD0 | reg.low_bits());
    }

    /// `mov byte [addr_reg], imm8` — used by the trampoline stubs to tag
    /// their exit kind into a fixed status cell before `ret`ing.
    pub fn store_imm8(&mut self, addr_reg: X86Reg, value: u8) {
        if addr_reg.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0xC6);
        self.push_u8(0x00 | addr_reg.low_bits());
        if addr_reg.low_bits() == X86Reg::Rsp.low_bits() {
            self.push_u8(0x24);
        }
        self.push_u8(value);
    }

    /// Record that the instruction currently being emitted at native offset
    /// `native_offset` corresponds to guest PC `pc` — consumed by the signal
    /// handler's host-PC -> guest-PC binary search.
    pub fn mark_breakpoint(&mut self, pc: u32) {
        let offset = self.here();
        self.breakpoints.push((offset, pc));
    }

    /// `REX + opcode + ModRM` for a register-register form at 32-bit operand
    /// size (no `REX.W`) — writes to `rm` zero-extend its upper 32 bits.
    fn rex_rr32(&mut self, reg: X86Reg, rm: X86Reg, base_opcode: u8) {
        let rex = 0x40 | ((reg.needs_extension() as u8) << 2) | (rm.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(base_opcode);
        self.push_u8(0xC0 | (reg.low_bits() << 3) | rm.low_bits());
    }

    /// `mov dst, src` at 32-bit width — zero-extends `dst`'s upper 32 bits,
    /// canonicalizing a register that may hold stale high bits.
    pub fn mov_reg_reg_32(&mut self, dst: X86Reg, src: X86Reg) {
        self.rex_rr32(src, dst, 0x89);
    }

    /// `movsxd dst, dst` (`63 /r`, `REX.W`) — sign-extend the low 32 bits of
    /// `dst` back out to 64, the write-back step every 32-bit-width ALU
    /// opcode applies before storing its result.
    pub fn sign_extend_32_inplace(&mut self, dst: X86Reg) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x63);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | dst.low_bits());
    }

    /// `<op> dst, imm32` via the `81 /digit id` group (`ADD`=0, `OR`=1,
    /// `AND`=4, `SUB`=5, `XOR`=6, `CMP`=7). `w64` selects `REX.W` (64-bit
    /// operand, immediate sign-extended) vs. a 32-bit operand (immediate
    /// compared/combined bit-for-bit, no extension).
    pub fn alu_imm32(&mut self, dst: X86Reg, digit: u8, imm_bits: u32, w64: bool) {
        let rex = 0x40 | ((w64 as u8) << 3) | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x81);
        self.push_u8(0xC0 | (digit << 3) | dst.low_bits());
        self.push_u32(imm_bits);
    }

    pub fn and_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        self.alu_imm32(dst, 4, imm as u32, true);
    }

    pub fn or_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        self.alu_imm32(dst, 1, imm as u32, true);
    }

    pub fn xor_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        self.alu_imm32(dst, 6, imm as u32, true);
    }

    pub fn cmp_reg_imm32_sext(&mut self, dst: X86Reg, imm: i32) {
        self.alu_imm32(dst, 7, imm as u32, true);
    }

    /// `test dst, imm32` (`F7 /0 id`).
    pub fn test_reg_imm32(&mut self, dst: X86Reg, imm: u32) {
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xF7);
        self.push_u8(0xC0 | dst.low_bits());
        self.push_u32(imm);
    }

    /// `test a, b` (`85 /r`).
    pub fn test_reg_reg(&mut self, a: X86Reg, b: X86Reg) {
        self.rex_rr(b, a, 0x85);
    }

    /// `not dst` (`F7 /2`).
    pub fn not_reg(&mut self, dst: X86Reg) {
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xF7);
        self.push_u8(0xD0 | dst.low_bits());
    }

    /// `imul dst, src, imm32` (three-operand form, `69 /r id`).
    pub fn imul_reg_reg_imm32(&mut self, dst: X86Reg, src: X86Reg, imm: i32) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x69);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
        self.push_i32(imm);
    }

    /// `<shift> dst, imm8` via the `C1 /digit ib` group (`ROL`=0, `ROR`=1,
    /// `SHL`=4, `SHR`=5, `SAR`=7). Hardware masks `imm8` to 5 (32-bit) or 6
    /// (64-bit) bits on its own, matching the guest's `& 31`/`& 63`.
    pub fn shift_imm(&mut self, dst: X86Reg, digit: u8, amount: u8, w64: bool) {
        let rex = 0x40 | ((w64 as u8) << 3) | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xC1);
        self.push_u8(0xC0 | (digit << 3) | dst.low_bits());
        self.push_u8(amount);
    }

    /// `<shift> dst, cl` via the `D3 /digit` group — same digit layout as
    /// [`Self::shift_imm`], count taken from `cl` (the scratch register's low
    /// byte), which hardware masks the same way a literal count would be.
    pub fn shift_cl(&mut self, dst: X86Reg, digit: u8, w64: bool) {
        let rex = 0x40 | ((w64 as u8) << 3) | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0xD3);
        self.push_u8(0xC0 | (digit << 3) | dst.low_bits());
    }

    /// `setcc dst` (`0F 90+cc /0`), writing the condition as 0/1 into the low
    /// byte of `dst`. Callers zero `dst` first and never touch its high bytes.
    pub fn setcc(&mut self, dst: X86Reg, cc: u8) {
        let rex = 0x40 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0x90 | cc);
        self.push_u8(0xC0 | dst.low_bits());
    }

    /// `cmovcc dst, src` (`0F 40+cc /r`).
    pub fn cmovcc(&mut self, dst: X86Reg, src: X86Reg, cc: u8) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0x40 | cc);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// `bsr dst, src` (`0F BD /r`) — index of the highest set bit; undefined
    /// (but flags-visible via `ZF`) when `src == 0`. `w64` selects operand
    /// width; the 32-bit form only ever reads/writes the low 32 bits.
    pub fn bsr(&mut self, dst: X86Reg, src: X86Reg, w64: bool) {
        let rex = 0x40 | ((w64 as u8) << 3) | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0xBD);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// `bsf dst, src` (`0F BC /r`) — index of the lowest set bit, i.e. the
    /// trailing zero count directly; same zero-input caveat as `bsr`.
    pub fn bsf(&mut self, dst: X86Reg, src: X86Reg, w64: bool) {
        let rex = 0x40 | ((w64 as u8) << 3) | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0xBC);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// `popcnt dst, src` (`F3 0F B8 /r`).
    pub fn popcnt(&mut self, dst: X86Reg, src: X86Reg, w64: bool) {
        self.push_u8(0xF3);
        let rex = 0x40 | ((w64 as u8) << 3) | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0xB8);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// `bswap dst` (`0F C8+r`), always full 64-bit width.
    pub fn bswap(&mut self, dst: X86Reg) {
        let rex = 0x48 | (dst.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        self.push_u8(0xC8 | dst.low_bits());
    }

    /// Register-to-register sign/zero extend from an 8- or 16-bit view of
    /// `src` up to a full 64-bit `dst` (`0F B6/BE/B7/BF /r`, `REX.W`).
    pub fn extend_reg(&mut self, dst: X86Reg, src: X86Reg, width: u8, signed: bool) {
        let rex = 0x48 | ((dst.needs_extension() as u8) << 2) | (src.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x0F);
        let op = match (width, signed) {
            (1, false) => 0xB6,
            (1, true) => 0xBE,
            (2, false) => 0xB7,
            (2, true) => 0xBF,
            _ => unreachable!("unsupported extend width"),
        };
        self.push_u8(op);
        self.push_u8(0xC0 | (dst.low_bits() << 3) | src.low_bits());
    }

    /// `mov dst, [base + index*8 + disp32]` — the one indexed-addressing form
    /// this assembler needs, for reading a native jump-table slot out of the
    /// context record.
    pub fn load_mem_sib8(&mut self, dst: X86Reg, base: X86Reg, index: X86Reg, disp: i32) {
        let rex = 0x48
            | ((dst.needs_extension() as u8) << 2)
            | ((index.needs_extension() as u8) << 1)
            | (base.needs_extension() as u8);
        self.push_u8(rex);
        self.push_u8(0x8B);
        self.push_u8(0x80 | (dst.low_bits() << 3) | 0b100);
        self.push_u8((0b11 << 6) | (index.low_bits() << 3) | base.low_bits());
        self.push_i32(disp);
    }

    /// `jmp reg` (`FF /4`).
    pub fn jmp_reg(&mut self, reg: X86Reg) {
        if reg.needs_extension() {
            self.push_u8(0x41);
        }
        self.push_u8(0xFF);
        self.push_u8(0xE0 | reg.low_bits());
    }

    /// `Jcc rel8` to a fresh fixup slot, returning its position for
    /// [`Self::patch_rel8`].
    fn jcc_rel8(&mut self, cc: u8) -> usize {
        self.push_u8(0x70 | cc);
        let pos = self.here();
        self.push_u8(0);
        pos
    }

    /// `jmp rel8` to a fresh fixup slot.
    fn jmp_rel8(&mut self) -> usize {
        self.push_u8(0xEB);
        let pos = self.here();
        self.push_u8(0);
        pos
    }

    fn patch_rel8(&mut self, pos: usize) {
        let len = self.here() - (pos + 1);
        self.code[pos] = len as u8;
    }

    /// Jump to the process-wide `target` trampoline iff condition `cc` holds,
    /// falling through otherwise. Uses the same load-address-independent
    /// `Jcc rel8 skip; jmp_abs target; skip:` shape as [`Self::emit_gas_charge`].
    pub fn emit_trap_if(&mut self, cc: u8, target: u64) {
        let skip = self.jcc_rel8(cc ^ 1);
        self.jmp_abs(target);
        self.patch_rel8(skip);
    }
}

/// x86 condition-code nibbles shared by `Jcc`/`SETcc`/`CMOVcc`.
mod cc {
    pub const B: u8 = 0x2; // below / unsigned less-than
    pub const AE: u8 = 0x3; // above-or-equal / unsigned greater-or-equal
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const BE: u8 = 0x6; // below-or-equal / unsigned
    pub const A: u8 = 0x7; // above / unsigned greater-than
    pub const L: u8 = 0xC; // signed less-than
    pub const GE: u8 = 0xD; // signed greater-or-equal
    pub const LE: u8 = 0xE; // signed less-or-equal
    pub const G: u8 = 0xF; // signed greater-than
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the host register a PVM register index maps to.
fn hostreg(pvm_index: usize) -> X86Reg {
    REGISTER_MAP[pvm_index]
}

/// The assembled program: native code, the guest jump table translated to
/// native code offsets, the offsets every block begins at, and the
/// breakpoint table for signal-to-guest-PC translation.
pub struct CompiledProgram {
    pub code: Vec<u8>,
    pub jump_table_native: Vec<u64>,
    pub block_offsets: HashMap<u32, usize>,
    pub breakpoints: Vec<(usize, u32)>,
    pub halt_offset: usize,
}

/// Assemble `program` against `trampolines`, whose addresses are resolved
/// process-wide constants (see `recompiler::signal`).
///
/// One label per basic-block entry; every opcode position gets a
/// gas-subtract-and-overflow-trap prologue, then its native translation.
pub fn assemble(program: &Program, trampolines: Trampolines, layout: &VmContextLayout) -> CompiledProgram {
    let mut asm = Assembler::new();
    // halt trampoline target: a local label executing `ret` after loading HALT-shaped state.
    let halt_offset = asm.here();
    asm.jmp_abs(trampolines.halt);
    // fallback target for a jump-table entry that doesn't resolve to a
    // compiled basic-block entry — offset 0 is `halt_offset` itself, so this
    // needs its own stub rather than defaulting to it.
    let invalid_jump_offset = asm.here();
    asm.jmp_abs(trampolines.panic);

    let gas_offset = -(layout.total_size() as i32 - layout.gas_offset() as i32);

    let mut label_fixups: Vec<(usize, u32)> = Vec::new();
    let mut pc_to_offset = HashMap::new();

    let mut entries: Vec<u32> = program.basic_blocks.iter().copied().collect();
    entries.sort_unstable();

    for entry in entries {
        pc_to_offset.insert(entry, asm.here());
        emit_block(&mut asm, program, entry, gas_offset, trampolines, layout, &mut label_fixups);
    }

    // Patch guest-PC branch targets now that every block's offset is known.
    // Every fixup here was reserved only after `branch_fixup`/
    // `conditional_branch_fixup` confirmed the target is a compiled block
    // entry, so the lookup always succeeds.
    for (pos, target_pc) in label_fixups {
        let target_offset = pc_to_offset[&target_pc];
        let rel = target_offset as i64 - (pos as i64 + 4);
        asm.code[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    let jump_table_native = program
        .jump_table
        .iter()
        .map(|&guest_pc| {
            let guest_pc = guest_pc as u32;
            *pc_to_offset.get(&guest_pc).unwrap_or(&invalid_jump_offset) as u64
        })
        .collect();

    CompiledProgram {
        code: asm.code,
        jump_table_native,
        block_offsets: pc_to_offset,
        breakpoints: asm.breakpoints,
        halt_offset,
    }
}

fn emit_block(
    asm: &mut Assembler,
    program: &Program,
    entry: u32,
    gas_offset: i32,
    trampolines: Trampolines,
    layout: &VmContextLayout,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    let mut pc = entry;
    loop {
        let opcode = program.opcode_at(pc);
        if !isa::is_known_opcode(opcode) {
            asm.jmp_abs(trampolines.panic);
            return;
        }
        let skip = program.skip(pc);
        let operands = isa::decode_operands(program, pc, opcode, skip);
        let fallthrough_pc = pc + 1 + skip as u32;
        let gas = isa::gas_cost(opcode);

        asm.mark_breakpoint(pc);
        asm.emit_gas_charge(gas_offset, gas, trampolines.out_of_gas);

        emit_opcode(asm, program, opcode, operands, pc, fallthrough_pc, trampolines, layout, label_fixups);

        if isa::is_terminator(opcode) {
            return;
        }
        pc = fallthrough_pc;
    }
}

fn branch_fixup(asm: &mut Assembler, program: &Program, target: u32, trampolines: Trampolines, label_fixups: &mut Vec<(usize, u32)>) {
    if !program.is_basic_block(target) {
        // Invalid branch target: every block is terminated by construction,
        // so this can only be reached via a target computed from a
        // malformed offset. Redirect straight to the panic trampoline
        // instead of reserving an intra-buffer fixup slot for a target that
        // will never be compiled.
        asm.jmp_abs(trampolines.panic);
        return;
    }
    // jmp rel32 placeholder, patched once every block offset is known.
    asm.push_u8(0xE9);
    label_fixups.push((asm.here(), target));
    asm.push_i32(0);
}

fn conditional_branch_fixup(
    asm: &mut Assembler,
    program: &Program,
    cc: u8,
    target: u32,
    fallthrough: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    if !program.is_basic_block(target) {
        asm.jmp_abs(trampolines.panic);
        return;
    }
    asm.push_u8(0x0F);
    asm.push_u8(0x80 | cc);
    label_fixups.push((asm.here(), target));
    asm.push_i32(0);
    branch_fixup(asm, program, fallthrough, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_opcode(
    asm: &mut Assembler,
    program: &Program,
    opcode: u8,
    operands: Operands,
    pc: u32,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    layout: &VmContextLayout,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    match (opcode, operands) {
        (op::TRAP, _) => asm.jmp_abs(trampolines.panic),
        (op::FALLTHROUGH, _) => branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups),
        (op::ECALLI, Operands::OneImm { vx }) => {
            // Stash the call index in the context's `ret_addr` slot (unused
            // by this crate for its original purpose) and the resume PC in
            // `resume_pc`, so the driver can read both back after the native
            // call returns via `trampolines.host_call`.
            let ctx_base = -(layout.total_size() as i32);
            asm.mov_reg_imm64(SCRATCH_REG, vx as u64);
            asm.store_mem(MEM_BASE_REG, ctx_base + layout.ret_addr_offset() as i32, SCRATCH_REG);
            asm.mov_reg_imm64(SCRATCH_REG, fallthrough_pc as u64);
            asm.store_mem(MEM_BASE_REG, ctx_base + layout.resume_pc_offset() as i32, SCRATCH_REG);
            asm.jmp_abs(trampolines.host_call);
        }
        (op::JUMP, Operands::OneOffset { target }) => {
            if target == pc {
                branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
            } else {
                branch_fixup(asm, program, target, trampolines, label_fixups);
            }
        }
        (op::LOAD_IMM_64, Operands::RegExtImm { ra, vx }) => {
            asm.mov_reg_imm64(hostreg(ra), vx);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MOVE_REG, Operands::TwoReg { rd, ra }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SBRK, Operands::TwoReg { rd, ra }) => {
            // The JIT cannot change page protections mid-stream, so `sbrk`
            // always exits to the driver: stash the requested size (`ra`)
            // and the destination register index (`rd`) in the context's
            // `ret_addr`/`ret_stack` slots, then trap. The driver performs
            // the permission change and re-enters at `fallthrough_pc`'s
            // breakpoint-recorded native offset — `sbrk` is not a block
            // terminator, so that offset sits mid-block, not at a label.
            let ctx_base = -(layout.total_size() as i32);
            asm.store_mem(MEM_BASE_REG, ctx_base + layout.ret_addr_offset() as i32, hostreg(ra));
            asm.mov_reg_imm64(SCRATCH_REG, rd as u64);
            asm.store_mem(MEM_BASE_REG, ctx_base + layout.ret_stack_offset() as i32, SCRATCH_REG);
            asm.mov_reg_imm64(SCRATCH_REG, fallthrough_pc as u64);
            asm.store_mem(MEM_BASE_REG, ctx_base + layout.resume_pc_offset() as i32, SCRATCH_REG);
            asm.jmp_abs(trampolines.sbrk);
        }
        (op::ADD_32, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.add_reg_reg(hostreg(rd), hostreg(rb));
            asm.sign_extend_32_inplace(hostreg(rd));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ADD_64, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.add_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SUB_32, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.sub_reg_reg(hostreg(rd), hostreg(rb));
            asm.sign_extend_32_inplace(hostreg(rd));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SUB_64, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.sub_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::AND, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.and_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::OR, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.or_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::XOR, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.xor_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_32, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.imul_reg_reg(hostreg(rd), hostreg(rb));
            asm.sign_extend_32_inplace(hostreg(rd));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_64, Operands::ThreeReg { ra, rb, rd }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.imul_reg_reg(hostreg(rd), hostreg(rb));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_UPPER_U_U, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::MulUpperUU, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_UPPER_S_S, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::MulUpperSS, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_UPPER_S_U, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::MulUpperSU, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::DIV_U_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::DivU32, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::DIV_U_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::DivU64, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::DIV_S_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::DivS32, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::DIV_S_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::DivS64, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::REM_U_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::RemU32, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::REM_U_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::RemU64, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::REM_S_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::RemS32, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::REM_S_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_helper_call(asm, Helper::RemS64, ra, rb, rd, layout);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::BRANCH_EQ, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0x4, target, fallthrough_pc, trampolines, label_fixups); // JE
        }
        (op::BRANCH_NE, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0x5, target, fallthrough_pc, trampolines, label_fixups); // JNE
        }
        (op::BRANCH_LT_U, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0x2, target, fallthrough_pc, trampolines, label_fixups); // JB
        }
        (op::BRANCH_LT_S, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0xC, target, fallthrough_pc, trampolines, label_fixups); // JL
        }
        (op::BRANCH_GE_U, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0x3, target, fallthrough_pc, trampolines, label_fixups); // JAE
        }
        (op::BRANCH_GE_S, Operands::TwoRegOffset { ra, rb, target }) => {
            asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
            conditional_branch_fixup(asm, program, 0xD, target, fallthrough_pc, trampolines, label_fixups); // JGE
        }
        (op::LOAD_IMM_JUMP, Operands::RegImmOffset { ra, vx, target }) => {
            // Target is already a resolved absolute PC from decode, same as
            // `JUMP` — unlike `JUMP_IND`/`LOAD_IMM_JUMP_IND` this never
            // touches the runtime jump table.
            asm.mov_reg_imm32_sext(hostreg(ra), vx as i32);
            branch_fixup(asm, program, target, trampolines, label_fixups);
        }
        (op::JUMP_IND, Operands::RegImm { ra, vx }) => {
            asm.mov_reg_reg(SCRATCH_REG, hostreg(ra));
            asm.add_reg_imm32_sext(SCRATCH_REG, vx as i32);
            emit_indirect_jump_tail(asm, layout, trampolines);
        }
        (op::LOAD_IMM_JUMP_IND, Operands::TwoRegTwoImm { ra, rb, vx, vy }) => {
            // `regs[ra]` is written before `regs[rb]` is read for the address
            // computation, so a write to `ra` must land before the read of
            // `rb` when the two alias.
            asm.mov_reg_imm32_sext(hostreg(ra), vx as i32);
            asm.mov_reg_reg(SCRATCH_REG, hostreg(rb));
            asm.add_reg_imm32_sext(SCRATCH_REG, vy as i32);
            emit_indirect_jump_tail(asm, layout, trampolines);
        }

        (op::LOAD_IMM, Operands::RegImm { ra, vx }) => {
            asm.mov_reg_imm32_sext(hostreg(ra), vx as i32);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::STORE_IMM_U8, Operands::TwoImm { vx, vy }) => emit_store_imm(asm, vx, vy, 1, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_U16, Operands::TwoImm { vx, vy }) => emit_store_imm(asm, vx, vy, 2, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_U32, Operands::TwoImm { vx, vy }) => emit_store_imm(asm, vx, vy, 4, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_U64, Operands::TwoImm { vx, vy }) => emit_store_imm(asm, vx, vy, 8, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_IND_U8, Operands::RegTwoImm { ra, vx, vy }) => emit_store_imm_ind(asm, ra, vx, vy, 1, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_IND_U16, Operands::RegTwoImm { ra, vx, vy }) => emit_store_imm_ind(asm, ra, vx, vy, 2, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_IND_U32, Operands::RegTwoImm { ra, vx, vy }) => emit_store_imm_ind(asm, ra, vx, vy, 4, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IMM_IND_U64, Operands::RegTwoImm { ra, vx, vy }) => emit_store_imm_ind(asm, ra, vx, vy, 8, program, fallthrough_pc, trampolines, label_fixups),

        (op::BRANCH_EQ_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::E, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_NE_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::NE, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_LT_U_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::B, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_LE_U_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::BE, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_GE_U_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::AE, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_GT_U_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::A, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_LT_S_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::L, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_LE_S_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::LE, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_GE_S_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::GE, target, fallthrough_pc, trampolines, label_fixups),
        (op::BRANCH_GT_S_IMM, Operands::RegImmOffset { ra, vx, target }) => emit_branch_imm(asm, program, ra, vx, cc::G, target, fallthrough_pc, trampolines, label_fixups),

        (op::COUNT_SET_BITS_64, Operands::TwoReg { rd, ra }) => {
            asm.popcnt(hostreg(rd), hostreg(ra), true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::COUNT_SET_BITS_32, Operands::TwoReg { rd, ra }) => {
            asm.popcnt(hostreg(rd), hostreg(ra), false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::LEADING_ZERO_BITS_64, Operands::TwoReg { rd, ra }) => {
            emit_leading_zeros(asm, hostreg(rd), hostreg(ra), true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::LEADING_ZERO_BITS_32, Operands::TwoReg { rd, ra }) => {
            emit_leading_zeros(asm, hostreg(rd), hostreg(ra), false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::TRAILING_ZERO_BITS_64, Operands::TwoReg { rd, ra }) => {
            emit_trailing_zeros(asm, hostreg(rd), hostreg(ra), true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::TRAILING_ZERO_BITS_32, Operands::TwoReg { rd, ra }) => {
            emit_trailing_zeros(asm, hostreg(rd), hostreg(ra), false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SIGN_EXTEND_8, Operands::TwoReg { rd, ra }) => {
            asm.extend_reg(hostreg(rd), hostreg(ra), 1, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SIGN_EXTEND_16, Operands::TwoReg { rd, ra }) => {
            asm.extend_reg(hostreg(rd), hostreg(ra), 2, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ZERO_EXTEND_16, Operands::TwoReg { rd, ra }) => {
            asm.extend_reg(hostreg(rd), hostreg(ra), 2, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::REVERSE_BYTES, Operands::TwoReg { rd, ra }) => {
            asm.mov_reg_reg(hostreg(rd), hostreg(ra));
            asm.bswap(hostreg(rd));
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::ADD_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Add, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ADD_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Add, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::AND_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::And, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::XOR_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Xor, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::OR_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Or, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Mul, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MUL_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_alu_imm(asm, ra, rb, vx, AluImmOp::Mul, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::SET_LT_U_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_set_cmp_imm(asm, rb, vx, ra, cc::B);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SET_LT_S_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_set_cmp_imm(asm, rb, vx, ra, cc::L);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SET_GT_U_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_set_cmp_imm(asm, rb, vx, ra, cc::A);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SET_GT_S_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_set_cmp_imm(asm, rb, vx, ra, cc::G);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::SHLO_L_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 4, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_L_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 4, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 5, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 5, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHAR_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 7, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHAR_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 7, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_L_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 0, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_L_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 0, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_R_IMM_32, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 1, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_R_IMM_64, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_shift_imm(asm, ra, rb, vx, 1, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::CMOV_IZ_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_cmov_imm(asm, ra, rb, vx, cc::E);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::CMOV_NZ_IMM, Operands::TwoRegImm { ra, rb, vx }) => {
            emit_cmov_imm(asm, ra, rb, vx, cc::NE);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::SHLO_L_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 4, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_L_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 4, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 5, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHLO_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 5, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHAR_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 7, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SHAR_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 7, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_L_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 0, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_L_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 0, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_R_64, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 1, false);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::ROT_R_32, Operands::ThreeReg { ra, rb, rd }) => {
            emit_shift_reg(asm, ra, rb, rd, 1, true);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::SET_LT_U, Operands::ThreeReg { ra, rb, rd }) => {
            emit_set_cmp_reg(asm, ra, rb, rd, cc::B);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::SET_LT_S, Operands::ThreeReg { ra, rb, rd }) => {
            emit_set_cmp_reg(asm, ra, rb, rd, cc::L);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::CMOV_IZ, Operands::ThreeReg { ra, rb, rd }) => {
            emit_cmov_reg(asm, ra, rb, rd, cc::E);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::CMOV_NZ, Operands::ThreeReg { ra, rb, rd }) => {
            emit_cmov_reg(asm, ra, rb, rd, cc::NE);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::AND_INV, Operands::ThreeReg { ra, rb, rd }) => {
            emit_bitwise_inv(asm, ra, rb, rd, BitwiseInv::AndNotRb);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::OR_INV, Operands::ThreeReg { ra, rb, rd }) => {
            emit_bitwise_inv(asm, ra, rb, rd, BitwiseInv::OrNotRb);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::XNOR, Operands::ThreeReg { ra, rb, rd }) => {
            emit_bitwise_inv(asm, ra, rb, rd, BitwiseInv::NotXor);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        (op::MAX, Operands::ThreeReg { ra, rb, rd }) => {
            emit_minmax(asm, ra, rb, rd, cc::G);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MAX_U, Operands::ThreeReg { ra, rb, rd }) => {
            emit_minmax(asm, ra, rb, rd, cc::A);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MIN, Operands::ThreeReg { ra, rb, rd }) => {
            emit_minmax(asm, ra, rb, rd, cc::L);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }
        (op::MIN_U, Operands::ThreeReg { ra, rb, rd }) => {
            emit_minmax(asm, ra, rb, rd, cc::B);
            branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
        }

        // Direct-address loads: the guest memory window is mapped with page
        // protections mirroring the guest's permission table, so an
        // out-of-bounds or unmapped access here faults in hardware and is
        // classified by the signal handler rather than checked in-line —
        // unlike the interpreter's explicit `Memory::read` bounds check.
        (op::LOAD_U8, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 1, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_I8, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 1, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_U16, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 2, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_I16, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 2, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_U32, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 4, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_I32, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 4, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_U64, Operands::RegImm { ra, vx }) => emit_direct_load(asm, ra, vx, 8, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_U8, Operands::RegImm { ra, vx }) => emit_direct_store(asm, ra, vx, 1, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_U16, Operands::RegImm { ra, vx }) => emit_direct_store(asm, ra, vx, 2, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_U32, Operands::RegImm { ra, vx }) => emit_direct_store(asm, ra, vx, 4, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_U64, Operands::RegImm { ra, vx }) => emit_direct_store(asm, ra, vx, 8, program, fallthrough_pc, trampolines, label_fixups),

        (op::LOAD_IND_U8, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 1, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_I8, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 1, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_U16, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 2, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_I16, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 2, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_U32, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 4, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_I32, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 4, true, program, fallthrough_pc, trampolines, label_fixups),
        (op::LOAD_IND_U64, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_load(asm, ra, rb, vx, 8, false, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IND_U8, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_store(asm, ra, rb, vx, 1, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IND_U16, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_store(asm, ra, rb, vx, 2, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IND_U32, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_store(asm, ra, rb, vx, 4, program, fallthrough_pc, trampolines, label_fixups),
        (op::STORE_IND_U64, Operands::TwoRegImm { ra, rb, vx }) => emit_indirect_store(asm, ra, rb, vx, 8, program, fallthrough_pc, trampolines, label_fixups),

        _ => {
            // Reachable only for a shape/opcode pairing decode_operands never
            // actually produces; every opcode `is_known_opcode` accepts has an
            // arm above.
            asm.jmp_abs(trampolines.panic);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_direct_load(
    asm: &mut Assembler,
    ra: usize,
    vx: i64,
    width: u8,
    signed: bool,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.mov_reg32_imm32(SCRATCH_REG, vx as u32);
    asm.load_guest_mem(hostreg(ra), SCRATCH_REG, width, signed);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_direct_store(
    asm: &mut Assembler,
    ra: usize,
    vx: i64,
    width: u8,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.mov_reg32_imm32(SCRATCH_REG, vx as u32);
    asm.store_guest_mem(SCRATCH_REG, hostreg(ra), width);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_indirect_load(
    asm: &mut Assembler,
    ra: usize,
    rb: usize,
    vx: i64,
    width: u8,
    signed: bool,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.mov_reg_reg(SCRATCH_REG, hostreg(rb));
    asm.add_reg_imm32_sext(SCRATCH_REG, vx as i32);
    asm.load_guest_mem(hostreg(ra), SCRATCH_REG, width, signed);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_indirect_store(
    asm: &mut Assembler,
    ra: usize,
    rb: usize,
    vx: i64,
    width: u8,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.mov_reg_reg(SCRATCH_REG, hostreg(rb));
    asm.add_reg_imm32_sext(SCRATCH_REG, vx as i32);
    asm.store_guest_mem(SCRATCH_REG, hostreg(ra), width);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

/// Resolve a native jump table entry out of the raw address sitting in
/// `SCRATCH_REG`, trapping to `halt`/`panic` the same way
/// `Program::resolve_jump_table` does, then jump to it. Shared tail of
/// `JUMP_IND` and `LOAD_IMM_JUMP_IND`, which differ only in how `SCRATCH_REG`
/// is computed beforehand.
fn emit_indirect_jump_tail(asm: &mut Assembler, layout: &VmContextLayout, trampolines: Trampolines) {
    let ctx_base = -(layout.total_size() as i32);
    asm.mov_reg_reg_32(SCRATCH_REG, SCRATCH_REG);
    asm.alu_imm32(SCRATCH_REG, 7, 0xFFFF_0000u32, false);
    asm.emit_trap_if(cc::E, trampolines.halt);
    asm.test_reg_reg(SCRATCH_REG, SCRATCH_REG);
    asm.emit_trap_if(cc::E, trampolines.panic);
    asm.test_reg_imm32(SCRATCH_REG, 1);
    asm.emit_trap_if(cc::NE, trampolines.panic);
    asm.shift_imm(SCRATCH_REG, 5, 1, true);
    asm.add_reg_imm32_sext(SCRATCH_REG, -1);
    asm.cmp_reg_imm32_sext(SCRATCH_REG, layout.jump_len as i32);
    asm.emit_trap_if(cc::AE, trampolines.panic);
    asm.load_mem_sib8(SCRATCH_REG, MEM_BASE_REG, SCRATCH_REG, ctx_base);
    asm.jmp_reg(SCRATCH_REG);
}

#[allow(clippy::too_many_arguments)]
fn emit_store_imm(
    asm: &mut Assembler,
    vx: i64,
    vy: i64,
    width: u8,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.push_reg(X86Reg::Rax);
    asm.mov_reg_imm64(X86Reg::Rax, vy as u64);
    asm.mov_reg32_imm32(SCRATCH_REG, vx as u32);
    asm.store_guest_mem(SCRATCH_REG, X86Reg::Rax, width);
    asm.pop_reg(X86Reg::Rax);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_store_imm_ind(
    asm: &mut Assembler,
    ra: usize,
    vx: i64,
    vy: i64,
    width: u8,
    program: &Program,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    // Address computed into the scratch register before `rax` is borrowed —
    // `ra` may itself map to `rax`, so clobbering it first would corrupt the
    // address.
    asm.mov_reg_reg(SCRATCH_REG, hostreg(ra));
    asm.add_reg_imm32_sext(SCRATCH_REG, vx as i32);
    asm.push_reg(X86Reg::Rax);
    asm.mov_reg_imm64(X86Reg::Rax, vy as u64);
    asm.store_guest_mem(SCRATCH_REG, X86Reg::Rax, width);
    asm.pop_reg(X86Reg::Rax);
    branch_fixup(asm, program, fallthrough_pc, trampolines, label_fixups);
}

#[allow(clippy::too_many_arguments)]
fn emit_branch_imm(
    asm: &mut Assembler,
    program: &Program,
    ra: usize,
    vx: i64,
    cc: u8,
    target: u32,
    fallthrough_pc: u32,
    trampolines: Trampolines,
    label_fixups: &mut Vec<(usize, u32)>,
) {
    asm.cmp_reg_imm32_sext(hostreg(ra), vx as i32);
    conditional_branch_fixup(asm, program, cc, target, fallthrough_pc, trampolines, label_fixups);
}

fn emit_leading_zeros(asm: &mut Assembler, dst: X86Reg, src: X86Reg, w64: bool) {
    let width = if w64 { 64 } else { 32 };
    asm.mov_reg_imm32_sext(SCRATCH_REG, 0);
    asm.bsr(dst, src, w64);
    asm.setcc(SCRATCH_REG, cc::E);
    asm.not_reg(dst);
    asm.add_reg_imm32_sext(dst, width);
    asm.test_reg_reg(SCRATCH_REG, SCRATCH_REG);
    asm.mov_reg_imm32_sext(SCRATCH_REG, width);
    asm.cmovcc(dst, SCRATCH_REG, cc::NE);
    if !w64 {
        asm.mov_reg_reg_32(dst, dst);
    }
}

fn emit_trailing_zeros(asm: &mut Assembler, dst: X86Reg, src: X86Reg, w64: bool) {
    let width = if w64 { 64 } else { 32 };
    asm.mov_reg_imm32_sext(SCRATCH_REG, 0);
    asm.bsf(dst, src, w64);
    asm.setcc(SCRATCH_REG, cc::E);
    asm.test_reg_reg(SCRATCH_REG, SCRATCH_REG);
    asm.mov_reg_imm32_sext(SCRATCH_REG, width);
    asm.cmovcc(dst, SCRATCH_REG, cc::NE);
    if !w64 {
        asm.mov_reg_reg_32(dst, dst);
    }
}

/// Which immediate arithmetic/bitwise op `emit_alu_imm` encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluImmOp {
    Add,
    And,
    Xor,
    Or,
    Mul,
}

fn emit_alu_imm(asm: &mut Assembler, ra: usize, rb: usize, vx: i64, op: AluImmOp, is32: bool) {
    match op {
        AluImmOp::Mul => asm.imul_reg_reg_imm32(hostreg(ra), hostreg(rb), vx as i32),
        AluImmOp::Add => {
            asm.mov_reg_reg(hostreg(ra), hostreg(rb));
            asm.add_reg_imm32_sext(hostreg(ra), vx as i32);
        }
        AluImmOp::And => {
            asm.mov_reg_reg(hostreg(ra), hostreg(rb));
            asm.and_reg_imm32_sext(hostreg(ra), vx as i32);
        }
        AluImmOp::Xor => {
            asm.mov_reg_reg(hostreg(ra), hostreg(rb));
            asm.xor_reg_imm32_sext(hostreg(ra), vx as i32);
        }
        AluImmOp::Or => {
            asm.mov_reg_reg(hostreg(ra), hostreg(rb));
            asm.or_reg_imm32_sext(hostreg(ra), vx as i32);
        }
    }
    if is32 {
        asm.sign_extend_32_inplace(hostreg(ra));
    }
}

/// `regs[ra] = cmp(regs[rb], vx) as u64` — `rb`/`vx` order matches the
/// `TwoRegImm{ra,rb,vx}` decode shape these immediate-compare opcodes share.
fn emit_set_cmp_imm(asm: &mut Assembler, rb: usize, vx: i64, ra: usize, cc: u8) {
    asm.cmp_reg_imm32_sext(hostreg(rb), vx as i32);
    asm.mov_reg_imm32_sext(hostreg(ra), 0);
    asm.setcc(hostreg(ra), cc);
}

/// `if (regs[rb] == 0) == (cc == E) { regs[ra] = vx }`.
fn emit_cmov_imm(asm: &mut Assembler, ra: usize, rb: usize, vx: i64, cc: u8) {
    asm.test_reg_reg(hostreg(rb), hostreg(rb));
    asm.mov_reg_imm64(SCRATCH_REG, vx as u64);
    asm.cmovcc(hostreg(ra), SCRATCH_REG, cc);
}

fn emit_shift_imm(asm: &mut Assembler, ra: usize, rb: usize, vx: i64, digit: u8, is32: bool) {
    asm.mov_reg_reg(hostreg(ra), hostreg(rb));
    asm.shift_imm(hostreg(ra), digit, vx as u8, !is32);
    if is32 {
        asm.sign_extend_32_inplace(hostreg(ra));
    }
}

/// Count taken from `rb` is cached into the scratch register first, so
/// overwriting `rd` (which may alias `rb`) below doesn't lose it.
fn emit_shift_reg(asm: &mut Assembler, ra: usize, rb: usize, rd: usize, digit: u8, is32: bool) {
    asm.mov_reg_reg(SCRATCH_REG, hostreg(rb));
    asm.mov_reg_reg(hostreg(rd), hostreg(ra));
    asm.shift_cl(hostreg(rd), digit, !is32);
    if is32 {
        asm.sign_extend_32_inplace(hostreg(rd));
    }
}

fn emit_set_cmp_reg(asm: &mut Assembler, ra: usize, rb: usize, rd: usize, cc: u8) {
    asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
    asm.mov_reg_imm32_sext(hostreg(rd), 0);
    asm.setcc(hostreg(rd), cc);
}

fn emit_cmov_reg(asm: &mut Assembler, ra: usize, rb: usize, rd: usize, cc: u8) {
    asm.test_reg_reg(hostreg(rb), hostreg(rb));
    asm.cmovcc(hostreg(rd), hostreg(ra), cc);
}

/// Which of the three NOT-combined bitwise ops `emit_bitwise_inv` encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitwiseInv {
    AndNotRb,
    OrNotRb,
    NotXor,
}

fn emit_bitwise_inv(asm: &mut Assembler, ra: usize, rb: usize, rd: usize, kind: BitwiseInv) {
    // `rb` is cached into the scratch register before `rd` is written, since
    // `rd` may alias either `ra` or `rb`.
    asm.mov_reg_reg(SCRATCH_REG, hostreg(rb));
    asm.mov_reg_reg(hostreg(rd), hostreg(ra));
    match kind {
        BitwiseInv::AndNotRb => {
            asm.not_reg(SCRATCH_REG);
            asm.and_reg_reg(hostreg(rd), SCRATCH_REG);
        }
        BitwiseInv::OrNotRb => {
            asm.not_reg(SCRATCH_REG);
            asm.or_reg_reg(hostreg(rd), SCRATCH_REG);
        }
        BitwiseInv::NotXor => {
            asm.xor_reg_reg(hostreg(rd), SCRATCH_REG);
            asm.not_reg(hostreg(rd));
        }
    }
}

/// `regs[rd] = if cmp(regs[ra], regs[rb]) { regs[ra] } else { regs[rb] }` —
/// `cc` picks the comparison (signed/unsigned, max/min) against `ra`.
fn emit_minmax(asm: &mut Assembler, ra: usize, rb: usize, rd: usize, cc: u8) {
    asm.mov_reg_reg(SCRATCH_REG, hostreg(ra));
    asm.cmp_reg_reg(hostreg(ra), hostreg(rb));
    asm.mov_reg_reg(hostreg(rd), hostreg(rb));
    asm.cmovcc(hostreg(rd), SCRATCH_REG, cc);
}

fn emit_helper_call(asm: &mut Assembler, helper: Helper, ra: usize, rb: usize, rd: usize, layout: &VmContextLayout) {
    let ctx_base = -(layout.total_size() as i32);
    // save_all_regs: spill every guest register to its context slot.
    for (i, &reg) in REGISTER_MAP.iter().enumerate() {
        asm.store_mem(MEM_BASE_REG, ctx_base + layout.reg_offset(i) as i32, reg);
    }
    asm.mov_reg_reg(X86Reg::Rdi, hostreg(ra));
    asm.mov_reg_reg(X86Reg::Rsi, hostreg(rb));
    // The ABI wants rsp 16-aligned immediately before `call`; the caller
    // stub leaves rsp 16-aligned at block entry (see `build_caller_stub`),
    // and nothing between then and here pushes, so nudge it back into
    // alignment around this one real `call`.
    asm.add_reg_imm32_sext(X86Reg::Rsp, -8);
    asm.call_abs(helper_address(helper));
    asm.add_reg_imm32_sext(X86Reg::Rsp, 8);
    asm.store_mem(MEM_BASE_REG, ctx_base + layout.reg_offset(rd) as i32, X86Reg::Rax);
    // load_all_regs: reload every guest register (rd's slot now reflects the result).
    for (i, &reg) in REGISTER_MAP.iter().enumerate() {
        asm.load_mem(reg, MEM_BASE_REG, ctx_base + layout.reg_offset(i) as i32);
    }
}

/// Resolve a helper's entry point. Backed by `recompiler::helpers`, whose
/// functions share the codec/exec semantics used by the interpreter so both
/// engines agree on division, remainder, and wide-multiply edge cases.
fn helper_address(helper: Helper) -> u64 {
    use crate::recompiler::helpers as h;
    (match helper {
        Helper::DivU32 => h::div_u32 as usize,
        Helper::DivU64 => h::div_u64 as usize,
        Helper::DivS32 => h::div_s32 as usize,
        Helper::DivS64 => h::div_s64 as usize,
        Helper::RemU32 => h::rem_u32 as usize,
        Helper::RemU64 => h::rem_u64 as usize,
        Helper::RemS32 => h::rem_s32 as usize,
        Helper::RemS64 => h::rem_s64 as usize,
        Helper::MulUpperSS => h::mul_upper_s_s as usize,
        Helper::MulUpperUU => h::mul_upper_u_u as usize,
        Helper::MulUpperSU => h::mul_upper_s_u as usize,
    }) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_trampolines() -> Trampolines {
        Trampolines {
            panic: 0x1000,
            out_of_gas: 0x2000,
            halt: 0x3000,
            host_call: 0x4000,
            sbrk: 0x5000,
        }
    }

    #[test]
    fn every_gpr_mapping_round_trips_through_mov() {
        let mut asm = Assembler::new();
        for &reg in REGISTER_MAP.iter() {
            asm.mov_reg_reg(reg, SCRATCH_REG);
        }
        assert!(!asm.code.is_empty());
    }

    #[test]
    fn single_trap_program_assembles_one_block() {
        let program = Program::decode(&[0, 1, 1, 0, 1]);
        let layout = VmContextLayout { jump_len: 0 };
        let compiled = assemble(&program, dummy_trampolines(), &layout);
        assert_eq!(compiled.block_offsets.len(), 1);
        assert_eq!(compiled.breakpoints.len(), 1);
    }

    #[test]
    fn load_u32_program_assembles_without_falling_back_to_panic() {
        // LOAD_U32 rd=r0, vx=0x10 (lx=1 byte), then TRAP.
        let mut instructions = vec![op::LOAD_U32, 0x0, 0x10];
        instructions.push(op::TRAP);
        let bit_len = instructions.len();
        let mut blob = vec![0u8, 1, bit_len as u8];
        blob.extend_from_slice(&instructions);
        blob.push(0b0000_1001); // opcode bits at 0 (load_u32) and 3 (trap)
        let program = Program::decode(&blob);
        let layout = VmContextLayout { jump_len: 0 };
        let compiled = assemble(&program, dummy_trampolines(), &layout);
        assert_eq!(compiled.breakpoints.len(), 2);
        // The load shouldn't have emitted a jmp_abs(panic) sequence: that
        // sequence is movabs(rcx, imm64) + jmp rcx, recognizable as the
        // scratch register's REX+B8 opcode followed immediately by the
        // trampoline's exact address bytes. Easier to assert indirectly: the
        // compiled code must be longer than a single `jmp_abs` to the panic
        // trampoline preceded only by the gas charge and breakpoint, since
        // the load itself emits extra SIB-addressed instructions.
        assert!(compiled.code.len() > 40);
    }

    #[test]
    fn add_block_records_a_breakpoint_per_opcode() {
        let add = [op::ADD_64, 0x01, 0];
        let mut instructions = add.to_vec();
        instructions.push(op::TRAP);
        let bit_len = instructions.len();
        let mut blob = vec![0u8, 1, bit_len as u8];
        blob.extend_from_slice(&instructions);
        blob.push(0b0000_1001); // opcode bits at 0 (add_64) and 3 (trap)
        let program = Program::decode(&blob);
        let layout = VmContextLayout { jump_len: 0 };
        let compiled = assemble(&program, dummy_trampolines(), &layout);
        assert_eq!(compiled.breakpoints.len(), 2);
    }
}
