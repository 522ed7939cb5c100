//! The host-native x86-64 recompiler: assemble a `Program` once into real
//! machine code, then re-enter it directly on every resume instead of
//! re-dispatching through the decoded interpreter.
//!
//! Grounded on `pvm.py`'s `run_code` (mmap the guest window once, build a
//! `VMContext`, enter via `create_caller`, classify the exit, loop on
//! cooperative call-outs) and `REC_Program.assemble`
//! (`tsrkit_pvm/recompiler/program.py`) for the compiled-program shape this
//! module drives. Unlike the original, every exit this crate's generated
//! code can produce on purpose (panic, out-of-gas, halt, host-call, sbrk) is
//! a direct `jmp` to a real assembled stub rather than a SIGSEGV against a
//! sentinel address — `signal` only has to handle a SIGSEGV that was *not*
//! one of those, i.e. a genuine out-of-bounds guest access.

mod codegen;
mod helpers;
mod signal;
mod vm_context;

pub use codegen::{assemble, CompiledProgram, Trampolines};
pub use vm_context::{VmContextLayout, X86Reg};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::consts::{PAGE_COUNT, PAGE_SIZE, REGISTER_COUNT};
use crate::error::{PanicReason, PvmError, TerminationStatus};
use crate::hostcall::{HostHandler, HostOutcome};
use crate::interpreter::Termination;
use crate::memory::{Memory, Permission};
use crate::program::Program;
use codegen::Assembler;
use vm_context::{VmContext, MEM_BASE_REG, REGISTER_MAP, SCRATCH_REG};

const KIND_PANIC: u8 = 1;
const KIND_OUT_OF_GAS: u8 = 2;
const KIND_HALT: u8 = 3;
const KIND_HOST_CALL: u8 = 4;
const KIND_SBRK: u8 = 5;

/// Written by whichever trampoline a native run exits through; read back by
/// the driver immediately after the caller stub returns. Process-global
/// because the trampolines themselves are process-global (see `global`);
/// safe across concurrent `Recompiler`s only in the sense that each run is
/// fully synchronous on the thread that calls it — this crate does not
/// support running two native programs on two threads at once.
static EXIT_KIND: AtomicU8 = AtomicU8::new(0);

/// mmap'd native code: writable while being assembled into, executable once
/// sealed. Used for the process-global trampolines, the per-layout caller
/// stub, and each program's compiled code.
struct ExecMem {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the only state is a raw pointer to an OS mapping this type owns
// exclusively; it is never mutated after `new` returns.
unsafe impl Send for ExecMem {}
unsafe impl Sync for ExecMem {}

impl ExecMem {
    fn new(code: &[u8]) -> Result<Self, PvmError> {
        let len = crate::consts::page_round(code.len().max(1) as u64) as usize;
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(PvmError::Io(std::io::Error::last_os_error()));
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            if libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(ptr, len);
                return Err(PvmError::Io(err));
            }
            Ok(Self { ptr, len })
        }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// The five process-global trampoline stubs plus the page-fault resume
/// stub, built once and reused by every `Recompiler`. None of these
/// reference a context layout, so (unlike the caller stub) they don't need
/// rebuilding per program.
struct GlobalNative {
    _mem: ExecMem,
    trampolines: Trampolines,
    fault_resume: u64,
}

unsafe impl Send for GlobalNative {}
unsafe impl Sync for GlobalNative {}

fn tag_stub(asm: &mut Assembler, exit_addr: u64, kind: u8) {
    asm.mov_reg_imm64(SCRATCH_REG, exit_addr);
    asm.store_imm8(SCRATCH_REG, kind);
    asm.ret();
}

fn build_global_native() -> Result<GlobalNative, PvmError> {
    let mut asm = Assembler::new();
    let exit_addr = &EXIT_KIND as *const AtomicU8 as u64;

    let off_panic = asm.code.len();
    tag_stub(&mut asm, exit_addr, KIND_PANIC);
    let off_out_of_gas = asm.code.len();
    tag_stub(&mut asm, exit_addr, KIND_OUT_OF_GAS);
    let off_halt = asm.code.len();
    tag_stub(&mut asm, exit_addr, KIND_HALT);
    let off_host_call = asm.code.len();
    tag_stub(&mut asm, exit_addr, KIND_HOST_CALL);
    let off_sbrk = asm.code.len();
    tag_stub(&mut asm, exit_addr, KIND_SBRK);
    // The page-fault resume stub: the signal handler rewrites the faulting
    // thread's RIP to land here, so all it has to do is unwind back into
    // the caller stub exactly like every other trampoline does.
    let off_fault_resume = asm.code.len();
    asm.ret();

    let mem = ExecMem::new(&asm.code)?;
    let base = mem.addr();
    Ok(GlobalNative {
        trampolines: Trampolines {
            panic: base + off_panic as u64,
            out_of_gas: base + off_out_of_gas as u64,
            halt: base + off_halt as u64,
            host_call: base + off_host_call as u64,
            sbrk: base + off_sbrk as u64,
        },
        fault_resume: base + off_fault_resume as u64,
        _mem: mem,
    })
}

static GLOBAL: OnceLock<GlobalNative> = OnceLock::new();

fn global() -> Result<&'static GlobalNative, PvmError> {
    if let Some(g) = GLOBAL.get() {
        return Ok(g);
    }
    let built = build_global_native()?;
    Ok(GLOBAL.get_or_init(|| built))
}

/// Analogous to `pvm.py`'s `create_caller`: a stub with signature
/// `extern "C" fn(entry: u64, guest_window_ptr: u64)` (System V AMD64:
/// `entry` in `rdi`, `guest_window_ptr` in `rsi`) that saves the host's
/// callee-saved registers (about to double as guest-register pins), loads
/// all 13 guest registers from the context record, calls into generated
/// code, and saves them all back before restoring the host's registers.
///
/// Built fresh per context layout (register offsets depend on `jump_len`,
/// which varies per program) rather than once per process, unlike the
/// five exit trampolines.
fn build_caller_stub(layout: &VmContextLayout) -> Vec<u8> {
    let mut asm = Assembler::new();
    asm.push_reg(X86Reg::Rbp);
    asm.push_reg(X86Reg::Rbx);
    asm.push_reg(X86Reg::R12);
    asm.push_reg(X86Reg::R13);
    asm.push_reg(X86Reg::R14);
    asm.push_reg(X86Reg::R15);

    // r15 (guest window base) must be set, and the entry address stashed
    // into the scratch register, before either rdi or rsi is clobbered by
    // the register-load loop below — both are pinned guest registers too.
    asm.mov_reg_reg(MEM_BASE_REG, X86Reg::Rsi);
    asm.mov_reg_reg(SCRATCH_REG, X86Reg::Rdi);

    let ctx_base = -(layout.total_size() as i32);
    for (i, &reg) in REGISTER_MAP.iter().enumerate() {
        asm.load_mem(reg, MEM_BASE_REG, ctx_base + layout.reg_offset(i) as i32);
    }

    // rsp is 16-aligned here (entry parity + 6 pushes, both multiples of
    // 16); the ABI wants it 16-aligned immediately before `call`, so nudge
    // it by 8 for the one real `call` this stub makes.
    asm.add_reg_imm32_sext(X86Reg::Rsp, -8);
    asm.call_reg(SCRATCH_REG);
    asm.add_reg_imm32_sext(X86Reg::Rsp, 8);

    for (i, &reg) in REGISTER_MAP.iter().enumerate() {
        asm.store_mem(MEM_BASE_REG, ctx_base + layout.reg_offset(i) as i32, reg);
    }

    asm.pop_reg(X86Reg::R15);
    asm.pop_reg(X86Reg::R14);
    asm.pop_reg(X86Reg::R13);
    asm.pop_reg(X86Reg::R12);
    asm.pop_reg(X86Reg::Rbx);
    asm.pop_reg(X86Reg::Rbp);
    asm.ret();
    asm.code
}

/// The mmap'd guest address space: a `ctx_size + 4GiB` reservation with the
/// context record at the very end of its (page-rounded) leading slice and
/// the 4GiB guest window immediately after, so `r15 - total_size` and
/// `r15 + guest_addr` are both simple pointer arithmetic off one base.
///
/// Grounded on `VMContext.store`'s placement of the context "right before"
/// guest memory; expressed here as a real `mmap`/`mprotect` pair instead of
/// `ctypes`.
struct GuestRegion {
    base: *mut libc::c_void,
    total_len: usize,
    window_ptr: u64,
}

unsafe impl Send for GuestRegion {}
unsafe impl Sync for GuestRegion {}

impl GuestRegion {
    fn new(layout: &VmContextLayout) -> Result<Self, PvmError> {
        let ctx_region_len = crate::consts::page_round(layout.total_size() as u64) as usize;
        let guest_len = PAGE_COUNT * PAGE_SIZE as usize;
        let total_len = ctx_region_len + guest_len;
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(PvmError::Io(std::io::Error::last_os_error()));
            }
            if libc::mprotect(base, ctx_region_len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(base, total_len);
                return Err(PvmError::Io(err));
            }
            Ok(Self {
                base,
                total_len,
                window_ptr: base as u64 + ctx_region_len as u64,
            })
        }
    }

    fn ctx_base(&self, layout: &VmContextLayout) -> *mut u8 {
        (self.window_ptr - layout.total_size() as u64) as *mut u8
    }

    /// Mirror `memory`'s page permissions and backing bytes into the guest
    /// window, coalescing runs of equal permission into one
    /// `mprotect`/batch of copies rather than one syscall per page.
    fn materialize(&self, memory: &Memory) -> Result<(), PvmError> {
        let mut page_no = 0usize;
        while page_no < PAGE_COUNT {
            let perm = memory.page_permission(page_no);
            let mut end = page_no + 1;
            while end < PAGE_COUNT && memory.page_permission(end) == perm {
                end += 1;
            }
            if perm != Permission::None {
                self.protect_pages(page_no, end, perm)?;
                for p in page_no..end {
                    if let Some(bytes) = memory.page_bytes(p) {
                        let dst = (self.window_ptr + p as u64 * PAGE_SIZE as u64) as *mut u8;
                        unsafe {
                            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, PAGE_SIZE as usize);
                        }
                    }
                }
            }
            page_no = end;
        }
        Ok(())
    }

    fn protect_pages(&self, start_page: usize, end_page: usize, perm: Permission) -> Result<(), PvmError> {
        let prot = match perm {
            Permission::None => libc::PROT_NONE,
            Permission::Read => libc::PROT_READ,
            Permission::Write => libc::PROT_READ | libc::PROT_WRITE,
        };
        let addr = (self.window_ptr + start_page as u64 * PAGE_SIZE as u64) as *mut libc::c_void;
        let len = (end_page - start_page) * PAGE_SIZE as usize;
        if unsafe { libc::mprotect(addr, len, prot) } != 0 {
            return Err(PvmError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// `sbrk` grew the heap by `[old_break, new_break)`: mirror that range's
    /// new WRITE permission into the live mapping so native loads/stores
    /// against it don't fault against a stale `PROT_NONE` page.
    fn grow_heap(&self, old_break: u32, new_break: u32) -> Result<(), PvmError> {
        if new_break <= old_break {
            return Ok(());
        }
        let start_page = (old_break / PAGE_SIZE) as usize;
        let end_page = ((new_break - 1) / PAGE_SIZE) as usize + 1;
        self.protect_pages(start_page, end_page, Permission::Write)
    }

    /// After native execution, copy every writable page's current content
    /// back into `memory`'s sparse model, so the caller's `Memory` reflects
    /// whatever the guest wrote.
    fn sync_back(&self, memory: &mut Memory) {
        for page_no in 0..PAGE_COUNT {
            if memory.page_permission(page_no) == Permission::Write {
                let src = (self.window_ptr + page_no as u64 * PAGE_SIZE as u64) as *const u8;
                let mut buf = [0u8; PAGE_SIZE as usize];
                unsafe {
                    std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), PAGE_SIZE as usize);
                }
                memory.write_back_page(page_no, buf);
            }
        }
    }
}

impl Drop for GuestRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.total_len);
        }
    }
}

/// Drives a compiled `Program` directly on the host CPU. Mirrors
/// `Interpreter<'a>`'s shape (a `&'a Program` plus whatever this backend
/// caches) so the two engines are interchangeable behind `Engine`.
pub struct Recompiler<'a> {
    #[allow(dead_code)]
    program: &'a Program,
    compiled: CompiledProgram,
    code_mem: ExecMem,
    caller_mem: ExecMem,
    layout: VmContextLayout,
    /// guest PC -> native offset, for both fresh entry (block starts) and
    /// mid-block resume after `ecalli`/`sbrk` (breakpoints).
    resume_map: HashMap<u32, usize>,
}

impl<'a> Recompiler<'a> {
    /// Assemble `program` against the process-global trampolines and mmap
    /// its generated code and per-layout caller stub as executable. Does
    /// not touch guest memory — that happens fresh on every `run`.
    pub fn new(program: &'a Program) -> Result<Self, PvmError> {
        let layout = VmContextLayout {
            jump_len: program.jump_table.len(),
        };
        let g = global()?;
        let compiled = assemble(program, g.trampolines, &layout);
        let code_mem = ExecMem::new(&compiled.code)?;
        let caller_mem = ExecMem::new(&build_caller_stub(&layout))?;

        let mut resume_map: HashMap<u32, usize> = compiled.block_offsets.clone();
        for &(native_offset, guest_pc) in &compiled.breakpoints {
            resume_map.entry(guest_pc).or_insert(native_offset);
        }

        Ok(Self {
            program,
            compiled,
            code_mem,
            caller_mem,
            layout,
            resume_map,
        })
    }

    /// Run until HALT, PANIC, PAGE_FAULT, OUT_OF_GAS, or HOST — the same
    /// cooperative contract as `Interpreter::run`: on HOST, `pc` already
    /// points past the `ecalli`, and the caller may resume by calling `run`
    /// again. `sbrk` never surfaces here; it's serviced and resumed
    /// internally, same as the interpreter's `cont!()` handling of it.
    pub fn run(&self, mut pc: u32, mut gas: i64, mut registers: [u64; REGISTER_COUNT], memory: &mut Memory) -> Result<Termination, PvmError> {
        signal::install();
        let g = global()?;
        let region = GuestRegion::new(&self.layout)?;
        region.materialize(memory)?;

        loop {
            let Some(&native_entry) = self.resume_map.get(&pc) else {
                region.sync_back(memory);
                return Ok(Termination {
                    status: TerminationStatus::Panic(PanicReason::UnknownOpcode),
                    pc,
                    gas_remaining: gas,
                    registers,
                });
            };

            let ctx = VmContext {
                jump_table: self.compiled.jump_table_native.iter().map(|&off| self.code_mem.addr() + off).collect(),
                regs: registers,
                gas,
                ret_addr: 0,
                ret_stack: 0,
                heap_start: memory.heap_break,
                resume_pc: 0,
            };
            let encoded = ctx.encode();
            unsafe {
                std::ptr::copy_nonoverlapping(encoded.as_ptr(), region.ctx_base(&self.layout), encoded.len());
            }

            EXIT_KIND.store(0, Ordering::SeqCst);
            signal::arm(region.window_ptr, (PAGE_COUNT as u64) * PAGE_SIZE as u64, g.fault_resume);

            let entry_addr = self.code_mem.addr() + native_entry as u64;
            unsafe {
                let caller: extern "C" fn(u64, u64) = std::mem::transmute(self.caller_mem.addr());
                caller(entry_addr, region.window_ptr);
            }

            let ctx_bytes = unsafe { std::slice::from_raw_parts(region.ctx_base(&self.layout), self.layout.total_size()) };
            let result_ctx = VmContext::decode(ctx_bytes, self.layout.jump_len);
            gas = result_ctx.gas;
            registers = result_ctx.regs;
            memory.heap_break = result_ctx.heap_start;

            if let Some((fault_addr, fault_regs)) = signal::take_fault() {
                registers = fault_regs;
                region.sync_back(memory);
                return Ok(Termination {
                    status: TerminationStatus::PageFault(fault_addr as u32),
                    pc,
                    gas_remaining: gas,
                    registers,
                });
            }

            match EXIT_KIND.load(Ordering::SeqCst) {
                KIND_PANIC => {
                    region.sync_back(memory);
                    // Every native panic source (explicit trap, unknown
                    // opcode, invalid branch target, an opcode this backend
                    // doesn't yet translate) collapses to one reason here —
                    // the interpreter remains the source of truth for which
                    // exact reason a given panic represents.
                    return Ok(Termination {
                        status: TerminationStatus::Panic(PanicReason::InvalidBranchTarget),
                        pc,
                        gas_remaining: gas,
                        registers,
                    });
                }
                KIND_OUT_OF_GAS => {
                    region.sync_back(memory);
                    return Ok(Termination {
                        status: TerminationStatus::OutOfGas,
                        pc,
                        gas_remaining: gas,
                        registers,
                    });
                }
                KIND_HALT => {
                    region.sync_back(memory);
                    return Ok(Termination {
                        status: TerminationStatus::Halt,
                        pc,
                        gas_remaining: gas,
                        registers,
                    });
                }
                KIND_HOST_CALL => {
                    region.sync_back(memory);
                    return Ok(Termination {
                        status: TerminationStatus::Host(result_ctx.ret_addr),
                        pc: result_ctx.resume_pc as u32,
                        gas_remaining: gas,
                        registers,
                    });
                }
                KIND_SBRK => {
                    let requested = result_ctx.ret_addr as u32;
                    let rd = result_ctx.ret_stack as usize;
                    let old_break = memory.heap_break;
                    memory.alter_accessibility(old_break, requested, Permission::Write);
                    memory.heap_break = old_break.wrapping_add(requested);
                    registers[rd] = memory.heap_break as u64;
                    region.grow_heap(old_break, memory.heap_break)?;
                    pc = result_ctx.resume_pc as u32;
                    continue;
                }
                other => unreachable!("recompiler exit tag {other} is not one any trampoline writes"),
            }
        }
    }

    /// As `Interpreter::run_with_host`: loop `run`, servicing every HOST
    /// termination with `handler` until a non-cooperative status comes
    /// back.
    pub fn run_with_host<H: HostHandler>(
        &self,
        mut pc: u32,
        mut gas: i64,
        mut registers: [u64; REGISTER_COUNT],
        memory: &mut Memory,
        handler: &mut H,
    ) -> Result<Termination, PvmError> {
        loop {
            let termination = self.run(pc, gas, registers, memory)?;
            let TerminationStatus::Host(index) = termination.status else {
                return Ok(termination);
            };
            gas = termination.gas_remaining;
            registers = termination.registers;
            pc = termination.pc;
            gas -= handler.gas_cost(index);
            if gas < 0 {
                return Ok(Termination {
                    status: TerminationStatus::OutOfGas,
                    pc,
                    gas_remaining: gas,
                    registers,
                });
            }
            match handler.call(index, &mut registers, memory) {
                HostOutcome::Continue => continue,
                HostOutcome::Terminate(status) => {
                    return Ok(Termination {
                        status,
                        pc,
                        gas_remaining: gas,
                        registers,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S3 — trap, on the recompiler backend this time: single `TRAP`
    /// instruction panics and charges exactly one gas, matching
    /// `interpreter::tests::s3_trap_panics_and_charges_one_gas`.
    #[test]
    fn s3_trap_panics_and_charges_one_gas() {
        let instructions = [crate::isa::op::TRAP];
        let mut blob = vec![0u8, 1, instructions.len() as u8];
        blob.extend_from_slice(&instructions);
        blob.push(0b0000_0001);
        let program = Program::decode(&blob);

        let rec = Recompiler::new(&program).expect("recompiler setup");
        let mut mem = Memory::empty();
        let result = rec.run(0, 1000, [0u64; REGISTER_COUNT], &mut mem).expect("native run");
        assert!(matches!(result.status, TerminationStatus::Panic(_)));
        assert_eq!(result.gas_remaining, 999);
    }

    /// A tight self-looping `add` exhausts gas rather than running forever.
    #[test]
    fn out_of_gas_on_infinite_loop() {
        let add = [crate::isa::op::ADD_64, 0x01, 0]; // r0 += r1
        let jump_offset = (-3i32) as u32;
        let mut instructions = add.to_vec();
        instructions.push(crate::isa::op::JUMP);
        instructions.extend_from_slice(&jump_offset.to_le_bytes());
        let bit_len = instructions.len();
        let mut bitmap_bits = vec![false; bit_len];
        bitmap_bits[0] = true;
        bitmap_bits[3] = true;
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

        let rec = Recompiler::new(&program).expect("recompiler setup");
        let mut mem = Memory::empty();
        let mut registers = [0u64; REGISTER_COUNT];
        registers[1] = 1;
        let result = rec.run(0, 1000, registers, &mut mem).expect("native run");
        assert_eq!(result.status, TerminationStatus::OutOfGas);
        assert!(result.gas_remaining < 0);
    }

    /// S5 — host-call round trip, on the recompiler backend: `ecalli 5`
    /// reports `Host(5)` with `pc` past the call; resuming with r7 set
    /// continues into the trailing `TRAP`.
    #[test]
    fn s5_host_call_round_trip() {
        use crate::hostcall::{sentinel, RESULT_REGISTER};

        let instructions = [crate::isa::op::ECALLI, 5, crate::isa::op::TRAP];
        let mut blob = vec![0u8, 1, instructions.len() as u8];
        blob.extend_from_slice(&instructions);
        blob.push(0b0000_0101);
        let program = Program::decode(&blob);

        let rec = Recompiler::new(&program).expect("recompiler setup");
        let mut mem = Memory::empty();
        let registers = [0u64; REGISTER_COUNT];

        let first = rec.run(0, 1000, registers, &mut mem).expect("native run");
        assert_eq!(first.status, TerminationStatus::Host(5));
        assert_eq!(first.pc, 2);

        let mut registers = first.registers;
        registers[RESULT_REGISTER] = sentinel::OK;
        let second = rec.run(first.pc, first.gas_remaining, registers, &mut mem).expect("native run");
        assert!(matches!(second.status, TerminationStatus::Panic(_)));
    }
}
