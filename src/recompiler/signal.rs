//! SIGSEGV handling for genuine guest memory faults.
//!
//! Grounded on `segwrap/sig_handler.py`'s `ProgramData` (register snapshot at
//! fault time) and `pvm.py`'s `run_code` (classifying the fault against the
//! guest window). Unlike the original's sentinel-address technique — jumping
//! to deliberately-unmapped trampoline addresses and classifying every exit
//! (halt, out-of-gas, host-call) through the same SIGSEGV path — this crate's
//! trampolines (`recompiler::mod`) are real assembled stubs reached by a
//! direct native `jmp`; a real SIGSEGV here means the guest genuinely touched
//! an address outside its mapped window, which is the one case a signal
//! handler is unavoidable for (hardware page protection, not software
//! bounds-checking, is what enforces the 32-bit guest address space).
//!
//! One installation per process: `libc::sigaction` is global state, so
//! `install` is idempotent (guarded by `Once`) rather than per-`Recompiler`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use crate::consts::REGISTER_COUNT;

static GUEST_WINDOW_LO: AtomicU64 = AtomicU64::new(0);
static GUEST_WINDOW_HI: AtomicU64 = AtomicU64::new(0);
static RESUME_TARGET: AtomicU64 = AtomicU64::new(0);
static FAULT_ADDR: AtomicU64 = AtomicU64::new(0);
static FAULTED: AtomicU64 = AtomicU64::new(0);

/// Guest register snapshot at fault time, in `REGISTER_MAP` order — captured
/// directly from `ucontext_t` since a mid-block SIGSEGV interrupts execution
/// before any `save_all_regs` spill, so the context record in guest memory is
/// stale; this is the only source of truth for "what were the guest
/// registers when it faulted" (mirrors `ProgramData.vm_regs` in
/// `sig_handler.py`).
static FAULT_REGS: [AtomicU64; REGISTER_COUNT] = [const { AtomicU64::new(0) }; REGISTER_COUNT];

/// `ucontext_t.uc_mcontext.gregs` indices for the 13 pinned guest registers,
/// in `vm_context::REGISTER_MAP` order.
const GREG_INDICES: [usize; REGISTER_COUNT] = [
    libc::REG_RDI as usize,
    libc::REG_RAX as usize,
    libc::REG_RSI as usize,
    libc::REG_RBX as usize,
    libc::REG_RDX as usize,
    libc::REG_RBP as usize,
    libc::REG_R8 as usize,
    libc::REG_R9 as usize,
    libc::REG_R10 as usize,
    libc::REG_R11 as usize,
    libc::REG_R12 as usize,
    libc::REG_R13 as usize,
    libc::REG_R14 as usize,
];

static INSTALL: Once = Once::new();

/// Install the process-wide SIGSEGV handler. Safe to call repeatedly; only
/// the first call takes effect.
pub fn install() {
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
    });
}

/// Configure the window a fault address must fall in to be treated as a
/// guest page fault, and the native address execution resumes at (a stub
/// that just `ret`s back into the driver's caller thunk) when it does.
/// Must be called (on the thread driving native execution) before every
/// `call` into generated code, since the window/resume target can change
/// across invocations.
pub fn arm(guest_window_base: u64, guest_window_len: u64, resume_target: u64) {
    GUEST_WINDOW_LO.store(guest_window_base, Ordering::SeqCst);
    GUEST_WINDOW_HI.store(guest_window_base + guest_window_len, Ordering::SeqCst);
    RESUME_TARGET.store(resume_target, Ordering::SeqCst);
    FAULTED.store(0, Ordering::SeqCst);
}

/// Whether the most recent native run ended via a caught page fault; if so,
/// the guest-relative fault address plus the 13 guest registers as they
/// stood at fault time (`regs_offset` order, i.e. `REGISTER_MAP` order).
pub fn take_fault() -> Option<(u64, [u64; REGISTER_COUNT])> {
    if FAULTED.swap(0, Ordering::SeqCst) == 0 {
        return None;
    }
    let mut regs = [0u64; REGISTER_COUNT];
    for (i, r) in regs.iter_mut().enumerate() {
        *r = FAULT_REGS[i].load(Ordering::SeqCst);
    }
    Some((FAULT_ADDR.load(Ordering::SeqCst), regs))
}

extern "C" fn handler(_signum: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // SAFETY: invoked by the kernel with a valid siginfo_t/ucontext_t for the
    // faulting thread; both pointers are non-null per the SA_SIGINFO contract.
    unsafe {
        let addr = (*info).si_addr() as u64;
        let lo = GUEST_WINDOW_LO.load(Ordering::SeqCst);
        let hi = GUEST_WINDOW_HI.load(Ordering::SeqCst);
        if addr < lo || addr >= hi {
            // Not a guest access we understand — restore the default
            // disposition and re-raise so the process crashes normally
            // instead of looping on the same instruction forever.
            let mut default_action: libc::sigaction = std::mem::zeroed();
            default_action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGSEGV, &default_action, std::ptr::null_mut());
            return;
        }
        FAULT_ADDR.store(addr - lo, Ordering::SeqCst);
        let ucontext = &mut *(ctx as *mut libc::ucontext_t);
        for (i, &greg) in GREG_INDICES.iter().enumerate() {
            FAULT_REGS[i].store(ucontext.uc_mcontext.gregs[greg] as u64, Ordering::SeqCst);
        }
        FAULTED.store(1, Ordering::SeqCst);
        ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = RESUME_TARGET.load(Ordering::SeqCst) as i64;
    }
}
