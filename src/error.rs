//! Typed termination and host-boundary error types.

use std::io;
use thiserror::Error;

/// Reasons the engine panics (terminates with `TerminationStatus::Panic`).
///
/// Closed over the causes this core can actually produce: bad opcode
/// dispatch, invalid control flow, and host-call handler preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
#[non_exhaustive]
pub enum PanicReason {
    /// Opcode byte did not resolve to any entry in the instruction table.
    UnknownOpcode,
    /// The `trap` instruction executed explicitly.
    ExplicitTrap,
    /// A branch, jump, or indirect-jump target was not a basic-block entry.
    InvalidBranchTarget,
    /// Indirect-jump argument violated one of the jump-table constraints.
    InvalidJumpTableIndex,
    /// A host-call handler's memory precondition failed.
    HostPrecondition,
}

impl std::fmt::Display for PanicReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for PanicReason {}

/// The guest-visible termination record returned to the supervisor.
///
/// Carries the reason an engine stopped; `pc`/`gas_remaining`/`regs` live
/// alongside it on `Termination`, since the caller already holds those on
/// whichever engine it drove to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    /// Cooperative normal exit (indirect-jump halt sentinel, or supervisor-level EOF).
    Halt,
    /// Illegal instruction or invalid control flow.
    Panic(PanicReason),
    /// Memory access denied at `addr`.
    PageFault(u32),
    /// Gas exhausted; the accompanying counter holds the (negative) deficit.
    OutOfGas,
    /// Guest requested a host call; `index` identifies the requested service.
    Host(u64),
}

impl std::fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Panic(reason) => write!(f, "panic: {reason}"),
            Self::PageFault(addr) => write!(f, "page fault at {addr:#010x}"),
            Self::OutOfGas => write!(f, "out of gas"),
            Self::Host(index) => write!(f, "host call {index}"),
        }
    }
}

/// Host-boundary failures that are not part of the guest-visible termination
/// record: a malformed program blob, or an OS-level failure setting up the
/// recompiler's memory mapping or signal handler.
#[derive(Debug, Error)]
pub enum PvmError {
    /// The program blob failed to decode (truncated length prefix, etc).
    #[error("malformed program blob: {0}")]
    MalformedProgram(&'static str),
    /// The outer code container failed to decode.
    #[error("malformed code container: {0}")]
    MalformedCode(&'static str),
    /// `PVM_MODE` named a backend this build does not support.
    #[error("unsupported PVM_MODE: {0}")]
    UnsupportedMode(String),
    /// Recompiler setup (mmap/mprotect/sigaction) failed.
    #[error("recompiler setup failed: {0}")]
    Io(#[from] io::Error),
}
