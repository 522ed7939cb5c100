#![allow(clippy::try_err)]
// Wrong clippy convention; check
// https://rust-lang.github.io/api-guidelines/naming.html
#![allow(clippy::wrong_self_convention)]

pub mod block;
pub mod code;
pub mod codec;
pub mod consts;
pub mod engine;
pub mod error;
pub mod exec;
pub mod hostcall;
pub mod interpreter;
pub mod isa;
pub mod memory;
pub mod program;
pub mod recompiler;

pub mod prelude {
    pub use crate::code::Code;
    pub use crate::engine::Engine;
    pub use crate::error::{PanicReason, PvmError, TerminationStatus};
    pub use crate::hostcall::{HostHandler, HostOutcome, NullHandler};
    pub use crate::interpreter::{Interpreter, Termination};
    pub use crate::memory::Memory;
    pub use crate::program::Program;
    pub use crate::recompiler::Recompiler;
}
