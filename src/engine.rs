//! Backend selection: which execution engine services a given invocation.
//!
//! Grounded on `core/code.py`'s `_PVM_MODE`/`y_function` switch: an
//! environment variable chooses between the decoded interpreter and the
//! native recompiler, defaulting to the interpreter when unset or
//! unrecognized.

use std::env;

use crate::error::PvmError;

/// Which back-end drives execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// The decoded, block-cached interpreter (`interpreter.rs`).
    Interpreter,
    /// The host-native x86-64 recompiler (`recompiler/`).
    Recompiler,
}

const ENV_VAR: &str = "PVM_MODE";

impl Engine {
    /// Read `PVM_MODE` from the environment: `"recompiler"` selects the JIT,
    /// anything else (including unset) selects the interpreter.
    pub fn from_env() -> Self {
        match env::var(ENV_VAR) {
            Ok(value) if value.eq_ignore_ascii_case("recompiler") => Self::Recompiler,
            _ => Self::Interpreter,
        }
    }

    /// As `from_env`, but reject unrecognized values instead of silently
    /// falling back — used where a caller wants configuration mistakes to
    /// surface rather than degrade to the default backend.
    pub fn from_env_strict() -> Result<Self, PvmError> {
        match env::var(ENV_VAR) {
            Err(env::VarError::NotPresent) => Ok(Self::Interpreter),
            Ok(value) if value.eq_ignore_ascii_case("interpreter") => Ok(Self::Interpreter),
            Ok(value) if value.eq_ignore_ascii_case("recompiler") => Ok(Self::Recompiler),
            Ok(other) => Err(PvmError::UnsupportedMode(other)),
            Err(env::VarError::NotUnicode(_)) => Err(PvmError::UnsupportedMode("<non-unicode>".to_string())),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::Interpreter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_defaults_to_interpreter() {
        env::remove_var(ENV_VAR);
        assert_eq!(Engine::from_env(), Engine::Interpreter);
    }

    #[test]
    fn unrecognized_value_falls_back_in_lenient_mode() {
        env::set_var(ENV_VAR, "quantum");
        assert_eq!(Engine::from_env(), Engine::Interpreter);
        env::remove_var(ENV_VAR);
    }

    #[test]
    fn unrecognized_value_errors_in_strict_mode() {
        env::set_var(ENV_VAR, "quantum");
        assert!(Engine::from_env_strict().is_err());
        env::remove_var(ENV_VAR);
    }

    #[test]
    fn recompiler_selected_case_insensitively() {
        env::set_var(ENV_VAR, "Recompiler");
        assert_eq!(Engine::from_env(), Engine::Recompiler);
        env::remove_var(ENV_VAR);
    }
}
