//! Compilation error taxonomy
//!
//! Failures during one method's compilation are local to that method: the
//! bridge always returns to a reusable idle state, and the driver decides
//! whether to skip, fallback-recompile, or abort the batch.

use thiserror::Error;

use kiln_types::TypeError;

/// Errors surfaced from compiling one method
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    /// The method body is not well-formed for execution (extern method
    /// with no implementation, vararg calling convention, static target
    /// of a virtual-call token, boxing a stack-only type, ...)
    #[error("invalid program in `{method}`: {reason}")]
    InvalidProgram {
        /// Method being compiled
        method: String,
        /// What made the body invalid
        reason: String,
    },

    /// A token resolved to a member that cannot exist at runtime
    /// (e.g. a literal field reference)
    #[error("missing member: `{name}`")]
    MissingMember {
        /// Name of the member
        name: String,
    },

    /// A type-system operation failed while answering a backend query
    #[error("type system error: {0}")]
    Type(#[from] TypeError),

    /// An unexpected backend failure that matched no recognized host-side
    /// condition, wrapped with the method it occurred in
    #[error("code generation failed for `{method}`: {reason}")]
    CodeGenFailed {
        /// Method being compiled
        method: String,
        /// The original cause
        reason: String,
    },
}

impl CompileError {
    /// Conditions a fallback-body compilation treats as expected and
    /// propagates unchanged; everything else there indicates a bridge bug.
    pub fn expected_in_fallback(&self) -> bool {
        matches!(
            self,
            CompileError::InvalidProgram { .. }
                | CompileError::MissingMember { .. }
                | CompileError::Type(_)
        )
    }
}
