//! Type system errors

use thiserror::Error;

/// Errors that can occur while building or querying the metadata store
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TypeError {
    /// Wrong number of arguments for a generic definition
    #[error("invalid type argument count for `{name}`: expected {expected}, got {actual}")]
    InvalidTypeArgCount {
        /// Definition being instantiated
        name: String,
        /// Declared arity
        expected: usize,
        /// Supplied arguments
        actual: usize,
    },

    /// Instantiation of something that is not a generic definition
    #[error("`{name}` is not a generic definition")]
    NotGeneric {
        /// Name of the offending entity
        name: String,
    },

    /// Size or offset query against a type whose layout was never computed
    #[error("`{name}` has no computed layout")]
    NoLayout {
        /// Name of the offending type
        name: String,
    },

    /// Layout was requested for a type that still contains open parameters
    #[error("cannot lay out open type `{name}`")]
    OpenType {
        /// Name of the offending type
        name: String,
    },

    /// Size query against a type with no meaningful size (void, open arrays)
    #[error("`{name}` has no size")]
    NoSize {
        /// Name of the offending type
        name: String,
    },
}
