//! Scope state mismatch errors.
//!
//! Both mismatch kinds are programmer-contract violations, not transient
//! faults: they are always surfaced to the caller and never retried.

use core::fmt;

/// Whether a scope is open or closed, as seen from one call graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    /// A scope of the context type is visible.
    Opened,
    /// No scope of the context type is visible.
    Closed,
}

impl fmt::Display for ScopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => f.write_str("opened"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Errors raised by scope store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// A scope of this context type is already open in the current call graph.
    ///
    /// Scopes of the same context type never nest.
    #[error("lifetime scope '{context}' is opened, but should be closed")]
    AlreadyOpen {
        /// Name of the context type.
        context: &'static str,
    },

    /// No scope of this context type is open in the current call graph.
    #[error("lifetime scope '{context}' is closed, but should be opened")]
    NotOpen {
        /// Name of the context type.
        context: &'static str,
    },

    /// The key already holds a value of a different type.
    #[error("value cached in lifetime scope '{context}' is not a `{expected}`")]
    TypeMismatch {
        /// Name of the context type.
        context: &'static str,
        /// Name of the requested value type.
        expected: &'static str,
    },
}

impl ScopeError {
    /// Returns the name of the context type the error refers to.
    #[must_use]
    pub fn context(&self) -> &'static str {
        match self {
            Self::AlreadyOpen { context }
            | Self::NotOpen { context }
            | Self::TypeMismatch { context, .. } => *context,
        }
    }

    /// Returns the scope status that was found, for state mismatches.
    #[must_use]
    pub fn found(&self) -> Option<ScopeStatus> {
        match self {
            Self::AlreadyOpen { .. } => Some(ScopeStatus::Opened),
            Self::NotOpen { .. } => Some(ScopeStatus::Closed),
            Self::TypeMismatch { .. } => None,
        }
    }

    /// Returns the scope status the operation required, for state mismatches.
    #[must_use]
    pub fn expected(&self) -> Option<ScopeStatus> {
        match self {
            Self::AlreadyOpen { .. } => Some(ScopeStatus::Closed),
            Self::NotOpen { .. } => Some(ScopeStatus::Opened),
            Self::TypeMismatch { .. } => None,
        }
    }
}
