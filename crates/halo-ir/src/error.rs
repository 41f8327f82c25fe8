//! Error types for the halo IR.

use crate::op::Location;

/// Errors that can occur when constructing or validating IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle refers to an erased or never-allocated entry.
    #[error("dead {kind} handle {index}")]
    DeadHandle { kind: &'static str, index: usize },

    /// An operation lacks a region it is required to have.
    #[error("{op} has no region #{index}")]
    MissingRegion { op: String, index: usize },

    /// A region lacks its entry block.
    #[error("{op} has an empty region")]
    MissingBlock { op: String },

    /// A required attribute is absent or has the wrong kind.
    #[error("{op} is missing attribute '{name}'")]
    MissingAttribute { op: String, name: String },

    /// A structural rule was violated.
    #[error("{location}: {message}")]
    Verification { location: Location, message: String },

    /// A hardware program is malformed.
    #[error("invalid kernel '{function}': {message}")]
    InvalidKernel { function: String, message: String },

    /// An invalid workgroup size was specified.
    #[error("invalid workgroup size: [{}, {}, {}]", .0[0], .0[1], .0[2])]
    InvalidWorkgroupSize([u32; 3]),
}
