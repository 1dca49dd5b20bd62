//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by graph construction, attribute access and
/// serialization.
///
/// The variants follow a three-way split callers rely on: parameter
/// validation failures, probes for things that may legitimately be absent,
/// and structural violations that abort an entire build or decode.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected before use (null-ish input,
    /// out-of-range index, malformed length).
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A name, index or attribute was looked up and does not exist.
    /// Callers routinely probe optional features this way.
    #[error("not found: {0}")]
    NotFound(String),

    /// A produced graph violates a structural invariant (duplicate node
    /// name, dangling subgraph reference, unresolvable edge).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// No callback or codec is registered for the requested key. Distinct
    /// from a registered function that ran and failed.
    #[error("nothing registered for {0}")]
    NotRegistered(String),

    /// Wire-format encode or decode failure.
    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;
