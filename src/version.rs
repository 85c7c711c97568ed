//! Contains the types necessary for optimistic locking through versioning.

/// Position of an event inside its stream, and the running count of
/// committed events on [`StreamInformation`][crate::document::StreamInformation].
///
/// A stream that has never been written to reports [`NO_STREAM`]; the first
/// committed event has version `0`.
pub type Version = i64;

/// Sentinel value of [`Version`] for a stream that holds no events yet.
pub const NO_STREAM: Version = -1;

/// This error is returned by a document or data store when the stored
/// version differs from the one the caller based its update on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflict error detected, expected version was: {expected}, found: {actual}")]
pub struct ConflictError {
    /// The version value that was expected when calling the function that failed.
    pub expected: String,

    /// The actual version value, which mismatch caused this error.
    pub actual: String,
}
