//! Error handling.

use thiserror::Error;

/// The error taxonomy for the whole pipeline.
///
/// Variants correspond to the error kinds of the external contract:
/// malformed input, numerically degenerate regression input, backend
/// selection/runtime failures, resource exhaustion, and I/O.
#[derive(Error, Debug)]
pub enum GrandConvError {
    /// Malformed tree, non-finite probabilities, mismatched offsets.
    #[error("invalid input: {detail}")]
    InvalidInput {
        /// Human-readable description of the violated invariant.
        detail: String,
    },
    /// A requested branch pair is not independent, or references an
    /// out-of-range node id.
    #[error("branch pair ({u}, {v}) is not a valid selection: {reason}")]
    InvalidBranchPairSelection {
        /// First node of the offending pair, prior to canonicalization.
        u: i64,
        /// Second node of the offending pair, prior to canonicalization.
        v: i64,
        /// Why the pair was rejected.
        reason: String,
    },
    /// Theil-Sen produced zero usable slopes, or the intercept median
    /// vector was empty.
    #[error("numeric degeneracy in regression: {detail}")]
    NumericDegeneracy {
        /// Description of which stage produced no usable values.
        detail: String,
    },
    /// Requested GPU backend is not present on this host.
    #[error("backend {backend} is unavailable: {reason}")]
    BackendUnavailable {
        /// Name of the requested backend (`cuda`, `metal`).
        backend: String,
        /// Probe failure reason.
        reason: String,
    },
    /// A device error occurred during kernel launch or a host/device copy.
    #[error("backend {backend} runtime error (pair={pair:?}, site={site:?}): {detail}")]
    BackendRuntime {
        /// Name of the backend that failed.
        backend: String,
        /// The `(pair, site)` being processed when the failure occurred,
        /// if known.
        pair: Option<(i64, i64)>,
        /// The site index being processed when the failure occurred, if
        /// known.
        site: Option<usize>,
        /// Backend-reported failure detail.
        detail: String,
    },
    /// Allocation failure on host or device.
    #[error("resource exhaustion: {detail}")]
    ResourceExhaustion {
        /// Description of the allocation that failed.
        detail: String,
    },
    /// Could not open or write an output artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Could not serialize an output artifact.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GrandConvError {
    /// Maps this error onto the process exit code documented in the
    /// command surface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            GrandConvError::InvalidInput { .. } => 1,
            GrandConvError::InvalidBranchPairSelection { .. } => 1,
            GrandConvError::Io(_) => 2,
            GrandConvError::BackendUnavailable { .. } => 3,
            GrandConvError::NumericDegeneracy { .. } => 4,
            GrandConvError::BackendRuntime { .. } => 2,
            GrandConvError::ResourceExhaustion { .. } => 2,
            GrandConvError::Json(_) => 2,
        }
    }
}
