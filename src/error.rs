//! Error taxonomy for lattice construction and halo traffic.
//!
//! Configuration problems come back as `Err(LatticeError)` from the
//! constructors. Everything that happens after startup (protocol violations,
//! buffer size mismatches, unanswered receives) is fatal: it is logged and the
//! partition panics through [`fatal`], which in turn aborts the whole run.

use thiserror::Error;

/// Marker carried by panics raised in partitions that were woken up because
/// another partition died first.
pub(crate) const PEER_ABORT_MARKER: &str = "peer partition aborted";

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("invalid lattice extents {extents:?}: {reason}")]
    InvalidExtents { extents: Vec<usize>, reason: String },

    #[error("cannot decompose extents {extents:?} into {count} partitions")]
    Decomposition { extents: Vec<usize>, count: usize },

    #[error("partition grid {grid:?} does not tile extents {extents:?}")]
    PartitionGrid { extents: Vec<usize>, grid: Vec<usize> },

    #[error("boundary conditions for field `{field}` list {got} axes, lattice has {dim}")]
    BoundaryAxes { field: String, got: usize, dim: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("halo protocol violation: {0}")]
    Protocol(String),

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("unanswered receive from partition {from} after {waited_ms} ms ({tag})")]
    Timeout { from: usize, tag: String, waited_ms: u64 },

    #[error("peer partition aborted")]
    PeerAborted,
}

pub type Result<T> = std::result::Result<T, LatticeError>;

/// Log `err` and abort the calling partition.
#[cold]
#[track_caller]
pub(crate) fn fatal(err: LatticeError) -> ! {
    tracing::error!(error = %err, "fatal lattice error");
    panic!("{err}");
}
