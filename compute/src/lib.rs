//! Execution engine of one simulation chunk
//!
//! A [`Chunk`] owns a table of named signals, an ordered list of operators
//! acting on them, and probes recording signal values over time. Each time
//! step runs every operator once, in insertion order, so the result of an
//! operator is visible to all operators that come after it in the same step.
//!
//! Operators are added in textual form (see [`descriptor`]) and resolved
//! against the chunk's signals at insertion time, so that every later step can
//! run without any lookup or validation.

pub mod chunk;
pub mod descriptor;
pub mod exchange;
pub mod filters;
pub mod neurons;
pub mod operator;
pub mod probe;
pub mod signals;

pub use chunk::Chunk;

use comm::{CommError, Rank, Tag};
use data::{Precision, ProbeKey, SignalKey};
use descriptor::DescriptorError;
use thiserror::Error;

/// Things that can go wrong while building a chunk
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to parse operator descriptor")]
    Descriptor(#[from] DescriptorError),

    #[error("signal {0} was already added")]
    DuplicateSignal(SignalKey),

    #[error("no signal with key {0}")]
    UnknownSignal(SignalKey),

    #[error("{op}: signal {key} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        op: &'static str,
        key: SignalKey,
        expected: [usize; 2],
        found: [usize; 2],
    },

    #[error("{op}: invalid {name} ({value})")]
    InvalidParameter {
        op: &'static str,
        name: &'static str,
        value: Precision,
    },

    #[error("probe {0} was already added")]
    DuplicateProbe(ProbeKey),

    #[error("probe {key}: period {period} does not round to a positive step count")]
    InvalidPeriod { key: ProbeKey, period: Precision },

    #[error("{op}: peer {peer} is not another member of the {size}-member group")]
    InvalidPeer {
        op: &'static str,
        peer: Rank,
        size: usize,
    },

    #[error("the chunk has started stepping and can no longer be modified")]
    AlreadyStepping,
}
//
/// Result type associated with chunk construction
pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Things that can go wrong while running simulation steps
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{op} on tag {tag} is not bound to a process group")]
    Unbound { op: &'static str, tag: Tag },

    #[error("{op} of signal {key} with member {peer} on tag {tag} failed")]
    Exchange {
        op: &'static str,
        key: SignalKey,
        peer: Rank,
        tag: Tag,
        #[source]
        source: CommError,
    },

    #[error("received a {found:?} value for signal {key} of shape {expected:?}")]
    ReceivedShape {
        key: SignalKey,
        expected: [usize; 2],
        found: [usize; 2],
    },
}
//
/// Result type associated with simulation steps
pub type StepResult<T> = std::result::Result<T, StepError>;
