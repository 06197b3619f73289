//! Messages of the master/worker control protocol
//!
//! During the build phase, the master streams [`BuildCommand`]s to each worker,
//! which applies them to its chunk in arrival order. Once every worker has
//! received [`BuildCommand::Stop`], the master drives the simulation by
//! broadcasting [`Directive`]s to the whole process group.

use crate::{shape, Matrix, Precision, ProbeKey, SignalKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag of the build-phase command stream
pub const BUILD_TAG: u32 = 1;

/// Tag of the probe data gathering stream
pub const GATHER_TAG: u32 = 3;

/// Chunk construction command
///
/// The same encoding is used on the wire and in network files, so a chunk can
/// always be rebuilt by replaying its command sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BuildCommand {
    /// Add a signal with its initial value
    AddSignal {
        /// Key under which operators and probes refer to the signal
        key: SignalKey,

        /// Human-readable name, used in diagnostics
        label: String,

        /// Initial value, which also fixes the signal's shape
        data: Matrix,
    },

    /// Add an operator, to be run after all previously added operators
    AddOp {
        /// Textual operator descriptor, resolved against the chunk's signals
        descriptor: String,
    },

    /// Add a probe
    AddProbe {
        /// Key under which the probe's history will be reported
        probe_key: ProbeKey,

        /// Signal to be sampled
        signal_key: SignalKey,

        /// Number of steps between two samples
        period: Precision,
    },

    /// End of the build phase
    Stop,
}
//
impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddSignal { key, label, data } => {
                let [rows, cols] = shape(data);
                write!(f, "AddSignal(key={key}, label={label:?}, shape={rows}x{cols})")
            }
            Self::AddOp { descriptor } => write!(f, "AddOp({descriptor})"),
            Self::AddProbe {
                probe_key,
                signal_key,
                period,
            } => write!(
                f,
                "AddProbe(key={probe_key}, signal={signal_key}, period={period})"
            ),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// Step-loop directive, broadcast by the master to the whole process group
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Directive {
    /// Run this many simulation steps, then synchronize on a barrier
    Run(u64),

    /// Send probe histories to the master, then synchronize on a barrier
    Gather,

    /// Leave the step loop and shut down
    Finish,
}
