//! Orchestration of a partitioned simulation across a process group
//!
//! The master process owns a [`Simulator`], which holds the master's own
//! chunk and a [`Controller`] driving the worker processes. Each worker runs
//! [`worker::serve()`], which builds its chunk from the commands sent by the
//! master, then follows the master's step-loop directives until told to
//! finish.

pub mod controller;
pub mod launcher;
pub mod simulator;
pub mod worker;

pub use controller::{Controller, ControllerState};
pub use launcher::Launcher;
pub use simulator::{Simulator, SimulatorConfig};

use comm::{CommError, Rank};
use compute::{BuildError, StepError};
use data::network::NetworkFileError;
use std::process::ExitStatus;
use thiserror::Error;

/// Things that can go wrong while orchestrating a simulation
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cannot {operation} while {state:?}")]
    State {
        operation: &'static str,
        state: ControllerState,
    },

    #[error("protocol violation ({0})")]
    Protocol(String),

    #[error("component {component} does not exist (there are {num_components})")]
    InvalidComponent {
        component: usize,
        num_components: usize,
    },

    #[error("failed to build a chunk")]
    Build(#[from] BuildError),

    #[error("failed to run simulation steps")]
    Step(#[from] StepError),

    #[error("failed to communicate with the process group")]
    Comm(#[from] CommError),

    #[error("failed to access a network file")]
    NetworkFile(#[from] NetworkFileError),

    #[error("failed to launch worker {rank}")]
    Launch {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for worker process {rank}")]
    Wait {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {rank} panicked")]
    WorkerPanicked { rank: Rank },

    #[error("worker process {rank} exited with {status}")]
    WorkerExited { rank: Rank, status: ExitStatus },

    #[error("worker {rank} failed")]
    Worker {
        rank: Rank,
        #[source]
        source: Box<ControllerError>,
    },
}
//
/// Result type associated with simulation orchestration
pub type Result<T> = std::result::Result<T, ControllerError>;
