//! Replayable description of a partitioned network
//!
//! A network file holds, for each component (chunk), the ordered sequence of
//! build commands that constructs it. Component 0 is the master's chunk, the
//! other components are shipped to worker processes.

use crate::{command::BuildCommand, Precision};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};
use thiserror::Error;

/// Partitioned network, as a set of per-component command streams
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkFile {
    /// Simulated time interval on each step
    pub dt: Precision,

    /// Build commands of each component, master first
    ///
    /// Streams never contain [`BuildCommand::Stop`], which is only emitted on
    /// the wire when a build is finalized.
    pub components: Vec<Vec<BuildCommand>>,
}
//
impl NetworkFile {
    /// Set up an empty network with a certain number of components
    pub fn new(dt: Precision, num_components: usize) -> Self {
        Self {
            dt,
            components: vec![Vec::new(); num_components],
        }
    }

    /// Number of components, including the master's
    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Append a command to a component's stream
    pub fn try_push(&mut self, component: usize, command: BuildCommand) -> Result<()> {
        let num_components = self.num_components();
        let commands = self
            .components
            .get_mut(component)
            .ok_or(NetworkFileError::InvalidComponent {
                component,
                num_components,
            })?;
        commands.push(command);
        Ok(())
    }

    /// Number of probes declared by each component that declares any
    pub fn probe_counts(&self) -> BTreeMap<usize, usize> {
        self.components
            .iter()
            .enumerate()
            .map(|(component, commands)| {
                let count = commands
                    .iter()
                    .filter(|command| matches!(command, BuildCommand::AddProbe { .. }))
                    .count();
                (component, count)
            })
            .filter(|&(_, count)| count > 0)
            .collect()
    }

    /// Save the network to a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a network from a file
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}
//
impl fmt::Display for NetworkFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<Network dt={}", self.dt)?;
        for (component, commands) in self.components.iter().enumerate() {
            writeln!(f, "  <Component {component}")?;
            for command in commands {
                writeln!(f, "    {command}")?;
            }
            writeln!(f, "  >")?;
        }
        write!(f, ">")
    }
}

/// Things that can go wrong while saving or loading files
#[derive(Debug, Error)]
pub enum NetworkFileError {
    #[error("failed to access file")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode file contents")]
    Encoding(#[from] bincode::Error),

    #[error("component {component} does not exist (there are {num_components})")]
    InvalidComponent {
        component: usize,
        num_components: usize,
    },
}
//
/// Result type associated with file I/O
pub type Result<T> = std::result::Result<T, NetworkFileError>;
