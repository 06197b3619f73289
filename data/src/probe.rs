//! Probe data collected at the end of a run

use crate::{network::Result, Matrix, Precision, ProbeKey};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Sampled values of a signal, oldest first
pub type ProbeHistory = Vec<Matrix>;

/// Histories of all probes of a simulation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeArchive {
    /// Simulated time interval on each step
    pub dt: Precision,

    /// Probe histories, by probe key
    pub histories: BTreeMap<ProbeKey, ProbeHistory>,
}
//
impl ProbeArchive {
    /// Save the archive to a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load an archive from a file
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}
