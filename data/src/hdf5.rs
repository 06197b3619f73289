//! Moving probe data to and from HDF5 files

use crate::{
    probe::{ProbeArchive, ProbeHistory},
    Matrix, Precision, ProbeKey,
};
use hdf5::{File, Group};
use ndarray::{Array3, Ix3};
use std::path::Path;

pub use hdf5::Result;

/// Common configuration for reading and writing to HDF5 files
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config<'grname, FileName: AsRef<Path>> {
    /// Name of the HDF5 file to be accessed
    pub file_name: FileName,

    /// Name of the group holding one dataset per probe
    pub group_name: Option<&'grname str>,
}
//
impl<'grname, FileName: AsRef<Path>> Config<'grname, FileName> {
    fn group_name(&self) -> &'grname str {
        self.group_name.unwrap_or("probes")
    }
}

/// Mechanism to write probe histories into an HDF5 file
///
/// Each history is stored as a `[samples, rows, cols]` dataset named after
/// the probe key. The simulation timestep is stored as a `dt` attribute of the
/// probe group.
pub struct Writer {
    /// File handle
    file: File,

    /// Group receiving the probe datasets
    group: Group,
}
//
impl Writer {
    /// Create or truncate a file
    pub fn create(config: Config<'_, impl AsRef<Path>>, dt: Precision) -> Result<Self> {
        let group_name = config.group_name();
        let file = File::create(config.file_name)?;
        let group = file.create_group(group_name)?;
        group
            .new_attr::<Precision>()
            .create("dt")?
            .write_scalar(&dt)?;
        Ok(Self { file, group })
    }

    /// Write down the history of one probe
    pub fn write(&mut self, key: ProbeKey, history: &[Matrix]) -> Result<()> {
        let [rows, cols] = history
            .first()
            .map(|sample| [sample.nrows(), sample.ncols()])
            .unwrap_or([0, 0]);
        let mut stacked = Array3::<Precision>::zeros((history.len(), rows, cols));
        for (mut dst, src) in stacked.outer_iter_mut().zip(history) {
            dst.assign(src);
        }
        self.group
            .new_dataset_builder()
            .with_data(&stacked)
            .create(key.to_string().as_str())?;
        Ok(())
    }

    /// Write down every history of an archive
    pub fn write_archive(&mut self, archive: &ProbeArchive) -> Result<()> {
        for (&key, history) in &archive.histories {
            self.write(key, history)?;
        }
        Ok(())
    }

    /// Flush the file to the underlying storage medium and close it
    ///
    /// This should automatically happen on Drop, but doing it manually allows
    /// you to catch and handle errors, instead of letting them lead to panics.
    pub fn close(self) -> Result<()> {
        self.file.close()
    }
}

/// Mechanism to read probe histories back from an HDF5 file
pub struct Reader {
    /// Group holding the probe datasets
    group: Group,
}
//
impl Reader {
    /// Open an existing file
    pub fn open(config: Config<'_, impl AsRef<Path>>) -> Result<Self> {
        let group_name = config.group_name();
        let file = File::open(config.file_name)?;
        let group = file.group(group_name)?;
        Ok(Self { group })
    }

    /// Simulation timestep that the file was recorded with
    pub fn dt(&self) -> Result<Precision> {
        self.group.attr("dt")?.read_scalar()
    }

    /// Keys of the probes stored in the file
    pub fn probe_keys(&self) -> Result<Vec<ProbeKey>> {
        Ok(self
            .group
            .member_names()?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect())
    }

    /// Read the history of one probe
    pub fn read(&self, key: ProbeKey) -> Result<ProbeHistory> {
        let stacked = self
            .group
            .dataset(&key.to_string())?
            .read::<Precision, Ix3>()?;
        Ok(stacked
            .outer_iter()
            .map(|sample| sample.to_owned())
            .collect())
    }

    /// Read every probe history into an archive
    pub fn read_archive(&self) -> Result<ProbeArchive> {
        let mut archive = ProbeArchive {
            dt: self.dt()?,
            ..Default::default()
        };
        for key in self.probe_keys()? {
            archive.histories.insert(key, self.read(key)?);
        }
        Ok(archive)
    }
}
