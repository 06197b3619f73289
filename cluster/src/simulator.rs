//! Top-level simulation handle

use crate::{Controller, ControllerError, ControllerState, Launcher, Result};
use compute::Chunk;
use data::{
    command::BuildCommand,
    network::NetworkFile,
    probe::ProbeArchive,
    Matrix, Precision, ProbeKey, SignalKey,
};
use log::info;
use std::{fmt, path::Path, time::Duration};

/// Runtime configuration of a simulation
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SimulatorConfig {
    /// How worker processes are started
    pub launcher: Launcher,

    /// Bound on every blocking wait for another member, if any
    ///
    /// Without it, a crashed or stalled member blocks everyone else forever.
    pub comm_timeout: Option<Duration>,
}

/// Partitioned simulation, seen from the master process
///
/// The simulation is described as a set of components (chunks), each built
/// by a sequence of build commands. Component 0 is run by the master, every
/// other component by its own worker. Building is lazy: commands are recorded
/// until the simulation first runs, at which point workers are started and
/// every component gets built.
#[derive(Debug)]
pub struct Simulator {
    /// Runtime configuration
    config: SimulatorConfig,

    /// Recorded build commands
    network: NetworkFile,

    /// Master's chunk, built from component 0
    master: Chunk,

    /// Driver of the workers
    controller: Controller,
}
//
impl Simulator {
    /// Set up a simulation with only a master component
    pub fn new(dt: Precision, config: SimulatorConfig) -> Self {
        Self::load_network(NetworkFile::new(dt, 1), config)
    }

    /// Set up a simulation that replays a recorded network
    ///
    /// A network without any component gets an empty master component.
    pub fn load_network(mut network: NetworkFile, config: SimulatorConfig) -> Self {
        if network.components.is_empty() {
            network.components.push(Vec::new());
        }
        Self {
            config,
            master: Chunk::new("Chunk 0", network.dt),
            network,
            controller: Controller::new(),
        }
    }

    /// Set up a simulation from a network file
    pub fn read_from_file(path: impl AsRef<Path>, config: SimulatorConfig) -> Result<Self> {
        Ok(Self::load_network(NetworkFile::read_from_file(path)?, config))
    }

    /// Record the network built so far into a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(self.network.write_to_file(path)?)
    }

    /// Simulation timestep (s)
    pub fn dt(&self) -> Precision {
        self.network.dt
    }

    /// Number of components, master included
    pub fn num_components(&self) -> usize {
        self.network.num_components()
    }

    /// Recorded network
    pub fn network(&self) -> &NetworkFile {
        &self.network
    }

    /// Master's chunk
    pub fn master_chunk(&self) -> &Chunk {
        &self.master
    }

    /// Stage of the underlying controller
    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    /// Add an empty component, returning its index
    pub fn add_chunk(&mut self) -> Result<usize> {
        self.ensure_recording("add a chunk")?;
        self.network.components.push(Vec::new());
        Ok(self.network.num_components() - 1)
    }

    /// Add a signal to a component
    pub fn add_signal(
        &mut self,
        component: usize,
        key: SignalKey,
        label: impl Into<String>,
        data: Matrix,
    ) -> Result<()> {
        self.push_command(
            component,
            BuildCommand::AddSignal {
                key,
                label: label.into(),
                data,
            },
        )
    }

    /// Add an operator to a component
    pub fn add_op(&mut self, component: usize, descriptor: impl Into<String>) -> Result<()> {
        self.push_command(
            component,
            BuildCommand::AddOp {
                descriptor: descriptor.into(),
            },
        )
    }

    /// Add a probe to a component
    pub fn add_probe(
        &mut self,
        component: usize,
        probe_key: ProbeKey,
        signal_key: SignalKey,
        period: Precision,
    ) -> Result<()> {
        self.push_command(
            component,
            BuildCommand::AddProbe {
                probe_key,
                signal_key,
                period,
            },
        )
    }

    /// Record a build command for a component
    pub fn push_command(&mut self, component: usize, command: BuildCommand) -> Result<()> {
        self.ensure_recording("add build commands")?;
        let num_components = self.num_components();
        if component >= num_components {
            return Err(ControllerError::InvalidComponent {
                component,
                num_components,
            });
        }
        if command == BuildCommand::Stop {
            return Err(ControllerError::Protocol(
                "network files do not contain stop commands".into(),
            ));
        }
        self.network.try_push(component, command)?;
        Ok(())
    }

    /// Start the workers and build every component
    ///
    /// This happens automatically on the first run, but calling it explicitly
    /// surfaces build errors before any step is taken.
    pub fn finalize(&mut self) -> Result<()> {
        self.ensure_recording("finalize")?;

        // The master's chunk is built first, to catch errors before spawning
        let mut master = Chunk::new("Chunk 0", self.dt());
        for command in &self.network.components[0] {
            master.apply(command.clone())?;
        }
        self.master = master;

        let num_workers = self.num_components() - 1;
        self.controller.initialize(
            &self.master,
            num_workers,
            &self.config.launcher,
            self.config.comm_timeout,
        )?;
        for (rank, commands) in self.network.components.iter().enumerate().skip(1) {
            for command in commands {
                self.controller.send_command(rank, command.clone())?;
            }
        }
        self.controller.finalize(&mut self.master)?;
        info!(
            "Built {} components, {} probes in total",
            self.num_components(),
            self.network.probe_counts().values().sum::<usize>()
        );
        Ok(())
    }

    /// Run `num_steps` simulation steps
    pub fn run_n_steps(&mut self, num_steps: u64) -> Result<()> {
        if self.state() == ControllerState::Uninitialized {
            self.finalize()?;
        }
        self.controller.run_n_steps(&mut self.master, num_steps)
    }

    /// Collect the histories of all probes, master's and workers'
    pub fn probe_data(&mut self) -> Result<ProbeArchive> {
        if self.state() == ControllerState::Uninitialized {
            self.finalize()?;
        }
        let mut histories = self
            .controller
            .gather_probe_data(&self.network.probe_counts())?;
        for (key, history) in self.master.probe_data() {
            if histories.insert(key, history.to_vec()).is_some() {
                return Err(ControllerError::Protocol(format!(
                    "probe {key} exists both on the master and on a worker"
                )));
            }
        }
        Ok(ProbeArchive {
            dt: self.dt(),
            histories,
        })
    }

    /// Shut down the workers
    pub fn finish(mut self) -> Result<()> {
        match self.state() {
            ControllerState::Uninitialized | ControllerState::Finalized => Ok(()),
            _ => self.controller.finish_simulation(),
        }
    }

    /// Check that build commands can still be recorded
    fn ensure_recording(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            ControllerState::Uninitialized => Ok(()),
            state => Err(ControllerError::State { operation, state }),
        }
    }
}
//
impl fmt::Display for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<Simulator state={:?}", self.state())?;
        if self.state() == ControllerState::Uninitialized {
            write!(f, "{}", self.network)?;
        } else {
            writeln!(f, "{}", self.master)?;
            let num_workers = self.controller.num_workers();
            write!(f, "  ({num_workers} remote chunks)")?;
        }
        write!(f, "\n>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::{column, scalar};

    #[test]
    fn recording_and_replay() -> Result<()> {
        let mut sim = Simulator::new(0.001, SimulatorConfig::default());
        assert_eq!(sim.add_chunk()?, 1);
        sim.add_signal(0, 1, "x", scalar(0.0))?;
        sim.add_op(0, "Reset;1;2")?;
        sim.add_probe(0, 7, 1, 1.0)?;
        sim.add_signal(1, 1, "y", column(&[0.0; 3]))?;
        sim.add_op(1, "Reset;1;4")?;
        sim.add_probe(1, 8, 1, 2.0)?;
        assert!(matches!(
            sim.add_op(2, "Reset;1;4"),
            Err(ControllerError::InvalidComponent { component: 2, .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.bin");
        sim.write_to_file(&path)?;
        let text = sim.to_string();
        assert!(text.starts_with("<Simulator state=Uninitialized"));

        let mut replayed = Simulator::read_from_file(&path, SimulatorConfig::default())?;
        assert_eq!(replayed.network(), sim.network());
        replayed.run_n_steps(4)?;
        assert!(matches!(
            replayed.add_chunk(),
            Err(ControllerError::State { .. })
        ));
        let archive = replayed.probe_data()?;
        assert_eq!(archive.dt, 0.001);
        assert_eq!(archive.histories[&7].len(), 5);
        assert_eq!(archive.histories[&7][4], scalar(2.0));
        assert_eq!(archive.histories[&8].len(), 3);
        assert_eq!(archive.histories[&8][2], column(&[4.0; 3]));
        replayed.finish()
    }

    #[test]
    fn master_build_errors_surface_before_spawning() {
        let mut sim = Simulator::new(0.001, SimulatorConfig::default());
        sim.add_chunk().unwrap();
        sim.add_op(0, "Copy;1;2").unwrap();
        assert!(matches!(
            sim.finalize(),
            Err(ControllerError::Build(compute::BuildError::UnknownSignal(1)))
        ));
        assert_eq!(sim.state(), ControllerState::Uninitialized);
    }
}
