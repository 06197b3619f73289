//! Master side of the control protocol
//!
//! The controller walks through the following states:
//!
//! - [`ControllerState::Uninitialized`]: nothing has happened yet.
//! - [`ControllerState::Spawned`]: workers have been started, but have not
//!   yet been told about their chunk.
//! - [`ControllerState::Building`]: each worker knows its chunk's label and
//!   timestep, and build commands can be forwarded to it.
//! - [`ControllerState::Running`]: the build phase is over, simulation steps
//!   can be run and probe data gathered.
//! - [`ControllerState::Finalized`]: the workers are gone.
//!
//! Any communication failure finalizes the controller, after collecting the
//! workers' own error reports.

use crate::{launcher::Workers, ControllerError, Launcher, Result};
use comm::{ProcessGroup, Rank, MASTER};
use compute::Chunk;
use data::{
    command::{BuildCommand, Directive, BUILD_TAG, GATHER_TAG},
    probe::ProbeHistory,
    Matrix, Precision, ProbeKey, SignalKey,
};
use log::{debug, info, warn};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    time::Duration,
};

/// Controller lifecycle stage
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControllerState {
    #[default]
    Uninitialized,
    Spawned,
    Building,
    Running,
    Finalized,
}

/// Master-side driver of the worker processes
#[derive(Debug, Default)]
pub struct Controller {
    /// Current lifecycle stage
    state: ControllerState,

    /// Master's handle to the process group, once spawned
    group: Option<ProcessGroup>,

    /// Running workers, until finalized
    workers: Option<Workers>,

    /// Number of workers
    num_workers: usize,

    /// Number of probes forwarded to each worker, by rank
    forwarded_probes: BTreeMap<Rank, usize>,
}
//
impl Controller {
    /// Set up a controller, without starting any worker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle stage
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Number of workers
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Start the workers and open their build phase
    ///
    /// Workers get ranks 1 to `num_workers`, and each of them is told its
    /// chunk label and the timestep of the master `chunk`.
    pub fn initialize(
        &mut self,
        chunk: &Chunk,
        num_workers: usize,
        launcher: &Launcher,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.expect_state(ControllerState::Uninitialized, "initialize")?;
        let (group, workers) = launcher.launch(num_workers, timeout)?;
        info!("Spawned {num_workers} workers");
        self.group = Some(group);
        self.workers = Some(workers);
        self.num_workers = num_workers;
        self.state = ControllerState::Spawned;

        let dt = chunk.dt();
        let outcome: Result<()> = (1..=num_workers).try_for_each(|rank| {
            let group = self.group()?;
            group.send(rank, BUILD_TAG, &format!("Chunk {rank}"))?;
            group.send(rank, BUILD_TAG, &dt)?;
            Ok(())
        });
        self.check(outcome)?;
        self.state = ControllerState::Building;
        Ok(())
    }

    /// Forward a signal to a worker's chunk
    pub fn add_signal(
        &mut self,
        rank: Rank,
        key: SignalKey,
        label: impl Into<String>,
        data: Matrix,
    ) -> Result<()> {
        self.send_command(
            rank,
            BuildCommand::AddSignal {
                key,
                label: label.into(),
                data,
            },
        )
    }

    /// Forward an operator to a worker's chunk
    pub fn add_op(&mut self, rank: Rank, descriptor: impl Into<String>) -> Result<()> {
        self.send_command(
            rank,
            BuildCommand::AddOp {
                descriptor: descriptor.into(),
            },
        )
    }

    /// Forward a probe to a worker's chunk
    pub fn add_probe(
        &mut self,
        rank: Rank,
        probe_key: ProbeKey,
        signal_key: SignalKey,
        period: Precision,
    ) -> Result<()> {
        self.send_command(
            rank,
            BuildCommand::AddProbe {
                probe_key,
                signal_key,
                period,
            },
        )
    }

    /// Forward a build command to a worker's chunk
    ///
    /// [`BuildCommand::Stop`] is reserved to [`Controller::finalize()`].
    pub fn send_command(&mut self, rank: Rank, command: BuildCommand) -> Result<()> {
        self.expect_state(ControllerState::Building, "forward build commands")?;
        if rank == MASTER || rank > self.num_workers {
            return Err(ControllerError::InvalidComponent {
                component: rank,
                num_components: self.num_workers + 1,
            });
        }
        if command == BuildCommand::Stop {
            return Err(ControllerError::Protocol(
                "build phases are only stopped by finalize".into(),
            ));
        }
        debug!("Forwarding {command} to worker {rank}");
        let outcome = self
            .group()
            .and_then(|group| Ok(group.send(rank, BUILD_TAG, &command)?));
        self.check(outcome)?;
        if let BuildCommand::AddProbe { .. } = command {
            *self.forwarded_probes.entry(rank).or_default() += 1;
        }
        Ok(())
    }

    /// End the build phase
    ///
    /// Binds the signal exchange operators of the master `chunk` to the
    /// process group, then tells every worker to stop building.
    pub fn finalize(&mut self, chunk: &mut Chunk) -> Result<()> {
        self.expect_state(ControllerState::Building, "finalize")?;
        let outcome: Result<()> = self.group().and_then(|group| {
            chunk.bind_group(group)?;
            for rank in 1..=self.num_workers {
                group.send(rank, BUILD_TAG, &BuildCommand::Stop)?;
            }
            Ok(())
        });
        self.check(outcome)?;
        info!("Build phase over");
        self.state = ControllerState::Running;
        Ok(())
    }

    /// Run `num_steps` steps on every member, master `chunk` included
    ///
    /// Returns once every member has completed these steps.
    pub fn run_n_steps(&mut self, chunk: &mut Chunk, num_steps: u64) -> Result<()> {
        self.expect_state(ControllerState::Running, "run simulation steps")?;
        info!("Running {num_steps} steps");
        let outcome = self.broadcast(Directive::Run(num_steps)).and_then(|()| {
            chunk.run_n_steps(num_steps)?;
            Ok(self.group()?.barrier()?)
        });
        self.check(outcome)?;
        info!("Finished running {num_steps} steps");
        Ok(())
    }

    /// Collect the probe histories of the workers
    ///
    /// `expected_counts` gives the number of probes of each worker that has
    /// any. It must match the probes that were forwarded to each worker,
    /// otherwise the gather is refused without contacting any worker. Entries
    /// for the master's rank are ignored, since the master's probes are local.
    pub fn gather_probe_data(
        &mut self,
        expected_counts: &BTreeMap<Rank, usize>,
    ) -> Result<BTreeMap<ProbeKey, ProbeHistory>> {
        self.expect_state(ControllerState::Running, "gather probe data")?;
        let expected_counts = expected_counts
            .iter()
            .filter(|&(&rank, &count)| rank != MASTER && count > 0)
            .map(|(&rank, &count)| (rank, count))
            .collect::<BTreeMap<_, _>>();
        if expected_counts != self.forwarded_probes {
            return Err(ControllerError::Protocol(format!(
                "expected probe counts {expected_counts:?} differ from the {:?} sent to workers",
                self.forwarded_probes
            )));
        }

        info!("Gathering probe data from workers");
        let mut duplicates = Vec::new();
        let outcome = self.broadcast(Directive::Gather).and_then(|()| {
            let group = self.group()?;
            let mut probe_data = BTreeMap::new();
            for (&rank, &count) in &expected_counts {
                for _ in 0..count {
                    let (key, history): (ProbeKey, ProbeHistory) =
                        group.recv(rank, GATHER_TAG)?;
                    debug!(
                        "Received {} samples of probe {key} from worker {rank}",
                        history.len()
                    );
                    match probe_data.entry(key) {
                        Entry::Vacant(vacant) => {
                            vacant.insert(history);
                        }
                        Entry::Occupied(_) => duplicates.push((rank, key)),
                    }
                }
            }
            group.barrier()?;
            Ok(probe_data)
        });
        let probe_data = self.check(outcome)?;
        if !duplicates.is_empty() {
            return Err(ControllerError::Protocol(format!(
                "probe keys were reported more than once (rank, key): {duplicates:?}"
            )));
        }
        info!("Gathered {} probe histories", probe_data.len());
        Ok(probe_data)
    }

    /// Shut the workers down and tear down the process group
    pub fn finish_simulation(&mut self) -> Result<()> {
        self.expect_state(ControllerState::Running, "finish the simulation")?;
        let outcome = self.broadcast(Directive::Finish);
        self.check(outcome)?;
        self.state = ControllerState::Finalized;
        let shutdown = self.group.take().map_or(Ok(()), |group| group.shutdown());
        if let Some(workers) = self.workers.take() {
            workers.join()?;
        }
        shutdown?;
        info!("Simulation finished");
        Ok(())
    }

    /// Master's handle to the process group
    fn group(&self) -> Result<&ProcessGroup> {
        self.group.as_ref().ok_or(ControllerError::State {
            operation: "communicate",
            state: self.state,
        })
    }

    /// Broadcast a directive to the workers
    fn broadcast(&self, mut directive: Directive) -> Result<()> {
        Ok(self.group()?.broadcast(MASTER, &mut directive)?)
    }

    /// Check that the controller is in a given state
    fn expect_state(&self, expected: ControllerState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ControllerError::State {
                operation,
                state: self.state,
            })
        }
    }

    /// Finalize the controller if an operation failed
    ///
    /// Worker failures often cause communication failures on the master
    /// side, so the workers' own reports are favored when available.
    fn check<T>(&mut self, outcome: Result<T>) -> Result<T> {
        outcome.map_err(|error| {
            warn!("Aborting simulation: {error}");
            self.state = ControllerState::Finalized;
            if let Some(group) = self.group.take() {
                let _ = group.shutdown();
            }
            match self.workers.take().map(Workers::join) {
                Some(Err(worker_error)) => worker_error,
                _ => error,
            }
        })
    }
}
//
impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            if let Err(e) = group.shutdown() {
                warn!("Failed to tear down the process group: {e}");
            }
        }
        if let Some(workers) = self.workers.take() {
            workers.abandon();
        }
    }
}
