//! Starting worker processes (or threads)

use crate::{worker, ControllerError, Result};
use comm::{local::LocalTransport, tcp::TcpTransport, ProcessGroup, Rank};
use log::{info, warn};
use std::{
    ffi::OsString,
    net::IpAddr,
    path::PathBuf,
    process::Child,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Way of starting the workers of a simulation
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Launcher {
    /// Run workers as threads of the master process
    ///
    /// The control protocol is exactly the same as with separate processes,
    /// which makes this handy for testing and for small simulations.
    #[default]
    Threads,

    /// Spawn workers as separate processes, connected over TCP
    Processes {
        /// Worker executable
        program: PathBuf,

        /// Arguments passed to the worker before its group coordinates
        args: Vec<OsString>,

        /// Address that all members listen on
        bind_host: IpAddr,
    },

    /// Spawn workers as MPI processes
    #[cfg(feature = "mpi")]
    Mpi {
        /// Worker executable
        program: PathBuf,

        /// Arguments passed to the worker
        args: Vec<OsString>,
    },
}
//
impl Launcher {
    /// Spawn workers by re-running the current executable with `args`
    pub fn current_exe(args: Vec<OsString>, bind_host: IpAddr) -> std::io::Result<Self> {
        Ok(Self::Processes {
            program: std::env::current_exe()?,
            args,
            bind_host,
        })
    }

    /// Spawn MPI workers by re-running the current executable with `args`
    #[cfg(feature = "mpi")]
    pub fn mpi_current_exe(args: Vec<OsString>) -> std::io::Result<Self> {
        Ok(Self::Mpi {
            program: std::env::current_exe()?,
            args,
        })
    }

    /// Start `num_workers` workers, each running [`worker::serve()`]
    ///
    /// Returns the master's handle to the resulting process group, along
    /// with a handle to the workers.
    pub(crate) fn launch(
        &self,
        num_workers: usize,
        timeout: Option<Duration>,
    ) -> Result<(ProcessGroup, Workers)> {
        match self {
            Self::Threads => {
                let mut members = LocalTransport::group(num_workers + 1)
                    .into_iter()
                    .map(|transport| {
                        ProcessGroup::new(Arc::new(transport)).with_timeout(timeout)
                    })
                    .collect::<Vec<_>>();
                let master = members.remove(0);
                let mut threads = Vec::with_capacity(num_workers);
                for group in members {
                    let rank = group.rank();
                    let spawned = thread::Builder::new()
                        .name(format!("worker {rank}"))
                        .spawn(move || worker::serve(group));
                    match spawned {
                        Ok(handle) => threads.push((rank, handle)),
                        Err(source) => {
                            // Let the workers that did start notice that the
                            // master went away, then wait for them
                            let _ = master.shutdown();
                            let _ = Workers::Threads(threads).join();
                            return Err(ControllerError::Launch { rank, source });
                        }
                    }
                }
                info!("Started {num_workers} worker threads");
                Ok((master, Workers::Threads(threads)))
            }
            Self::Processes {
                program,
                args,
                bind_host,
            } => {
                let (transport, children) =
                    TcpTransport::spawn(program, args, num_workers, *bind_host, timeout)?;
                let master = ProcessGroup::new(Arc::new(transport)).with_timeout(timeout);
                let children = (1..).zip(children).collect();
                Ok((master, Workers::Processes(children)))
            }
            #[cfg(feature = "mpi")]
            Self::Mpi { program, args } => {
                let transport = comm::mpi::MpiTransport::spawn(program, args, num_workers)?;
                let master = ProcessGroup::new(Arc::new(transport)).with_timeout(timeout);
                Ok((master, Workers::Mpi))
            }
        }
    }
}

/// Handle to the running workers
#[derive(Debug)]
pub(crate) enum Workers {
    /// Worker threads, with their ranks
    Threads(Vec<(Rank, JoinHandle<Result<()>>)>),

    /// Worker processes, with their ranks
    Processes(Vec<(Rank, Child)>),

    /// MPI worker processes, which are owned by the MPI runtime
    #[cfg(feature = "mpi")]
    Mpi,
}
//
impl Workers {
    /// Wait for all workers to exit
    ///
    /// Reports the failure of the lowest-ranked failing worker, if any.
    pub fn join(self) -> Result<()> {
        let mut outcome = Ok(());
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                warn!("{e}");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        };
        match self {
            Self::Threads(threads) => {
                for (rank, handle) in threads {
                    record(match handle.join() {
                        Ok(result) => result.map_err(|e| ControllerError::Worker {
                            rank,
                            source: Box::new(e),
                        }),
                        Err(_) => Err(ControllerError::WorkerPanicked { rank }),
                    });
                }
            }
            Self::Processes(children) => {
                for (rank, mut child) in children {
                    record(match child.wait() {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => Err(ControllerError::WorkerExited { rank, status }),
                        Err(source) => Err(ControllerError::Wait { rank, source }),
                    });
                }
            }
            #[cfg(feature = "mpi")]
            Self::Mpi => {}
        }
        outcome
    }

    /// Stop waiting for the workers
    ///
    /// Worker processes are killed, worker threads are detached.
    pub fn abandon(self) {
        if let Self::Processes(children) = self {
            for (rank, mut child) in children {
                if let Err(e) = child.kill().and_then(|()| child.wait()) {
                    warn!("Failed to kill worker process {rank}: {e}");
                }
            }
        }
    }
}
