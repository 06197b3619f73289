//! Command-line plumbing shared by the simulation binaries

#[cfg(feature = "cluster")]
use clap::{Args, ValueEnum};
#[cfg(feature = "cluster")]
use cluster::{Launcher, SimulatorConfig};
#[cfg(feature = "cluster")]
use comm::{tcp::WorkerEndpoint, Rank};
#[cfg(feature = "tui")]
use indicatif::{style::TemplateError, ProgressBar, ProgressFinish, ProgressStyle};
#[cfg(feature = "tui")]
use log::LevelFilter;
#[cfg(feature = "cluster")]
use std::{
    ffi::OsString,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
#[cfg(any(feature = "cluster", feature = "tui"))]
use std::time::Duration;

/// Way of running the workers of a simulation
#[cfg(feature = "cluster")]
#[derive(ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Transport {
    /// One process per worker, connected over TCP
    #[default]
    Process,

    /// One thread of the master process per worker
    Thread,

    /// One MPI process per worker, spawned by the master
    #[cfg(feature = "mpi")]
    Mpi,
}

/// Connection settings shared by the master and its worker processes
#[cfg(feature = "cluster")]
#[derive(Args, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionArgs {
    /// Give up on any wait for another process after this many milliseconds
    #[arg(long, env)]
    pub comm_timeout_ms: Option<u64>,

    /// Address that every process of the simulation listens on
    #[arg(long, env, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind_host: IpAddr,
}
//
#[cfg(feature = "cluster")]
impl ConnectionArgs {
    /// Bound on blocking waits, if any
    pub fn comm_timeout(&self) -> Option<Duration> {
        self.comm_timeout_ms.map(Duration::from_millis)
    }

    /// Command-line arguments reproducing these settings in a worker process
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = vec!["--bind-host".into(), self.bind_host.to_string().into()];
        if let Some(ms) = self.comm_timeout_ms {
            args.push("--comm-timeout-ms".into());
            args.push(ms.to_string().into());
        }
        args
    }
}

/// Master-side settings of a partitioned simulation
#[cfg(feature = "cluster")]
#[derive(Args, Clone, Debug, Eq, PartialEq)]
pub struct ClusterArgs {
    /// Expected number of workers (default: one per non-master component)
    #[arg(long, env)]
    pub workers: Option<usize>,

    /// How workers are run
    #[arg(long, env, value_enum, default_value_t)]
    pub transport: Transport,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}
//
#[cfg(feature = "cluster")]
impl ClusterArgs {
    /// Simulator configuration matching these settings
    ///
    /// Worker processes re-run the current executable with `worker_command`,
    /// followed by the connection settings and, for TCP workers, their group
    /// coordinates. MPI workers also get the `--mpi` flag.
    pub fn simulator_config(
        &self,
        worker_command: Vec<OsString>,
    ) -> io::Result<SimulatorConfig> {
        let launcher = match self.transport {
            Transport::Thread => Launcher::Threads,
            Transport::Process => {
                let mut args = worker_command;
                args.extend(self.connection.to_args());
                Launcher::current_exe(args, self.connection.bind_host)?
            }
            #[cfg(feature = "mpi")]
            Transport::Mpi => {
                let mut args = worker_command;
                args.push("--mpi".into());
                args.extend(self.connection.to_args());
                Launcher::mpi_current_exe(args)?
            }
        };
        Ok(SimulatorConfig {
            launcher,
            comm_timeout: self.connection.comm_timeout(),
        })
    }
}

/// Settings of a spawned worker process
#[cfg(feature = "cluster")]
#[derive(Args, Clone, Debug, Eq, PartialEq)]
pub struct WorkerArgs {
    /// Join the MPI process group of the parent process
    #[arg(long)]
    pub mpi: bool,

    /// Listening address of the master
    #[arg(long, required_unless_present = "mpi", conflicts_with = "mpi")]
    pub master_addr: Option<SocketAddr>,

    /// Rank of this worker
    #[arg(long, required_unless_present = "mpi", conflicts_with = "mpi")]
    pub rank: Option<Rank>,

    /// Number of processes in the group, master included
    #[arg(long, required_unless_present = "mpi", conflicts_with = "mpi")]
    pub size: Option<usize>,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}
//
#[cfg(feature = "cluster")]
impl WorkerArgs {
    /// Coordinates of this worker within its TCP group
    ///
    /// MPI workers have none, the MPI runtime tells them where they stand.
    pub fn endpoint(&self) -> Option<WorkerEndpoint> {
        Some(WorkerEndpoint {
            master_addr: self.master_addr?,
            rank: self.rank?,
            size: self.size?,
        })
    }
}

/// Default log level
#[cfg(feature = "tui")]
fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Enable logging to syslog or, by default, to stderr
///
/// Stderr logging honors `RUST_LOG`.
#[cfg(feature = "tui")]
pub fn init_logging(to_syslog: bool) -> Result<(), syslog::Error> {
    if to_syslog {
        syslog::init(syslog::Facility::default(), default_level(), None)
    } else {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_level().as_str()),
        )
        .init();
        Ok(())
    }
}

/// Set up a progress bar over `len` units of work
#[cfg(feature = "tui")]
pub fn init_progress_reporting(
    message: &'static str,
    len: u64,
) -> Result<ProgressBar, TemplateError> {
    let progress = ProgressBar::new(len)
        .with_message(message)
        .with_style(ProgressStyle::with_template(
            "{msg} {pos}/{len} {wide_bar} {elapsed}/~{duration}",
        )?)
        .with_finish(ProgressFinish::AndClear);
    progress.enable_steady_tick(Duration::from_millis(100));
    Ok(progress)
}

#[cfg(all(test, feature = "cluster"))]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestWorker {
        #[command(flatten)]
        worker: WorkerArgs,
    }

    #[test]
    fn worker_accepts_launcher_arguments() {
        let connection = ConnectionArgs {
            comm_timeout_ms: Some(2500),
            bind_host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        };
        let endpoint = WorkerEndpoint {
            master_addr: "10.0.0.7:4242".parse().unwrap(),
            rank: 3,
            size: 5,
        };
        let args = std::iter::once(OsString::from("worker"))
            .chain(connection.to_args())
            .chain(endpoint.to_args());
        let parsed = TestWorker::try_parse_from(args).unwrap().worker;
        assert!(!parsed.mpi);
        assert_eq!(parsed.endpoint(), Some(endpoint));
        assert_eq!(parsed.connection, connection);
        assert_eq!(parsed.connection.comm_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn mpi_worker_needs_no_endpoint() {
        let args = ["worker", "--mpi", "--comm-timeout-ms", "10"];
        let parsed = TestWorker::try_parse_from(args).unwrap().worker;
        assert!(parsed.mpi);
        assert_eq!(parsed.endpoint(), None);
        assert_eq!(parsed.connection.comm_timeout(), Some(Duration::from_millis(10)));

        assert!(TestWorker::try_parse_from(["worker"]).is_err());
        assert!(TestWorker::try_parse_from(["worker", "--mpi", "--rank", "1"]).is_err());
    }

    #[test]
    fn thread_transport_needs_no_executable() {
        let args = ClusterArgs {
            workers: None,
            transport: Transport::Thread,
            connection: ConnectionArgs {
                comm_timeout_ms: None,
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
        };
        let config = args.simulator_config(Vec::new()).unwrap();
        assert_eq!(config.launcher, Launcher::Threads);
        assert_eq!(config.comm_timeout, None);
    }
}
