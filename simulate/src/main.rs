mod demo;

use clap::{Parser, Subcommand};
use cluster::{worker, Simulator, SimulatorConfig};
use data::{probe::ProbeArchive, Precision};
use eyre::{bail, WrapErr};
use log::info;
use std::{ffi::OsString, path::Path, path::PathBuf, time::Duration};
use ui::{ClusterArgs, WorkerArgs};

/// Partitioned spiking network simulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log to syslog instead of stderr
    #[arg(long, env, global = true)]
    syslog: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a network file and save its probe data
    Run {
        /// Network file to be simulated
        network: PathBuf,

        /// Number of steps to be simulated
        #[arg(short = 'n', long, default_value_t = 1000)]
        steps: u64,

        /// Number of steps between two progress updates
        #[arg(
            short = 'e',
            long,
            default_value_t = 100,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        steps_per_update: u64,

        /// Path to the probe archive output file
        #[arg(short, long, default_value = "probes.bin")]
        output: PathBuf,

        /// Also export probe data to this HDF5 file
        #[arg(long)]
        hdf5: Option<PathBuf>,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Write a demonstration network file
    Demo {
        /// Path to the network output file
        output: PathBuf,

        /// Number of worker components
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Number of neurons on the master
        #[arg(long, default_value_t = 50)]
        neurons: usize,

        /// Time interval between two simulation steps (s)
        #[arg(short = 't', long, default_value_t = 0.001)]
        deltat: Precision,
    },

    /// Serve as a worker of a master process
    ///
    /// Started by the master itself, once per worker component.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    ui::init_logging(args.syslog).wrap_err("failed to set up logging")?;

    match args.command {
        Command::Run {
            network,
            steps,
            steps_per_update,
            output,
            hdf5,
            cluster,
        } => {
            // Workers inherit the logging setup of the master
            let mut worker_command = vec![OsString::from("worker")];
            if args.syslog {
                worker_command.push("--syslog".into());
            }
            let config = cluster
                .simulator_config(worker_command)
                .wrap_err("failed to locate the worker executable")?;
            let mut simulator = Simulator::read_from_file(&network, config)
                .wrap_err_with(|| format!("failed to load {}", network.display()))?;
            let num_workers = simulator.num_components() - 1;
            if let Some(expected) = cluster.workers {
                if expected != num_workers {
                    bail!("expected {expected} workers, but the network has {num_workers}");
                }
            }
            simulator.finalize().wrap_err("failed to build the network")?;

            // Run the simulation
            let progress = ui::init_progress_reporting("Simulating step", steps)?;
            let mut remaining = steps;
            while remaining > 0 {
                let num_steps = remaining.min(steps_per_update);
                simulator
                    .run_n_steps(num_steps)
                    .wrap_err("failed to compute simulation steps")?;
                progress.inc(num_steps);
                remaining -= num_steps;
            }
            progress.finish();

            // Save the results
            let archive = simulator
                .probe_data()
                .wrap_err("failed to collect probe data")?;
            archive
                .write_to_file(&output)
                .wrap_err_with(|| format!("failed to write {}", output.display()))?;
            if let Some(path) = hdf5 {
                export_hdf5(&archive, &path)
                    .wrap_err_with(|| format!("failed to export {}", path.display()))?;
            }
            info!(
                "Saved {} probe histories to {}",
                archive.histories.len(),
                output.display()
            );
            simulator.finish().wrap_err("failed to shut down the workers")?;
        }

        Command::Demo {
            output,
            workers,
            neurons,
            deltat,
        } => {
            let simulator =
                demo::demo_network(workers, neurons, deltat, SimulatorConfig::default())?;
            simulator
                .write_to_file(&output)
                .wrap_err_with(|| format!("failed to write {}", output.display()))?;
            info!("Wrote a network of {} components to {}", workers + 1, output.display());
        }

        Command::Worker(args) => {
            let timeout = args.connection.comm_timeout();
            match args.endpoint() {
                Some(endpoint) => {
                    worker::join_and_serve(endpoint, args.connection.bind_host, timeout)
                        .wrap_err_with(|| format!("worker {} failed", endpoint.rank))?
                }
                None => serve_mpi(timeout).wrap_err("MPI worker failed")?,
            }
        }
    }
    Ok(())
}

/// Join the MPI process group of the parent process and serve it
#[cfg(feature = "mpi")]
fn serve_mpi(timeout: Option<Duration>) -> eyre::Result<()> {
    Ok(worker::join_mpi_and_serve(timeout)?)
}

/// Join the MPI process group of the parent process and serve it
#[cfg(not(feature = "mpi"))]
fn serve_mpi(_timeout: Option<Duration>) -> eyre::Result<()> {
    bail!("MPI workers are only available when built with the mpi feature")
}

/// Save probe data to an HDF5 file
#[cfg(feature = "hdf5")]
fn export_hdf5(archive: &ProbeArchive, path: &Path) -> eyre::Result<()> {
    use data::hdf5::{Config, Writer};
    let mut writer = Writer::create(
        Config {
            file_name: path,
            group_name: None,
        },
        archive.dt,
    )?;
    writer.write_archive(archive)?;
    writer.close()?;
    Ok(())
}

/// Save probe data to an HDF5 file
#[cfg(not(feature = "hdf5"))]
fn export_hdf5(_archive: &ProbeArchive, _path: &Path) -> eyre::Result<()> {
    bail!("HDF5 export is only available when built with the hdf5 feature")
}
