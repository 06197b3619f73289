//! Worker side of the control protocol

use crate::Result;
use comm::{
    tcp::{TcpTransport, WorkerEndpoint},
    ProcessGroup, MASTER,
};
use compute::Chunk;
use data::{
    command::{BuildCommand, Directive, BUILD_TAG, GATHER_TAG},
    Precision,
};
use log::{debug, error, info};
use std::{net::IpAddr, sync::Arc, time::Duration};

/// Join a TCP process group as a spawned worker process, then serve it
pub fn join_and_serve(
    endpoint: WorkerEndpoint,
    bind_host: IpAddr,
    timeout: Option<Duration>,
) -> Result<()> {
    let transport = TcpTransport::join(endpoint, bind_host, timeout)?;
    serve(ProcessGroup::new(Arc::new(transport)).with_timeout(timeout))
}

/// Join the MPI process group of the master that spawned this process, then
/// serve it
#[cfg(feature = "mpi")]
pub fn join_mpi_and_serve(timeout: Option<Duration>) -> Result<()> {
    let transport = comm::mpi::MpiTransport::join()?;
    serve(ProcessGroup::new(Arc::new(transport)).with_timeout(timeout))
}

/// Build this worker's chunk as instructed by the master, then run it
///
/// Returns once the master has finished the simulation. On failure, this
/// worker's connections are torn down so that the master does not wait for
/// it forever.
pub fn serve(group: ProcessGroup) -> Result<()> {
    let outcome = build(&group).and_then(|mut chunk| step_loop(&group, &mut chunk));
    if let Err(e) = &outcome {
        error!("Worker {} failed: {e}", group.rank());
    }
    let shutdown = group.shutdown();
    outcome?;
    shutdown?;
    Ok(())
}

/// Receive and apply build commands until the master says stop
fn build(group: &ProcessGroup) -> Result<Chunk> {
    let rank = group.rank();
    let label: String = group.recv(MASTER, BUILD_TAG)?;
    let dt: Precision = group.recv(MASTER, BUILD_TAG)?;
    let mut chunk = Chunk::new(label, dt);
    info!("Worker {rank} building {:?} with dt={dt}", chunk.label());
    loop {
        let command: BuildCommand = group.recv(MASTER, BUILD_TAG)?;
        debug!("Worker {rank} received {command}");
        if command == BuildCommand::Stop {
            break;
        }
        chunk.apply(command)?;
    }
    chunk.bind_group(group)?;
    info!(
        "Worker {rank} finished building {:?}: {} signals, {} operators, {} probes",
        chunk.label(),
        chunk.signals().len(),
        chunk.operators().len(),
        chunk.num_probes()
    );
    Ok(chunk)
}

/// Follow the master's directives until told to finish
fn step_loop(group: &ProcessGroup, chunk: &mut Chunk) -> Result<()> {
    let rank = group.rank();
    loop {
        let mut directive = Directive::Finish;
        group.broadcast(MASTER, &mut directive)?;
        debug!("Worker {rank} received directive {directive:?}");
        match directive {
            Directive::Run(num_steps) => {
                chunk.run_n_steps(num_steps)?;
                group.barrier()?;
            }
            Directive::Gather => {
                for (key, history) in chunk.probe_data() {
                    group.send(MASTER, GATHER_TAG, &(key, history))?;
                }
                group.barrier()?;
            }
            Directive::Finish => {
                info!("Worker {rank} done after {} steps", chunk.time_step());
                return Ok(());
            }
        }
    }
}

