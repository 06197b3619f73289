//! Multi-process transport over MPI
//!
//! The master starts as a single MPI process (either on its own or through
//! `mpiexec -n 1`) and spawns its workers with `MPI_Comm_spawn`. Both sides
//! then merge the resulting intercommunicator into one communicator, in which
//! the master has rank 0 and the workers follow in spawn order.
//!
//! Point-to-point messages travel as byte vectors tagged after their channel,
//! and use standard-mode sends, which may wait for the matching receive.
//! Broadcasts and barriers map to the MPI collectives. These are not bounded
//! by the group's timeout, only receives are.

use crate::{Channel, CommError, Rank, Result, Tag, Transport};
use ::mpi::{
    environment::Universe,
    topology::{MergeOrder, SimpleCommunicator},
    traits::*,
    Threading,
};
use log::{debug, info};
use parking_lot::Mutex;
use std::{
    ffi::OsString,
    fmt,
    path::Path,
    process::Command,
    thread,
    time::{Duration, Instant},
};

/// How often a receive with a timeout checks for an incoming message
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// MPI tag of the collective channel
///
/// Point-to-point tags are shifted by one to leave room for it.
const COLLECTIVE_TAG: ::mpi::Tag = 0;

/// Transport between MPI processes
pub struct MpiTransport {
    /// Communicator spanning the master and all workers
    ///
    /// Declared before `_universe`, so that it is freed before MPI shuts down.
    group: Mutex<SimpleCommunicator>,

    /// Rank of this member within `group`
    rank: Rank,

    /// Number of members in `group`
    size: usize,

    /// MPI environment, finalized on drop
    _universe: Universe,
}
//
// SAFETY: MPI is initialized with at least `Threading::Serialized`, and every
//         MPI call made through this transport holds the `group` lock. The
//         transport is dropped, and MPI thus finalized, by the main thread of
//         both the master and the worker binaries.
unsafe impl Send for MpiTransport {}
unsafe impl Sync for MpiTransport {}
//
impl MpiTransport {
    /// Spawn `num_workers` MPI worker processes and set up a group with them
    ///
    /// Each worker is started as `program args..`, and is expected to call
    /// [`join()`](Self::join). The master gets rank 0.
    pub fn spawn(program: &Path, args: &[OsString], num_workers: usize) -> Result<Self> {
        let universe = initialize()?;
        let world = universe.world();
        if world.size() != 1 {
            return Err(CommError::Handshake(format!(
                "the master must run as a single MPI process, not {}",
                world.size()
            )));
        }
        let max_procs = ::mpi::Rank::try_from(num_workers).map_err(|_| {
            CommError::Handshake(format!("cannot spawn {num_workers} MPI processes"))
        })?;
        let mut command = Command::new(program);
        command.args(args);
        info!(
            "Master spawning {num_workers} MPI workers from {}",
            program.display()
        );
        let workers = world
            .process_at_rank(0)
            .spawn(&command, max_procs)
            .map_err(|e| CommError::Handshake(format!("MPI worker spawn failed: {e:?}")))?;
        let group = workers.merge(MergeOrder::Low);
        let transport = Self::new(universe, group);
        info!("All {num_workers} MPI workers joined the process group");
        Ok(transport)
    }

    /// Join the group of the master that spawned this process
    pub fn join() -> Result<Self> {
        let universe = initialize()?;
        let master = universe.world().parent().ok_or_else(|| {
            CommError::Handshake("this process was not spawned by an MPI master".into())
        })?;
        let group = master.merge(MergeOrder::High);
        let transport = Self::new(universe, group);
        debug!(
            "Worker {} joined the {}-member MPI process group",
            transport.rank, transport.size
        );
        Ok(transport)
    }

    /// Wrap a merged communicator
    fn new(universe: Universe, group: SimpleCommunicator) -> Self {
        Self {
            rank: group.rank() as Rank,
            size: group.size() as usize,
            group: Mutex::new(group),
            _universe: universe,
        }
    }

    /// Check a member's rank and translate it to MPI's representation
    fn mpi_rank(&self, rank: Rank) -> Result<::mpi::Rank> {
        if rank < self.size {
            ::mpi::Rank::try_from(rank).map_err(|_| CommError::InvalidRank {
                rank,
                size: self.size,
            })
        } else {
            Err(CommError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }
}
//
impl Transport for MpiTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_bytes(&self, dst: Rank, channel: Channel, payload: Vec<u8>) -> Result<()> {
        let tag = mpi_tag(channel)?;
        let dst = self.mpi_rank(dst)?;
        self.group
            .lock()
            .process_at_rank(dst)
            .send_with_tag(&payload[..], tag);
        Ok(())
    }

    fn recv_bytes(
        &self,
        src: Rank,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let tag = mpi_tag(channel)?;
        let mpi_src = self.mpi_rank(src)?;
        let Some(timeout) = timeout else {
            let (payload, _status) = self
                .group
                .lock()
                .process_at_rank(mpi_src)
                .receive_vec_with_tag::<u8>(tag);
            return Ok(payload);
        };
        let deadline = Instant::now() + timeout;
        loop {
            {
                let group = self.group.lock();
                let source = group.process_at_rank(mpi_src);
                if let Some((message, _status)) = source.immediate_matched_probe_with_tag(tag) {
                    let (payload, _status) = message.matched_receive_vec::<u8>();
                    return Ok(payload);
                }
            }
            if Instant::now() >= deadline {
                return Err(CommError::Timeout {
                    peer: src,
                    channel,
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn broadcast_bytes(
        &self,
        root: Rank,
        payload: &mut Vec<u8>,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        let root = self.mpi_rank(root)?;
        let group = self.group.lock();
        let root = group.process_at_rank(root);
        let mut len = payload.len() as u64;
        root.broadcast_into(&mut len);
        let len = usize::try_from(len).map_err(|_| {
            CommError::Handshake(format!("cannot receive a {len}-byte broadcast"))
        })?;
        payload.resize(len, 0);
        root.broadcast_into(&mut payload[..]);
        Ok(())
    }

    fn barrier(&self, _timeout: Option<Duration>) -> Result<()> {
        self.group.lock().barrier();
        Ok(())
    }
}
//
impl fmt::Debug for MpiTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiTransport")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Set up the MPI environment of this process
fn initialize() -> Result<Universe> {
    let (universe, threading) = ::mpi::initialize_with_threading(Threading::Serialized)
        .ok_or_else(|| CommError::Handshake("MPI was already initialized".into()))?;
    if matches!(threading, Threading::Single | Threading::Funneled) {
        return Err(CommError::Handshake(format!(
            "the MPI implementation only supports {threading:?} threading"
        )));
    }
    Ok(universe)
}

/// MPI tag of a channel
fn mpi_tag(channel: Channel) -> Result<::mpi::Tag> {
    match channel {
        Channel::Collective => Ok(COLLECTIVE_TAG),
        Channel::Point(tag) => point_tag(tag),
    }
}

/// MPI tag of a point-to-point channel
fn point_tag(tag: Tag) -> Result<::mpi::Tag> {
    tag.checked_add(1)
        .and_then(|shifted| ::mpi::Tag::try_from(shifted).ok())
        .ok_or(CommError::TagOutOfRange(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_tags_leave_room_for_collectives() {
        assert_eq!(mpi_tag(Channel::Collective).unwrap(), COLLECTIVE_TAG);
        assert_eq!(mpi_tag(Channel::Point(0)).unwrap(), 1);
        assert_eq!(mpi_tag(Channel::Point(41)).unwrap(), 42);
        assert!(matches!(
            mpi_tag(Channel::Point(Tag::MAX)),
            Err(CommError::TagOutOfRange(Tag::MAX))
        ));
    }
}
