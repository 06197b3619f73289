//! Process groups for partitioned simulations
//!
//! A process group is the set of cooperating simulation processes: one master
//! (rank 0) and a number of workers (ranks 1..N). Members exchange messages
//! point-to-point on numbered tags, and take part in collective operations
//! (broadcast from a root, barrier) which all members must call in the same
//! order.
//!
//! Messages between a fixed pair of members on a fixed tag are delivered in
//! send order. No ordering is guaranteed across pairs or tags.
//!
//! The actual byte shuffling is delegated to a [`Transport`].
//! [`local::LocalTransport`] runs every member as a thread of the current
//! process, and [`tcp::TcpTransport`] runs them as separate processes
//! connected by a TCP mesh. With the `mpi` feature, `mpi::MpiTransport` runs
//! them as MPI processes spawned by the master.

pub mod local;
pub mod mailbox;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod tcp;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, process::ExitStatus, sync::Arc, time::Duration};
use thiserror::Error;

/// Position of a member within the process group
pub type Rank = usize;

/// Rank of the master process
pub const MASTER: Rank = 0;

/// Point-to-point message tag
pub type Tag = u32;

/// Logical stream of messages between two members
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Channel {
    /// Point-to-point messages with a user-chosen tag
    Point(Tag),

    /// Internal traffic of collective operations
    Collective,
}

/// Raw message transport between the members of a process group
pub trait Transport: Send + Sync {
    /// Rank of the calling member
    fn rank(&self) -> Rank;

    /// Number of members in the group
    fn size(&self) -> usize;

    /// Send a message, without waiting for it to be received
    fn send_bytes(&self, dst: Rank, channel: Channel, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next message from `src` on `channel`
    ///
    /// Blocks forever if `timeout` is `None`.
    fn recv_bytes(&self, src: Rank, channel: Channel, timeout: Option<Duration>)
        -> Result<Vec<u8>>;

    /// Broadcast `payload` from `root`, overwriting it on other members
    ///
    /// The default implementation sends the payload point-to-point from the
    /// root to every other member.
    fn broadcast_bytes(
        &self,
        root: Rank,
        payload: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.rank() == root {
            for dst in (0..self.size()).filter(|&dst| dst != root) {
                self.send_bytes(dst, Channel::Collective, payload.clone())?;
            }
        } else {
            *payload = self.recv_bytes(root, Channel::Collective, timeout)?;
        }
        Ok(())
    }

    /// Wait until every member has entered the barrier
    ///
    /// The default implementation gathers empty messages on the master, then
    /// releases everyone.
    fn barrier(&self, timeout: Option<Duration>) -> Result<()> {
        if self.rank() == MASTER {
            for src in 1..self.size() {
                self.recv_bytes(src, Channel::Collective, timeout)?;
            }
            for dst in 1..self.size() {
                self.send_bytes(dst, Channel::Collective, Vec::new())?;
            }
        } else {
            self.send_bytes(MASTER, Channel::Collective, Vec::new())?;
            self.recv_bytes(MASTER, Channel::Collective, timeout)?;
        }
        Ok(())
    }

    /// Tear down the connections to other members
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle to a process group, as seen from one of its members
///
/// Handles are cheap to clone, and all clones refer to the same membership.
#[derive(Clone)]
pub struct ProcessGroup {
    /// Underlying transport
    transport: Arc<dyn Transport>,

    /// Bound on every blocking wait, if any
    timeout: Option<Duration>,
}
//
impl ProcessGroup {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    /// Set up an in-process group of `size` members
    ///
    /// Member `i` of the output has rank `i`.
    pub fn local(size: usize) -> Vec<Self> {
        local::LocalTransport::group(size)
            .into_iter()
            .map(|transport| Self::new(Arc::new(transport)))
            .collect()
    }

    /// Bound every blocking wait of this handle
    ///
    /// Without a timeout, a stalled or crashed peer blocks its partners
    /// forever. With one, such stalls surface as [`CommError::Timeout`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rank of the calling member
    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    /// Number of members in the group
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Send a value to another member
    pub fn send<T: Serialize + ?Sized>(&self, dst: Rank, tag: Tag, value: &T) -> Result<()> {
        self.check_rank(dst)?;
        self.transport
            .send_bytes(dst, Channel::Point(tag), bincode::serialize(value)?)
    }

    /// Wait for the next value sent by `src` on `tag`
    pub fn recv<T: DeserializeOwned>(&self, src: Rank, tag: Tag) -> Result<T> {
        self.check_rank(src)?;
        let bytes = self
            .transport
            .recv_bytes(src, Channel::Point(tag), self.timeout)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Broadcast `value` from `root` to every member
    ///
    /// On the root, `value` is sent to everyone else. On other members, it is
    /// overwritten with the root's value.
    pub fn broadcast<T>(&self, root: Rank, value: &mut T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        self.check_rank(root)?;
        let mut bytes = if self.rank() == root {
            bincode::serialize(value)?
        } else {
            Vec::new()
        };
        self.transport
            .broadcast_bytes(root, &mut bytes, self.timeout)?;
        if self.rank() != root {
            *value = bincode::deserialize(&bytes)?;
        }
        Ok(())
    }

    /// Wait until every member has entered the barrier
    pub fn barrier(&self) -> Result<()> {
        self.transport.barrier(self.timeout)
    }

    /// Tear down this member's connections
    pub fn shutdown(&self) -> Result<()> {
        self.transport.shutdown()
    }

    /// Check that a rank designates a member of the group
    fn check_rank(&self, rank: Rank) -> Result<()> {
        let size = self.size();
        if rank < size {
            Ok(())
        } else {
            Err(CommError::InvalidRank { rank, size })
        }
    }
}
//
impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Things that can go wrong while communicating
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} is outside of the {size}-member process group")]
    InvalidRank { rank: Rank, size: usize },

    #[error("failed to encode or decode a message")]
    Encoding(#[from] bincode::Error),

    #[error("network I/O failed")]
    Io(#[from] std::io::Error),

    #[error("member {peer} disconnected")]
    Disconnected { peer: Rank },

    #[error("no message from member {peer} on {channel:?} after {timeout:?}")]
    Timeout {
        peer: Rank,
        channel: Channel,
        timeout: Duration,
    },

    #[error("failed to spawn worker process {rank}")]
    Spawn {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process {rank} exited before joining the group ({status})")]
    Exited { rank: Rank, status: ExitStatus },

    #[error("only {connected} of {expected} members connected within {timeout:?}")]
    SetupTimeout {
        connected: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("tag {0} is outside of the range supported by the transport")]
    TagOutOfRange(Tag),

    #[error("process group setup failed ({0})")]
    Handshake(String),
}
//
/// Result type associated with communication issues
pub type Result<T> = std::result::Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_is_fifo_per_tag() -> Result<()> {
        let [a, b]: [ProcessGroup; 2] = ProcessGroup::local(2).try_into().unwrap();
        a.send(1, 7, &1u32)?;
        a.send(1, 8, &100u32)?;
        a.send(1, 7, &2u32)?;
        assert_eq!(b.recv::<u32>(0, 8)?, 100);
        assert_eq!(b.recv::<u32>(0, 7)?, 1);
        assert_eq!(b.recv::<u32>(0, 7)?, 2);
        Ok(())
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let group = ProcessGroup::local(2).remove(0);
        assert!(matches!(
            group.send(2, 0, &0u8),
            Err(CommError::InvalidRank { rank: 2, size: 2 })
        ));
    }

    #[test]
    fn broadcast_reaches_every_member() {
        let results = thread::scope(|s| {
            let handles = ProcessGroup::local(4)
                .into_iter()
                .map(|group| {
                    s.spawn(move || {
                        let mut value = if group.rank() == MASTER { 42u64 } else { 0 };
                        group.broadcast(MASTER, &mut value).map(|()| value)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(results, vec![42; 4]);
    }

    #[test]
    fn barrier_waits_for_everyone() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let arrived = AtomicUsize::new(0);
        thread::scope(|s| {
            for group in ProcessGroup::local(3) {
                let arrived = &arrived;
                s.spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    group.barrier().unwrap();
                    assert_eq!(arrived.load(Ordering::SeqCst), 3);
                });
            }
        });
    }

    #[test]
    fn timeout_bounds_receive() {
        let group = ProcessGroup::local(2)
            .remove(1)
            .with_timeout(Some(Duration::from_millis(20)));
        assert!(matches!(
            group.recv::<u8>(MASTER, 0),
            Err(CommError::Timeout { peer: MASTER, .. })
        ));
    }
}
