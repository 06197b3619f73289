//! In-process transport, where every group member is a thread

use crate::{mailbox::Mailbox, Channel, CommError, Rank, Result, Transport};
use std::{sync::Arc, time::Duration};

/// Transport between threads of the current process
#[derive(Clone, Debug)]
pub struct LocalTransport {
    /// Rank of the member owning this end
    rank: Rank,

    /// Mailboxes of all members, indexed by rank
    mailboxes: Arc<[Mailbox]>,
}
//
impl LocalTransport {
    /// Set up the transports of a `size`-member group, ordered by rank
    pub fn group(size: usize) -> Vec<Self> {
        let mailboxes: Arc<[Mailbox]> = (0..size).map(|_| Mailbox::default()).collect();
        (0..size)
            .map(|rank| Self {
                rank,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}
//
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send_bytes(&self, dst: Rank, channel: Channel, payload: Vec<u8>) -> Result<()> {
        let mailbox = self.mailboxes.get(dst).ok_or(CommError::InvalidRank {
            rank: dst,
            size: self.size(),
        })?;
        mailbox.deliver(self.rank, channel, payload);
        Ok(())
    }

    fn recv_bytes(
        &self,
        src: Rank,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.mailboxes[self.rank].take(src, channel, timeout)
    }

    fn shutdown(&self) -> Result<()> {
        for (rank, mailbox) in self.mailboxes.iter().enumerate() {
            if rank != self.rank {
                mailbox.close(self.rank);
            }
        }
        Ok(())
    }
}
