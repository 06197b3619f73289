//! Per-member queue of incoming messages, sorted by sender and channel

use crate::{Channel, CommError, Rank, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

/// How often blocked receivers check whether their peer went away
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Incoming message queues of one group member
///
/// Each (sender, channel) pair gets its own FIFO queue, created on first use
/// by either side. Messages can thus be awaited in any order across senders
/// and channels, while staying ordered within one of them.
#[derive(Debug, Default)]
pub struct Mailbox {
    /// Message queues, keyed by sender and channel
    queues: Mutex<HashMap<(Rank, Channel), (Sender<Vec<u8>>, Receiver<Vec<u8>>)>>,

    /// Senders which will not deliver any further message
    closed: Mutex<HashSet<Rank>>,
}
//
impl Mailbox {
    /// Enqueue a message from `src`
    pub fn deliver(&self, src: Rank, channel: Channel, payload: Vec<u8>) {
        let (sender, _) = self.queue(src, channel);
        // Cannot fail as long as the queue map holds the matching receiver
        let _ = sender.send(payload);
    }

    /// Record that `src` will not deliver any further message
    ///
    /// Messages delivered before this call can still be received.
    pub fn close(&self, src: Rank) {
        self.closed.lock().insert(src);
    }

    /// Wait for the next message from `src` on `channel`
    pub fn take(&self, src: Rank, channel: Channel, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let (_, receiver) = self.queue(src, channel);
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        loop {
            let wait = deadline.map_or(POLL_INTERVAL, |(deadline, _)| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_INTERVAL)
            });
            match receiver.recv_timeout(wait) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer: src })
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.closed.lock().contains(&src) && receiver.is_empty() {
                        return Err(CommError::Disconnected { peer: src });
                    }
                    if let Some((deadline, timeout)) = deadline {
                        if Instant::now() >= deadline {
                            return Err(CommError::Timeout {
                                peer: src,
                                channel,
                                timeout,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Access the queue associated with a sender and channel
    fn queue(&self, src: Rank, channel: Channel) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        self.queues
            .lock()
            .entry((src, channel))
            .or_insert_with(crossbeam_channel::unbounded)
            .clone()
    }
}
