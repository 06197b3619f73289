//! Signal exchange between chunks
//!
//! A signal computed in one chunk and needed by another is carried by a pair
//! of operators: an [`MpiSend`] in the producing chunk and an [`MpiReceive`]
//! in the consuming chunk, agreeing on a tag. Both operators are created
//! during the build phase, before the process group exists, and only get
//! bound to it once the build phase is over.
//!
//! Sends are buffered, so a send never waits for the matching receive. A
//! receive blocks until the matching send has happened.

use crate::{
    signals::{SignalRef, SignalTable},
    BuildError, BuildResult, StepError, StepResult,
};
use comm::{ProcessGroup, Rank, Tag};
use data::{Matrix, SignalKey};
use std::fmt;

/// Connection state shared by both exchange operators
#[derive(Debug)]
struct Endpoint {
    /// Member on the other end of the exchange
    peer: Rank,

    /// Message tag
    tag: Tag,

    /// Exchanged signal
    signal: SignalRef,

    /// Process group, once bound
    group: Option<ProcessGroup>,
}
//
impl Endpoint {
    fn new(signals: &SignalTable, peer: Rank, tag: Tag, signal: SignalKey) -> BuildResult<Self> {
        Ok(Self {
            peer,
            tag,
            signal: signals.resolve(signal)?,
            group: None,
        })
    }

    fn bind(&mut self, op: &'static str, group: &ProcessGroup) -> BuildResult<()> {
        let size = group.size();
        if self.peer >= size || self.peer == group.rank() {
            return Err(BuildError::InvalidPeer {
                op,
                peer: self.peer,
                size,
            });
        }
        self.group = Some(group.clone());
        Ok(())
    }

    fn group(&self, op: &'static str) -> StepResult<&ProcessGroup> {
        self.group
            .as_ref()
            .ok_or(StepError::Unbound { op, tag: self.tag })
    }

    fn exchange_error(&self, op: &'static str) -> impl FnOnce(comm::CommError) -> StepError {
        let (key, peer, tag) = (self.signal.key(), self.peer, self.tag);
        move |source| StepError::Exchange {
            op,
            key,
            peer,
            tag,
            source,
        }
    }
}

/// Send the value of a signal to another member
#[derive(Debug)]
pub struct MpiSend(Endpoint);
//
impl MpiSend {
    const NAME: &'static str = "MPISend";

    pub(crate) fn new(
        signals: &SignalTable,
        dst: Rank,
        tag: Tag,
        signal: SignalKey,
    ) -> BuildResult<Self> {
        Endpoint::new(signals, dst, tag, signal).map(Self)
    }

    /// Attach the process group that values will be sent through
    pub fn bind(&mut self, group: &ProcessGroup) -> BuildResult<()> {
        self.0.bind(Self::NAME, group)
    }

    /// Truth that this operator is attached to a process group
    pub fn is_bound(&self) -> bool {
        self.0.group.is_some()
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) -> StepResult<()> {
        let endpoint = &self.0;
        endpoint
            .group(Self::NAME)?
            .send(endpoint.peer, endpoint.tag, &*signals.read(endpoint.signal))
            .map_err(endpoint.exchange_error(Self::NAME))
    }
}
//
impl fmt::Display for MpiSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MPISend(dst={}, tag={}, signal={})",
            self.0.peer, self.0.tag, self.0.signal
        )
    }
}

/// Overwrite a signal with a value received from another member
#[derive(Debug)]
pub struct MpiReceive(Endpoint);
//
impl MpiReceive {
    const NAME: &'static str = "MPIReceive";

    pub(crate) fn new(
        signals: &SignalTable,
        src: Rank,
        tag: Tag,
        signal: SignalKey,
    ) -> BuildResult<Self> {
        Endpoint::new(signals, src, tag, signal).map(Self)
    }

    /// Attach the process group that values will be received from
    pub fn bind(&mut self, group: &ProcessGroup) -> BuildResult<()> {
        self.0.bind(Self::NAME, group)
    }

    /// Truth that this operator is attached to a process group
    pub fn is_bound(&self) -> bool {
        self.0.group.is_some()
    }

    pub(crate) fn invoke(&self, signals: &SignalTable) -> StepResult<()> {
        let endpoint = &self.0;
        let value: Matrix = endpoint
            .group(Self::NAME)?
            .recv(endpoint.peer, endpoint.tag)
            .map_err(endpoint.exchange_error(Self::NAME))?;
        let mut dst = signals.write(endpoint.signal);
        let (expected, found) = (data::shape(&dst), data::shape(&value));
        if expected != found {
            return Err(StepError::ReceivedShape {
                key: endpoint.signal.key(),
                expected,
                found,
            });
        }
        dst.assign(&value);
        Ok(())
    }
}
//
impl fmt::Display for MpiReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MPIReceive(src={}, tag={}, signal={})",
            self.0.peer, self.0.tag, self.0.signal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::column;

    fn table(value: Matrix) -> SignalTable {
        let mut signals = SignalTable::default();
        signals.insert(1, "x", value).unwrap();
        signals
    }

    #[test]
    fn unbound_exchange_fails() {
        let signals = table(column(&[1.0]));
        let send = MpiSend::new(&signals, 1, 5, 1).unwrap();
        assert!(!send.is_bound());
        assert!(matches!(
            send.invoke(&signals),
            Err(StepError::Unbound {
                op: "MPISend",
                tag: 5
            })
        ));
    }

    #[test]
    fn binding_checks_peer() {
        let signals = table(column(&[1.0]));
        let group = ProcessGroup::local(2).remove(0);
        let mut to_self = MpiSend::new(&signals, 0, 5, 1).unwrap();
        assert!(matches!(
            to_self.bind(&group),
            Err(BuildError::InvalidPeer { peer: 0, .. })
        ));
        let mut to_nobody = MpiReceive::new(&signals, 2, 5, 1).unwrap();
        assert!(matches!(
            to_nobody.bind(&group),
            Err(BuildError::InvalidPeer { peer: 2, .. })
        ));
    }

    #[test]
    fn send_then_receive() {
        let [a, b]: [ProcessGroup; 2] = ProcessGroup::local(2).try_into().unwrap();
        let src_signals = table(column(&[1.0, 2.0]));
        let dst_signals = table(column(&[0.0, 0.0]));
        let mut send = MpiSend::new(&src_signals, 1, 3, 1).unwrap();
        let mut recv = MpiReceive::new(&dst_signals, 0, 3, 1).unwrap();
        send.bind(&a).unwrap();
        recv.bind(&b).unwrap();
        send.invoke(&src_signals).unwrap();
        recv.invoke(&dst_signals).unwrap();
        assert_eq!(*dst_signals.get(1).unwrap(), column(&[1.0, 2.0]));
    }

    #[test]
    fn received_shape_is_checked() {
        let [a, b]: [ProcessGroup; 2] = ProcessGroup::local(2).try_into().unwrap();
        let src_signals = table(column(&[1.0, 2.0, 3.0]));
        let dst_signals = table(column(&[0.0, 0.0]));
        let mut send = MpiSend::new(&src_signals, 1, 3, 1).unwrap();
        let mut recv = MpiReceive::new(&dst_signals, 0, 3, 1).unwrap();
        send.bind(&a).unwrap();
        recv.bind(&b).unwrap();
        send.invoke(&src_signals).unwrap();
        assert!(matches!(
            recv.invoke(&dst_signals),
            Err(StepError::ReceivedShape {
                expected: [2, 1],
                found: [3, 1],
                ..
            })
        ));
    }
}
