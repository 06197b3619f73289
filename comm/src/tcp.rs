//! Multi-process transport over a full TCP mesh
//!
//! Group setup goes as follows:
//!
//! 1. The master binds a listener, then spawns the worker processes, telling
//!    each of them its rank, the group size and the master's address.
//! 2. Each worker binds its own listener, connects to the master and
//!    introduces itself with its rank and listening address.
//! 3. Once every worker has checked in, the master sends everyone the
//!    directory of listening addresses.
//! 4. Each worker connects to all workers of lower rank, and accepts
//!    connections from all workers of higher rank.
//!
//! After that, every pair of members shares one TCP stream, with one reader
//! thread per stream feeding the local [`Mailbox`].

use crate::{mailbox::Mailbox, Channel, CommError, Rank, Result, Transport, MASTER};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io::{BufReader, BufWriter, ErrorKind, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream},
    path::Path,
    process::{Child, Command},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How often a listener waiting for members checks for setup failures
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Coordinates that a spawned worker needs in order to join the group
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkerEndpoint {
    /// Listening address of the master
    pub master_addr: SocketAddr,

    /// Rank of the worker
    pub rank: Rank,

    /// Number of members in the group, master included
    pub size: usize,
}
//
impl WorkerEndpoint {
    /// Command-line arguments passing this endpoint to a worker process
    ///
    /// These are appended after the launcher's own arguments.
    pub fn to_args(&self) -> [OsString; 6] {
        [
            "--master-addr".into(),
            self.master_addr.to_string().into(),
            "--rank".into(),
            self.rank.to_string().into(),
            "--size".into(),
            self.size.to_string().into(),
        ]
    }
}

/// Handshake messages exchanged while setting up the mesh
#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    /// A worker introduces itself to the master
    Hello { rank: Rank, address: SocketAddr },

    /// The master tells workers where everyone listens
    Directory(Vec<SocketAddr>),

    /// A worker introduces itself to a worker of lower rank
    Peer { rank: Rank },
}

/// Message frame on an established stream
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    channel: Channel,
    payload: Vec<u8>,
}

/// Connection to one other member
#[derive(Debug)]
struct Link {
    /// Buffered write half
    writer: Mutex<BufWriter<TcpStream>>,

    /// Handle used to shut the stream down
    stream: TcpStream,
}

/// Transport between processes, over TCP
#[derive(Debug)]
pub struct TcpTransport {
    /// Rank of this member
    rank: Rank,

    /// Connections to other members, indexed by rank
    links: Vec<Option<Link>>,

    /// Incoming messages
    mailbox: Arc<Mailbox>,

    /// Threads moving messages from the streams to the mailbox
    readers: Mutex<Vec<JoinHandle<()>>>,
}
//
impl TcpTransport {
    /// Spawn `num_workers` worker processes and set up a group with them
    ///
    /// Each worker is started as `program args.. <endpoint args>`, see
    /// [`WorkerEndpoint::to_args()`]. The master gets rank 0. Setup fails if
    /// a worker exits before joining, or if not every worker has joined
    /// within `timeout`.
    pub fn spawn(
        program: &Path,
        args: &[OsString],
        num_workers: usize,
        bind_host: IpAddr,
        timeout: Option<Duration>,
    ) -> Result<(Self, Vec<Child>)> {
        let listener = TcpListener::bind((bind_host, 0))?;
        let master_addr = listener.local_addr()?;
        info!(
            "Master spawning {num_workers} workers from {}, listening on {master_addr}",
            program.display()
        );

        let mut children = Vec::with_capacity(num_workers);
        for rank in 1..=num_workers {
            let endpoint = WorkerEndpoint {
                master_addr,
                rank,
                size: num_workers + 1,
            };
            let spawned = Command::new(program)
                .args(args)
                .args(endpoint.to_args())
                .spawn();
            match spawned {
                Ok(child) => children.push(child),
                Err(source) => {
                    kill_all(&mut children);
                    return Err(CommError::Spawn { rank, source });
                }
            }
        }

        match Self::accept_workers(listener, num_workers, timeout, &mut children) {
            Ok(transport) => Ok((transport, children)),
            Err(e) => {
                kill_all(&mut children);
                Err(e)
            }
        }
    }

    /// Accept `num_workers` workers on `listener` and become the group master
    ///
    /// Fails if not every worker has joined within `timeout`.
    pub fn host(
        listener: TcpListener,
        num_workers: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::accept_workers(listener, num_workers, timeout, &mut [])
    }

    /// Implementation of [`host()`](Self::host), watching over the worker
    /// processes that are expected to join
    fn accept_workers(
        listener: TcpListener,
        num_workers: usize,
        timeout: Option<Duration>,
        children: &mut [Child],
    ) -> Result<Self> {
        let size = num_workers + 1;
        let mut directory = vec![listener.local_addr()?; size];
        let mut streams = Vec::with_capacity(num_workers);
        let mut acceptor = Acceptor::new(listener, num_workers, timeout)?;
        while streams.len() < num_workers {
            let (mut stream, peer_addr) = acceptor.accept(streams.len(), || {
                for (rank, child) in (1..).zip(children.iter_mut()) {
                    if let Some(status) = child.try_wait()? {
                        return Err(CommError::Exited { rank, status });
                    }
                }
                Ok(())
            })?;
            match bincode::deserialize_from(&mut stream)? {
                Handshake::Hello { rank, address }
                    if (1..size).contains(&rank)
                        && streams.iter().all(|(other, _)| *other != rank) =>
                {
                    debug!("Worker {rank} checked in from {peer_addr}, listening on {address}");
                    directory[rank] = address;
                    streams.push((rank, stream));
                }
                other => {
                    return Err(CommError::Handshake(format!(
                        "unexpected introduction {other:?} from {peer_addr}"
                    )))
                }
            }
        }
        for (_, stream) in &mut streams {
            bincode::serialize_into(&mut *stream, &Handshake::Directory(directory.clone()))?;
        }
        info!("All {num_workers} workers joined the process group");
        Self::from_streams(MASTER, size, streams)
    }

    /// Join the group hosted by the master described in `endpoint`
    ///
    /// This worker's listener is bound on `bind_host`. Fails if the group
    /// is not fully connected within `timeout`.
    pub fn join(
        endpoint: WorkerEndpoint,
        bind_host: IpAddr,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let WorkerEndpoint {
            master_addr,
            rank,
            size,
        } = endpoint;
        if rank == MASTER || rank >= size {
            return Err(CommError::InvalidRank { rank, size });
        }
        let listener = TcpListener::bind((bind_host, 0))?;
        let address = listener.local_addr()?;
        let mut acceptor = Acceptor::new(listener, size - 1, timeout)?;

        let mut master = connect(master_addr, timeout)?;
        bincode::serialize_into(&mut master, &Handshake::Hello { rank, address })?;
        let directory = match bincode::deserialize_from(&mut master)? {
            Handshake::Directory(directory) if directory.len() == size => directory,
            other => {
                return Err(CommError::Handshake(format!(
                    "expected a {size}-member directory from the master, got {other:?}"
                )))
            }
        };

        let mut streams = Vec::with_capacity(size - 1);
        streams.push((MASTER, master));
        for (peer, &peer_addr) in directory.iter().enumerate().take(rank).skip(1) {
            let mut stream = connect(peer_addr, timeout)?;
            bincode::serialize_into(&mut stream, &Handshake::Peer { rank })?;
            streams.push((peer, stream));
        }
        while streams.len() < size - 1 {
            let (mut stream, peer_addr) = acceptor.accept(streams.len(), || Ok(()))?;
            match bincode::deserialize_from(&mut stream)? {
                Handshake::Peer { rank: peer }
                    if peer > rank
                        && peer < size
                        && streams.iter().all(|(other, _)| *other != peer) =>
                {
                    streams.push((peer, stream));
                }
                other => {
                    return Err(CommError::Handshake(format!(
                        "unexpected introduction {other:?} from {peer_addr}"
                    )))
                }
            }
        }
        debug!("Worker {rank} connected to all {} other members", size - 1);
        Self::from_streams(rank, size, streams)
    }

    /// Start serving established streams
    fn from_streams(rank: Rank, size: usize, streams: Vec<(Rank, TcpStream)>) -> Result<Self> {
        let mailbox = Arc::new(Mailbox::default());
        let mut links = (0..size).map(|_| None).collect::<Vec<_>>();
        let mut readers = Vec::with_capacity(streams.len());
        for (peer, stream) in streams {
            stream.set_read_timeout(None)?;
            stream.set_nodelay(true)?;
            let read_half = stream.try_clone()?;
            let mailbox = mailbox.clone();
            readers.push(
                thread::Builder::new()
                    .name(format!("comm-{rank}-from-{peer}"))
                    .spawn(move || receive_loop(peer, read_half, &mailbox))?,
            );
            links[peer] = Some(Link {
                writer: Mutex::new(BufWriter::new(stream.try_clone()?)),
                stream,
            });
        }
        Ok(Self {
            rank,
            links,
            mailbox,
            readers: Mutex::new(readers),
        })
    }
}
//
impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.links.len()
    }

    fn send_bytes(&self, dst: Rank, channel: Channel, payload: Vec<u8>) -> Result<()> {
        if dst == self.rank {
            self.mailbox.deliver(dst, channel, payload);
            return Ok(());
        }
        let link = self
            .links
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or(CommError::InvalidRank {
                rank: dst,
                size: self.size(),
            })?;
        let mut writer = link.writer.lock();
        bincode::serialize_into(&mut *writer, &Frame { channel, payload })?;
        writer.flush()?;
        Ok(())
    }

    fn recv_bytes(
        &self,
        src: Rank,
        channel: Channel,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.mailbox.take(src, channel, timeout)
    }

    fn shutdown(&self) -> Result<()> {
        for link in self.links.iter().flatten() {
            link.writer.lock().flush()?;
            match link.stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != ErrorKind::NotConnected => return Err(e.into()),
                _ => {}
            }
        }
        for reader in self.readers.lock().drain(..) {
            if reader.join().is_err() {
                warn!("A message reader thread panicked");
            }
        }
        Ok(())
    }
}

/// Listener that waits for incoming members until a common deadline
struct Acceptor {
    /// Nonblocking listener
    listener: TcpListener,

    /// Number of connections that should be accepted in total
    expected: usize,

    /// Setup deadline, along with the timeout it was derived from
    deadline: Option<(Instant, Duration)>,
}
//
impl Acceptor {
    /// Start watching a listener
    fn new(listener: TcpListener, expected: usize, timeout: Option<Duration>) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            expected,
            deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
        })
    }

    /// Wait for the next incoming connection
    ///
    /// `connected` is the number of connections established so far, and
    /// `check` is run between polls to detect members that will never connect.
    fn accept(
        &mut self,
        connected: usize,
        mut check: impl FnMut() -> Result<()>,
    ) -> Result<(TcpStream, SocketAddr)> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(self.deadline.map(|(_, timeout)| timeout))?;
                    return Ok((stream, peer_addr));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    check()?;
                    if let Some((deadline, timeout)) = self.deadline {
                        if Instant::now() >= deadline {
                            return Err(CommError::SetupTimeout {
                                connected,
                                expected: self.expected,
                                timeout,
                            });
                        }
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Connect to another member, waiting at most `timeout` for the connection
/// and for each of the following handshake messages
fn connect(address: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
    let stream = match timeout {
        Some(timeout) => TcpStream::connect_timeout(&address, timeout)?,
        None => TcpStream::connect(address)?,
    };
    stream.set_read_timeout(timeout)?;
    Ok(stream)
}

/// Move messages from a peer's stream into the mailbox until it closes
fn receive_loop(peer: Rank, stream: TcpStream, mailbox: &Mailbox) {
    let mut reader = BufReader::new(stream);
    loop {
        match bincode::deserialize_from::<_, Frame>(&mut reader) {
            Ok(Frame { channel, payload }) => mailbox.deliver(peer, channel, payload),
            Err(e) => {
                match *e {
                    bincode::ErrorKind::Io(ref io) if io.kind() == ErrorKind::UnexpectedEof => {
                        debug!("Member {peer} closed its stream");
                    }
                    _ => debug!("Stopped reading from member {peer}: {e}"),
                }
                break;
            }
        }
    }
    mailbox.close(peer);
}

/// Kill worker processes after a failed group setup
fn kill_all(children: &mut [Child]) {
    for child in children {
        if let Err(e) = child.kill() {
            warn!("Failed to kill worker process {}: {e}", child.id());
        }
        let _ = child.wait();
    }
}
