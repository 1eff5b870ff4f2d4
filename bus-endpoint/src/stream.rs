//! Byte streams an endpoint can run over.
//!
//! The endpoint only needs three operations: a read that gives up after a
//! timeout, a write that may be partial, and close. [`TcpBusStream`] adapts a
//! blocking `std::net::TcpStream`; [`LoopbackStream`] is an in-process pair
//! used for process-local links and tests.

use {
    crossbeam_channel::{select_biased, unbounded, Receiver, Sender, TryRecvError},
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        net::{Shutdown, SocketAddr, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

const WRITE_BACKOFF_MIN: Duration = Duration::from_millis(1);
const WRITE_BACKOFF_MAX: Duration = Duration::from_millis(32);

/// Result of a [`Stream::read`] that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the buffer.
    Data(usize),
    /// Nothing arrived before the timeout.
    TimedOut,
    /// The peer closed its side; no more bytes will arrive.
    Closed,
}

/// A bidirectional byte channel.
///
/// Reads and writes may happen concurrently from two threads (the rx and tx
/// pumps), so every method takes `&self`.
pub trait Stream: Send + Sync {
    /// Wait at most `timeout` for data and read some of it into `buf`.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome>;

    /// Write some prefix of `buf`, returning how many bytes were taken.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close both directions.
    fn close(&self) -> io::Result<()>;
}

/// Write all of `buf`, retrying partial writes and transient errors.
///
/// Gives up with `Interrupted` once `exit` is raised so a stopping endpoint
/// is never wedged behind a stalled peer.
pub(crate) fn write_fully(
    stream: &dyn Stream,
    mut buf: &[u8],
    exit: &AtomicBool,
) -> io::Result<()> {
    let mut backoff = WRITE_BACKOFF_MIN;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                ))
            }
            Ok(n) => {
                buf = buf.get(n..).unwrap_or_default();
                backoff = WRITE_BACKOFF_MIN;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if exit.load(Ordering::Relaxed) {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "endpoint stopping",
                    ));
                }
                trace!("transient write error, retrying in {backoff:?}: {e}");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2).min(WRITE_BACKOFF_MAX);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── TCP ─────────────────────────────────────────────────────────────────────

const TCP_WRITE_POLL: Duration = Duration::from_millis(250);

/// [`Stream`] over a connected, blocking TCP socket.
#[derive(Debug)]
pub struct TcpBusStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpBusStream {
    /// Wrap an already-connected socket.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        // Bounded writes let `write_fully` notice the exit flag.
        stream.set_write_timeout(Some(TCP_WRITE_POLL))?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self { stream, peer_addr })
    }

    /// Connect to `addr`, giving up after `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        debug!("connected bus stream to {addr}");
        Self::new(stream)
    }

    /// Address of the remote side.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Stream for TcpBusStream {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        // A zero timeout means "block forever" to the socket API.
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match (&self.stream).read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::TimedOut)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

// ── Loopback ────────────────────────────────────────────────────────────────

/// In-process [`Stream`]; created in connected pairs.
///
/// Each direction is a crossbeam channel of written chunks. Closing either
/// end closes both directions, the same as a socket pair.
#[derive(Debug)]
pub struct LoopbackStream {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    /// Received bytes that did not fit the caller's buffer.
    pending: Mutex<VecDeque<u8>>,
    /// Shared by both ends; dropping the sender closes the pair.
    closer: Arc<Mutex<Option<Sender<()>>>>,
    closed: Receiver<()>,
    write_chunk: usize,
}

impl LoopbackStream {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let (closer, closed) = unbounded();
        let closer = Arc::new(Mutex::new(Some(closer)));
        (
            Self::end(a_rx, a_tx, closer.clone(), closed.clone()),
            Self::end(b_rx, b_tx, closer, closed),
        )
    }

    fn end(
        rx: Receiver<Vec<u8>>,
        tx: Sender<Vec<u8>>,
        closer: Arc<Mutex<Option<Sender<()>>>>,
        closed: Receiver<()>,
    ) -> Self {
        Self {
            rx,
            tx,
            pending: Mutex::new(VecDeque::new()),
            closer,
            closed,
            write_chunk: usize::MAX,
        }
    }

    /// Accept at most `chunk` bytes per `write` call, forcing the caller
    /// through its partial-write path.
    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.write_chunk = chunk.max(1);
        self
    }

    fn is_closed(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl Stream for LoopbackStream {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            // Queued data wins over the close signal.
            let chunk = select_biased! {
                recv(self.rx) -> chunk => chunk.ok(),
                recv(self.closed) -> _ => None,
                default(timeout) => return Ok(ReadOutcome::TimedOut),
            };
            match chunk {
                Some(chunk) => pending.extend(chunk),
                None => return Ok(ReadOutcome::Closed),
            }
        }
        pending.extend(self.rx.try_iter().flatten());
        let n = buf.len().min(pending.len());
        for (dst, src) in buf.iter_mut().zip(pending.drain(..n)) {
            *dst = src;
        }
        Ok(ReadOutcome::Data(n))
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed");
        if self.is_closed() {
            return Err(broken());
        }
        let n = buf.len().min(self.write_chunk);
        if n == 0 {
            return Ok(0);
        }
        let chunk = buf.get(..n).unwrap_or_default().to_vec();
        self.tx.send(chunk).map_err(|_| broken())?;
        Ok(n)
    }

    fn close(&self) -> io::Result<()> {
        drop(self.closer.lock().take());
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
