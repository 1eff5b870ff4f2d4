//! Shared fixtures for the endpoint integration tests.
//!
//! Provides a recording bus, an exit-listener recorder, a stream whose
//! writes can be stalled on demand, and a helper that authenticates a
//! client/server endpoint pair over an in-process loopback link.

#![allow(dead_code)]

use {
    assert_matches::assert_matches,
    parking_lot::{Condvar, Mutex},
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
    trv1_bus_endpoint::{
        BusDispatcher, EndpointConfig, EndpointListener, EndpointState, EstablishOutcome,
        ExitReason, Guid128, LoopbackStream, Message, ReadOutcome, RemoteEndpoint, Stream,
        UniqueNameAllocator,
    },
};

/// Initialize env_logger once for test output.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

/// A bus that records every dispatched message.
pub struct RecordingBus {
    pub guid: Guid128,
    names: UniqueNameAllocator,
    received: Mutex<Vec<Message>>,
    arrived: Condvar,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        let guid = Guid128::new_random();
        Arc::new(Self {
            names: UniqueNameAllocator::new(&guid),
            guid,
            received: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        })
    }

    /// Wait until at least `n` messages have arrived, returning whatever
    /// arrived by the deadline.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Message> {
        let deadline = Instant::now() + timeout;
        let mut received = self.received.lock();
        while received.len() < n {
            if self.arrived.wait_until(&mut received, deadline).timed_out() {
                break;
            }
        }
        received.clone()
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }
}

impl BusDispatcher for RecordingBus {
    fn dispatch(&self, _endpoint: &RemoteEndpoint, msg: Message) {
        self.received.lock().push(msg);
        self.arrived.notify_all();
    }

    fn guid(&self) -> Guid128 {
        self.guid
    }

    fn bus_name(&self) -> String {
        self.names.bus_name()
    }

    fn assign_unique_name(&self) -> String {
        self.names.allocate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit listener
// ─────────────────────────────────────────────────────────────────────────────

/// What the endpoint looked like when its exit listener ran.
#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub state: EndpointState,
    pub reason: Option<ExitReason>,
    pub at: Instant,
}

#[derive(Default)]
pub struct ExitRecorder {
    exits: Mutex<Vec<ExitRecord>>,
}

impl ExitRecorder {
    pub fn attach(endpoint: &RemoteEndpoint) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        let as_dyn: Arc<dyn EndpointListener> = recorder.clone();
        endpoint.set_listener(Arc::downgrade(&as_dyn));
        recorder
    }

    pub fn exits(&self) -> Vec<ExitRecord> {
        self.exits.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.exits.lock().len()
    }
}

impl EndpointListener for ExitRecorder {
    fn endpoint_exit(&self, endpoint: &RemoteEndpoint) {
        // Joining from inside the listener must not deadlock.
        endpoint.join();
        self.exits.lock().push(ExitRecord {
            state: endpoint.state(),
            reason: endpoint.exit_reason(),
            at: Instant::now(),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streams
// ─────────────────────────────────────────────────────────────────────────────

/// Loopback stream whose writes can be stalled, simulating a peer that
/// stopped reading.
pub struct GatedStream {
    inner: LoopbackStream,
    stalled: AtomicBool,
}

impl GatedStream {
    pub fn new(inner: LoopbackStream) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
        }
    }

    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

impl Stream for GatedStream {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        self.inner.read(buf, timeout)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.stalled.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "stalled"));
        }
        self.inner.write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint pairs
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated client/server pair over a loopback link.
pub struct Link {
    pub client: RemoteEndpoint,
    pub server: RemoteEndpoint,
    pub client_bus: Arc<RecordingBus>,
    pub server_bus: Arc<RecordingBus>,
    pub client_stream: Arc<GatedStream>,
    pub server_stream: Arc<GatedStream>,
}

impl Link {
    /// Authenticate with ANONYMOUS and default dev configs.
    pub fn establish() -> Self {
        Self::establish_with(
            EndpointConfig::dev_default(),
            EndpointConfig::dev_default(),
        )
    }

    pub fn establish_with(client_config: EndpointConfig, server_config: EndpointConfig) -> Self {
        let (a, b) = LoopbackStream::pair();
        let client_stream = Arc::new(GatedStream::new(a));
        let server_stream = Arc::new(GatedStream::new(b));
        let client_bus = RecordingBus::new();
        let server_bus = RecordingBus::new();
        let client = RemoteEndpoint::new(
            client_bus.clone(),
            false,
            "loopback:server",
            client_stream.clone(),
            client_config,
        )
        .unwrap();
        let server = RemoteEndpoint::new(
            server_bus.clone(),
            true,
            "loopback:client",
            server_stream.clone(),
            server_config,
        )
        .unwrap();

        let server_side = {
            let server = server.clone();
            thread::spawn(move || server.establish("ANONYMOUS", None))
        };
        let outcome = client.establish("ANONYMOUS", None).unwrap();
        assert_matches!(outcome, EstablishOutcome::Established { .. });
        assert_matches!(
            server_side.join().unwrap(),
            Ok(EstablishOutcome::Established { .. })
        );

        Self {
            client,
            server,
            client_bus,
            server_bus,
            client_stream,
            server_stream,
        }
    }

    pub fn start(&self) {
        self.client.start().unwrap();
        self.server.start().unwrap();
    }

    /// Stop both sides, close the link, and wait for the pumps.
    pub fn shutdown(&self) {
        self.client.stop();
        self.server.stop();
        self.client_stream.stall(false);
        let _ = self.client_stream.close();
        self.client.join();
        self.server.join();
    }
}

/// A signal whose body carries `(producer, seq)`.
pub fn numbered(producer: u8, seq: u32) -> Message {
    let mut body = vec![producer];
    body.extend_from_slice(&seq.to_le_bytes());
    Message::signal(seq, "org.trv1.Test", "Numbered", body)
}

/// Inverse of [`numbered`].
pub fn number_of(msg: &Message) -> (u8, u32) {
    let producer = msg.body[0];
    let seq = u32::from_le_bytes(msg.body[1..5].try_into().unwrap());
    (producer, seq)
}
