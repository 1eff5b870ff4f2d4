//! The remote endpoint: one peer connection, its handshake, and its pumps.
//!
//! A [`RemoteEndpoint`] is a cheap, cloneable handle. The transport builds
//! one around a [`Stream`], runs [`establish`](RemoteEndpoint::establish),
//! then [`start`](RemoteEndpoint::start)s two named threads:
//!
//! - the **rx pump** reads frames, answers probes, dispatches everything
//!   else to the bus, and drives the [`LinkMonitor`] from its bounded waits;
//! - the **tx pump** pops the [`OutboundQueue`] and writes each frame in
//!   full, handling `stop_after_tx_empty` draining.
//!
//! Any path that ends the connection goes through one idempotent stop. The
//! last pump to exit moves the endpoint to `Stopped` and notifies the exit
//! listener exactly once.

use {
    crate::{
        auth::{
            requested_features, AuthListener, EstablishOutcome, Handshake, Identity, Mechanism,
            Negotiator,
        },
        bus::{BusDispatcher, EndpointListener},
        config::EndpointConfig,
        error::{EndpointError, Result},
        features::{Features, Guid128},
        link_monitor::{LinkAction, LinkMonitor, LinkTimeoutParams},
        message::{
            decode_payload, encode_frame, FrameDecoder, Message, ProbeKind, FRAME_HEADER_LEN,
        },
        queue::{OutboundQueue, Pop, PushError},
        state::{EndpointState, ExitReason},
        stats::{EndpointStats, StatsSnapshot},
        stream::{write_fully, ReadOutcome, Stream},
    },
    log::{debug, error, info, trace, warn},
    parking_lot::{Condvar, Mutex, RwLock},
    std::{
        fmt, io,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, OnceLock, Weak,
        },
        thread::{self, Builder, JoinHandle, ThreadId},
        time::{Duration, Instant},
    },
};

const READ_CHUNK: usize = 65_536;

#[derive(Debug)]
struct Lifecycle {
    state: EndpointState,
    started: bool,
    running_pumps: u8,
    ref_count: u32,
    draining: bool,
    /// `None` while draining means wait indefinitely.
    drain_deadline: Option<Instant>,
    pause_after_reply: bool,
    paused: bool,
    exit_reason: Option<ExitReason>,
    exit_notified: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: EndpointState::Created,
            started: false,
            running_pumps: 0,
            ref_count: 0,
            draining: false,
            drain_deadline: None,
            pause_after_reply: false,
            paused: false,
            exit_reason: None,
            exit_notified: false,
        }
    }
}

struct Inner {
    bus: Arc<dyn BusDispatcher>,
    incoming: bool,
    connect_spec: String,
    config: EndpointConfig,
    stream: RwLock<Arc<dyn Stream>>,
    /// Written once by `establish`.
    identity: OnceLock<Identity>,
    /// Decoder carried from the handshake to the rx pump.
    handoff: Mutex<Option<FrameDecoder>>,
    queue: OutboundQueue,
    monitor: Mutex<LinkMonitor>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    exit: AtomicBool,
    listener: Mutex<Option<Weak<dyn EndpointListener>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pump_thread_ids: Mutex<Vec<ThreadId>>,
    next_serial: AtomicU32,
    stats: EndpointStats,
}

/// Handle to one remote peer connection.
#[derive(Clone)]
pub struct RemoteEndpoint {
    inner: Arc<Inner>,
}

/// Runs when a pump returns or unwinds.
struct PumpGuard<'a> {
    endpoint: &'a RemoteEndpoint,
    pump: &'static str,
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.endpoint.initiate_stop(ExitReason::StreamError(format!(
                "{} pump panicked",
                self.pump
            )));
        }
        self.endpoint.pump_exited(self.pump);
    }
}

impl RemoteEndpoint {
    /// Wrap `stream` in a new endpoint in the `Created` state.
    ///
    /// `incoming` selects the accepting side of the handshake.
    /// `connect_spec` describes the peer (for example
    /// `tcp:addr=10.0.0.2,port=9955`) and is reported to auth listeners.
    pub fn new(
        bus: Arc<dyn BusDispatcher>,
        incoming: bool,
        connect_spec: impl Into<String>,
        stream: Arc<dyn Stream>,
        config: EndpointConfig,
    ) -> Result<Self> {
        config.validate()?;
        let params = LinkTimeoutParams {
            idle_timeout_secs: config.idle_timeout_secs,
            probe_timeout_secs: config.probe_timeout_secs,
            max_idle_probes: config.max_idle_probes,
        };
        let inner = Inner {
            bus,
            incoming,
            connect_spec: connect_spec.into(),
            stream: RwLock::new(stream),
            identity: OnceLock::new(),
            handoff: Mutex::new(None),
            queue: OutboundQueue::new(config.tx_high_water_mark),
            monitor: Mutex::new(LinkMonitor::new(params, Instant::now())),
            lifecycle: Mutex::new(Lifecycle::new()),
            lifecycle_changed: Condvar::new(),
            exit: AtomicBool::new(false),
            listener: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            pump_thread_ids: Mutex::new(Vec::new()),
            next_serial: AtomicU32::new(1),
            stats: EndpointStats::default(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Run the authentication handshake on the calling thread.
    ///
    /// `mechanisms` is a space-separated list: the offer order for an
    /// outgoing endpoint, the allowed set for an incoming one. Legal once,
    /// in `Created`. On failure the endpoint is `AuthFailed` for good.
    pub fn establish(
        &self,
        mechanisms: &str,
        auth_listener: Option<&dyn AuthListener>,
    ) -> Result<EstablishOutcome> {
        {
            let mut lc = self.inner.lifecycle.lock();
            if lc.state != EndpointState::Created {
                return Err(EndpointError::AlreadyEstablished(lc.state));
            }
            lc.state = EndpointState::Authenticating;
        }
        debug!(
            "{}: authenticating ({})",
            self.label(),
            if self.inner.incoming { "incoming" } else { "outgoing" }
        );

        let result = Mechanism::parse_list(mechanisms)
            .map_err(EndpointError::from)
            .and_then(|mechanisms| {
                let stream = self.stream();
                let negotiator = Negotiator {
                    stream: stream.as_ref(),
                    config: &self.inner.config,
                    bus: self.inner.bus.as_ref(),
                    listener: auth_listener,
                    peer: &self.inner.connect_spec,
                };
                negotiator.run(self.inner.incoming, &mechanisms)
            });

        let mut lc = self.inner.lifecycle.lock();
        if lc.state != EndpointState::Authenticating {
            // Stopped while the handshake was running.
            return Err(EndpointError::NotRunning(lc.state));
        }
        match result {
            Ok(Handshake::Established { identity, decoder }) => {
                let outcome = EstablishOutcome::Established {
                    auth_used: identity.mechanism.name().to_string(),
                    remote_guid: identity.remote_guid,
                };
                let supports_probes = identity.features.supports_link_probes();
                let protocol_version = identity.features.protocol_version;
                if self.inner.identity.set(identity).is_err() {
                    error!("{}: identity already set", self.inner.connect_spec);
                }
                *self.inner.handoff.lock() = Some(decoder);
                {
                    let now = Instant::now();
                    let mut monitor = self.inner.monitor.lock();
                    if monitor.is_enabled() && !supports_probes {
                        debug!(
                            "{}: remote protocol {protocol_version} has no link probes, \
                             monitor off",
                            self.label()
                        );
                        let params = LinkTimeoutParams {
                            idle_timeout_secs: 0,
                            ..monitor.params()
                        };
                        monitor.reconfigure(params, now);
                    } else {
                        monitor.record_activity(now);
                    }
                }
                lc.state = EndpointState::Established;
                info!(
                    "{}: established with {} (remote {})",
                    self.label(),
                    self.inner.connect_spec,
                    self.remote_name()
                );
                Ok(outcome)
            }
            Ok(Handshake::Redirected { address }) => {
                lc.state = EndpointState::Redirected;
                info!("{}: redirected to {address}", self.inner.connect_spec);
                Ok(EstablishOutcome::Redirected { address })
            }
            Err(e) => {
                lc.state = EndpointState::AuthFailed;
                Err(e)
            }
        }
    }

    /// Spawn the rx and tx pumps. Legal once, in `Established`.
    pub fn start(&self) -> Result<()> {
        {
            let mut lc = self.inner.lifecycle.lock();
            if lc.started {
                return Err(EndpointError::AlreadyStarted);
            }
            if lc.state != EndpointState::Established {
                return Err(EndpointError::NotRunning(lc.state));
            }
            lc.started = true;
            lc.running_pumps = 2;
        }

        let decoder = self
            .inner
            .handoff
            .lock()
            .take()
            .unwrap_or_else(|| FrameDecoder::new(self.inner.config.max_message_size));
        self.inner.monitor.lock().record_activity(Instant::now());

        let prefix = &self.inner.config.thread_name_prefix;
        let rx = {
            let endpoint = self.clone();
            Builder::new()
                .name(format!("{prefix}Rx"))
                .spawn(move || endpoint.run_rx_pump(decoder))
        };
        let rx = match rx {
            Ok(handle) => handle,
            Err(e) => {
                self.abort_start(2, &e);
                return Err(e.into());
            }
        };
        let tx = {
            let endpoint = self.clone();
            Builder::new()
                .name(format!("{prefix}Tx"))
                .spawn(move || endpoint.run_tx_pump())
        };
        let mut threads = self.inner.threads.lock();
        threads.push(rx);
        match tx {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(threads);
                self.abort_start(1, &e);
                return Err(e.into());
            }
        }
        info!("{}: started", self.label());
        Ok(())
    }

    fn abort_start(&self, unspawned: u8, e: &io::Error) {
        error!("{}: failed to spawn pump thread: {e}", self.label());
        self.initiate_stop(ExitReason::StreamError(format!(
            "failed to spawn pump thread: {e}"
        )));
        for _ in 0..unspawned {
            self.pump_exited("unspawned");
        }
    }

    /// Begin shutdown. Idempotent, never blocks, safe from any thread
    /// (including pump threads and the exit listener). Overrides any
    /// outstanding references.
    pub fn stop(&self) {
        self.initiate_stop(ExitReason::Requested);
    }

    /// Keep sending until the outbound queue is empty, then stop.
    ///
    /// Gives up and stops anyway after `max_wait_ms`; `0` waits as long as it
    /// takes. New messages are still accepted while draining.
    pub fn stop_after_tx_empty(&self, max_wait_ms: u32) {
        let mut lc = self.inner.lifecycle.lock();
        if lc.state != EndpointState::Established {
            return;
        }
        if !lc.started {
            drop(lc);
            self.initiate_stop(ExitReason::Requested);
            return;
        }
        lc.draining = true;
        lc.drain_deadline = if max_wait_ms == 0 {
            None
        } else {
            Instant::now().checked_add(Duration::from_millis(u64::from(max_wait_ms)))
        };
        drop(lc);
        info!(
            "{}: draining {} queued messages (max wait {max_wait_ms}ms)",
            self.label(),
            self.inner.queue.depth()
        );
        self.inner.queue.wake();
    }

    /// Block until both pumps have exited and reap their threads.
    ///
    /// Returns immediately if the pumps never started, or when called from
    /// a pump thread (for example from the exit listener).
    pub fn join(&self) {
        if self.on_pump_thread() {
            return;
        }
        {
            let mut lc = self.inner.lifecycle.lock();
            if !lc.started {
                return;
            }
            while lc.state != EndpointState::Stopped {
                self.inner.lifecycle_changed.wait(&mut lc);
            }
        }
        let threads: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("pump").to_string();
            if handle.join().is_err() {
                error!("{}: {name} thread panicked", self.label());
            }
        }
    }

    /// Install the exit listener. Only a weak reference is kept; if the
    /// listener is gone by the time the endpoint stops, nothing is called.
    pub fn set_listener(&self, listener: Weak<dyn EndpointListener>) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Replace the stream. Only legal before `establish`.
    pub fn set_stream(&self, stream: Arc<dyn Stream>) -> Result<()> {
        let lc = self.inner.lifecycle.lock();
        if lc.state != EndpointState::Created {
            return Err(EndpointError::AlreadyEstablished(lc.state));
        }
        *self.inner.stream.write() = stream;
        Ok(())
    }

    /// Add a holder. Returns the new count.
    pub fn increment_ref(&self) -> u32 {
        let mut lc = self.inner.lifecycle.lock();
        lc.ref_count = lc.ref_count.saturating_add(1);
        lc.ref_count
    }

    /// Release a holder. The transition to zero stops the endpoint. Returns
    /// the new count.
    pub fn decrement_ref(&self) -> u32 {
        let remaining = {
            let mut lc = self.inner.lifecycle.lock();
            let Some(remaining) = lc.ref_count.checked_sub(1) else {
                error!("{}: decrement_ref with no references held", self.label());
                return 0;
            };
            lc.ref_count = remaining;
            remaining
        };
        if remaining == 0 {
            debug!("{}: last reference released", self.label());
            self.initiate_stop(ExitReason::ReferencesReleased);
        }
        remaining
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.inner.lifecycle.lock().ref_count
    }

    // ── Traffic ─────────────────────────────────────────────────────────────

    /// Queue `msg` for the tx pump.
    ///
    /// Blocks while the queue is at its high-water mark, for at most the
    /// configured push timeout.
    pub fn push_message(&self, msg: Message) -> Result<()> {
        let state = self.state();
        if !state.accepts_traffic() || self.exiting() {
            return Err(EndpointError::NotRunning(state));
        }
        let size = usize::try_from(bincode::serialized_size(&msg)?).unwrap_or(usize::MAX);
        let max = self.inner.config.max_message_size;
        if size > max {
            return Err(EndpointError::MessageTooLarge { size, max });
        }
        trace!("{}: queue {} serial={}", self.label(), msg.kind(), msg.serial);
        match self.inner.queue.push(msg, self.inner.config.push_timeout()) {
            Ok(()) => Ok(()),
            Err(PushError::Closed) => Err(EndpointError::NotRunning(self.state())),
            Err(PushError::Backpressure) => {
                debug!(
                    "{}: outbound queue full for {}ms",
                    self.label(),
                    self.inner.config.push_timeout_ms
                );
                Err(EndpointError::Backpressure(self.inner.config.push_timeout_ms))
            }
        }
    }

    /// Messages waiting for the tx pump.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    /// Stop reading after the next inbound method reply is dispatched, until
    /// `resume_rx`.
    pub fn pause_after_rx_reply(&self) {
        self.inner.lifecycle.lock().pause_after_reply = true;
    }

    /// Resume a paused rx pump, or cancel a pending pause.
    pub fn resume_rx(&self) {
        let mut lc = self.inner.lifecycle.lock();
        lc.pause_after_reply = false;
        lc.paused = false;
        drop(lc);
        self.inner.lifecycle_changed.notify_all();
    }

    /// Whether the rx pump is currently held by `pause_after_rx_reply`.
    pub fn is_rx_paused(&self) -> bool {
        self.inner.lifecycle.lock().paused
    }

    // ── Link monitor ────────────────────────────────────────────────────────

    /// Set the link timeout as one number of seconds and return the
    /// effective value.
    ///
    /// The value is raised to the configured minimum and split into an idle
    /// timeout plus the probe budget. `0` disables probing.
    pub fn set_link_timeout(&self, link_timeout_secs: u32) -> Result<u32> {
        let Some(identity) = self.inner.identity.get() else {
            return Err(EndpointError::NotRunning(self.state()));
        };
        if !identity.features.supports_link_probes() {
            return Err(EndpointError::NotSupported(identity.features.protocol_version));
        }
        let config = &self.inner.config;
        let (params, effective) = LinkTimeoutParams::from_link_timeout(
            link_timeout_secs,
            config.min_link_timeout_secs,
            config.probe_timeout_secs.max(1),
            config.max_idle_probes.max(1),
        );
        self.inner.monitor.lock().reconfigure(params, Instant::now());
        info!(
            "{}: link timeout {effective}s (idle {}s, {} probes of {}s)",
            self.label(),
            params.idle_timeout_secs,
            params.max_idle_probes,
            params.probe_timeout_secs
        );
        Ok(effective)
    }

    /// Set the monitor parameters directly, for transports that know their
    /// own characteristics. `idle_timeout_secs == 0` disables probing.
    pub fn set_link_timeout_params(
        &self,
        idle_timeout_secs: u32,
        probe_timeout_secs: u32,
        max_idle_probes: u32,
    ) -> Result<()> {
        if idle_timeout_secs > 0 && (probe_timeout_secs == 0 || max_idle_probes == 0) {
            return Err(EndpointError::InvalidConfig {
                reason: "probe timeout and probe count must be non-zero".to_string(),
            });
        }
        let params = LinkTimeoutParams {
            idle_timeout_secs,
            probe_timeout_secs,
            max_idle_probes,
        };
        self.inner.monitor.lock().reconfigure(params, Instant::now());
        debug!("{}: link monitor set to {params:?}", self.label());
        Ok(())
    }

    /// Current link-monitor parameters.
    pub fn link_timeout_params(&self) -> LinkTimeoutParams {
        self.inner.monitor.lock().params()
    }

    /// Unanswered probes since the last inbound traffic.
    pub fn probes_outstanding(&self) -> u32 {
        self.inner.monitor.lock().probes_sent()
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn state(&self) -> EndpointState {
        self.inner.lifecycle.lock().state
    }

    /// Whether `stop_after_tx_empty` is in progress.
    pub fn is_draining(&self) -> bool {
        let lc = self.inner.lifecycle.lock();
        lc.draining && lc.state == EndpointState::Established
    }

    /// Why the endpoint stopped, once it has.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.inner.lifecycle.lock().exit_reason.clone()
    }

    /// Unique bus name of this connection; empty until established.
    pub fn unique_name(&self) -> &str {
        self.inner
            .identity
            .get()
            .map_or("", |identity| identity.unique_name.as_str())
    }

    /// Unique name of the bus on the other side; empty until established.
    pub fn remote_name(&self) -> &str {
        self.inner
            .identity
            .get()
            .map_or("", |identity| identity.remote_name.as_str())
    }

    /// GUID of the remote bus; nil until established.
    pub fn remote_guid(&self) -> Guid128 {
        self.inner
            .identity
            .get()
            .map_or_else(Guid128::default, |identity| identity.remote_guid)
    }

    /// Mechanism that authenticated the peer.
    pub fn auth_mechanism(&self) -> Option<&'static str> {
        self.inner
            .identity
            .get()
            .map(|identity| identity.mechanism.name())
    }

    pub fn connect_spec(&self) -> &str {
        &self.inner.connect_spec
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    /// Negotiated features once established, the requested ones before.
    pub fn features(&self) -> Features {
        self.inner.identity.get().map_or_else(
            || requested_features(&self.inner.config),
            |identity| identity.features,
        )
    }

    pub fn remote_protocol_version(&self) -> u32 {
        self.inner
            .identity
            .get()
            .map_or(0, |identity| identity.features.protocol_version)
    }

    pub fn remote_library_version(&self) -> u32 {
        self.inner
            .identity
            .get()
            .map_or(0, |identity| identity.features.library_version)
    }

    pub fn remote_process_id(&self) -> u32 {
        self.inner
            .identity
            .get()
            .map_or(0, |identity| identity.features.process_id)
    }

    /// Whether the peer accepts messages that originate on remote buses.
    pub fn allow_remote_messages(&self) -> bool {
        self.features().allow_remote
    }

    pub fn is_bus_to_bus(&self) -> bool {
        self.features().is_bus_to_bus
    }

    pub fn handle_passing_enabled(&self) -> bool {
        self.features().handle_passing
    }

    pub fn is_trusted(&self) -> bool {
        self.features().trusted
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Whether two handles refer to the same endpoint.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn label(&self) -> &str {
        match self.inner.identity.get() {
            Some(identity) => &identity.unique_name,
            None => &self.inner.connect_spec,
        }
    }

    fn stream(&self) -> Arc<dyn Stream> {
        self.inner.stream.read().clone()
    }

    fn exiting(&self) -> bool {
        self.inner.exit.load(Ordering::Relaxed)
    }

    fn listener(&self) -> Option<Arc<dyn EndpointListener>> {
        self.inner.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    fn on_pump_thread(&self) -> bool {
        self.inner
            .pump_thread_ids
            .lock()
            .contains(&thread::current().id())
    }

    fn register_pump_thread(&self) {
        self.inner.pump_thread_ids.lock().push(thread::current().id());
    }

    /// Single entry point for every shutdown path. The first caller's reason
    /// sticks; later calls return `false`.
    fn initiate_stop(&self, reason: ExitReason) -> bool {
        let mut lc = self.inner.lifecycle.lock();
        if !matches!(
            lc.state,
            EndpointState::Created | EndpointState::Authenticating | EndpointState::Established
        ) {
            return false;
        }
        let started = lc.started;
        lc.state = if started {
            EndpointState::Stopping
        } else {
            EndpointState::Stopped
        };
        lc.draining = false;
        lc.pause_after_reply = false;
        lc.paused = false;
        lc.exit_reason = Some(reason.clone());
        drop(lc);

        self.inner.exit.store(true, Ordering::Relaxed);
        self.inner.stats.shutdowns_initiated.inc();
        let discarded = self.inner.queue.close();
        self.inner.lifecycle_changed.notify_all();

        if reason.is_failure() {
            warn!(
                "{}: stopping: {reason} ({discarded} queued messages discarded)",
                self.label()
            );
        } else {
            info!(
                "{}: stopping: {reason} ({discarded} queued messages discarded)",
                self.label()
            );
        }
        if !started {
            info!("{}: stopped before the pumps ran", self.label());
        }
        true
    }

    fn pump_exited(&self, pump: &str) {
        let notify = {
            let mut lc = self.inner.lifecycle.lock();
            lc.running_pumps = lc.running_pumps.saturating_sub(1);
            debug!("{}: {pump} pump exited", self.label());
            if lc.running_pumps > 0 {
                return;
            }
            lc.state = EndpointState::Stopped;
            lc.draining = false;
            !std::mem::replace(&mut lc.exit_notified, true)
        };
        self.inner.lifecycle_changed.notify_all();
        info!(
            "{}: stopped ({})",
            self.label(),
            self.exit_reason()
                .map_or_else(|| "no reason recorded".to_string(), |r| r.to_string())
        );
        if notify {
            match self.listener() {
                Some(listener) => listener.endpoint_exit(self),
                None => debug!("{}: no exit listener to notify", self.label()),
            }
        }
    }

    fn next_serial(&self) -> u32 {
        self.inner.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    fn push_control(&self, kind: ProbeKind) {
        let msg = Message::probe(kind, self.next_serial());
        if !self.inner.queue.push_priority(msg) {
            trace!("{}: queue closed, {kind:?} dropped", self.label());
        }
    }

    // ── Rx pump ─────────────────────────────────────────────────────────────

    fn run_rx_pump(&self, mut decoder: FrameDecoder) {
        self.register_pump_thread();
        let _guard = PumpGuard {
            endpoint: self,
            pump: "rx",
        };
        debug!("{}: rx pump running", self.label());
        if let Some(reason) = self.rx_loop(&mut decoder) {
            self.initiate_stop(reason);
        }
    }

    fn rx_loop(&self, decoder: &mut FrameDecoder) -> Option<ExitReason> {
        let stream = self.stream();
        let poll = self.inner.config.rx_poll_interval();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if let Err(reason) = self.dispatch_frames(decoder) {
                return Some(reason);
            }
            if self.exiting() {
                return None;
            }
            // The tx pump cannot see the deadline while wedged on a write.
            if self.drain_expired() {
                return Some(ExitReason::DrainTimedOut);
            }

            let now = Instant::now();
            let (action, next_action) = {
                let mut monitor = self.inner.monitor.lock();
                let action = monitor.poll(now);
                (action, monitor.time_to_next_action(now))
            };
            match action {
                LinkAction::SendProbe => {
                    debug!("{}: link idle, sending probe", self.label());
                    self.inner.stats.probes_sent.inc();
                    self.push_control(ProbeKind::Req);
                }
                LinkAction::Dead => {
                    warn!("{}: no answer to link probes", self.label());
                    return Some(ExitReason::LinkTimeout);
                }
                LinkAction::None => {}
            }

            let timeout = next_action.map_or(poll, |next| next.min(poll));
            match stream.read(&mut buf, timeout) {
                Ok(ReadOutcome::Data(n)) => decoder.push(buf.get(..n).unwrap_or_default()),
                Ok(ReadOutcome::TimedOut) => {}
                Ok(ReadOutcome::Closed) => {
                    return (!self.exiting()).then_some(ExitReason::RemoteClosed);
                }
                Err(e) => {
                    return (!self.exiting()).then(|| ExitReason::StreamError(e.to_string()));
                }
            }
        }
    }

    /// Handle every complete frame in `decoder`.
    fn dispatch_frames(&self, decoder: &mut FrameDecoder) -> std::result::Result<(), ExitReason> {
        while !self.exiting() {
            let payload = match decoder.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => return Err(ExitReason::ProtocolViolation(e.to_string())),
            };
            let msg: Message = decode_payload(&payload)
                .map_err(|e| ExitReason::ProtocolViolation(e.to_string()))?;
            self.inner.monitor.lock().record_activity(Instant::now());
            self.inner
                .stats
                .bytes_received
                .add(payload.len().saturating_add(FRAME_HEADER_LEN) as u64);

            match msg.probe_kind() {
                Some(ProbeKind::Req) => {
                    trace!("{}: answering probe", self.label());
                    self.inner.stats.probes_answered.inc();
                    self.push_control(ProbeKind::Ack);
                }
                Some(ProbeKind::Ack) => {
                    trace!("{}: probe acknowledged", self.label());
                    self.inner.stats.probes_acked.inc();
                }
                None => {
                    trace!("{}: rx {} serial={}", self.label(), msg.kind(), msg.serial);
                    self.inner.stats.messages_received.inc();
                    let is_reply = msg.is_reply();
                    self.inner.bus.dispatch(self, msg);
                    if is_reply {
                        self.pause_if_requested();
                    }
                }
            }
        }
        Ok(())
    }

    fn pause_if_requested(&self) {
        let mut lc = self.inner.lifecycle.lock();
        if !lc.pause_after_reply {
            return;
        }
        lc.pause_after_reply = false;
        lc.paused = true;
        debug!("{}: rx paused after reply", self.label());
        while lc.paused && !self.exiting() {
            self.inner.lifecycle_changed.wait(&mut lc);
        }
        debug!("{}: rx resumed", self.label());
    }

    // ── Tx pump ─────────────────────────────────────────────────────────────

    fn run_tx_pump(&self) {
        self.register_pump_thread();
        let _guard = PumpGuard {
            endpoint: self,
            pump: "tx",
        };
        debug!("{}: tx pump running", self.label());
        if let Some(reason) = self.tx_loop() {
            self.initiate_stop(reason);
        }
    }

    fn tx_loop(&self) -> Option<ExitReason> {
        let stream = self.stream();
        let poll = self.inner.config.rx_poll_interval();
        let max = self.inner.config.max_message_size;
        loop {
            if let Some(reason) = self.drain_finished() {
                return Some(reason);
            }
            let msg = match self.inner.queue.pop(poll) {
                Pop::Message(msg) => msg,
                Pop::Empty => continue,
                Pop::Closed => return None,
            };
            let frame = match encode_frame(&msg, max) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        "{}: dropping {} serial={}: {e}",
                        self.label(),
                        msg.kind(),
                        msg.serial
                    );
                    continue;
                }
            };
            if let Err(e) = write_fully(stream.as_ref(), &frame, &self.inner.exit) {
                return (!self.exiting()).then(|| ExitReason::StreamError(e.to_string()));
            }
            trace!("{}: tx {} serial={}", self.label(), msg.kind(), msg.serial);
            self.inner.stats.bytes_sent.add(frame.len() as u64);
            if msg.probe_kind().is_none() {
                self.inner.stats.messages_sent.inc();
            }
        }
    }

    fn drain_finished(&self) -> Option<ExitReason> {
        let lc = self.inner.lifecycle.lock();
        if !lc.draining || lc.state != EndpointState::Established {
            return None;
        }
        // Closing and the emptiness check are one step, so a push racing
        // the end of the drain is either written or refused.
        if self.inner.queue.close_if_empty() {
            return Some(ExitReason::Drained);
        }
        drop(lc);
        self.drain_expired().then_some(ExitReason::DrainTimedOut)
    }

    fn drain_expired(&self) -> bool {
        let lc = self.inner.lifecycle.lock();
        lc.draining
            && lc.state == EndpointState::Established
            && lc
                .drain_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("connect_spec", &self.inner.connect_spec)
            .field("unique_name", &self.unique_name())
            .field("incoming", &self.inner.incoming)
            .field("state", &self.state())
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{bus::UniqueNameAllocator, stream::LoopbackStream},
        assert_matches::assert_matches,
        proptest::prelude::*,
        std::sync::atomic::AtomicUsize,
    };

    struct NullBus {
        guid: Guid128,
        names: UniqueNameAllocator,
    }

    impl NullBus {
        fn new() -> Arc<Self> {
            let guid = Guid128::new_random();
            Arc::new(Self {
                names: UniqueNameAllocator::new(&guid),
                guid,
            })
        }
    }

    impl BusDispatcher for NullBus {
        fn dispatch(&self, _endpoint: &RemoteEndpoint, _msg: Message) {}
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

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl EndpointListener for CountingListener {
        fn endpoint_exit(&self, _endpoint: &RemoteEndpoint) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn endpoint() -> (RemoteEndpoint, LoopbackStream) {
        let (ours, theirs) = LoopbackStream::pair();
        let ep = RemoteEndpoint::new(
            NullBus::new(),
            false,
            "loopback:test",
            Arc::new(ours),
            EndpointConfig::dev_default(),
        )
        .unwrap();
        (ep, theirs)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (stream, _peer) = LoopbackStream::pair();
        let config = EndpointConfig {
            max_auth_attempts: 0,
            ..EndpointConfig::dev_default()
        };
        assert_matches!(
            RemoteEndpoint::new(NullBus::new(), false, "x", Arc::new(stream), config),
            Err(EndpointError::InvalidConfig { .. })
        );
    }

    #[test]
    fn test_fresh_endpoint_refuses_traffic() {
        let (ep, _peer) = endpoint();
        assert_eq!(ep.state(), EndpointState::Created);
        assert_eq!(ep.unique_name(), "");
        assert!(ep.remote_guid().is_nil());
        assert_matches!(
            ep.push_message(Message::signal(1, "org.example.A", "B", vec![])),
            Err(EndpointError::NotRunning(EndpointState::Created))
        );
        assert_matches!(
            ep.start(),
            Err(EndpointError::NotRunning(EndpointState::Created))
        );
        assert_matches!(ep.set_link_timeout(60), Err(EndpointError::NotRunning(_)));
        // Before establishment the requested features are reported.
        assert_eq!(ep.features().process_id, std::process::id());
        assert!(!ep.features().trusted);
    }

    #[test]
    fn test_stop_before_start_skips_notification() {
        let (ep, _peer) = endpoint();
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn EndpointListener> = listener.clone();
        ep.set_listener(Arc::downgrade(&as_dyn));
        ep.stop();
        ep.stop();
        assert_eq!(ep.state(), EndpointState::Stopped);
        assert_eq!(ep.exit_reason(), Some(ExitReason::Requested));
        assert_eq!(ep.stats().shutdowns_initiated, 1);
        ep.join();
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);
        assert_matches!(
            ep.establish("ANONYMOUS", None),
            Err(EndpointError::AlreadyEstablished(EndpointState::Stopped))
        );
    }

    #[test]
    fn test_unknown_mechanism_fails_auth() {
        let (ep, _peer) = endpoint();
        assert_matches!(
            ep.establish("KERBEROS", None),
            Err(EndpointError::Auth(crate::error::AuthError::UnknownMechanism(_)))
        );
        assert_eq!(ep.state(), EndpointState::AuthFailed);
        assert_matches!(
            ep.start(),
            Err(EndpointError::NotRunning(EndpointState::AuthFailed))
        );
        // Terminal: stop does not move it.
        ep.stop();
        assert_eq!(ep.state(), EndpointState::AuthFailed);
    }

    #[test]
    fn test_set_stream_only_before_establish() {
        let (ep, _peer) = endpoint();
        let (replacement, _other) = LoopbackStream::pair();
        ep.set_stream(Arc::new(replacement)).unwrap();
        ep.stop();
        let (late, _late_peer) = LoopbackStream::pair();
        assert_matches!(
            ep.set_stream(Arc::new(late)),
            Err(EndpointError::AlreadyEstablished(EndpointState::Stopped))
        );
    }

    #[test]
    fn test_link_timeout_params_validated() {
        let (ep, _peer) = endpoint();
        assert_matches!(
            ep.set_link_timeout_params(5, 0, 3),
            Err(EndpointError::InvalidConfig { .. })
        );
        ep.set_link_timeout_params(5, 1, 2).unwrap();
        assert_eq!(
            ep.link_timeout_params(),
            LinkTimeoutParams {
                idle_timeout_secs: 5,
                probe_timeout_secs: 1,
                max_idle_probes: 2,
            }
        );
        ep.set_link_timeout_params(0, 0, 0).unwrap();
    }

    #[test]
    fn test_decrement_at_zero_is_ignored() {
        let (ep, _peer) = endpoint();
        assert_eq!(ep.decrement_ref(), 0);
        assert_eq!(ep.state(), EndpointState::Created);
        assert_eq!(ep.increment_ref(), 1);
        assert_eq!(ep.decrement_ref(), 0);
        assert_eq!(ep.state(), EndpointState::Stopped);
        assert_eq!(ep.exit_reason(), Some(ExitReason::ReferencesReleased));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The endpoint stops on the first transition to zero, exactly once,
        /// however increments and decrements interleave.
        #[test]
        fn prop_refcount_zero_stops_once(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let (ep, _peer) = endpoint();
            let mut count = 0u32;
            let mut released = false;
            for increment in ops {
                if increment {
                    count += 1;
                    prop_assert_eq!(ep.increment_ref(), count);
                } else {
                    let was = count;
                    count = count.saturating_sub(1);
                    prop_assert_eq!(ep.decrement_ref(), count);
                    if was == 1 {
                        released = true;
                    }
                }
                let expected = if released {
                    EndpointState::Stopped
                } else {
                    EndpointState::Created
                };
                prop_assert_eq!(ep.state(), expected);
            }
            prop_assert_eq!(ep.stats().shutdowns_initiated, u64::from(released));
        }
    }
}
