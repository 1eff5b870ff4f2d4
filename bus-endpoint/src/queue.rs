//! Outbound message queue between producer threads and the tx pump.
//!
//! Two crossbeam lanes feed the tx pump: a bounded application lane whose
//! capacity is the high-water mark, and an unbounded lane for link-control
//! messages that is always drained first. Closing drops the only sender of
//! a shutdown channel, which wakes every blocked producer and the consumer
//! at once.

use {
    crate::message::Message,
    crossbeam_channel::{bounded, select_biased, unbounded, Receiver, Sender},
    parking_lot::{Mutex, RwLock},
    std::time::Duration,
};

/// Why a push did not enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue was closed (endpoint stopping).
    Closed,
    /// The queue stayed at its high-water mark for the whole timeout.
    Backpressure,
}

/// Result of [`OutboundQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    /// The next message to write.
    Message(Message),
    /// Nothing arrived before the timeout, or the consumer was woken.
    Empty,
    /// The queue was closed; anything still queued has been discarded.
    Closed,
}

/// FIFO of pending outbound messages with a soft high-water mark.
///
/// Producers block while the application lane is at the high-water mark;
/// the high-water mark never drops anything. Link-control messages bypass
/// both the limit and the application lane.
#[derive(Debug)]
pub struct OutboundQueue {
    messages_tx: Sender<Message>,
    messages_rx: Receiver<Message>,
    control_tx: Sender<Message>,
    control_rx: Receiver<Message>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    /// Never sent on; dropping it disconnects `shutdown_rx`.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    /// Producers hold the read side for the whole push, so the write side
    /// sees no enqueue in flight.
    closed: RwLock<bool>,
}

impl OutboundQueue {
    /// Create a queue; `high_water_mark == 0` means unbounded.
    pub fn new(high_water_mark: usize) -> Self {
        let (messages_tx, messages_rx) = if high_water_mark == 0 {
            unbounded()
        } else {
            bounded(high_water_mark)
        };
        let (control_tx, control_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            messages_tx,
            messages_rx,
            control_tx,
            control_rx,
            wake_tx,
            wake_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: RwLock::new(false),
        }
    }

    /// Enqueue an application message at the tail, waiting up to `timeout`
    /// for room if the queue is at its high-water mark.
    pub fn push(&self, msg: Message, timeout: Duration) -> Result<(), PushError> {
        let closed = self.closed.read();
        if *closed {
            return Err(PushError::Closed);
        }
        let result = select_biased! {
            recv(self.shutdown_rx) -> _ => Err(PushError::Closed),
            send(self.messages_tx, msg) -> sent => sent.map_err(|_| PushError::Closed),
            default(timeout) => Err(PushError::Backpressure),
        };
        drop(closed);
        result
    }

    /// Enqueue a link-control message ahead of all application traffic.
    /// Never blocks. Returns `false` if the queue is closed.
    pub fn push_priority(&self, msg: Message) -> bool {
        let closed = self.closed.read();
        !*closed && self.control_tx.send(msg).is_ok()
    }

    /// Take the next message, waiting up to `timeout` for one.
    pub fn pop(&self, timeout: Duration) -> Pop {
        select_biased! {
            recv(self.shutdown_rx) -> _ => Pop::Closed,
            recv(self.control_rx) -> msg => msg.map_or(Pop::Closed, Pop::Message),
            recv(self.messages_rx) -> msg => msg.map_or(Pop::Closed, Pop::Message),
            recv(self.wake_rx) -> _ => Pop::Empty,
            default(timeout) => Pop::Empty,
        }
    }

    /// Close the queue, discard everything still queued, and wake every
    /// waiter. Returns how many messages were discarded.
    pub fn close(&self) -> usize {
        // Release blocked producers first; they hold the read side.
        self.disconnect();
        let mut closed = self.closed.write();
        if std::mem::replace(&mut *closed, true) {
            return 0;
        }
        self.control_rx
            .try_iter()
            .count()
            .saturating_add(self.messages_rx.try_iter().count())
    }

    /// Close the queue only if nothing is queued and no push is in flight.
    ///
    /// Never blocks. Once this returns `true`, every later push fails with
    /// [`PushError::Closed`], so no accepted message is discarded.
    pub fn close_if_empty(&self) -> bool {
        let Some(mut closed) = self.closed.try_write() else {
            return false;
        };
        if *closed {
            return true;
        }
        if self.depth() > 0 {
            return false;
        }
        *closed = true;
        drop(closed);
        self.disconnect();
        true
    }

    /// End the consumer's current `pop` wait without enqueuing anything.
    pub fn wake(&self) {
        // A full wake lane already has a wake-up pending.
        let _ = self.wake_tx.try_send(());
    }

    /// Number of queued messages, both lanes.
    pub fn depth(&self) -> usize {
        self.control_rx.len().saturating_add(self.messages_rx.len())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    fn disconnect(&self) {
        drop(self.shutdown_tx.lock().take());
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
