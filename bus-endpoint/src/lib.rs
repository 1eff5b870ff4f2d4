//! TRv1 Remote Bus Endpoint
//!
//! The transport-endpoint layer of the TRv1 message bus: one authenticated,
//! liveness-monitored connection to one peer over an arbitrary byte stream.
//!
//! - **Authentication** - a challenge/response handshake (ANONYMOUS,
//!   EXTERNAL, SHARED_SECRET) that negotiates features and identities, or
//!   redirects the peer elsewhere.
//! - **Pumps** - a receive thread that decodes length-prefixed bincode
//!   frames and dispatches them to the bus, and a transmit thread that
//!   drains a bounded outbound queue.
//! - **Link monitoring** - ProbeReq/ProbeAck on a reserved control interface
//!   detects dead peers on idle links.
//! - **Lifecycle** - reference counting, draining shutdown, and an exit
//!   listener notified exactly once.
//!
//! ## Lifecycle
//!
//! ```text
//!  RemoteEndpoint::new ─▶ establish() ─▶ start() ─▶ push_message() ...
//!                              │                        │
//!                      Redirected/AuthFailed   stop() / stop_after_tx_empty()
//!                                              decrement_ref() to zero
//!                                              link timeout / stream error
//!                                                       │
//!                                             join() ◀─ Stopped ─▶ endpoint_exit()
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`auth`]         | Handshake, mechanisms, auth listener |
//! | [`bus`]          | Bus dispatcher and exit listener traits |
//! | [`config`]       | `EndpointConfig` defaults and dev overrides |
//! | [`endpoint`]     | `RemoteEndpoint`: lifecycle, pumps, refcount |
//! | [`error`]        | Crate-wide error enums |
//! | [`features`]     | Negotiated feature set, versions, GUIDs |
//! | [`link_monitor`] | Idle-probe state machine |
//! | [`message`]      | Message type, control interface, framing |
//! | [`queue`]        | Outbound queue with high-water mark |
//! | [`state`]        | Lifecycle states and exit reasons |
//! | [`stats`]        | Traffic counters |
//! | [`stream`]       | Stream trait, TCP and loopback streams |

pub mod auth;
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod features;
pub mod link_monitor;
pub mod message;
pub mod queue;
pub mod state;
pub mod stats;
pub mod stream;

pub use {
    auth::{AuthListener, Credentials, EstablishOutcome, Mechanism},
    bus::{BusDispatcher, EndpointListener, UniqueNameAllocator},
    config::EndpointConfig,
    endpoint::RemoteEndpoint,
    error::{AuthError, EndpointError, Result},
    features::{Features, Guid128},
    message::{Message, MessageType},
    state::{EndpointState, ExitReason},
    stream::{LoopbackStream, ReadOutcome, Stream, TcpBusStream},
};
