//! Connection-level authentication handshake.
//!
//! Runs once, directly over the stream, before the pumps exist. The outgoing
//! side offers mechanisms in the caller's priority order; the incoming side
//! answers each offer with a challenge, an acceptance, or a rejection that
//! lists what it does support. Once a mechanism is accepted the two sides
//! swap features and identities:
//!
//! ```text
//! client                                server
//!   Auth{mechanism, initial_response} ─▶
//!                                     ◀─ Challenge(nonce)        (SHARED_SECRET)
//!   Response(digest)                  ─▶
//!                                     ◀─ Accepted{guid} | Rejected{..} | Redirect{..}
//!   Begin{guid, name, features}       ─▶
//!                                     ◀─ Welcome{unique_name, remote_name, features}
//! ```
//!
//! Handshake frames use the same length-prefixed framing as messages. Bytes
//! that arrive behind the last handshake frame stay in the returned
//! [`FrameDecoder`] for the rx pump.

use {
    crate::{
        bus::BusDispatcher,
        config::EndpointConfig,
        error::{AuthError, EndpointError, Result},
        features::{library_version, Features, Guid128, PROTOCOL_VERSION},
        message::{decode_payload, encode_frame, FrameDecoder},
        stream::{write_fully, ReadOutcome, Stream},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{
        collections::VecDeque,
        fmt,
        sync::atomic::AtomicBool,
        time::{Duration, Instant},
    },
};

/// No credentials; the peer is untrusted.
pub const ANONYMOUS: &str = "ANONYMOUS";
/// The client asserts its OS user identity.
pub const EXTERNAL: &str = "EXTERNAL";
/// Challenge/response over a secret both sides obtain from their listener.
pub const SHARED_SECRET: &str = "SHARED_SECRET";

const NONCE_LEN: usize = 32;
const READ_CHUNK: usize = 4_096;

/// An authentication mechanism this endpoint can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Anonymous,
    External,
    SharedSecret,
}

impl Mechanism {
    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Anonymous => ANONYMOUS,
            Self::External => EXTERNAL,
            Self::SharedSecret => SHARED_SECRET,
        }
    }

    /// Look a mechanism up by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ANONYMOUS => Some(Self::Anonymous),
            EXTERNAL => Some(Self::External),
            SHARED_SECRET => Some(Self::SharedSecret),
            _ => None,
        }
    }

    /// Whether a peer authenticated this way counts as trusted.
    pub fn is_trusted(self) -> bool {
        self != Self::Anonymous
    }

    /// Parse a space-separated mechanism list, keeping the caller's order
    /// and dropping repeats.
    pub fn parse_list(list: &str) -> std::result::Result<Vec<Self>, AuthError> {
        let mut mechanisms = Vec::new();
        for name in list.split_whitespace() {
            let mechanism =
                Self::from_name(name).ok_or_else(|| AuthError::UnknownMechanism(name.to_string()))?;
            if !mechanisms.contains(&mechanism) {
                mechanisms.push(mechanism);
            }
        }
        if mechanisms.is_empty() {
            return Err(AuthError::UnknownMechanism(list.to_string()));
        }
        Ok(mechanisms)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Credentials handed out by an [`AuthListener`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// User identity (EXTERNAL).
    pub user_name: Option<String>,
    /// Shared secret (SHARED_SECRET).
    pub secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_name", &self.user_name)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Application hooks consulted during authentication.
pub trait AuthListener: Send + Sync {
    /// Supply credentials for `mechanism` when talking to `peer`. `attempt`
    /// starts at 1. Returning `None` means none are available.
    fn request_credentials(&self, mechanism: &str, peer: &str, attempt: u16) -> Option<Credentials>;

    /// Approve credentials presented by `peer`. Accepts everything unless
    /// overridden.
    fn verify_credentials(
        &self,
        _mechanism: &str,
        _peer: &str,
        _credentials: &Credentials,
    ) -> bool {
        true
    }

    /// Called once when the handshake finishes, successfully or not.
    fn authentication_complete(&self, _mechanism: &str, _peer: &str, _success: bool) {}
}

/// Successful result of `establish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstablishOutcome {
    /// The connection is authenticated and ready to `start`.
    Established {
        /// Mechanism that succeeded.
        auth_used: String,
        /// GUID of the remote bus.
        remote_guid: Guid128,
    },
    /// The connection should be retried at `address`; the endpoint is done.
    Redirected {
        /// Connect spec to use instead.
        address: String,
    },
}

/// One handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum AuthFrame {
    Auth {
        mechanism: String,
        initial_response: Vec<u8>,
    },
    Challenge(Vec<u8>),
    Response(Vec<u8>),
    Rejected {
        mechanisms: Vec<String>,
    },
    Accepted {
        guid: Guid128,
    },
    Redirect {
        address: String,
    },
    Begin {
        guid: Guid128,
        name: String,
        features: Features,
    },
    Welcome {
        unique_name: String,
        remote_name: String,
        features: Features,
    },
    Error {
        reason: String,
    },
}

impl AuthFrame {
    fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "Auth",
            Self::Challenge(_) => "Challenge",
            Self::Response(_) => "Response",
            Self::Rejected { .. } => "Rejected",
            Self::Accepted { .. } => "Accepted",
            Self::Redirect { .. } => "Redirect",
            Self::Begin { .. } => "Begin",
            Self::Welcome { .. } => "Welcome",
            Self::Error { .. } => "Error",
        }
    }
}

/// Everything the handshake learned about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Identity {
    pub(crate) mechanism: Mechanism,
    pub(crate) remote_guid: Guid128,
    pub(crate) unique_name: String,
    pub(crate) remote_name: String,
    pub(crate) features: Features,
}

#[derive(Debug)]
pub(crate) enum Handshake {
    Established {
        identity: Identity,
        /// Holds any bytes that arrived behind the final handshake frame.
        decoder: FrameDecoder,
    },
    Redirected {
        address: String,
    },
}

enum Step {
    Done(Identity),
    Redirected(String),
}

/// Features this side asks for, taken from its config.
pub(crate) fn requested_features(config: &EndpointConfig) -> Features {
    Features {
        is_bus_to_bus: config.bus_to_bus,
        allow_remote: config.allow_remote,
        handle_passing: config.handle_passing,
        protocol_version: PROTOCOL_VERSION,
        library_version: library_version(),
        process_id: std::process::id(),
        trusted: false,
    }
}

fn shared_secret_digest(nonce: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn protocol_error(expected: &str, got: &AuthFrame) -> EndpointError {
    AuthError::Protocol(format!("expected {expected}, got {}", got.name())).into()
}

// ── Conversation ────────────────────────────────────────────────────────────

/// Frame-level I/O for the handshake.
struct Conversation<'a> {
    stream: &'a dyn Stream,
    decoder: FrameDecoder,
    frame_timeout: Duration,
    max_frame: usize,
    /// Never raised: the handshake runs on the caller's thread and gives up
    /// through its own timeout.
    exit: AtomicBool,
    /// Mechanism currently being tried.
    current: Option<Mechanism>,
}

impl<'a> Conversation<'a> {
    fn new(stream: &'a dyn Stream, config: &EndpointConfig) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(config.max_message_size),
            frame_timeout: config.auth_timeout(),
            max_frame: config.max_message_size,
            exit: AtomicBool::new(false),
            current: None,
        }
    }

    fn send(&self, frame: &AuthFrame) -> Result<()> {
        let bytes = encode_frame(frame, self.max_frame)?;
        write_fully(self.stream, &bytes, &self.exit)?;
        Ok(())
    }

    /// Wait up to the auth timeout for the peer's next frame.
    fn recv(&mut self) -> Result<AuthFrame> {
        let deadline = Instant::now().checked_add(self.frame_timeout);
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return decode_payload(&payload).map_err(|e| {
                    EndpointError::from(AuthError::Protocol(format!(
                        "undecodable handshake frame: {e}"
                    )))
                });
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.frame_timeout,
            };
            if remaining.is_zero() {
                let millis = u64::try_from(self.frame_timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(AuthError::Timeout(millis).into());
            }
            match self.stream.read(&mut buf, remaining)? {
                ReadOutcome::Data(n) => self.decoder.push(buf.get(..n).unwrap_or_default()),
                ReadOutcome::TimedOut => {}
                ReadOutcome::Closed => return Err(AuthError::StreamClosed.into()),
            }
        }
    }

    /// Best-effort notice to the peer that we are giving up.
    fn abort(&self, reason: &str) {
        let frame = AuthFrame::Error {
            reason: reason.to_string(),
        };
        if let Err(e) = self.send(&frame) {
            debug!("could not tell peer about auth failure: {e}");
        }
    }
}

// ── Negotiator ──────────────────────────────────────────────────────────────

/// Drives one side of the handshake.
pub(crate) struct Negotiator<'a> {
    pub(crate) stream: &'a dyn Stream,
    pub(crate) config: &'a EndpointConfig,
    pub(crate) bus: &'a dyn BusDispatcher,
    pub(crate) listener: Option<&'a dyn AuthListener>,
    /// Connect spec of the peer, passed to the auth listener and used in logs.
    pub(crate) peer: &'a str,
}

impl Negotiator<'_> {
    /// Run the handshake. `mechanisms` is the offer order when `incoming` is
    /// false and the allowed set when it is true.
    pub(crate) fn run(&self, incoming: bool, mechanisms: &[Mechanism]) -> Result<Handshake> {
        let mut conv = Conversation::new(self.stream, self.config);
        let step = if incoming {
            self.accept(&mut conv, mechanisms)
        } else {
            self.connect(&mut conv, mechanisms)
        };
        let mechanism = conv.current.map(Mechanism::name).unwrap_or_default();
        let result = match step {
            Ok(Step::Done(identity)) => {
                info!(
                    "{}: authenticated with {} as {} (remote {})",
                    self.peer, identity.mechanism, identity.unique_name, identity.remote_name
                );
                Ok(Handshake::Established {
                    identity,
                    decoder: conv.decoder,
                })
            }
            Ok(Step::Redirected(address)) => Ok(Handshake::Redirected { address }),
            Err(e) => {
                warn!("{}: authentication failed: {e}", self.peer);
                let peer_gone = matches!(
                    e,
                    EndpointError::Stream(_)
                        | EndpointError::Auth(AuthError::PeerAborted(_) | AuthError::StreamClosed)
                );
                if !peer_gone {
                    conv.abort(&e.to_string());
                }
                Err(e)
            }
        };
        if let Some(listener) = self.listener {
            listener.authentication_complete(mechanism, self.peer, result.is_ok());
        }
        result
    }

    /// Outgoing side.
    fn connect(&self, conv: &mut Conversation, offered: &[Mechanism]) -> Result<Step> {
        let mut candidates: VecDeque<Mechanism> = offered.iter().copied().collect();
        let mut attempts: u16 = 0;
        let mut credentials_rejected: Option<Mechanism> = None;

        let (mechanism, remote_guid) = 'negotiate: loop {
            let Some(mechanism) = candidates.pop_front() else {
                return Err(match credentials_rejected {
                    Some(m) => AuthError::Rejected(m.name().to_string()),
                    None => AuthError::NoCommonMechanism {
                        offered: offered.iter().map(|m| m.name()).collect::<Vec<_>>().join(" "),
                    },
                }
                .into());
            };
            if attempts >= self.config.max_auth_attempts {
                return Err(AuthError::TooManyAttempts(attempts).into());
            }
            attempts = attempts.saturating_add(1);
            conv.current = Some(mechanism);
            debug!("{}: offering {mechanism} (attempt {attempts})", self.peer);
            conv.send(&AuthFrame::Auth {
                mechanism: mechanism.name().to_string(),
                initial_response: self.initial_response(mechanism, attempts),
            })?;

            loop {
                match conv.recv()? {
                    AuthFrame::Challenge(nonce) => {
                        let response = self.challenge_response(mechanism, &nonce, attempts)?;
                        conv.send(&AuthFrame::Response(response))?;
                    }
                    AuthFrame::Accepted { guid } => break 'negotiate (mechanism, guid),
                    AuthFrame::Rejected { mechanisms } => {
                        debug!(
                            "{}: {mechanism} rejected, peer supports [{}]",
                            self.peer,
                            mechanisms.join(" ")
                        );
                        // Still listed means the mechanism was fine and our
                        // credentials were not.
                        if mechanisms.iter().any(|m| m == mechanism.name()) {
                            credentials_rejected = Some(mechanism);
                        }
                        candidates.retain(|c| mechanisms.iter().any(|m| m == c.name()));
                        continue 'negotiate;
                    }
                    AuthFrame::Redirect { address } => {
                        info!("{}: redirected to {address}", self.peer);
                        return Ok(Step::Redirected(address));
                    }
                    AuthFrame::Error { reason } => {
                        return Err(AuthError::PeerAborted(reason).into())
                    }
                    other => return Err(protocol_error("Challenge, Accepted or Rejected", &other)),
                }
            }
        };

        conv.send(&AuthFrame::Begin {
            guid: self.bus.guid(),
            name: self.bus.bus_name(),
            features: requested_features(self.config),
        })?;
        match conv.recv()? {
            AuthFrame::Welcome {
                unique_name,
                remote_name,
                features,
            } => Ok(Step::Done(Identity {
                mechanism,
                remote_guid,
                unique_name,
                remote_name,
                features: Features {
                    trusted: mechanism.is_trusted(),
                    ..features
                },
            })),
            AuthFrame::Error { reason } => Err(AuthError::PeerAborted(reason).into()),
            other => Err(protocol_error("Welcome", &other)),
        }
    }

    /// Incoming side.
    fn accept(&self, conv: &mut Conversation, allowed: &[Mechanism]) -> Result<Step> {
        let allowed_names: Vec<String> = allowed.iter().map(|m| m.name().to_string()).collect();
        let mut attempts: u16 = 0;

        let mechanism = loop {
            let (name, initial_response) = match conv.recv()? {
                AuthFrame::Auth {
                    mechanism,
                    initial_response,
                } => (mechanism, initial_response),
                AuthFrame::Error { reason } => return Err(AuthError::PeerAborted(reason).into()),
                other => return Err(protocol_error("Auth", &other)),
            };
            if attempts >= self.config.max_auth_attempts {
                return Err(AuthError::TooManyAttempts(attempts).into());
            }
            attempts = attempts.saturating_add(1);

            let Some(mechanism) = Mechanism::from_name(&name).filter(|m| allowed.contains(m)) else {
                debug!("{}: peer offered unsupported mechanism {name}", self.peer);
                conv.send(&AuthFrame::Rejected {
                    mechanisms: allowed_names.clone(),
                })?;
                continue;
            };
            conv.current = Some(mechanism);
            if self.verify(conv, mechanism, &initial_response, attempts)? {
                break mechanism;
            }
            debug!("{}: {mechanism} credentials rejected", self.peer);
            conv.send(&AuthFrame::Rejected {
                mechanisms: allowed_names.clone(),
            })?;
        };

        if let Some(address) = &self.config.redirection_address {
            info!("{}: redirecting peer to {address}", self.peer);
            conv.send(&AuthFrame::Redirect {
                address: address.clone(),
            })?;
            return Ok(Step::Redirected(address.clone()));
        }

        conv.send(&AuthFrame::Accepted {
            guid: self.bus.guid(),
        })?;
        let (remote_guid, remote_name, offered) = match conv.recv()? {
            AuthFrame::Begin {
                guid,
                name,
                features,
            } => (guid, name, features),
            AuthFrame::Error { reason } => return Err(AuthError::PeerAborted(reason).into()),
            other => return Err(protocol_error("Begin", &other)),
        };

        let local = requested_features(self.config);
        let is_bus_to_bus = offered.is_bus_to_bus && local.is_bus_to_bus;
        let handle_passing =
            offered.handle_passing && local.handle_passing && mechanism == Mechanism::External;
        let trusted = mechanism.is_trusted();
        let unique_name = self.bus.assign_unique_name();
        conv.send(&AuthFrame::Welcome {
            unique_name: unique_name.clone(),
            remote_name: self.bus.bus_name(),
            features: Features {
                is_bus_to_bus,
                handle_passing,
                trusted,
                ..local
            },
        })?;

        Ok(Step::Done(Identity {
            mechanism,
            remote_guid,
            unique_name,
            remote_name,
            features: Features {
                is_bus_to_bus,
                handle_passing,
                trusted,
                ..offered
            },
        }))
    }

    fn credentials(&self, mechanism: Mechanism, attempt: u16) -> Option<Credentials> {
        self.listener
            .and_then(|l| l.request_credentials(mechanism.name(), self.peer, attempt))
    }

    fn approved(&self, mechanism: Mechanism, credentials: &Credentials) -> bool {
        match self.listener {
            Some(listener) => listener.verify_credentials(mechanism.name(), self.peer, credentials),
            None => true,
        }
    }

    fn initial_response(&self, mechanism: Mechanism, attempt: u16) -> Vec<u8> {
        match mechanism {
            Mechanism::External => self
                .credentials(mechanism, attempt)
                .and_then(|c| c.user_name)
                .unwrap_or_default()
                .into_bytes(),
            Mechanism::Anonymous | Mechanism::SharedSecret => Vec::new(),
        }
    }

    fn challenge_response(
        &self,
        mechanism: Mechanism,
        nonce: &[u8],
        attempt: u16,
    ) -> Result<Vec<u8>> {
        if mechanism != Mechanism::SharedSecret {
            return Err(AuthError::Protocol(format!("unexpected challenge for {mechanism}")).into());
        }
        let secret = self
            .credentials(mechanism, attempt)
            .and_then(|c| c.secret)
            .ok_or_else(|| AuthError::CredentialsUnavailable(mechanism.name().to_string()))?;
        Ok(shared_secret_digest(nonce, &secret))
    }

    /// Check an offer from the peer; `Ok(false)` means reject and let it
    /// try again.
    fn verify(
        &self,
        conv: &mut Conversation,
        mechanism: Mechanism,
        initial_response: &[u8],
        attempt: u16,
    ) -> Result<bool> {
        match mechanism {
            Mechanism::Anonymous => Ok(true),
            Mechanism::External => {
                let credentials = Credentials {
                    user_name: Some(String::from_utf8_lossy(initial_response).into_owned()),
                    secret: None,
                };
                Ok(self.approved(mechanism, &credentials))
            }
            Mechanism::SharedSecret => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                conv.send(&AuthFrame::Challenge(nonce.to_vec()))?;
                let response = match conv.recv()? {
                    AuthFrame::Response(response) => response,
                    AuthFrame::Error { reason } => {
                        return Err(AuthError::PeerAborted(reason).into())
                    }
                    other => return Err(protocol_error("Response", &other)),
                };
                let Some(credentials) = self.credentials(mechanism, attempt) else {
                    warn!("{}: no shared secret available to check peer", self.peer);
                    return Ok(false);
                };
                let Some(secret) = credentials.secret.as_deref() else {
                    return Ok(false);
                };
                let expected = shared_secret_digest(&nonce, secret);
                Ok(constant_time_eq(&expected, &response) && self.approved(mechanism, &credentials))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
