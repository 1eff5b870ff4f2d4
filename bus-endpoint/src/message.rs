//! Messages, link-control conventions, and wire framing.
//!
//! Message bodies are opaque to the endpoint; only the header fields needed
//! to classify traffic are interpreted here. Every frame on the wire, both
//! handshake frames and messages, is length-prefixed:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```

use {
    crate::error::{EndpointError, Result},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::collections::VecDeque,
};

/// Interface reserved for link-control traffic. Messages on it are consumed
/// by the endpoint and never reach the bus.
pub const LINK_CONTROL_INTERFACE: &str = "org.trv1.Bus.Link";
/// Member name of an idle probe request.
pub const PROBE_REQ_MEMBER: &str = "ProbeReq";
/// Member name of an idle probe acknowledgement.
pub const PROBE_ACK_MEMBER: &str = "ProbeAck";

/// Size of the length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Kind of bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A method invocation.
    MethodCall,
    /// The reply to a method call.
    MethodReply,
    /// An error reply to a method call.
    Error,
    /// A broadcast or session signal.
    Signal,
}

/// A bus message as seen by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What kind of message this is.
    pub msg_type: MessageType,
    /// Sender-assigned serial number.
    pub serial: u32,
    /// Serial of the call this replies to (replies and errors only).
    pub reply_serial: Option<u32>,
    /// Sender's bus name.
    pub sender: String,
    /// Destination bus name (empty for broadcast signals).
    pub destination: String,
    /// Interface name.
    pub interface: String,
    /// Member name.
    pub member: String,
    /// Marshalled arguments, opaque at this layer.
    pub body: Vec<u8>,
}

/// Which link-control message a [`Message`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Idle probe request.
    Req,
    /// Idle probe acknowledgement.
    Ack,
}

impl Message {
    /// Build a method call.
    pub fn method_call(
        serial: u32,
        destination: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            msg_type: MessageType::MethodCall,
            serial,
            reply_serial: None,
            sender: String::new(),
            destination: destination.into(),
            interface: interface.into(),
            member: member.into(),
            body,
        }
    }

    /// Build the reply to `call`.
    pub fn method_reply(serial: u32, call: &Message, body: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::MethodReply,
            serial,
            reply_serial: Some(call.serial),
            sender: call.destination.clone(),
            destination: call.sender.clone(),
            interface: String::new(),
            member: String::new(),
            body,
        }
    }

    /// Build a signal.
    pub fn signal(
        serial: u32,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            msg_type: MessageType::Signal,
            serial,
            reply_serial: None,
            sender: String::new(),
            destination: String::new(),
            interface: interface.into(),
            member: member.into(),
            body,
        }
    }

    /// Build a ProbeReq (`kind == Req`) or ProbeAck (`kind == Ack`).
    pub fn probe(kind: ProbeKind, serial: u32) -> Self {
        let member = match kind {
            ProbeKind::Req => PROBE_REQ_MEMBER,
            ProbeKind::Ack => PROBE_ACK_MEMBER,
        };
        Self::signal(serial, LINK_CONTROL_INTERFACE, member, Vec::new())
    }

    /// Classify a link-control message. `None` means application traffic.
    pub fn probe_kind(&self) -> Option<ProbeKind> {
        if self.msg_type != MessageType::Signal || self.interface != LINK_CONTROL_INTERFACE {
            return None;
        }
        match self.member.as_str() {
            PROBE_REQ_MEMBER => Some(ProbeKind::Req),
            PROBE_ACK_MEMBER => Some(ProbeKind::Ack),
            _ => None,
        }
    }

    /// Whether this message is a method reply (or error reply).
    pub fn is_reply(&self) -> bool {
        matches!(self.msg_type, MessageType::MethodReply | MessageType::Error)
    }

    /// Return a human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match (self.msg_type, self.probe_kind()) {
            (_, Some(ProbeKind::Req)) => "probe_req",
            (_, Some(ProbeKind::Ack)) => "probe_ack",
            (MessageType::MethodCall, None) => "method_call",
            (MessageType::MethodReply, None) => "method_reply",
            (MessageType::Error, None) => "error",
            (MessageType::Signal, None) => "signal",
        }
    }
}

// ── Framing ─────────────────────────────────────────────────────────────────

/// Serialize `value` with a 4-byte little-endian length prefix.
pub fn encode_frame<T: Serialize>(value: &T, max_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    if payload.len() > max_size {
        return Err(EndpointError::MessageTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| EndpointError::MessageTooLarge {
        size: payload.len(),
        max: max_size,
    })?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one frame payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(EndpointError::Serialization)
}

/// Reassembles frames from arbitrarily split reads.
///
/// Bytes are pushed as they arrive; complete payloads are popped in order.
/// Bytes belonging to a frame that is not complete yet stay buffered, so a
/// decoder can be handed from the auth negotiator to the rx pump without
/// losing data that arrived right behind the last handshake frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: VecDeque<u8>,
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames larger than `max_frame` bytes.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            max_frame,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// Returns `MessageTooLarge` as soon as a header announces an oversized
    /// frame; the stream is unusable after that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        for (dst, src) in header.iter_mut().zip(self.buf.iter()) {
            *dst = *src;
        }
        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame {
            return Err(EndpointError::MessageTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN.saturating_add(len) {
            return Ok(None);
        }
        self.buf.drain(..FRAME_HEADER_LEN);
        Ok(Some(self.buf.drain(..len).collect()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_classification() {
        assert_eq!(Message::probe(ProbeKind::Req, 1).probe_kind(), Some(ProbeKind::Req));
        assert_eq!(Message::probe(ProbeKind::Ack, 2).probe_kind(), Some(ProbeKind::Ack));

        // Same member on another interface is ordinary traffic.
        let msg = Message::signal(3, "org.example.Chat", PROBE_REQ_MEMBER, vec![]);
        assert_eq!(msg.probe_kind(), None);

        // A method call on the reserved interface is not a probe either.
        let msg = Message::method_call(4, ":1.1", LINK_CONTROL_INTERFACE, PROBE_REQ_MEMBER, vec![]);
        assert_eq!(msg.probe_kind(), None);
    }

    #[test]
    fn test_reply_links_back_to_call() {
        let mut call = Message::method_call(7, ":1.2", "org.example.Calc", "Add", vec![1, 2]);
        call.sender = ":1.1".to_string();
        let reply = Message::method_reply(9, &call, vec![3]);
        assert_eq!(reply.reply_serial, Some(7));
        assert_eq!(reply.destination, ":1.1");
        assert!(reply.is_reply());
        assert!(!call.is_reply());
        assert_eq!(reply.kind(), "method_reply");
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let first = Message::signal(1, "org.example.A", "Ping", vec![0xaa; 10]);
        let second = Message::signal(2, "org.example.B", "Pong", vec![0xbb; 300]);
        let mut wire = encode_frame(&first, 1_024).unwrap();
        wire.extend(encode_frame(&second, 1_024).unwrap());

        let mut decoder = FrameDecoder::new(1_024);
        let mut decoded = Vec::new();
        // Feed three bytes at a time to cross every boundary.
        for chunk in wire.chunks(3) {
            decoder.push(chunk);
            while let Some(payload) = decoder.next_frame().unwrap() {
                decoded.push(decode_payload::<Message>(&payload).unwrap());
            }
        }
        assert_eq!(decoded, vec![first, second]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_keeps_trailing_partial_frame() {
        let msg = Message::signal(1, "org.example.A", "Ping", vec![1, 2, 3]);
        let wire = encode_frame(&msg, 1_024).unwrap();
        let mut decoder = FrameDecoder::new(1_024);
        decoder.push(&wire[..wire.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), wire.len() - 1);
        decoder.push(&wire[wire.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let msg = Message::signal(1, "org.example.A", "Big", vec![0; 2_000]);
        assert!(matches!(
            encode_frame(&msg, 1_000),
            Err(EndpointError::MessageTooLarge { max: 1_000, .. })
        ));

        let mut decoder = FrameDecoder::new(16);
        decoder.push(&1_000u32.to_le_bytes());
        assert!(decoder.next_frame().is_err());
    }
}
