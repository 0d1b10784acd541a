//! # Message Model
//!
//! ## Purpose
//!
//! A [`Message`] is the in-process form of one wire frame. Control messages
//! drive the negotiation stages; domain messages flow through the configured
//! pipeline. Messages are moved, never shared: every channel operation hands
//! ownership to exactly one receiver.
//!
//! ## Tag Organization
//!
//! - **Control (1-8)**: negotiation and diagnostics, legal in every stage where sanctioned
//! - **Domain (1000+)**: payload records handled by registered codecs
//!
//! Tag values are part of the wire contract and must never be renumbered.

use crate::records::{Acquisition, Image, Waveform};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Stable message-type tags carried as the first two bytes of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MessageId {
    // ═══════════════════════════════════════════════════════════════════════
    // Control (1-8)
    // ═══════════════════════════════════════════════════════════════════════
    /// Path of a pipeline description stored on the server
    Filename = 1,
    /// Inline pipeline description
    Config = 2,
    /// Serialized scan metadata
    Header = 3,
    /// Graceful stage termination
    Close = 4,
    /// Free-form text
    Text = 5,
    /// Diagnostic / capability request
    Query = 6,
    /// Answer to a [`MessageId::Query`]
    Response = 7,
    /// Error report sent before a connection is torn down
    Error = 8,

    // ═══════════════════════════════════════════════════════════════════════
    // Domain (1000+)
    // ═══════════════════════════════════════════════════════════════════════
    /// Raw acquisition record
    Acquisition = 1008,
    /// Reconstructed image record
    Image = 1022,
    /// Physiological waveform record
    Waveform = 1026,
}

impl MessageId {
    /// Human readable tag name for logs and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            MessageId::Filename => "FILENAME",
            MessageId::Config => "CONFIG",
            MessageId::Header => "HEADER",
            MessageId::Close => "CLOSE",
            MessageId::Text => "TEXT",
            MessageId::Query => "QUERY",
            MessageId::Response => "RESPONSE",
            MessageId::Error => "ERROR",
            MessageId::Acquisition => "ACQUISITION",
            MessageId::Image => "IMAGE",
            MessageId::Waveform => "WAVEFORM",
        }
    }

    /// Tags that negotiate or describe the connection rather than carry payload
    pub fn is_control(&self) -> bool {
        u16::from(*self) < 1000
    }
}

/// Diagnostic request, answered in place by the receiving stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub correlation_id: u64,
    pub query: String,
}

/// Answer to a [`Query`], echoing its correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub correlation_id: u64,
    pub response: String,
}

/// Opaque payload for tags declared by a pipeline but unknown to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u16,
    pub payload: Bytes,
}

/// Decoded frame payload
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Filename(String),
    Config(String),
    Header(Bytes),
    Close,
    Text(String),
    Query(Query),
    Response(Response),
    Error(String),
    Acquisition(Acquisition),
    Image(Image),
    Waveform(Waveform),
    Raw(RawMessage),
}

impl Message {
    /// Wire tag of this message
    pub fn id(&self) -> u16 {
        let id = match self {
            Message::Filename(_) => MessageId::Filename,
            Message::Config(_) => MessageId::Config,
            Message::Header(_) => MessageId::Header,
            Message::Close => MessageId::Close,
            Message::Text(_) => MessageId::Text,
            Message::Query(_) => MessageId::Query,
            Message::Response(_) => MessageId::Response,
            Message::Error(_) => MessageId::Error,
            Message::Acquisition(_) => MessageId::Acquisition,
            Message::Image(_) => MessageId::Image,
            Message::Waveform(_) => MessageId::Waveform,
            Message::Raw(raw) => return raw.id,
        };
        id.into()
    }

    /// Name used in logs; raw messages report their numeric tag
    pub fn describe(&self) -> String {
        match MessageId::try_from(self.id()) {
            Ok(id) => id.name().to_string(),
            Err(_) => format!("RAW({})", self.id()),
        }
    }

    /// Whether this message carries pipeline payload
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Message::Acquisition(_)
                | Message::Image(_)
                | Message::Waveform(_)
                | Message::Text(_)
                | Message::Raw(_)
        )
    }
}
