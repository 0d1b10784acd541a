//! # Frame Codec
//!
//! ## Purpose
//!
//! Reads and writes whole frames: a little-endian `u16` tag followed by a
//! tag-specific body. Control bodies are fixed by the protocol and handled
//! here; domain bodies are delegated to the connection's [`CodecRegistry`].
//!
//! ## Body Layouts
//!
//! ```text
//! FILENAME  [1024-byte NUL-terminated path]
//! CONFIG    [u32 len][UTF-8 text]
//! HEADER    [u32 len][bytes]
//! CLOSE     (empty)
//! QUERY     [u64 correlation][u64 len][UTF-8 text]
//! RESPONSE  [u64 correlation][u64 len][UTF-8 text]
//! ERROR     [u64 len][UTF-8 text]
//! other     registry codec for the tag, else UnknownMessageId
//! ```

use crate::error::{CodecError, CodecResult};
use crate::primitives::{
    read_bytes_u32, read_fixed_string, read_string_u32, read_string_u64, read_tag, read_u64,
    write_bytes_u32, write_bytes_u64, write_fixed_string, write_tag, write_u64,
};
use crate::registry::{CodecRegistry, FrameLimits};
use bytes::Bytes;
use std::io::{Read, Write};
use std::sync::Arc;
use types::{Message, MessageId, Query, Response};

/// Capacity of the FILENAME body, terminator included
pub const FILENAME_CAPACITY: usize = 1024;

/// Stateless frame reader/writer bound to one codec registry
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<CodecRegistry>,
    limits: FrameLimits,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(CodecRegistry::with_defaults()), FrameLimits::default())
    }
}

impl FrameCodec {
    pub fn new(registry: Arc<CodecRegistry>, limits: FrameLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// Same limits, different registry
    pub fn with_registry(&self, registry: Arc<CodecRegistry>) -> Self {
        Self {
            registry,
            limits: self.limits,
        }
    }

    /// Next frame, or `Ok(None)` when the peer ended the stream between frames
    pub fn read_frame<R: Read + ?Sized>(&self, stream: &mut R) -> CodecResult<Option<Message>> {
        match read_tag(stream)? {
            Some(id) => self.read_body(id, stream).map(Some),
            None => Ok(None),
        }
    }

    /// Decode the body for an already consumed tag
    pub fn read_body<R: Read + ?Sized>(&self, id: u16, mut stream: &mut R) -> CodecResult<Message> {
        let max = self.limits.max_body_size;
        match MessageId::try_from(id) {
            Ok(MessageId::Filename) => {
                read_fixed_string(stream, FILENAME_CAPACITY, "FILENAME body").map(Message::Filename)
            }
            Ok(MessageId::Config) => read_string_u32(stream, max, "CONFIG body").map(Message::Config),
            Ok(MessageId::Header) => {
                read_bytes_u32(stream, max, "HEADER body").map(|b| Message::Header(Bytes::from(b)))
            }
            Ok(MessageId::Close) => Ok(Message::Close),
            Ok(MessageId::Query) => {
                let correlation_id = read_u64(stream, "QUERY correlation id")?;
                let query = read_string_u64(stream, max, "QUERY body")?;
                Ok(Message::Query(Query {
                    correlation_id,
                    query,
                }))
            }
            Ok(MessageId::Response) => {
                let correlation_id = read_u64(stream, "RESPONSE correlation id")?;
                let response = read_string_u64(stream, max, "RESPONSE body")?;
                Ok(Message::Response(Response {
                    correlation_id,
                    response,
                }))
            }
            Ok(MessageId::Error) => read_string_u64(stream, max, "ERROR body").map(Message::Error),
            _ => {
                let codec = self
                    .registry
                    .get(id)
                    .ok_or(CodecError::UnknownMessageId { id })?;
                // `&mut &mut R` is Sized, so it coerces to `&mut dyn Read`
                codec.read(&mut stream, &self.limits)
            }
        }
    }

    /// Encode tag and body
    ///
    /// The frame is encoded in full before anything reaches `stream`, so a
    /// message that fails to encode leaves the stream untouched.
    pub fn write_frame<W: Write + ?Sized>(&self, stream: &mut W, message: &Message) -> CodecResult<()> {
        let frame = self.encode(message)?;
        stream.write_all(&frame).map_err(CodecError::io("writing frame"))
    }

    /// Encode a frame into a fresh buffer
    pub fn encode(&self, message: &Message) -> CodecResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let stream = &mut buffer;
        let id = message.id();
        match message {
            Message::Filename(path) => {
                write_tag(stream, id)?;
                write_fixed_string(stream, path, FILENAME_CAPACITY)?;
            }
            Message::Config(text) => {
                write_tag(stream, id)?;
                write_bytes_u32(stream, text.as_bytes())?;
            }
            Message::Header(raw) => {
                write_tag(stream, id)?;
                write_bytes_u32(stream, raw)?;
            }
            Message::Close => write_tag(stream, id)?,
            Message::Query(query) => {
                write_tag(stream, id)?;
                write_u64(stream, query.correlation_id)?;
                write_bytes_u64(stream, query.query.as_bytes())?;
            }
            Message::Response(response) => {
                write_tag(stream, id)?;
                write_u64(stream, response.correlation_id)?;
                write_bytes_u64(stream, response.response.as_bytes())?;
            }
            Message::Error(text) => {
                write_tag(stream, id)?;
                write_bytes_u64(stream, text.as_bytes())?;
            }
            _ => {
                let codec = self
                    .registry
                    .get(id)
                    .ok_or(CodecError::UnknownMessageId { id })?;
                write_tag(stream, id)?;
                codec.write(stream, message)?;
            }
        }
        Ok(buffer)
    }
}
