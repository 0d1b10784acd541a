//! # Message Codec Registry
//!
//! ## Purpose
//!
//! Domain data frames are decoded by codecs selected on the frame tag. A
//! [`CodecRegistry`] is built per connection or per external link: the
//! default set, plus whatever additional codecs a pipeline stage declares
//! through [`CodecSpec`] strings such as `"raw:2000"`.
//!
//! ## Integration Points
//!
//! - **Stream stage**: decodes inbound data frames before they enter the pipeline
//! - **External bridge / remote workers**: serialize messages to and from worker links
//! - **Queries**: `streamgate::codecs` lists [`CodecRegistry::names`]

use crate::error::{CodecError, CodecResult};
use crate::primitives::{
    read_bytes_u64, read_f32_array, read_string_u32, read_string_u64, read_u32_array,
    write_bytes_u32, write_bytes_u64, write_f32_array, write_u32_array,
};
use crate::records::{
    read_header, write_header, WireAcquisitionHeader, WireImageHeader, WireWaveformHeader,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use types::{Acquisition, Image, Message, MessageId, RawMessage, Waveform};

/// Upper bounds applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest length-prefixed body or element array accepted, in bytes
    pub max_body_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_body_size: 256 * 1024 * 1024, // 256MB
        }
    }
}

/// Reader/writer pair for one domain tag
pub trait MessageCodec: Send + Sync {
    /// Tag this codec owns
    fn id(&self) -> u16;

    /// Catalog name, as written in pipeline declarations
    fn name(&self) -> String;

    /// Decode a body; the stream is positioned just after the tag
    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message>;

    /// Encode a body, without the tag
    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()>;
}

fn mismatch(codec: &str, message: &Message) -> CodecError {
    CodecError::protocol(format!(
        "{codec} codec cannot encode {} message",
        message.describe()
    ))
}

pub struct AcquisitionCodec;

impl MessageCodec for AcquisitionCodec {
    fn id(&self) -> u16 {
        MessageId::Acquisition.into()
    }

    fn name(&self) -> String {
        "acquisition".to_string()
    }

    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message> {
        let wire: WireAcquisitionHeader = read_header(stream, "ACQUISITION header")?;
        let header = types::AcquisitionHeader::from(&wire);
        let trajectory = read_f32_array(
            stream,
            header.trajectory_len(),
            limits.max_body_size,
            "ACQUISITION trajectory",
        )?;
        let data = read_f32_array(
            stream,
            header.data_len(),
            limits.max_body_size,
            "ACQUISITION data",
        )?;
        Ok(Message::Acquisition(Acquisition {
            header,
            trajectory,
            data,
        }))
    }

    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()> {
        let Message::Acquisition(acquisition) = message else {
            return Err(mismatch("acquisition", message));
        };
        if !acquisition.is_consistent() {
            return Err(CodecError::protocol(
                "acquisition payload length disagrees with its header",
            ));
        }
        write_header(stream, &WireAcquisitionHeader::from(&acquisition.header))?;
        write_f32_array(stream, &acquisition.trajectory)?;
        write_f32_array(stream, &acquisition.data)
    }
}

pub struct WaveformCodec;

impl MessageCodec for WaveformCodec {
    fn id(&self) -> u16 {
        MessageId::Waveform.into()
    }

    fn name(&self) -> String {
        "waveform".to_string()
    }

    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message> {
        let wire: WireWaveformHeader = read_header(stream, "WAVEFORM header")?;
        let header = types::WaveformHeader::from(&wire);
        let data = read_u32_array(
            stream,
            header.data_len(),
            limits.max_body_size,
            "WAVEFORM data",
        )?;
        Ok(Message::Waveform(Waveform { header, data }))
    }

    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()> {
        let Message::Waveform(waveform) = message else {
            return Err(mismatch("waveform", message));
        };
        if waveform.data.len() != waveform.header.data_len() {
            return Err(CodecError::protocol(
                "waveform payload length disagrees with its header",
            ));
        }
        write_header(stream, &WireWaveformHeader::from(&waveform.header))?;
        write_u32_array(stream, &waveform.data)
    }
}

pub struct ImageCodec;

impl MessageCodec for ImageCodec {
    fn id(&self) -> u16 {
        MessageId::Image.into()
    }

    fn name(&self) -> String {
        "image".to_string()
    }

    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message> {
        let wire: WireImageHeader = read_header(stream, "IMAGE header")?;
        let header = types::ImageHeader::from(&wire);
        let meta = read_string_u64(stream, limits.max_body_size, "IMAGE meta")?;
        let data = read_f32_array(
            stream,
            header.data_len(),
            limits.max_body_size,
            "IMAGE data",
        )?;
        Ok(Message::Image(Image { header, meta, data }))
    }

    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()> {
        let Message::Image(image) = message else {
            return Err(mismatch("image", message));
        };
        if image.data.len() != image.header.data_len() {
            return Err(CodecError::protocol(
                "image payload length disagrees with its header",
            ));
        }
        write_header(stream, &WireImageHeader::from(&image.header))?;
        write_bytes_u64(stream, image.meta.as_bytes())?;
        write_f32_array(stream, &image.data)
    }
}

pub struct TextCodec;

impl MessageCodec for TextCodec {
    fn id(&self) -> u16 {
        MessageId::Text.into()
    }

    fn name(&self) -> String {
        "text".to_string()
    }

    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message> {
        read_string_u32(stream, limits.max_body_size, "TEXT body").map(Message::Text)
    }

    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()> {
        let Message::Text(text) = message else {
            return Err(mismatch("text", message));
        };
        write_bytes_u32(stream, text.as_bytes())
    }
}

/// Pass-through codec for tags the server does not interpret
pub struct RawCodec {
    id: u16,
}

impl RawCodec {
    pub fn new(id: u16) -> Self {
        Self { id }
    }
}

impl MessageCodec for RawCodec {
    fn id(&self) -> u16 {
        self.id
    }

    fn name(&self) -> String {
        format!("raw:{}", self.id)
    }

    fn read(&self, stream: &mut dyn Read, limits: &FrameLimits) -> CodecResult<Message> {
        let payload = read_bytes_u64(stream, limits.max_body_size, "raw body")?;
        Ok(Message::Raw(RawMessage {
            id: self.id,
            payload: Bytes::from(payload),
        }))
    }

    fn write(&self, stream: &mut dyn Write, message: &Message) -> CodecResult<()> {
        match message {
            Message::Raw(raw) if raw.id == self.id => write_bytes_u64(stream, &raw.payload),
            other => Err(mismatch(&self.name(), other)),
        }
    }
}

/// Declarative codec reference used in pipeline descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CodecSpec {
    Acquisition,
    Waveform,
    Image,
    Text,
    Raw(u16),
}

impl CodecSpec {
    /// Codecs every registry starts with
    pub const DEFAULTS: [CodecSpec; 4] = [
        CodecSpec::Acquisition,
        CodecSpec::Waveform,
        CodecSpec::Image,
        CodecSpec::Text,
    ];

    pub fn build(&self) -> Arc<dyn MessageCodec> {
        match self {
            CodecSpec::Acquisition => Arc::new(AcquisitionCodec),
            CodecSpec::Waveform => Arc::new(WaveformCodec),
            CodecSpec::Image => Arc::new(ImageCodec),
            CodecSpec::Text => Arc::new(TextCodec),
            CodecSpec::Raw(id) => Arc::new(RawCodec::new(*id)),
        }
    }
}

impl FromStr for CodecSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim().to_ascii_lowercase();
        match spec.as_str() {
            "acquisition" => Ok(CodecSpec::Acquisition),
            "waveform" => Ok(CodecSpec::Waveform),
            "image" => Ok(CodecSpec::Image),
            "text" => Ok(CodecSpec::Text),
            _ => {
                let id = spec
                    .strip_prefix("raw:")
                    .ok_or_else(|| format!("unknown codec '{s}'"))?
                    .parse::<u16>()
                    .map_err(|e| format!("invalid raw codec tag in '{s}': {e}"))?;
                if MessageId::try_from(id).is_ok() {
                    return Err(format!("raw codec tag {id} collides with a built-in message id"));
                }
                Ok(CodecSpec::Raw(id))
            }
        }
    }
}

impl TryFrom<String> for CodecSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CodecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecSpec::Acquisition => f.write_str("acquisition"),
            CodecSpec::Waveform => f.write_str("waveform"),
            CodecSpec::Image => f.write_str("image"),
            CodecSpec::Text => f.write_str("text"),
            CodecSpec::Raw(id) => write!(f, "raw:{id}"),
        }
    }
}

impl From<CodecSpec> for String {
    fn from(spec: CodecSpec) -> Self {
        spec.to_string()
    }
}

/// Tag → codec table, scoped to one connection or link
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<u16, Arc<dyn MessageCodec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding [`CodecSpec::DEFAULTS`]
    pub fn with_defaults() -> Self {
        Self::from_specs(&[])
    }

    /// Defaults plus declared additions; later declarations replace earlier ones
    pub fn from_specs(additional: &[CodecSpec]) -> Self {
        let mut registry = Self::empty();
        for spec in CodecSpec::DEFAULTS.iter().chain(additional) {
            registry.register(spec.build());
        }
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn MessageCodec>) {
        if let Some(previous) = self.codecs.insert(codec.id(), codec) {
            tracing::debug!(id = previous.id(), name = %previous.name(), "Replaced codec");
        }
    }

    pub fn get(&self, id: u16) -> Option<&Arc<dyn MessageCodec>> {
        self.codecs.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.codecs.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.codecs.keys().copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.codecs.values().map(|c| c.name()).collect()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
