//! # Streamgate Wire Codec
//!
//! ## Purpose
//!
//! The "rules" layer between plain data definitions in `types` and the
//! socket plumbing in the server: frame tags, body layouts and the codec
//! registry that decodes domain records.
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → services/server
//!     ↑           ↓             ↓
//! Pure Data   Frame Rules    Connections
//! Message     FrameCodec     Stage loops
//! Records     CodecRegistry  External links
//! ```
//!
//! ## What This Crate Contains
//! - [`FrameCodec`]: tag dispatch, control bodies, size limits
//! - [`CodecRegistry`] and the built-in [`MessageCodec`]s
//! - [`CodecSpec`]: declarative codec names used by pipeline descriptions
//! - Little-endian primitives and zerocopy record headers
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling
//! - Stage semantics (which tags are legal when)

pub mod error;
pub mod frame;
pub mod primitives;
pub mod records;
pub mod registry;

pub use error::{CodecError, CodecResult};
pub use frame::{FrameCodec, FILENAME_CAPACITY};
pub use registry::{
    AcquisitionCodec, CodecRegistry, CodecSpec, FrameLimits, ImageCodec, MessageCodec, RawCodec,
    TextCodec, WaveformCodec,
};
