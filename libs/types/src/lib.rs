//! # Streamgate Types Library
//!
//! Pure data definitions shared by every streamgate crate. Nothing in here
//! touches a socket or a thread; encoding rules live in `codec`, runtime
//! plumbing lives in `channel` and the server.
//!
//! ## Contents
//!
//! - **Message Model**: [`Message`] and the stable [`MessageId`] tag registry
//! - **Domain Records**: [`Acquisition`], [`Waveform`] and [`Image`] payloads
//! - **Scan Context**: [`ScanHeader`], [`ScanContext`] and [`Paths`]
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → libs/codec → services/server
//!     ↑            ↓              ↓
//! Pure Data    Wire Rules     Connection Stages
//! Message      Frame Codec    Strategies
//! ```

pub mod context;
pub mod message;
pub mod records;

pub use context::{HeaderParseError, Paths, ScanContext, ScanHeader};
pub use message::{Message, MessageId, Query, RawMessage, Response};
pub use records::{Acquisition, AcquisitionHeader, Image, ImageHeader, Waveform, WaveformHeader};
