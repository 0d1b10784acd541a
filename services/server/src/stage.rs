//! # Connection Stage Loop
//!
//! ## Purpose
//!
//! The building blocks shared by all negotiation stages. A stage runs two
//! threads over the same socket:
//!
//! ```text
//!            ┌──────────── input thread ────────────┐
//! socket ──▶ │ read tag → HandlerTable → handler    │──push──┐
//!            └──────────────────────────────────────┘        ▼
//!                                                        [Channel]
//!            ┌──────────── output thread ───────────┐        │
//! socket ◀── │ pop → FrameCodec::write_frame        │◀──pop──┘
//!            └──────────────────────────────────────┘
//! ```
//!
//! The input thread stops once a handler invokes the [`StageCloser`] or the
//! peer ends the stream; the output thread stops when its channel closes.
//! A handler records the stage result at most once in a [`StageOutcome`],
//! which the connection reads after both threads have joined.

use crate::error::{StageError, StageResult};
use crate::handler::{HandlerContext, HandlerTable};
use crate::supervisor::ErrorSupervisor;
use channel::{ChannelReceiver, Closeable};
use codec::primitives::read_tag;
use codec::FrameCodec;
use once_cell::sync::OnceCell;
use std::io::{BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use tracing::{debug, trace};
use types::Message;

/// Why a stage's input loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A handler closed the stage (CLOSE frame or a recorded outcome)
    Requested,
    /// The peer ended the stream between frames
    Disconnected,
}

/// One-shot stage completion signal; later invocations are no-ops
#[derive(Debug, Default)]
pub struct StageCloser {
    reason: OnceCell<CloseReason>,
}

impl StageCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        let _ = self.reason.set(CloseReason::Requested);
    }

    pub fn disconnect(&self) {
        let _ = self.reason.set(CloseReason::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        self.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

/// Result slot of a negotiation stage, written at most once
#[derive(Debug)]
pub struct StageOutcome<T> {
    value: OnceCell<T>,
}

impl<T> Default for StageOutcome<T> {
    fn default() -> Self {
        Self {
            value: OnceCell::new(),
        }
    }
}

impl<T> StageOutcome<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: T) -> StageResult<()> {
        self.value
            .set(value)
            .map_err(|_| StageError::protocol("stage outcome supplied twice"))
    }

    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn into_inner(self) -> Option<T> {
        self.value.into_inner()
    }
}

/// Input loop: dispatch frames until the stage is closed or the peer leaves
pub fn read_frames<R: Read>(
    reader: &mut R,
    handlers: &HandlerTable<'_>,
    cx: &HandlerContext<'_>,
) -> StageResult<()> {
    while !cx.closer.is_closed() {
        let Some(id) = read_tag(reader)? else {
            debug!(stage = handlers.stage(), "Peer ended the stream");
            cx.closer.disconnect();
            break;
        };

        trace!(stage = handlers.stage(), id, "Frame received");
        let handler = handlers.get(id).ok_or_else(|| handlers.unexpected(id))?;
        handler.handle(id, reader, cx)?;
    }
    Ok(())
}

/// Output loop: write every queued message, then `trailer` unless the stage failed
pub fn write_frames(
    stream: &TcpStream,
    codec: &FrameCodec,
    outgoing: &ChannelReceiver<Message>,
    trailer: Option<Message>,
    supervisor: &ErrorSupervisor,
) -> StageResult<()> {
    let mut writer = BufWriter::new(stream);
    while let Some(message) = outgoing.pop() {
        trace!(message = %message.describe(), "Frame sent");
        codec.write_frame(&mut writer, &message)?;
        if outgoing.is_empty() {
            writer.flush()?;
        }
    }

    if let Some(trailer) = trailer {
        if !supervisor.has_failed() {
            codec.write_frame(&mut writer, &trailer)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Shuts down one direction of a socket when closed
pub struct SocketShutdown {
    stream: TcpStream,
    how: Shutdown,
}

impl SocketShutdown {
    /// Unblocks a thread parked in `read()` on any clone of `stream`
    pub fn read(stream: &TcpStream) -> std::io::Result<Self> {
        Ok(Self {
            stream: stream.try_clone()?,
            how: Shutdown::Read,
        })
    }

    pub fn both(stream: &TcpStream) -> std::io::Result<Self> {
        Ok(Self {
            stream: stream.try_clone()?,
            how: Shutdown::Both,
        })
    }
}

impl Closeable for SocketShutdown {
    fn close(&self) {
        if let Err(e) = self.stream.shutdown(self.how) {
            trace!(error = %e, "Socket shutdown failed");
        }
    }
}
