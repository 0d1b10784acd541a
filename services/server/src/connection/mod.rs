//! # Connection State Machine
//!
//! ## Purpose
//!
//! Drives one client socket through the negotiation stages:
//!
//! ```text
//!  CONFIG ──pipeline──▶ HEADER ──header──▶ STREAM ──▶ END
//!    │                    │ CLOSE / EOF
//!    │ CLOSE / EOF        └──────────────▶ VOID ───▶ END
//!    ▼
//!   END
//! ```
//!
//! Each negotiation stage is a [`HandlerTable`] run by [`negotiate`], which
//! pairs an input thread (socket → handlers) with an output thread
//! (responses → socket). STREAM and VOID run the negotiated pipeline; VOID
//! is the same stage without scan metadata.
//!
//! ## Failure
//!
//! The first error of any stage thread ends the connection. The server
//! makes a best-effort attempt to send an ERROR frame with the error text
//! before shutting the socket down.

mod config;
mod header;
mod stream;

use crate::error::StageResult;
use crate::handler::{HandlerContext, HandlerTable};
use crate::server::ServerState;
use crate::stage::{read_frames, write_frames, CloseReason, SocketShutdown, StageCloser};
use crate::supervisor::ErrorSupervisor;
use channel::channel;
use codec::FrameCodec;
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, info_span};
use types::{Message, ScanContext};

/// One accepted client socket
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    state: Arc<ServerState>,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            id,
            peer,
            stream,
            state,
        })
    }

    /// Run the connection to completion, reporting a failure to the peer
    pub fn handle(self) -> StageResult<()> {
        let span = info_span!("connection", id = self.id, peer = %self.peer);
        let _enter = span.enter();
        info!("Client connected");

        let result = self.run();
        match &result {
            Ok(()) => info!("Connection finished"),
            Err(err) => {
                error!(kind = err.kind(), error = %err, "Connection failed");
                self.report(&err.to_string());
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        result
    }

    fn run(&self) -> StageResult<()> {
        let mut reader = BufReader::new(self.stream.try_clone()?);

        info!("Connection state: [CONFIG]");
        let Some(pipeline) = config::run(&mut reader, &self.stream, &self.state)? else {
            info!("Peer left before configuring a pipeline");
            return Ok(());
        };

        info!("Connection state: [HEADER]");
        let header = match header::run(&mut reader, &self.stream, &self.state)? {
            header::HeaderOutcome::Header(header) => Some(header),
            header::HeaderOutcome::Void => None,
        };

        let context = Arc::new(ScanContext::new(
            header,
            self.state.services.config.paths.clone(),
            self.arguments(),
        ));
        stream::run(&mut reader, &self.stream, &self.state, &pipeline, context)
    }

    /// Server arguments visible to strategies
    fn arguments(&self) -> BTreeMap<String, String> {
        let config = &self.state.services.config;
        BTreeMap::from([
            ("listen".to_string(), config.listen.to_string()),
            ("home".to_string(), config.paths.home.display().to_string()),
            ("peer".to_string(), self.peer.to_string()),
        ])
    }

    fn report(&self, text: &str) {
        let mut stream = &self.stream;
        if let Err(e) = self
            .state
            .services
            .codec
            .write_frame(&mut stream, &Message::Error(text.to_string()))
        {
            debug!(error = %e, "Could not deliver ERROR frame");
        }
    }
}

/// Run one negotiation stage until a handler closes it or the peer leaves
pub(crate) fn negotiate<R: Read + Send>(
    reader: &mut R,
    stream: &TcpStream,
    codec: &FrameCodec,
    handlers: &HandlerTable<'_>,
) -> StageResult<CloseReason> {
    let stage = handlers.stage();
    let supervisor = ErrorSupervisor::new();
    supervisor.abort_on_error(SocketShutdown::read(stream)?);

    let (tx, rx) = channel::<Message>();
    let closer = StageCloser::new();

    thread::scope(|scope| -> StageResult<()> {
        let input_tx = tx.clone();
        let closer = &closer;
        supervisor.spawn_scoped(scope, &format!("{stage}-input"), tx, move || {
            let cx = HandlerContext {
                codec,
                output: &input_tx,
                closer,
            };
            read_frames(reader, handlers, &cx)
        })?;

        let output_rx = rx.clone();
        let output_supervisor = supervisor.clone();
        supervisor.spawn_scoped(scope, &format!("{stage}-output"), rx, move || {
            write_frames(stream, codec, &output_rx, None, &output_supervisor)
        })?;
        Ok(())
    })?;

    supervisor.result()?;
    let reason = closer.reason().unwrap_or(CloseReason::Disconnected);
    if reason == CloseReason::Disconnected {
        debug!(stage, "Peer disconnected mid-negotiation");
    }
    Ok(reason)
}
