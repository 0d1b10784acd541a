//! Header stage: receive scan metadata
//!
//! HEADER moves the connection to STREAM. CLOSE, or the peer ending its
//! side of the stream, without a header moves it to VOID. A second pipeline
//! description is a protocol error.

use super::negotiate;
use crate::error::{StageError, StageResult};
use crate::handler::{Handler, HandlerContext, HandlerTable, RejectHandler};
use crate::server::ServerState;
use crate::stage::{CloseReason, StageOutcome};
use std::io::Read;
use std::net::TcpStream;
use tracing::{debug, info};
use types::{Message, MessageId, ScanHeader};

#[derive(Debug)]
pub(super) enum HeaderOutcome {
    Header(ScanHeader),
    /// Peer closed the stage, or its write side, without metadata
    Void,
}

pub(super) fn run<R: Read + Send>(
    reader: &mut R,
    stream: &TcpStream,
    state: &ServerState,
) -> StageResult<HeaderOutcome> {
    let outcome = StageOutcome::new();
    let mut handlers = HandlerTable::new("HEADER");
    handlers
        .with_common(&state.queries)
        .insert(MessageId::Header, HeaderHandler { outcome: &outcome })
        .insert(
            MessageId::Config,
            RejectHandler::new("CONFIG received after the pipeline was configured"),
        )
        .insert(
            MessageId::Filename,
            RejectHandler::new("FILENAME received after the pipeline was configured"),
        );

    let reason = negotiate(reader, stream, &state.services.codec, &handlers)?;
    drop(handlers);

    Ok(match (outcome.into_inner(), reason) {
        (Some(header), _) => HeaderOutcome::Header(header),
        (None, CloseReason::Requested) => HeaderOutcome::Void,
        (None, CloseReason::Disconnected) => {
            debug!("Peer ended its stream without a header, running without metadata");
            HeaderOutcome::Void
        }
    })
}

struct HeaderHandler<'a> {
    outcome: &'a StageOutcome<ScanHeader>,
}

impl Handler for HeaderHandler<'_> {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        let Message::Header(raw) = cx.read_body(id, stream)? else {
            return Err(StageError::protocol("malformed HEADER frame"));
        };
        let header = ScanHeader::parse(&raw)?;
        info!(bytes = raw.len(), "Scan header received");
        self.outcome.set(header)?;
        cx.closer.close();
        Ok(())
    }
}
