//! # Handler Tables
//!
//! ## Purpose
//!
//! Each negotiation stage owns a table mapping a message tag to a
//! [`Handler`]. The stage's input thread reads a tag, looks it up and hands
//! the handler the stream positioned just after the tag. A handler then does
//! one of four things:
//!
//! - parse a body and record a stage outcome, then close the stage
//! - answer a query by pushing a response onto the output channel
//! - close the stage with no payload
//! - fail with a protocol error for a tag the stage must not accept
//!
//! Tables are built per stage and borrow stage-local state, so handlers
//! never touch process-wide mutable data.

use crate::error::{StageError, StageResult};
use crate::query::QueryResponders;
use crate::stage::StageCloser;
use channel::ChannelSender;
use codec::{CodecError, FrameCodec};
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;
use types::{Message, MessageId};

/// What a handler may touch while processing one frame
pub struct HandlerContext<'a> {
    pub codec: &'a FrameCodec,
    /// Frames pushed here are written back to the peer
    pub output: &'a ChannelSender<Message>,
    pub closer: &'a StageCloser,
}

impl HandlerContext<'_> {
    /// Decode the body of the frame whose tag was just read
    pub fn read_body(&self, id: u16, stream: &mut dyn Read) -> StageResult<Message> {
        Ok(self.codec.read_body(id, stream)?)
    }

    /// Queue a frame for the peer
    ///
    /// Once the output side has finished (the pipeline drained, or the stage
    /// already failed) the frame is dropped.
    pub fn respond(&self, message: Message) {
        if let Err(closed) = self.output.push(message) {
            debug!(message = %closed.into_inner().describe(), "Output closed, dropping reply");
        }
    }
}

pub trait Handler: Send + Sync {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()>;
}

impl<F> Handler for F
where
    F: Fn(u16, &mut dyn Read, &HandlerContext<'_>) -> StageResult<()> + Send + Sync,
{
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        self(id, stream, cx)
    }
}

/// Tag → handler table for one stage
pub struct HandlerTable<'a> {
    stage: &'static str,
    handlers: BTreeMap<u16, Box<dyn Handler + 'a>>,
}

impl<'a> HandlerTable<'a> {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            handlers: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn insert(&mut self, id: MessageId, handler: impl Handler + 'a) -> &mut Self {
        self.insert_raw(id.into(), handler)
    }

    pub fn insert_raw(&mut self, id: u16, handler: impl Handler + 'a) -> &mut Self {
        self.handlers.insert(id, Box::new(handler));
        self
    }

    /// QUERY and CLOSE, legal in every stage
    pub fn with_common(&mut self, responders: &'a QueryResponders) -> &mut Self {
        self.insert(MessageId::Query, QueryHandler { responders })
            .insert(MessageId::Close, CloseHandler)
    }

    pub fn get(&self, id: u16) -> Option<&(dyn Handler + 'a)> {
        self.handlers.get(&id).map(|h| h.as_ref())
    }

    /// Error for a tag this stage has no handler for
    pub fn unexpected(&self, id: u16) -> StageError {
        match MessageId::try_from(id) {
            Ok(known) => StageError::protocol(format!(
                "{} message is not valid in the {} stage",
                known.name(),
                self.stage
            )),
            Err(_) => CodecError::UnknownMessageId { id }.into(),
        }
    }
}

/// Answers QUERY frames from the server's responder table
pub struct QueryHandler<'a> {
    pub responders: &'a QueryResponders,
}

impl Handler for QueryHandler<'_> {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        match cx.read_body(id, stream)? {
            Message::Query(query) => {
                cx.respond(Message::Response(self.responders.answer(&query)));
                Ok(())
            }
            other => Err(StageError::protocol(format!(
                "expected QUERY body, decoded {}",
                other.describe()
            ))),
        }
    }
}

/// Peer-requested graceful end of the stage
pub struct CloseHandler;

impl Handler for CloseHandler {
    fn handle(&self, _id: u16, _stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        debug!("Peer closed stage");
        cx.closer.close();
        Ok(())
    }
}

/// Fails the stage for a tag that is known but forbidden here
pub struct RejectHandler {
    reason: String,
}

impl RejectHandler {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Handler for RejectHandler {
    fn handle(&self, _id: u16, _stream: &mut dyn Read, _cx: &HandlerContext<'_>) -> StageResult<()> {
        Err(StageError::protocol(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::channel;
    use std::io::Cursor;
    use types::Query;

    #[test]
    fn test_query_handler_pushes_response() {
        let responders = QueryResponders::with_defaults(vec![], vec![]);
        let mut table = HandlerTable::new("CONFIG");
        table.with_common(&responders);

        let codec = FrameCodec::default();
        let (tx, rx) = channel();
        let closer = StageCloser::new();
        let cx = HandlerContext {
            codec: &codec,
            output: &tx,
            closer: &closer,
        };

        let frame = codec
            .encode(&Message::Query(Query {
                correlation_id: 9,
                query: "streamgate::health".into(),
            }))
            .unwrap();
        let mut body = Cursor::new(frame[2..].to_vec());
        table.get(6).unwrap().handle(6, &mut body, &cx).unwrap();

        match rx.try_pop() {
            Some(Message::Response(response)) => {
                assert_eq!(response.correlation_id, 9);
                assert_eq!(response.response, "ok");
            }
            other => panic!("unexpected output: {other:?}"),
        }
        assert!(!closer.is_closed());

        table.get(4).unwrap().handle(4, &mut Cursor::new(vec![]), &cx).unwrap();
        assert!(closer.is_closed());
    }

    #[test]
    fn test_query_after_output_closed_is_dropped() {
        let responders = QueryResponders::with_defaults(vec![], vec![]);
        let mut table = HandlerTable::new("STREAM");
        table.with_common(&responders);

        let codec = FrameCodec::default();
        let (tx, rx) = channel();
        tx.close();
        let closer = StageCloser::new();
        let cx = HandlerContext {
            codec: &codec,
            output: &tx,
            closer: &closer,
        };

        let frame = codec
            .encode(&Message::Query(Query {
                correlation_id: 1,
                query: "streamgate::health".into(),
            }))
            .unwrap();
        let mut body = Cursor::new(frame[2..].to_vec());
        table.get(6).unwrap().handle(6, &mut body, &cx).unwrap();
        assert_eq!(rx.try_pop(), None);
        assert_eq!(body.position() as usize, frame.len() - 2);
    }

    #[test]
    fn test_unexpected_tags() {
        let table = HandlerTable::new("HEADER");
        let known = table.unexpected(1008);
        assert!(known.to_string().contains("ACQUISITION message is not valid in the HEADER stage"));

        let unknown = table.unexpected(0xFFFF);
        assert!(matches!(unknown, StageError::Protocol(_)));
        assert!(unknown.to_string().contains("0xffff"));
    }

    #[test]
    fn test_closure_handlers() {
        let mut table = HandlerTable::new("TEST");
        table.insert_raw(2000, |_id: u16, _s: &mut dyn Read, cx: &HandlerContext<'_>| {
            cx.closer.close();
            Ok(())
        });
        assert!(table.get(2000).is_some());
        assert!(table.get(2001).is_none());
    }
}
