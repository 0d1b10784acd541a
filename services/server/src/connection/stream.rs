//! Stream stage: run the negotiated pipeline
//!
//! ```text
//! input thread ─▶ [ch0] ─▶ strategy 1 ─▶ [ch1] ─▶ ... ─▶ strategy N ─▶ [chN] ─▶ output thread
//!      │                                                                 ▲
//!      └──────────────── RESPONSE to QUERY ──────────────────────────────┘
//! ```
//!
//! Without scan metadata the same stage runs as VOID. Data frames are
//! accepted for every tag in the connection's codec registry (defaults plus
//! the codecs pipeline stages declare). After the last result the output
//! thread sends CLOSE, unless the stage failed.

use crate::error::{StageError, StageResult};
use crate::handler::{
    CloseHandler, Handler, HandlerContext, HandlerTable, QueryHandler, RejectHandler,
};
use crate::server::ServerState;
use crate::stage::{read_frames, write_frames, SocketShutdown, StageCloser};
use crate::strategy::{declared_codecs, Processable, StageEnv};
use crate::supervisor::ErrorSupervisor;
use channel::{channel, ChannelReceiver, ChannelSender};
use codec::{CodecRegistry, FrameCodec};
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use streamgate_config::PipelineConfig;
use tracing::{debug, info, trace};
use types::{Message, MessageId, ScanContext};

pub(super) fn run<R: Read + Send>(
    reader: &mut R,
    stream: &TcpStream,
    state: &ServerState,
    pipeline: &PipelineConfig,
    context: Arc<ScanContext>,
) -> StageResult<()> {
    let stage = if context.has_header() { "STREAM" } else { "VOID" };
    info!("Connection state: [{stage}]");

    let codec = connection_codec(&state.services.codec, pipeline)?;
    let strategies = pipeline
        .stages
        .iter()
        .map(|stage_config| {
            state.strategies.build(&StageEnv {
                stage: stage_config,
                context: &context,
                services: &state.services,
            })
        })
        .collect::<StageResult<Vec<_>>>()?;

    let supervisor = ErrorSupervisor::new();
    supervisor.abort_on_error(SocketShutdown::read(stream)?);
    let closer = StageCloser::new();

    let (input_tx, mut downstream) = channel::<Message>();
    let codec = &codec;

    thread::scope(|scope| -> StageResult<()> {
        let mut final_tx = input_tx.clone();
        for strategy in strategies {
            let (tx, rx) = channel();
            let input = std::mem::replace(&mut downstream, rx);
            final_tx = tx.clone();
            spawn_strategy(scope, &supervisor, strategy, input, tx)?;
        }

        let output_rx = downstream;
        let output_supervisor = supervisor.clone();
        supervisor.spawn_scoped(scope, &format!("{stage}-output"), output_rx.clone(), move || {
            write_frames(stream, codec, &output_rx, Some(Message::Close), &output_supervisor)
        })?;

        let closer = &closer;
        let owned_tx = input_tx.clone();
        supervisor.spawn_scoped(scope, &format!("{stage}-input"), owned_tx, move || {
            let mut handlers = HandlerTable::new(stage);
            for id in codec.registry().ids() {
                handlers.insert_raw(id, DataHandler { pipeline: &input_tx });
            }
            handlers
                .insert(MessageId::Query, QueryHandler { responders: &state.queries })
                .insert(MessageId::Close, CloseHandler)
                .insert(MessageId::Config, RejectHandler::new("CONFIG received while streaming"))
                .insert(MessageId::Filename, RejectHandler::new("FILENAME received while streaming"))
                .insert(MessageId::Header, RejectHandler::new("HEADER received while streaming"));

            let cx = HandlerContext {
                codec,
                output: &final_tx,
                closer,
            };
            read_frames(reader, &handlers, &cx)
        })?;
        Ok(())
    })?;

    supervisor.result()?;
    debug!(stage, reason = ?closer.reason(), "Pipeline drained");
    Ok(())
}

/// Default codecs plus every codec a pipeline stage declares
fn connection_codec(base: &FrameCodec, pipeline: &PipelineConfig) -> StageResult<FrameCodec> {
    let mut specs = Vec::new();
    for stage in &pipeline.stages {
        specs.extend(declared_codecs(stage)?);
    }
    Ok(base.with_registry(Arc::new(CodecRegistry::from_specs(&specs))))
}

fn spawn_strategy<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    supervisor: &ErrorSupervisor,
    strategy: Box<dyn Processable>,
    input: ChannelReceiver<Message>,
    output: ChannelSender<Message>,
) -> StageResult<()> {
    let name = strategy.name().to_string();
    let owned = (input.clone(), output.clone());
    let strategy_supervisor = supervisor.clone();
    supervisor.spawn_scoped(scope, &name, owned, move || {
        strategy.process(input, output, &strategy_supervisor)
    })?;
    Ok(())
}

/// Forwards a data frame into the pipeline
struct DataHandler<'a> {
    pipeline: &'a ChannelSender<Message>,
}

impl Handler for DataHandler<'_> {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        let message = cx.read_body(id, stream)?;
        if !message.is_data() {
            return Err(StageError::protocol(format!(
                "{} is not a data message",
                message.describe()
            )));
        }
        if self.pipeline.push(message).is_err() {
            // The first strategy already stopped; the frame is consumed but dropped
            trace!(id, "Pipeline input closed, dropping frame");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_config::StageConfig;

    #[test]
    fn test_connection_codec_merges_declarations() {
        let pipeline = PipelineConfig {
            name: "p".into(),
            stages: vec![
                StageConfig::new("a", "external").with("codecs", vec!["raw:2000"]),
                StageConfig::new("b", "external").with("codecs", vec!["raw:2001", "image"]),
            ],
        };
        let codec = connection_codec(&FrameCodec::default(), &pipeline).unwrap();
        for id in [1008, 1022, 1026, 5, 2000, 2001] {
            assert!(codec.registry().contains(id), "missing codec {id}");
        }
        assert!(!codec.registry().contains(2002));
    }
}
