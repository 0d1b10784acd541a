//! Config stage: negotiate the pipeline
//!
//! Accepts FILENAME (load `<home>/pipelines/<name>`) or CONFIG (inline TOML),
//! plus QUERY and CLOSE. Scan metadata before a pipeline is a protocol error.

use super::negotiate;
use crate::error::{StageError, StageResult};
use crate::handler::{Handler, HandlerContext, HandlerTable, RejectHandler};
use crate::server::ServerState;
use crate::stage::StageOutcome;
use crate::strategy::StrategyRegistry;
use std::io::Read;
use std::net::TcpStream;
use streamgate_config::PipelineConfig;
use tracing::info;
use types::{Message, MessageId, Paths};

/// Run the Config stage; `None` when the peer left without configuring
pub(super) fn run<R: Read + Send>(
    reader: &mut R,
    stream: &TcpStream,
    state: &ServerState,
) -> StageResult<Option<PipelineConfig>> {
    let outcome = StageOutcome::new();
    let mut handlers = HandlerTable::new("CONFIG");
    handlers
        .with_common(&state.queries)
        .insert(
            MessageId::Filename,
            FilenameHandler {
                paths: &state.services.config.paths,
                strategies: &state.strategies,
                outcome: &outcome,
            },
        )
        .insert(
            MessageId::Config,
            ConfigHandler {
                strategies: &state.strategies,
                outcome: &outcome,
            },
        )
        .insert(
            MessageId::Header,
            RejectHandler::new("HEADER received before a pipeline was configured"),
        );

    negotiate(reader, stream, &state.services.codec, &handlers)?;
    drop(handlers);
    Ok(outcome.into_inner())
}

/// Every stage must name a registered strategy
fn check_strategies(pipeline: &PipelineConfig, strategies: &StrategyRegistry) -> StageResult<()> {
    match pipeline.stages.iter().find(|s| !strategies.contains(&s.strategy)) {
        Some(stage) => Err(stage
            .invalid(format!(
                "unknown strategy '{}' (available: {})",
                stage.strategy,
                strategies.names().join(", ")
            ))
            .into()),
        None => Ok(()),
    }
}

fn accept(
    pipeline: PipelineConfig,
    strategies: &StrategyRegistry,
    outcome: &StageOutcome<PipelineConfig>,
    cx: &HandlerContext<'_>,
) -> StageResult<()> {
    check_strategies(&pipeline, strategies)?;
    info!(
        pipeline = %pipeline.name,
        stages = pipeline.stages.len(),
        "Pipeline configured"
    );
    outcome.set(pipeline)?;
    cx.closer.close();
    Ok(())
}

struct FilenameHandler<'a> {
    paths: &'a Paths,
    strategies: &'a StrategyRegistry,
    outcome: &'a StageOutcome<PipelineConfig>,
}

impl Handler for FilenameHandler<'_> {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        let Message::Filename(name) = cx.read_body(id, stream)? else {
            return Err(StageError::protocol("malformed FILENAME frame"));
        };
        info!(file = %name, "Loading pipeline file");
        let pipeline = PipelineConfig::load(self.paths, &name)?;
        accept(pipeline, self.strategies, self.outcome, cx)
    }
}

struct ConfigHandler<'a> {
    strategies: &'a StrategyRegistry,
    outcome: &'a StageOutcome<PipelineConfig>,
}

impl Handler for ConfigHandler<'_> {
    fn handle(&self, id: u16, stream: &mut dyn Read, cx: &HandlerContext<'_>) -> StageResult<()> {
        let Message::Config(text) = cx.read_body(id, stream)? else {
            return Err(StageError::protocol("malformed CONFIG frame"));
        };
        let pipeline = PipelineConfig::parse(&text)?;
        accept(pipeline, self.strategies, self.outcome, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyRegistry;
    use streamgate_config::StageConfig;

    #[test]
    fn test_unknown_strategy_rejected() {
        let registry = StrategyRegistry::with_defaults();
        let pipeline = PipelineConfig {
            name: "p".into(),
            stages: vec![StageConfig::new("s", "fft")],
        };
        let err = check_strategies(&pipeline, &registry).unwrap_err();
        assert!(matches!(err, StageError::ConfigParse(_)));
        assert!(err.to_string().contains("unknown strategy 'fft'"));

        let pipeline = PipelineConfig {
            name: "p".into(),
            stages: vec![StageConfig::new("s", "external")],
        };
        assert!(check_strategies(&pipeline, &registry).is_ok());
    }
}
