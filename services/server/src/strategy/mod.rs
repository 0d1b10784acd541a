//! # Execution Strategies
//!
//! ## Purpose
//!
//! A negotiated pipeline is a list of stages, each naming a strategy. The
//! Stream stage asks the [`StrategyRegistry`] to build one [`Processable`]
//! per pipeline stage and chains them with channels:
//!
//! ```text
//! socket ─▶ [ch0] ─▶ strategy 1 ─▶ [ch1] ─▶ ... ─▶ strategy N ─▶ [chN] ─▶ socket
//! ```
//!
//! ## Built-in Strategies
//!
//! - **external**: [`ExternalBridge`], one out-of-process module over a local TCP link
//! - **distributed**: [`DistributedPool`], order-preserving fan-out to remote workers
//!
//! Integrators register further strategies under new names; in-process
//! strategies only need to implement [`Processable`].

pub mod distributed;
pub mod external;
pub mod launcher;
pub mod worker;

pub use distributed::DistributedPool;
pub use external::ExternalBridge;
pub use launcher::{CommandLauncher, ModuleLauncher};
pub use worker::{RemoteWorkerSource, Worker, WorkerSource};

use crate::error::{StageError, StageResult};
use crate::supervisor::ErrorSupervisor;
use channel::{ChannelReceiver, ChannelSender};
use codec::{CodecSpec, FrameCodec};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use streamgate_config::{ServerConfig, StageConfig};
use types::{Message, ScanContext};

/// A pipeline stage that turns an input message stream into an output stream
pub trait Processable: Send {
    /// Name used in thread names and diagnostics
    fn name(&self) -> &str;

    /// Run to completion
    ///
    /// Implementations close `output` when they finish and stop early when
    /// a push to `output` fails because downstream went away.
    fn process(
        self: Box<Self>,
        input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        supervisor: &ErrorSupervisor,
    ) -> StageResult<()>;
}

/// Server-wide collaborators available to strategy factories
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ServerConfig>,
    pub launcher: Arc<dyn ModuleLauncher>,
    /// Runtime executing distributed jobs
    pub runtime: tokio::runtime::Handle,
    /// Frame codec carrying the server's wire limits
    pub codec: FrameCodec,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything a factory may use to build one strategy instance
pub struct StageEnv<'a> {
    pub stage: &'a StageConfig,
    pub context: &'a Arc<ScanContext>,
    pub services: &'a Services,
}

pub type StrategyFactory =
    Arc<dyn Fn(&StageEnv<'_>) -> StageResult<Box<dyn Processable>> + Send + Sync>;

/// Strategy name → factory
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding `external` and `distributed`
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(external::STRATEGY_NAME, |env| {
            Ok(Box::new(ExternalBridge::from_env(env)?) as Box<dyn Processable>)
        });
        registry.register(distributed::STRATEGY_NAME, |env| {
            Ok(Box::new(DistributedPool::from_env(env)?) as Box<dyn Processable>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StageEnv<'_>) -> StageResult<Box<dyn Processable>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Instantiate the strategy a stage names
    pub fn build(&self, env: &StageEnv<'_>) -> StageResult<Box<dyn Processable>> {
        let factory = self.factories.get(&env.stage.strategy).ok_or_else(|| {
            env.stage.invalid(format!(
                "unknown strategy '{}' (available: {})",
                env.stage.strategy,
                self.names().join(", ")
            ))
        })?;
        factory(env)
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Codecs a stage declares through its `codecs` property
pub fn declared_codecs(stage: &StageConfig) -> StageResult<Vec<CodecSpec>> {
    match stage.properties.get("codecs") {
        None => Ok(Vec::new()),
        Some(value) => value
            .clone()
            .try_into::<Vec<CodecSpec>>()
            .map_err(|e| {
                StageError::from(stage.invalid(format!("invalid `codecs`: {}", e.message())))
            }),
    }
}
