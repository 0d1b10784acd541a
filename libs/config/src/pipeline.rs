//! # Pipeline Descriptions
//!
//! ## Purpose
//!
//! A client negotiates what a connection runs by sending a pipeline
//! description during the Config stage, either inline (CONFIG) or by naming
//! a file under `<home>/pipelines` (FILENAME). Descriptions are TOML:
//!
//! ```toml
//! name = "recon"
//!
//! [[stages]]
//! name = "fft"
//! strategy = "external"
//! module_type = "python"
//! module = "fft_worker"
//! codecs = ["raw:2000"]
//! ```
//!
//! Every key of a stage other than `name` and `strategy` is kept in
//! [`StageConfig::properties`] and interpreted by the strategy through a
//! typed view such as [`ExternalSettings`] or [`DistributedSettings`].

use codec::CodecSpec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use types::Paths;

#[derive(Debug, Error)]
pub enum ConfigParseError {
    #[error("Pipeline syntax error: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("Pipeline '{name}' declares no stages")]
    NoStages { name: String },

    #[error("Invalid settings for stage '{stage}': {message}")]
    InvalidStage { stage: String, message: String },

    #[error("Pipeline path '{name}' escapes the pipelines directory")]
    PathTraversal { name: String },

    #[error("Failed to read pipeline file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize pipeline: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Ordered list of stages negotiated for one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage: a strategy name plus its free-form properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub strategy: String,

    #[serde(flatten)]
    pub properties: toml::Table,
}

impl PipelineConfig {
    /// Parse a TOML description; zero stages is an error
    pub fn parse(text: &str) -> Result<Self, ConfigParseError> {
        let pipeline: PipelineConfig = toml::from_str(text)?;
        if pipeline.stages.is_empty() {
            return Err(ConfigParseError::NoStages {
                name: pipeline.name,
            });
        }
        debug!(
            pipeline = %pipeline.name,
            stages = pipeline.stages.len(),
            "Parsed pipeline description"
        );
        Ok(pipeline)
    }

    /// Load `<home>/pipelines/<name>`
    pub fn load(paths: &Paths, name: &str) -> Result<Self, ConfigParseError> {
        let path = resolve_pipeline_path(paths, name)?;
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigParseError::Read { path, source })?;
        Self::parse(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigParseError> {
        Ok(toml::to_string(self)?)
    }
}

impl StageConfig {
    pub fn new(name: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: strategy.into(),
            properties: toml::Table::new(),
        }
    }

    /// Builder-style property insertion
    pub fn with(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Deserialize the properties into a typed view
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, ConfigParseError> {
        toml::Value::Table(self.properties.clone())
            .try_into()
            .map_err(|e: toml::de::Error| self.invalid(e.message()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigParseError> {
        Ok(toml::to_string(self)?)
    }

    pub fn invalid(&self, message: impl Into<String>) -> ConfigParseError {
        ConfigParseError::InvalidStage {
            stage: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Map a FILENAME body to a path below the pipelines directory
pub fn resolve_pipeline_path(paths: &Paths, name: &str) -> Result<PathBuf, ConfigParseError> {
    let relative = Path::new(name);
    let contained = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(ConfigParseError::PathTraversal {
            name: name.to_string(),
        });
    }
    Ok(paths.pipelines_dir().join(relative))
}

/// Properties of an `external` stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSettings {
    /// Key into the server's launcher table
    pub module_type: String,
    /// Module name passed to the launcher
    pub module: String,
    /// Codecs added to the defaults for this link
    #[serde(default)]
    pub codecs: Vec<CodecSpec>,
    /// Overrides the server-wide handshake timeout
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

/// Properties of a `distributed` stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedSettings {
    /// Worker addresses; falls back to the server-wide list when empty
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub codecs: Vec<CodecSpec>,
    /// Pipeline sent inline to every worker
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    /// Pipeline file name each worker loads from its own home
    #[serde(default)]
    pub pipeline_file: Option<String>,
}

/// How a remote worker is told what to run
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerPipeline {
    Inline(PipelineConfig),
    File(String),
}

impl ExternalSettings {
    pub fn from_stage(stage: &StageConfig) -> Result<Self, ConfigParseError> {
        let settings: Self = stage.settings()?;
        if settings.module.trim().is_empty() {
            return Err(stage.invalid("`module` must not be empty"));
        }
        Ok(settings)
    }
}

impl DistributedSettings {
    pub fn from_stage(stage: &StageConfig) -> Result<Self, ConfigParseError> {
        let settings: Self = stage.settings()?;
        settings.worker_pipeline(stage)?;
        if settings.max_workers == Some(0) {
            return Err(stage.invalid("`max_workers` must be at least 1"));
        }
        Ok(settings)
    }

    /// Exactly one of `pipeline` / `pipeline_file` must be given
    pub fn worker_pipeline(&self, stage: &StageConfig) -> Result<WorkerPipeline, ConfigParseError> {
        match (&self.pipeline, &self.pipeline_file) {
            (Some(pipeline), None) => {
                if pipeline.stages.is_empty() {
                    return Err(stage.invalid("worker pipeline declares no stages"));
                }
                Ok(WorkerPipeline::Inline(pipeline.clone()))
            }
            (None, Some(file)) => Ok(WorkerPipeline::File(file.clone())),
            (Some(_), Some(_)) => Err(stage.invalid("set either `pipeline` or `pipeline_file`, not both")),
            (None, None) => Err(stage.invalid("one of `pipeline` or `pipeline_file` is required")),
        }
    }
}
