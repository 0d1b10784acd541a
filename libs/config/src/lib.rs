//! # Streamgate Configuration
//!
//! Server settings and pipeline descriptions.
//!
//! ## Features
//!
//! - **Server Configuration**: layered defaults, TOML file and `STREAMGATE_*` environment
//! - **Pipeline Descriptions**: TOML stage lists negotiated per connection
//! - **Stage Settings**: typed views over a stage's free-form properties
//!
//! ## Usage
//!
//! ```rust,no_run
//! use streamgate_config::{PipelineConfig, ServerConfig};
//!
//! let server = ServerConfig::load(None).unwrap();
//! let pipeline = PipelineConfig::load(&server.paths, "default.toml").unwrap();
//! println!("{} stages", pipeline.stages.len());
//! ```

pub mod defaults;
pub mod pipeline;
pub mod server_config;

// Re-export commonly used types
pub use pipeline::{
    resolve_pipeline_path, ConfigParseError, DistributedSettings, ExternalSettings,
    PipelineConfig, StageConfig, WorkerPipeline,
};
pub use server_config::{
    DistributedConfig, ExternalConfig, LimitsConfig, ModuleCommand, ServerConfig,
};
