//! Server Configuration Module
//!
//! Provides configuration loading for the streamgate server. Values are
//! layered: built-in defaults, then an optional TOML file, then
//! `STREAMGATE_*` environment variables (`__` separates nested keys, e.g.
//! `STREAMGATE_EXTERNAL__HANDSHAKE_TIMEOUT_SECS=5`).
//!
//! Loading leaves `$VAR` references untouched; callers apply their own
//! overrides first and then call [`ServerConfig::expand_env_vars`] once.

use crate::defaults;
use anyhow::{Context, Result};
use codec::FrameLimits;
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use types::Paths;

/// Main server configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the connection listener binds to
    pub listen: SocketAddr,

    /// Filesystem roots handed to every connection
    pub paths: Paths,

    /// External module launching
    pub external: ExternalConfig,

    /// Remote worker pool
    pub distributed: DistributedConfig,

    /// Wire limits
    pub limits: LimitsConfig,
}

/// External module settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExternalConfig {
    pub handshake_timeout_secs: u64,

    /// Module type → how to launch it
    pub modules: BTreeMap<String, ModuleCommand>,
}

/// Command template for one module type
///
/// `{port}` and `{name}` in `args` are replaced at launch time.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct ModuleCommand {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Remote worker pool settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DistributedConfig {
    /// Worker addresses used when a stage does not list its own
    pub workers: Vec<String>,
    pub max_workers: usize,
    pub acquire_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9002)),
            paths: Paths::default(),
            external: ExternalConfig::default(),
            distributed: DistributedConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: defaults::external::HANDSHAKE_TIMEOUT_SECS,
            modules: BTreeMap::new(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            max_workers: defaults::distributed::MAX_WORKERS,
            acquire_timeout_secs: defaults::distributed::ACQUIRE_TIMEOUT_SECS,
            connect_timeout_secs: defaults::distributed::CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: defaults::limits::MAX_BODY_SIZE,
        }
    }
}

/// Zero means "no deadline"
fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ExternalConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        optional_secs(self.handshake_timeout_secs)
    }
}

impl DistributedConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        optional_secs(self.acquire_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        optional_secs(self.connect_timeout_secs)
    }
}

impl LimitsConfig {
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_body_size: self.max_body_size,
        }
    }
}

impl ModuleCommand {
    /// Arguments with `{port}` and `{name}` substituted
    pub fn render_args(&self, port: u16, name: &str) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{name}", name))
            .collect()
    }
}

impl ServerConfig {
    /// Load configuration: defaults, then `path` if given, then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, defaults::server::ENV_PREFIX)
    }

    /// Load with a custom environment prefix
    pub fn load_with_env(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let defaults = Config::try_from(&ServerConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!("Loading server config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("distributed.workers")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let config: ServerConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        debug!(?config, "Server configuration loaded");
        Ok(config)
    }

    /// Expand environment variables in paths and module commands
    pub fn expand_env_vars(&mut self) -> Result<()> {
        self.paths.home = expand_path(&self.paths.home).context("Failed to expand home path")?;
        self.paths.working_dir =
            expand_path(&self.paths.working_dir).context("Failed to expand working dir")?;

        for (name, module) in &mut self.external.modules {
            module.command = shellexpand::env(&module.command)
                .with_context(|| format!("Failed to expand command for module '{name}'"))?
                .to_string();
        }

        Ok(())
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let text = path.to_string_lossy();
    Ok(PathBuf::from(shellexpand::env(&text)?.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let config = ServerConfig::load_with_env(None, "STREAMGATE_TEST_NONE").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.external.handshake_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.limits.frame_limits(), FrameLimits::default());
    }

    #[test]
    fn test_load_file_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("streamgate.toml");

        let config_content = r#"
listen = "127.0.0.1:9100"

[paths]
home = "/opt/streamgate"
working_dir = "/tmp/work"

[external]
handshake_timeout_secs = 0

[external.modules.python]
command = "python3"
args = ["-m", "worker", "{port}", "{name}"]

[distributed]
workers = ["10.0.0.1:9002", "10.0.0.2:9002"]
max_workers = 2
"#;

        fs::write(&config_path, config_content).unwrap();

        let config =
            ServerConfig::load_with_env(Some(&config_path), "STREAMGATE_TEST_FILE").unwrap();

        assert_eq!(config.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.paths.home, PathBuf::from("/opt/streamgate"));
        assert_eq!(config.external.handshake_timeout(), None);
        assert_eq!(config.distributed.workers.len(), 2);
        assert_eq!(config.distributed.max_workers, 2);
        // Untouched sections keep their defaults
        assert_eq!(
            config.distributed.connect_timeout_secs,
            defaults::distributed::CONNECT_TIMEOUT_SECS
        );

        let python = &config.external.modules["python"];
        assert_eq!(
            python.render_args(4100, "recon"),
            vec!["-m", "worker", "4100", "recon"]
        );
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("STREAMGATE_TEST_ENV_EXTERNAL__HANDSHAKE_TIMEOUT_SECS", "5");
        std::env::set_var("STREAMGATE_TEST_ENV_LISTEN", "127.0.0.1:7000");

        let config = ServerConfig::load_with_env(None, "STREAMGATE_TEST_ENV").unwrap();
        assert_eq!(config.external.handshake_timeout_secs, 5);
        assert_eq!(config.listen.port(), 7000);

        std::env::remove_var("STREAMGATE_TEST_ENV_EXTERNAL__HANDSHAKE_TIMEOUT_SECS");
        std::env::remove_var("STREAMGATE_TEST_ENV_LISTEN");
    }

    #[test]
    fn test_expansion_happens_after_load() {
        std::env::set_var("STREAMGATE_TEST_EXPAND_ROOT", "/srv/scans");
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("streamgate.toml");
        fs::write(
            &config_path,
            "[paths]\nhome = \"$STREAMGATE_TEST_EXPAND_ROOT/home\"\n",
        )
        .unwrap();

        let mut config =
            ServerConfig::load_with_env(Some(&config_path), "STREAMGATE_TEST_EXPAND").unwrap();
        assert_eq!(
            config.paths.home,
            PathBuf::from("$STREAMGATE_TEST_EXPAND_ROOT/home")
        );

        config.expand_env_vars().unwrap();
        assert_eq!(config.paths.home, PathBuf::from("/srv/scans/home"));
        std::env::remove_var("STREAMGATE_TEST_EXPAND_ROOT");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(ServerConfig::load_with_env(Some(&missing), "STREAMGATE_TEST_MISSING").is_err());
    }
}
