//! External module launching
//!
//! The bridge never starts processes itself; it asks a [`ModuleLauncher`]
//! to start the module and tell it which local port to connect back to.

use crate::error::{StageError, StageResult};
use std::collections::BTreeMap;
use std::process::{Child, Command, Stdio};
use streamgate_config::defaults::external::{MODULE_ENV, PORT_ENV};
use streamgate_config::ModuleCommand;
use tracing::info;
use types::ScanContext;

pub trait ModuleLauncher: Send + Sync {
    /// Start `module` of `module_type`, which must connect to `127.0.0.1:<port>`
    ///
    /// Returns the child process when one was spawned, so the bridge can
    /// detect an early exit and reap it on teardown.
    fn launch(
        &self,
        module_type: &str,
        module: &str,
        port: u16,
        context: &ScanContext,
    ) -> StageResult<Option<Child>>;
}

/// Launches modules from the server's `external.modules` command table
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    modules: BTreeMap<String, ModuleCommand>,
}

impl CommandLauncher {
    pub fn new(modules: BTreeMap<String, ModuleCommand>) -> Self {
        Self { modules }
    }
}

impl ModuleLauncher for CommandLauncher {
    fn launch(
        &self,
        module_type: &str,
        module: &str,
        port: u16,
        context: &ScanContext,
    ) -> StageResult<Option<Child>> {
        let template = self.modules.get(module_type).ok_or_else(|| {
            StageError::external(format!("no launcher configured for module type '{module_type}'"))
        })?;

        let args = template.render_args(port, module);
        info!(
            module_type,
            module,
            port,
            command = %template.command,
            ?args,
            "Launching external module"
        );

        let child = Command::new(&template.command)
            .args(&args)
            .envs(&template.env)
            .env(PORT_ENV, port.to_string())
            .env(MODULE_ENV, module)
            .current_dir(&context.paths.working_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                StageError::external(format!(
                    "failed to launch '{}' for module '{module}': {e}",
                    template.command
                ))
            })?;

        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_module_type() {
        let launcher = CommandLauncher::default();
        let err = launcher
            .launch("matlab", "m", 1234, &ScanContext::default())
            .unwrap_err();
        assert!(matches!(err, StageError::ExternalModule(_)));
    }

    #[test]
    fn test_missing_executable() {
        let mut modules = BTreeMap::new();
        modules.insert(
            "bogus".to_string(),
            ModuleCommand {
                command: "/nonexistent/streamgate-module".into(),
                ..Default::default()
            },
        );
        let err = CommandLauncher::new(modules)
            .launch("bogus", "m", 1234, &ScanContext::default())
            .unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }
}
