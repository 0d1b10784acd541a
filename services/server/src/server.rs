//! # Server
//!
//! ## Purpose
//!
//! Accepts client sockets and hands each one to a [`Connection`] running on
//! its own thread. A failing connection is logged and reported to its own
//! peer; it never affects another connection.
//!
//! ## Architecture Role
//!
//! ```text
//!                    ┌───────────────────────── ServerState (shared, read-only) ─┐
//!                    │ Services · StrategyRegistry · QueryResponders           │
//!                    └────────────────────────────▲─────────────────────────────┘
//! TcpListener ──accept──▶ thread "conn-N" ──▶ Connection::handle
//!                                                 │
//!                                                 └─ distributed jobs ─▶ tokio runtime
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stream_server::Server;
//! use streamgate_config::ServerConfig;
//!
//! let server = Server::builder(ServerConfig::default()).bind()?;
//! server.serve()?;
//! # Ok::<(), std::io::Error>(())
//! ```

use crate::connection::Connection;
use crate::error::StageResult;
use crate::query::QueryResponders;
use crate::strategy::{
    CommandLauncher, ModuleLauncher, Processable, Services, StageEnv, StrategyRegistry,
};
use codec::{CodecRegistry, FrameCodec};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use streamgate_config::ServerConfig;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

/// Everything connections share
pub struct ServerState {
    pub services: Services,
    pub strategies: StrategyRegistry,
    pub queries: QueryResponders,
}

pub struct ServerBuilder {
    config: ServerConfig,
    strategies: StrategyRegistry,
    launcher: Option<Arc<dyn ModuleLauncher>>,
}

impl ServerBuilder {
    /// Register an additional strategy, replacing a built-in of the same name
    pub fn strategy<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&StageEnv<'_>) -> StageResult<Box<dyn Processable>> + Send + Sync + 'static,
    {
        self.strategies.register(name, factory);
        self
    }

    /// Replace the launcher built from `external.modules`
    pub fn launcher(mut self, launcher: Arc<dyn ModuleLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn bind(self) -> io::Result<Server> {
        let listener = TcpListener::bind(self.config.listen)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("streamgate-jobs")
            .enable_all()
            .build()?;

        let codec = FrameCodec::new(
            Arc::new(CodecRegistry::with_defaults()),
            self.config.limits.frame_limits(),
        );
        let queries =
            QueryResponders::with_defaults(self.strategies.names(), codec.registry().names());
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(CommandLauncher::new(self.config.external.modules.clone())));

        let state = ServerState {
            services: Services {
                config: Arc::new(self.config),
                launcher,
                runtime: runtime.handle().clone(),
                codec,
            },
            strategies: self.strategies,
            queries,
        };

        let server = Server {
            listener,
            state: Arc::new(state),
            runtime,
            next_id: AtomicU64::new(1),
        };
        info!(
            addr = %server.local_addr()?,
            strategies = ?server.state.strategies.names(),
            "Server listening"
        );
        Ok(server)
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    // Kept alive for the lifetime of the server; strategies hold handles to it
    #[allow(dead_code)]
    runtime: Runtime,
    next_id: AtomicU64,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            strategies: StrategyRegistry::with_defaults(),
            launcher: None,
        }
    }

    /// Bind with the built-in strategies and the configured launcher
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        Self::builder(config).bind()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accept connections forever
    pub fn serve(&self) -> io::Result<()> {
        for incoming in self.listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let state = self.state.clone();
            let spawned = thread::Builder::new()
                .name(format!("conn-{id}"))
                .spawn(move || match Connection::new(id, stream, state) {
                    Ok(connection) => {
                        if let Err(e) = connection.handle() {
                            debug!(id, kind = e.kind(), "Connection ended with error");
                        }
                    }
                    Err(e) => warn!(id, error = %e, "Connection dropped before setup"),
                });
            if let Err(e) = spawned {
                error!(id, error = %e, "Failed to spawn connection thread");
            }
        }
        Ok(())
    }

    /// Serve on a background thread, returning the bound address
    pub fn spawn(self) -> io::Result<SocketAddr> {
        let addr = self.local_addr()?;
        thread::Builder::new()
            .name("streamgate-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    error!(error = %e, "Server loop ended");
                }
            })?;
        Ok(addr)
    }
}
