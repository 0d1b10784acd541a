//! # Streamgate Connection Server
//!
//! ## Purpose
//!
//! Accepts client connections, negotiates a processing pipeline and scan
//! metadata over a framed binary protocol, then streams data messages
//! through the negotiated strategies and back to the client.
//!
//! ## Architecture Role
//!
//! ```text
//!  client ──frames──▶ Server ──thread per connection──▶ Connection
//!                                                         │
//!            CONFIG ─▶ HEADER ─▶ STREAM | VOID ───────────┘
//!                                   │
//!               ┌───────────────────┴──────────────────┐
//!               ▼                                      ▼
//!        ExternalBridge                         DistributedPool
//!     (module process over TCP)        (remote streamgate workers, ordered)
//! ```
//!
//! ## Module Map
//! - [`server`]: listener, builder, shared [`ServerState`]
//! - [`connection`]: the per-connection state machine
//! - [`stage`] / [`handler`]: the two-thread stage loop and tag dispatch
//! - [`supervisor`]: error capture and channel cleanup for every thread
//! - [`strategy`]: [`Processable`], the registry and the built-in strategies
//! - [`query`]: diagnostic QUERY answers

pub mod connection;
pub mod error;
pub mod handler;
pub mod query;
pub mod server;
pub mod stage;
pub mod strategy;
pub mod supervisor;

pub use connection::Connection;
pub use error::{StageError, StageResult};
pub use query::QueryResponders;
pub use server::{Server, ServerBuilder, ServerState};
pub use strategy::{
    CommandLauncher, DistributedPool, ExternalBridge, ModuleLauncher, Processable,
    RemoteWorkerSource, Services, StageEnv, StrategyRegistry, Worker, WorkerSource,
};
pub use supervisor::ErrorSupervisor;
