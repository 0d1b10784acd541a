//! Default values shared by the server configuration and its consumers

/// Listener defaults
pub mod server {
    /// Default bind address
    pub const LISTEN: &str = "0.0.0.0:9002";

    /// Environment variable prefix for overrides
    pub const ENV_PREFIX: &str = "STREAMGATE";
}

/// External module defaults
pub mod external {
    /// Seconds to wait for a launched module to connect back (0 = forever)
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;

    /// Environment variables handed to every launched module
    pub const PORT_ENV: &str = "STREAMGATE_PORT";
    pub const MODULE_ENV: &str = "STREAMGATE_MODULE";
}

/// Distributed pool defaults
pub mod distributed {
    /// Upper bound on concurrently connected remote workers
    pub const MAX_WORKERS: usize = 8;

    /// Seconds to wait for an idle worker slot (0 = forever)
    pub const ACQUIRE_TIMEOUT_SECS: u64 = 300;

    /// Seconds allowed for a TCP connect to a remote worker
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
}

/// Wire limits
pub mod limits {
    /// Largest accepted length-prefixed body
    pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024; // 256MB
}
