//! Command-line and environment configuration.

use std::time::Duration;

use annolive_collab::ServerConfig;
use clap::Parser;

/// Real-time annotation collaboration server
#[derive(Parser, Debug)]
#[command(name = "annolive-server")]
#[command(about = "Real-time annotation collaboration server")]
#[command(version)]
pub struct Args {
    /// Address to bind to
    #[arg(short, long, env = "ANNOLIVE_BIND", default_value = "127.0.0.1:9090")]
    pub bind: String,

    /// HS256 secret shared with the token issuer
    #[arg(long, env = "ANNOLIVE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    #[arg(long, env = "ANNOLIVE_MAX_CONNECTIONS_PER_ROOM", default_value_t = 100)]
    pub max_connections_per_room: usize,

    /// Pending suggestions kept per document
    #[arg(long, env = "ANNOLIVE_MAX_PENDING_SUGGESTIONS", default_value_t = 500)]
    pub max_pending_suggestions: usize,

    /// Resolved conflicts remembered for late resolvers
    #[arg(long, env = "ANNOLIVE_MAX_RESOLVED_CONFLICTS", default_value_t = 1000)]
    pub max_resolved_conflicts: usize,

    #[arg(long, env = "ANNOLIVE_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Replies queued per connection before a non-reading client is dropped
    #[arg(long, env = "ANNOLIVE_UNICAST_CAPACITY", default_value_t = 64)]
    pub unicast_capacity: usize,

    /// Milliseconds a socket may stay unauthenticated
    #[arg(long, env = "ANNOLIVE_AUTH_GRACE_MS", default_value_t = 10_000)]
    pub auth_grace_ms: u64,

    /// Milliseconds of silence before a channel goes stale
    #[arg(long, env = "ANNOLIVE_HEARTBEAT_TIMEOUT_MS", default_value_t = 30_000)]
    pub heartbeat_timeout_ms: u64,

    /// Seconds of inactivity before presence turns idle
    #[arg(long, env = "ANNOLIVE_IDLE_AFTER_SECS", default_value_t = 120)]
    pub idle_after_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_connections_per_room: self.max_connections_per_room,
            max_pending_suggestions: self.max_pending_suggestions,
            max_resolved_conflicts: self.max_resolved_conflicts,
            broadcast_capacity: self.broadcast_capacity,
            unicast_capacity: self.unicast_capacity,
            auth_grace: Duration::from_millis(self.auth_grace_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            idle_after: Duration::from_secs(self.idle_after_secs),
            ..ServerConfig::default()
        }
    }
}
