//! annolive server binary.
//!
//! # Usage
//!
//! ```bash
//! ANNOLIVE_JWT_SECRET=dev-secret annolive-server --bind 0.0.0.0:9090
//! ```
//!
//! Clients connect to `ws://<bind>/ws?projectId=..&documentId=..` and send
//! `authenticate` with an HS256 token signed with the same secret.

mod config;

use std::sync::Arc;

use annolive_collab::{CollabServer, JwtVerifier, MemoryAnnotationStore};
use clap::Parser;
use log::info;

use config::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    info!("Starting annolive server...");
    let config = args.server_config();
    info!(
        "Rooms hold up to {} connections, {} pending suggestions",
        config.max_connections_per_room, config.max_pending_suggestions
    );

    let verifier = Arc::new(JwtVerifier::new(&args.jwt_secret));
    let store = Arc::new(MemoryAnnotationStore::new());
    let server = CollabServer::new(config, verifier, store);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connection(s) served, {} message(s), {} room(s) open",
                stats.total_connections, stats.total_messages, stats.active_rooms
            );
        }
    }
    Ok(())
}
