//! Offline sync core for the Caixa point-of-sale client.
//!
//! Provides:
//! - An HTTP client with primary/fallback failover and bounded timeouts
//! - A durable mutation queue drained one operation at a time
//! - A connection monitor telling "no network" apart from "server down"
//! - A TTL response cache for painting screens before the network answers

pub mod api_client;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod monitor;
pub mod observer;
pub mod queue;
pub mod runtime;
pub mod types;

pub use api_client::ApiClient;
pub use cache::{cache_key, ResponseCache};
pub use config::ApiConfig;
pub use connectivity::{Connectivity, Unmonitored};
pub use error::{SyncError, SyncResult};
pub use monitor::{ConnectionMonitor, NetworkSignal};
pub use observer::Subscription;
pub use queue::SyncQueue;
pub use runtime::SyncRuntime;
pub use types::*;

/// Installs the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
