//! Shared server context handed to every protocol handler.

use crate::metrics::Metrics;
use crate::server::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// State shared by the acceptor and all connections.
///
/// Protocol handlers receive an `Arc<ServerContext>` at construction. It is
/// the handler's only route to server-wide configuration and metrics.
#[derive(Debug)]
pub struct ServerContext {
    config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.config.metrics.as_ref()
    }

    /// Allocates a process-unique connection id.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
