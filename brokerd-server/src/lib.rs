//! # brokerd-server
//!
//! TCP front door for the brokerd message broker.
//!
//! This crate provides:
//! - TCP connection acceptance with async I/O
//! - Protocol negotiation from the client's 4-byte magic
//! - A concurrent registry of live connections for bulk shutdown
//! - Per-connection session dispatch to the negotiated protocol handler
//! - YAML/env configuration and Prometheus metrics
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept -> Negotiator -> ConnectionRegistry::insert -> dispatch -> Registration drop
//!              |
//!              +-> E_BAD_PROTOCOL / close
//! ```
//!
//! Sessions have no cooperative cancellation. [`Server::shutdown`] force-closes
//! every registered connection, which surfaces as an I/O error inside each
//! session loop.

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod negotiate;
pub mod protocol;
pub mod protocol_v2;
pub mod registry;
pub mod server;
pub mod stream;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig};
pub use connection::{Connection, ConnectionState};
pub use context::ServerContext;
pub use dispatch::{dispatch, SessionOutcome};
pub use error::{ErrorKind, ServerError};
pub use metrics::Metrics;
pub use negotiate::Negotiator;
pub use protocol::{ProtocolFactory, ProtocolHandler, ProtocolTable};
pub use protocol_v2::ProtocolV2;
pub use registry::{ConnectionRegistry, Registration};
pub use server::{Server, ServerConfig, ServerStats};
pub use stream::{BoxedStream, ClosableStream, CloseHandle};
