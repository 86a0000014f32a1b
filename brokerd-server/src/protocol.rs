//! Protocol handlers and the table that selects them by magic.

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::protocol_v2::ProtocolV2;
use async_trait::async_trait;
use brokerd_protocol::{ProtocolMagic, MAGIC_V2};
use std::collections::HashMap;
use std::sync::Arc;

/// One wire-protocol version's session loop.
#[async_trait]
pub trait ProtocolHandler: Send {
    /// Human-readable protocol name for logs.
    fn name(&self) -> &'static str;

    /// Runs the session until the peer leaves, the protocol ends it, or the
    /// connection fails. The handler owns the connection's I/O for the whole
    /// call; force-closing the connection surfaces here as an I/O error.
    ///
    /// A force-close only fails reads and writes on `conn`; the socket is
    /// released when this returns. Implementations must therefore keep a
    /// read or write on `conn` pending whenever they wait, or select on it
    /// alongside anything else they await, and return once it errors.
    /// A handler parked only on some other future never observes shutdown.
    async fn io_loop(&mut self, conn: &mut Connection) -> Result<(), ServerError>;
}

/// Builds a fresh handler for each negotiated connection.
pub trait ProtocolFactory: Send + Sync {
    fn create(&self, ctx: Arc<ServerContext>) -> Box<dyn ProtocolHandler>;
}

impl<F> ProtocolFactory for F
where
    F: Fn(Arc<ServerContext>) -> Box<dyn ProtocolHandler> + Send + Sync,
{
    fn create(&self, ctx: Arc<ServerContext>) -> Box<dyn ProtocolHandler> {
        self(ctx)
    }
}

/// Fixed mapping from protocol magic to handler factory.
#[derive(Default)]
pub struct ProtocolTable {
    factories: HashMap<ProtocolMagic, Arc<dyn ProtocolFactory>>,
}

impl ProtocolTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with every built-in protocol registered.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(MAGIC_V2, |ctx: Arc<ServerContext>| {
            Box::new(ProtocolV2::new(ctx)) as Box<dyn ProtocolHandler>
        });
        table
    }

    /// Registers a factory for `magic`, replacing any earlier one.
    pub fn register(&mut self, magic: ProtocolMagic, factory: impl ProtocolFactory + 'static) {
        self.factories.insert(magic, Arc::new(factory));
    }

    /// Builds a handler for `magic`, or `None` if the magic is unknown.
    pub fn resolve(
        &self,
        magic: &ProtocolMagic,
        ctx: Arc<ServerContext>,
    ) -> Option<Box<dyn ProtocolHandler>> {
        self.factories.get(magic).map(|factory| factory.create(ctx))
    }

    pub fn supports(&self, magic: &ProtocolMagic) -> bool {
        self.factories.contains_key(magic)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ProtocolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolTable")
            .field("magics", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
