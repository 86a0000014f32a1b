//! Protocol negotiation.
//!
//! Every client opens with a 4-byte magic naming the protocol version it
//! wants. The negotiator reads it, picks the matching handler, or rejects the
//! connection with a single `E_BAD_PROTOCOL` error frame.

use crate::connection::{Connection, ConnectionState};
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::protocol::{ProtocolHandler, ProtocolTable};
use brokerd_protocol::{Encoder, ErrorCode, ProtocolMagic, MAGIC_LEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Selects a protocol handler for freshly accepted connections.
#[derive(Debug, Clone)]
pub struct Negotiator {
    table: Arc<ProtocolTable>,
    ctx: Arc<ServerContext>,
    handshake_timeout: Option<Duration>,
}

impl Negotiator {
    pub fn new(table: Arc<ProtocolTable>, ctx: Arc<ServerContext>) -> Self {
        let handshake_timeout = ctx.config().handshake_timeout;
        Self {
            table,
            ctx,
            handshake_timeout,
        }
    }

    /// Reads the magic and resolves it to a handler.
    ///
    /// On success the connection is `Active`. On failure it is `Rejected`
    /// and the caller should drop it. A short or failed read sends nothing
    /// back; an unknown magic gets one `E_BAD_PROTOCOL` frame first.
    pub async fn negotiate(
        &self,
        conn: &mut Connection,
    ) -> Result<Box<dyn ProtocolHandler>, ServerError> {
        conn.set_state(ConnectionState::Negotiating);
        let addr = conn.remote_addr();

        let magic = match self.read_magic(conn).await {
            Ok(magic) => magic,
            Err(e) => {
                conn.set_state(ConnectionState::Rejected);
                tracing::error!("[{}] Failed to read protocol magic: {}", addr, e);
                self.record_outcome("read_error");
                return Err(e);
            }
        };

        tracing::info!("[{}] Desired protocol magic '{}'", addr, magic);

        match self.table.resolve(&magic, self.ctx.clone()) {
            Some(handler) => {
                conn.set_state(ConnectionState::Active);
                tracing::debug!("[{}] Negotiated protocol {}", addr, handler.name());
                self.record_outcome("accepted");
                Ok(handler)
            }
            None => {
                conn.set_state(ConnectionState::Rejected);
                if let Err(e) = reject(conn).await {
                    tracing::debug!("[{}] Failed to send E_BAD_PROTOCOL: {}", addr, e);
                }
                tracing::error!("[{}] Bad protocol magic '{}'", addr, magic);
                self.record_outcome("bad_protocol");
                Err(ServerError::UnsupportedProtocol(magic))
            }
        }
    }

    async fn read_magic(&self, conn: &mut Connection) -> Result<ProtocolMagic, ServerError> {
        let mut buf = [0u8; MAGIC_LEN];
        let read = conn.read_exact(&mut buf);
        let result = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ServerError::HandshakeTimeout)?,
            None => read.await,
        };
        result.map_err(ServerError::HandshakeRead)?;
        Ok(ProtocolMagic::new(buf))
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(metrics) = self.ctx.metrics() {
            metrics.handshakes_total.with_label_values(&[outcome]).inc();
        }
    }
}

/// Writes the `E_BAD_PROTOCOL` frame and shuts down the write side.
async fn reject(conn: &mut Connection) -> Result<(), ServerError> {
    let frame = Encoder::encode_error(ErrorCode::BadProtocol, None)?;
    conn.write_all(&frame).await?;
    conn.flush().await?;
    conn.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use brokerd_protocol::{Decoder, FrameType};
    use tokio::io::DuplexStream;

    fn negotiator(config: ServerConfig) -> Negotiator {
        let ctx = Arc::new(ServerContext::new(config));
        Negotiator::new(Arc::new(ProtocolTable::with_defaults()), ctx)
    }

    fn pipe() -> (Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(256);
        let conn = Connection::new(7, "127.0.0.1:6000".parse().unwrap(), Box::new(server));
        (conn, client)
    }

    async fn read_to_end(client: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_v2_magic_selects_handler() {
        let (mut conn, mut client) = pipe();
        client.write_all(b"  V2").await.unwrap();

        let handler = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .unwrap();
        assert_eq!(handler.name(), "V2");
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_magic_split_across_writes() {
        let (mut conn, mut client) = pipe();
        let writer = tokio::spawn(async move {
            client.write_all(b"  ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"V2").await.unwrap();
            client
        });

        let handler = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .unwrap();
        assert_eq!(handler.name(), "V2");
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_magic_gets_single_error_frame() {
        let (mut conn, mut client) = pipe();
        client.write_all(b"XXXX").await.unwrap();

        let err = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::UnsupportedProtocol(m) if m.as_bytes() == b"XXXX"));
        assert_eq!(conn.state(), ConnectionState::Rejected);
        drop(conn);

        let bytes = read_to_end(&mut client).await;
        let mut decoder = Decoder::new();
        decoder.extend(&bytes);
        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.body.as_ref(), b"E_BAD_PROTOCOL");
        assert!(decoder.decode_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[tokio::test]
    async fn test_short_read_sends_nothing() {
        let (mut conn, mut client) = pipe();
        client.write_all(b" V").await.unwrap();
        client.shutdown().await.unwrap();

        let err = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::HandshakeRead(_)));
        assert_eq!(conn.state(), ConnectionState::Rejected);
        drop(conn);

        assert!(read_to_end(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut conn, mut client) = pipe();
        client.write_all(b"  ").await.unwrap();

        let mut config = ServerConfig::default();
        config.handshake_timeout = Some(Duration::from_millis(50));

        let err = negotiator(config).negotiate(&mut conn).await.err().unwrap();
        assert!(matches!(err, ServerError::HandshakeTimeout));
        drop(conn);

        assert!(read_to_end(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_writes_exact_frame_bytes() {
        let expected = Encoder::encode_error(ErrorCode::BadProtocol, None).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(b"GET ")
            .write(&expected)
            .build();
        let mut conn = Connection::new(8, "127.0.0.1:6001".parse().unwrap(), Box::new(mock));

        let err = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn test_short_read_writes_nothing_to_mock() {
        // Any write would fail the mock, which has none scripted.
        let mock = tokio_test::io::Builder::new().read(b"  V").build();
        let mut conn = Connection::new(9, "127.0.0.1:6002".parse().unwrap(), Box::new(mock));

        let err = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::HandshakeRead);
    }

    #[tokio::test]
    async fn test_rejection_does_not_fail_when_peer_is_gone() {
        let (mut conn, client) = pipe();
        let mut client = client;
        client.write_all(b"HTTP").await.unwrap();
        drop(client);

        let err = negotiator(ServerConfig::default())
            .negotiate(&mut conn)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::UnsupportedProtocol(_)));
    }
}
