//! Protocol V2 session loop (magic `"  V2"`).
//!
//! Only the session skeleton lives here: newline-terminated commands, `NOP`
//! and `CLS`. Pub/sub commands are served by the broker core.

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::protocol::ProtocolHandler;
use async_trait::async_trait;
use brokerd_protocol::{Encoder, ErrorCode};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Longest command line accepted, excluding the newline.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Response body sent when the client asks to close.
pub const CLOSE_WAIT: &str = "CLOSE_WAIT";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Nop,
    Close,
    Unknown(String),
}

impl Command {
    fn parse(line: &[u8]) -> Self {
        let name = line.split(|b| *b == b' ').next().unwrap_or_default();
        match name {
            b"NOP" => Command::Nop,
            b"CLS" => Command::Close,
            other => Command::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// Per-connection V2 protocol state.
pub struct ProtocolV2 {
    ctx: Arc<ServerContext>,
    buffer: BytesMut,
}

impl ProtocolV2 {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Returns the next command line with its line ending stripped, or
    /// `None` once the peer has closed its side.
    async fn next_line(&mut self, conn: &mut Connection) -> Result<Option<Bytes>, ServerError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return Ok(Some(line.freeze()));
            }
            if self.buffer.len() > MAX_COMMAND_LEN {
                return Err(ServerError::CommandTooLong(MAX_COMMAND_LEN));
            }

            let read = conn.read_buf(&mut self.buffer);
            let n = match self.ctx.config().idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| ServerError::IdleTimeout)??,
                None => read.await?,
            };
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        "[{}] Discarding {} bytes of partial command at EOF",
                        conn.remote_addr(),
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for ProtocolV2 {
    fn name(&self) -> &'static str {
        "V2"
    }

    async fn io_loop(&mut self, conn: &mut Connection) -> Result<(), ServerError> {
        let addr = conn.remote_addr();
        while let Some(line) = self.next_line(conn).await? {
            if line.is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Command::Nop => {}
                Command::Close => {
                    tracing::debug!("[{}] Client requested close", addr);
                    let frame = Encoder::encode_response(CLOSE_WAIT)?;
                    conn.write_all(&frame).await?;
                    conn.flush().await?;
                    return Ok(());
                }
                Command::Unknown(name) => {
                    let detail = format!("invalid command {}", name);
                    let frame = Encoder::encode_error(ErrorCode::Invalid, Some(&detail))?;
                    conn.write_all(&frame).await?;
                    conn.flush().await?;
                    return Err(ServerError::InvalidCommand(name));
                }
            }
        }
        Ok(())
    }
}
