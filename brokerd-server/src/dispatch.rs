//! Session dispatch: runs a negotiated handler until its loop exits.

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::protocol::ProtocolHandler;
use crate::registry::Registration;

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The peer disconnected or the protocol ended the session.
    Completed,
    /// The loop returned an error.
    Failed(ServerError),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

/// Hands `conn` to `handler` and blocks until the session loop returns.
///
/// The loop's result is logged and never propagated further. `registration`
/// is dropped once the loop has returned, which removes the connection from
/// the registry exactly once whatever the outcome.
pub async fn dispatch(
    ctx: &ServerContext,
    mut conn: Connection,
    mut handler: Box<dyn ProtocolHandler>,
    registration: Registration,
) -> SessionOutcome {
    let addr = conn.remote_addr();
    if let Some(metrics) = ctx.metrics() {
        metrics.sessions_active.inc();
    }

    let result = handler.io_loop(&mut conn).await;

    let outcome = match result {
        Ok(()) => {
            tracing::debug!("[{}] {} session ended", addr, handler.name());
            SessionOutcome::Completed
        }
        Err(e) => {
            if e.is_local_close() {
                tracing::debug!("[{}] {} session closed by server", addr, handler.name());
            } else {
                tracing::error!("[{}] {} session error: {}", addr, handler.name(), e);
            }
            if let Some(metrics) = ctx.metrics() {
                metrics.session_errors_total.inc();
            }
            SessionOutcome::Failed(e)
        }
    };

    drop(registration);
    if let Some(metrics) = ctx.metrics() {
        metrics.sessions_active.dec();
    }
    drop(conn);
    outcome
}
