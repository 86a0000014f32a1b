//! Prometheus metrics for the brokerd front door.
//!
//! This module provides:
//! - Metrics registry with connection, handshake and session counters
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the brokerd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Connections currently being handled (negotiating or in session).
    pub connections_active: Gauge,
    /// Sessions whose protocol loop is running.
    pub sessions_active: Gauge,
    /// Handshake outcomes: accepted, bad_protocol, read_error.
    pub handshakes_total: CounterVec,
    /// Sessions that ended with an error.
    pub session_errors_total: Counter,
    /// Connections force-closed by a registry sweep.
    pub registry_closed_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "brokerd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "brokerd_connections_active",
            "Number of connections currently being handled",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "brokerd_sessions_active",
            "Number of connections with a running protocol session",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let handshakes_total = CounterVec::new(
            Opts::new("brokerd_handshakes_total", "Protocol handshakes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(handshakes_total.clone()))?;

        let session_errors_total = Counter::with_opts(Opts::new(
            "brokerd_session_errors_total",
            "Total sessions that ended with an error",
        ))?;
        registry.register(Box::new(session_errors_total.clone()))?;

        let registry_closed_total = Counter::with_opts(Opts::new(
            "brokerd_registry_closed_total",
            "Total connections force-closed by a registry sweep",
        ))?;
        registry.register(Box::new(registry_closed_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            sessions_active,
            handshakes_total,
            session_errors_total,
            registry_closed_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("connections_total", &self.connections_total.get())
            .field("connections_active", &self.connections_active.get())
            .field("sessions_active", &self.sessions_active.get())
            .finish()
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}
