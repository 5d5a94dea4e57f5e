//! Health check endpoint for the queue coordinator.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::HealthConfig;
use crate::coordinator::HealthState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    last_successful_poll: Option<DateTime<Utc>>,
}

/// Health server handle.
pub struct HealthServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl HealthServer {
    /// Start the health server.
    ///
    /// Returns None if the health check is disabled via configuration.
    pub async fn start(config: &HealthConfig, health: HealthState) -> Result<Option<Self>> {
        if !config.enabled {
            info!("health check disabled (set CONVEYOR_HEALTH_CHECK_ACTIVE=true to enable)");
            return Ok(None);
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind health listener on {bind_addr}"))?;
        let actual_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/healthz", get(healthz))
            .with_state(health);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                tracing::error!(error = %err, "health server failed");
            }
        });

        info!(addr = %actual_addr, "health server started");
        Ok(Some(Self {
            addr: actual_addr,
            shutdown_tx,
        }))
    }

    /// Get the address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn healthz(State(health): State<HealthState>) -> impl IntoResponse {
    let snapshot = health.snapshot();
    if snapshot.healthy {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                last_successful_poll: snapshot.last_success,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unreachable",
                last_successful_poll: snapshot.last_success,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_health_check_does_not_bind() {
        let server = HealthServer::start(&HealthConfig::default(), HealthState::new())
            .await
            .expect("start");
        assert!(server.is_none());
    }

    #[tokio::test]
    async fn healthz_reflects_backend_state() {
        let health = HealthState::new();
        let server = HealthServer::start(
            &HealthConfig {
                enabled: true,
                port: 0,
            },
            health.clone(),
        )
        .await
        .expect("start")
        .expect("enabled");
        let addr = server.addr();

        health.mark_ok();
        let response = reqwest_get(addr, "/healthz").await;
        assert_eq!(response.0, 200);
        assert!(response.1.contains("\"status\":\"ok\""));

        health.mark_unreachable();
        let response = reqwest_get(addr, "/healthz").await;
        assert_eq!(response.0, 503);

        server.shutdown().await;
    }

    async fn reqwest_get(addr: SocketAddr, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        (status, body)
    }
}
