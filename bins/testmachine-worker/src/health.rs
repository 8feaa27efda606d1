// Liveness probe for the worker process

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn routes() -> Router {
    Router::new().route("/health", get(health))
}

/// GET /health - reports the process is up, regardless of connection state
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "mode": "websocket-client"
        })),
    )
}

pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint to {}", addr))?;
    serve_on(listener, shutdown).await
}

pub async fn serve_on(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Health endpoint listening");
    axum::serve(listener, routes())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Health server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_reports_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_on(listener, shutdown.clone()));

        let response = get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json, serde_json::json!({"status": "alive", "mode": "websocket-client"}));

        let missing = get(addr, "/status").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
