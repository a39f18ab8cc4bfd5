//! Minimal health-check HTTP endpoint — raw TCP, minimal parsing,
//! `Connection: close`. Internal monitoring only, not a public API.
//!
//! `GET /health` returns a JSON snapshot; any other path is a 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Produces the health payload on demand. Pure data collection, no I/O.
pub type SnapshotFn = Arc<dyn Fn() -> Value + Send + Sync>;

const MAX_REQUEST_LINE: usize = 8192;
const MAX_HEADER_LINES: usize = 64;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind and serve. Returns the bound address (useful with port 0) and the
/// accept-loop handle; aborting the handle closes the socket.
pub async fn start_health_server(
    host: &str,
    port: u16,
    snapshot: SnapshotFn,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "health server listening");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            debug!(%peer, "health connection");
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, snapshot).await;
            });
        }
    });

    Ok((addr, handle))
}

async fn handle_connection(stream: TcpStream, snapshot: SnapshotFn) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut request_line)).await??;
    if request_line.len() > MAX_REQUEST_LINE {
        return Ok(());
    }
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

    // Drain headers, bounded.
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let (status, body) = if path == "/health" {
        ("200 OK", snapshot())
    } else {
        ("404 Not Found", serde_json::json!({"error": "not found"}))
    };

    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
