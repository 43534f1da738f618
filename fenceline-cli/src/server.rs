//! Reference transport adapter: newline-delimited JSON over TCP.
//!
//! One `LocationUpdate` object per line in, one `TransitionResult` (or an
//! `{"error": ...}` object) per line out. The adapter translates and
//! relays; every classification decision happens in the engine.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fenceline::queue::EventWorker;
use fenceline::{LocationUpdate, TransitionEngine};

/// Runs the listener and the event worker until Ctrl-C.
pub async fn serve(
    listen: &str,
    engine: Arc<TransitionEngine>,
    worker: EventWorker,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listen, "listening for location updates");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                debug!(peer = %peer, "connection accepted");
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(engine, socket).await {
                        debug!(peer = %peer, error = %e, "connection closed");
                    }
                });
            }
        }
    }

    shutdown.cancel();
    worker_handle.await?;
    Ok(())
}

/// Reads update lines until the peer disconnects.
async fn handle_connection(
    engine: Arc<TransitionEngine>,
    socket: TcpStream,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line).await;
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

/// Translates one request line into one response line.
pub async fn handle_line(engine: &TransitionEngine, line: &str) -> String {
    match serde_json::from_str::<LocationUpdate>(line) {
        Ok(update) => match engine.process(update).await {
            Ok(result) => serde_json::to_string(&result)
                .unwrap_or_else(|e| error_json(&format!("response serialization failed: {e}"))),
            Err(e) => error_json(&e.to_string()),
        },
        Err(e) => error_json(&format!("invalid location update: {e}")),
    }
}

fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
