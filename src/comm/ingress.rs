/// TCP ingress: newline-delimited JSON readings from sensor connections
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::models::RawReading;

/// Accept sensor connections forever, one task per connection
pub async fn serve(listener: TcpListener, tx: mpsc::Sender<RawReading>) {
    match listener.local_addr() {
        Ok(addr) => info!("Listening for sensor connections on {}", addr),
        Err(e) => warn!("Listening on unknown address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    info!("Connection established from {}", addr);
                    let forwarded = handle_connection(stream, addr, tx).await;
                    info!(
                        "Connection closed from {} after {} readings",
                        addr, forwarded
                    );
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

/// Frame lines from one connection and forward decoded readings in order
///
/// Returns the number of readings forwarded. Blank lines are skipped;
/// invalid UTF-8 is replaced, so an undecodable line only costs that line.
pub async fn handle_connection<R>(stream: R, addr: SocketAddr, tx: mpsc::Sender<RawReading>) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut forwarded = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Read error from {}: {}", addr, e);
                break;
            }
        }

        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<RawReading>(line) {
            Ok(reading) => {
                debug!("Enqueued reading from {}: {}", addr, line);
                if tx.send(reading).await.is_err() {
                    warn!("Pipeline closed, dropping connection from {}", addr);
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!("JSON decode error from {}: {} (line: {})", addr, e, line),
        }
    }

    forwarded
}
