/// Delivery of finished summaries to the remote collector
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::comm::retry::RetryPolicy;
use crate::error::SinkError;
use crate::models::Summary;

/// Destination for summaries. A send either succeeds or fails; no
/// acknowledgement beyond that is expected.
#[async_trait]
pub trait CollectorSink: Send + Sync {
    async fn send(&self, summary: &Summary) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: CollectorSink + ?Sized> CollectorSink for Arc<T> {
    async fn send(&self, summary: &Summary) -> Result<(), SinkError> {
        (**self).send(summary).await
    }
}

/// Writes each summary as one JSON line over a fresh TCP connection
#[derive(Debug, Clone)]
pub struct TcpCollector {
    address: String,
    retry: RetryPolicy,
    connect_timeout: Duration,
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound one connection attempt; running out of time counts as a failed attempt
async fn within<T, F>(limit: Duration, attempt: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no connection within {:?}", limit),
        )),
    }
}

impl TcpCollector {
    /// Build from a `tcp://host:port` URL
    pub fn from_url(url: &Url, retry: RetryPolicy) -> Result<Self, SinkError> {
        if url.scheme() != "tcp" {
            return Err(SinkError::InvalidAddress(format!(
                "unsupported scheme '{}' in {}",
                url.scheme(),
                url
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| SinkError::InvalidAddress(format!("missing host in {}", url)))?;
        let port = url
            .port()
            .ok_or_else(|| SinkError::InvalidAddress(format!("missing port in {}", url)))?;

        Ok(TcpCollector {
            address: format!("{}:{}", host, port),
            retry,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream, SinkError> {
        let mut attempt = 0;
        loop {
            match within(self.connect_timeout, TcpStream::connect(&self.address)).await {
                Ok(stream) => return Ok(stream),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Collector {} unreachable ({}), retrying in {:?}",
                        self.address, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Collector {} unreachable: {}", self.address, e);
                    return Err(SinkError::RetriesExhausted {
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl CollectorSink for TcpCollector {
    async fn send(&self, summary: &Summary) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(summary)?;
        line.push(b'\n');

        let mut stream = self.connect().await?;
        stream.write_all(&line).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
