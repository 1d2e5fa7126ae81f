//! HTTP(S) transport built on a pooled reqwest client.

use super::{copy_chunked, ensure_parent, no_progress, redact, split_credentials, ProgressCallback, Transport, TransportOptions};
use crate::{Result, UpdateError};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, Response, Url};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keep idle pooled connections around between files of one run
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub struct HttpTransport {
    client: Client,
    chunk_size: usize,
}

impl HttpTransport {
    /// Build the pooled client, falling back to reqwest's defaults if the
    /// tuned client cannot be constructed.
    pub fn new(options: &TransportOptions) -> Self {
        let client = Client::builder()
            .connect_timeout(options.timeout)
            .read_timeout(options.timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .user_agent(options.user_agent.clone())
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client ({}), using default client", e);
                Client::new()
            });

        Self::with_client(client, options.chunk_size)
    }

    /// Create a transport around an existing client
    pub fn with_client(client: Client, chunk_size: usize) -> Self {
        Self { client, chunk_size }
    }

    /// Issue the GET, applying user-info credentials as basic auth.
    async fn send(&self, url: &str, cancel: &CancellationToken) -> Result<Response> {
        let parsed = Url::parse(url)
            .map_err(|e| UpdateError::Transport(format!("Invalid URL {}: {}", redact(url), e)))?;
        let (target, credentials) = split_credentials(parsed);

        let mut request = self.client.get(target);
        if let Some(credentials) = credentials {
            request = request.basic_auth(credentials.user, Some(credentials.password));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            result = request.send() => result.map_err(|e| {
                if e.is_connect() {
                    UpdateError::Transport(format!("Connection failed: {}", e))
                } else if e.is_timeout() {
                    UpdateError::Transport(format!("Request timed out: {}", e))
                } else {
                    UpdateError::Http(e)
                }
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Transport(format!(
                "HTTP {}: {}",
                status,
                redact(url)
            )));
        }

        Ok(response)
    }

    async fn stream_into<W>(
        &self,
        url: &str,
        writer: &mut W,
        cancel: &CancellationToken,
        progress: &ProgressCallback,
    ) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let response = self.send(url, cancel).await?;

        // None when the body is being decompressed; the size check is then skipped.
        let content_length = response.content_length();
        debug!("GET {} (content length: {:?})", redact(url), content_length);

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(body);

        copy_chunked(
            &mut reader,
            writer,
            self.chunk_size,
            content_length,
            cancel,
            progress,
        )
        .await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
        progress: ProgressCallback,
    ) -> Result<u64> {
        ensure_parent(destination).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        self.stream_into(url, &mut file, cancel, &progress).await
    }

    async fn fetch_to_memory(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.stream_into(url, &mut buffer, cancel, &no_progress()).await?;
        Ok(buffer)
    }
}
