// Plain HTTP(S) loader on top of reqwest.

use super::{ChunkCompleteInfo, LoadedResponse, Loader, LoaderContext, LoaderOutcome, ProgressInfo};
use crate::content::{ByteRange, ContentLocator, ManifestRequest, PipelineInput};
use crate::error::{LoadError, NetworkError};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::RANGE;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
    chunked: bool,
}

impl HttpLoader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            chunked: false,
        }
    }

    /// Low-latency mode: hand every body chunk to `on_new_chunk` instead of
    /// buffering the whole response.
    pub fn with_chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    async fn fetch(
        &self,
        range: Option<ByteRange>,
        context: &LoaderContext,
        chunked: bool,
    ) -> Result<LoaderOutcome, LoadError> {
        let Some(raw_url) = context.url.as_deref() else {
            return Err(LoadError::other("no URL to load"));
        };
        let url = Url::parse(raw_url)
            .map_err(|e| LoadError::other(format!("invalid URL {raw_url}: {e}")))?;

        let started = Instant::now();
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_header_value());
        }
        debug!(url = raw_url, range = ?range, chunked, "Sending request");

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, raw_url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::http_status(status.as_u16(), Some(raw_url.to_string())).into());
        }

        let total_size = response.content_length();
        let mut buffer = if chunked {
            BytesMut::new()
        } else {
            BytesMut::with_capacity(prealloc_size(total_size))
        };
        let mut body = response.bytes_stream();
        let mut size = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(e, raw_url))?;
            size += chunk.len() as u64;
            trace!(url = raw_url, size, total_size = ?total_size, "Received body chunk");
            context.callbacks.on_progress(ProgressInfo {
                size,
                total_size,
                duration: started.elapsed(),
                url: Some(raw_url.to_string()),
            });
            if chunked {
                context.callbacks.on_new_chunk(chunk);
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }

        let request_duration = started.elapsed();
        if chunked {
            return Ok(LoaderOutcome::ChunkComplete(ChunkCompleteInfo {
                size,
                request_duration,
            }));
        }
        Ok(LoaderOutcome::Loaded(LoadedResponse::new(
            buffer.freeze(),
            request_duration,
            Some(raw_url.to_string()),
        )))
    }
}

impl Default for HttpLoader {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

/// The header is only a hint; the buffer grows as the body actually arrives.
fn prealloc_size(content_length: Option<u64>) -> usize {
    content_length.map_or(0, |len| len.min(MAX_PREALLOC) as usize)
}

fn map_reqwest_error(error: reqwest::Error, url: &str) -> LoadError {
    if error.is_timeout() {
        NetworkError::timeout(Some(url.to_string())).into()
    } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
        NetworkError::connection(Some(url.to_string()), error.to_string()).into()
    } else {
        LoadError::other(error.to_string())
    }
}

#[async_trait]
impl Loader<ContentLocator> for HttpLoader {
    async fn load(
        &self,
        input: &ContentLocator,
        context: LoaderContext,
    ) -> Result<LoaderOutcome, LoadError> {
        self.fetch(input.byte_range(), &context, self.chunked).await
    }
}

#[async_trait]
impl Loader<ManifestRequest> for HttpLoader {
    async fn load(
        &self,
        _input: &ManifestRequest,
        context: LoaderContext,
    ) -> Result<LoaderOutcome, LoadError> {
        // Manifests are always parsed whole.
        self.fetch(None, &context, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prealloc_is_capped() {
        assert_eq!(prealloc_size(None), 0);
        assert_eq!(prealloc_size(Some(1024)), 1024);
        assert_eq!(prealloc_size(Some(1_000_000_000_000_000)), MAX_PREALLOC as usize);
    }
}
