//! Manifest loading on top of the generic pipeline.
//!
//! Manifests are never chunked and never cached; they are parsed as soon as
//! they arrive.

use crate::backoff::{AlwaysOnline, NetworkStatus};
use crate::config::ManifestFetcherConfig;
use crate::content::ManifestRequest;
use crate::error::{ParseError, PipelineError};
use crate::pipeline::{Pipeline, PipelineEvent};
use crate::transport::Transport;
use async_stream::stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedManifest<M> {
    pub manifest: M,
    /// URL the document was finally loaded from
    pub url: Option<String>,
    pub size: u64,
    pub request_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestEvent<M> {
    Warning(PipelineError),
    Parsed(FetchedManifest<M>),
}

pub struct ManifestFetcher<M> {
    pipeline: Pipeline<ManifestRequest, M>,
}

impl<M> Clone for ManifestFetcher<M> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ManifestFetcher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestFetcher")
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl<M: Send + 'static> ManifestFetcher<M> {
    pub fn new(transport: Transport<ManifestRequest, M>, config: ManifestFetcherConfig) -> Self {
        Self::with_network_status(transport, config, Arc::new(AlwaysOnline))
    }

    pub fn with_network_status(
        transport: Transport<ManifestRequest, M>,
        config: ManifestFetcherConfig,
        network_status: Arc<dyn NetworkStatus>,
    ) -> Self {
        Self {
            pipeline: Pipeline::new(transport, config.pipeline_config())
                .with_network_status(network_status),
        }
    }

    pub fn pipeline(&self) -> &Pipeline<ManifestRequest, M> {
        &self.pipeline
    }

    /// Load and parse the manifest, yielding retry warnings along the way.
    pub fn fetch(
        &self,
        request: ManifestRequest,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<ManifestEvent<M>, PipelineError>> {
        let mut events = self.pipeline.execute(request, token);
        Box::pin(stream! {
            let mut response = None;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                match event {
                    PipelineEvent::Request(info) => {
                        debug!(url = ?info.url, "Loading manifest");
                    }
                    PipelineEvent::Progress(_) | PipelineEvent::Metrics(_) => {}
                    PipelineEvent::Warning(error) => {
                        yield Ok(ManifestEvent::Warning(error));
                    }
                    PipelineEvent::Response(loaded) => {
                        response = Some(loaded);
                    }
                    PipelineEvent::Data(manifest) => {
                        let (url, size, request_duration) = match response.take() {
                            Some(loaded) => (loaded.url, loaded.size, loaded.request_duration),
                            None => (None, 0, Duration::ZERO),
                        };
                        yield Ok(ManifestEvent::Parsed(FetchedManifest {
                            manifest,
                            url,
                            size,
                            request_duration,
                        }));
                        return;
                    }
                    // No cache is ever configured for manifests, but a
                    // cached document would be followed by its `Data` event.
                    PipelineEvent::Cache(_) => {}
                    PipelineEvent::Chunk(_) | PipelineEvent::ChunkComplete(_) => {
                        warn!("Loader returned a chunked manifest");
                        yield Err(PipelineError::parse(ParseError::new(
                            "manifest loaders must return the whole document",
                        )));
                        return;
                    }
                }
            }
        })
    }
}

/// Fetch a manifest and wait for the parsed result, logging warnings.
#[instrument(skip(fetcher, token), fields(url = ?request.url), level = "debug")]
pub async fn fetch_manifest<M: Send + 'static>(
    fetcher: &ManifestFetcher<M>,
    request: ManifestRequest,
    token: CancellationToken,
) -> Result<FetchedManifest<M>, PipelineError> {
    let mut events = fetcher.fetch(request, token);
    while let Some(event) = events.next().await {
        match event? {
            ManifestEvent::Warning(error) => warn!(error = %error, "Manifest request failed, retrying"),
            ManifestEvent::Parsed(fetched) => return Ok(fetched),
        }
    }
    Err(PipelineError::load_fatal(crate::error::LoadError::other(
        "manifest stream ended without a document",
    )))
}
