use crate::abr::AbrObserver;
use crate::backoff::{AlwaysOnline, NetworkStatus};
use crate::cache::InitSegmentCache;
use crate::config::FetcherCreatorConfig;
use crate::content::{BufferType, ContentLocator};
use crate::error::PipelineError;
use crate::fetcher::{FetcherEvent, SegmentFetcher};
use crate::pipeline::Pipeline;
use crate::prioritizer::{Prioritizer, TaskHandle};
use crate::transport::Transport;
use async_stream::stream;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builds one [`PrioritizedSegmentFetcher`] per buffer type, all sharing a
/// single [`Prioritizer`].
#[derive(Debug, Clone)]
pub struct SegmentFetcherCreator {
    prioritizer: Prioritizer,
    config: FetcherCreatorConfig,
    network_status: Arc<dyn NetworkStatus>,
}

impl SegmentFetcherCreator {
    pub fn new(config: FetcherCreatorConfig) -> Self {
        Self {
            prioritizer: Prioritizer::new(),
            config,
            network_status: Arc::new(AlwaysOnline),
        }
    }

    pub fn with_network_status(mut self, network_status: Arc<dyn NetworkStatus>) -> Self {
        self.network_status = network_status;
        self
    }

    pub fn prioritizer(&self) -> &Prioritizer {
        &self.prioritizer
    }

    pub fn config(&self) -> &FetcherCreatorConfig {
        &self.config
    }

    pub fn create_segment_fetcher<P: Send + 'static>(
        &self,
        buffer_type: BufferType,
        transport: Transport<ContentLocator, P>,
        abr: Option<Arc<dyn AbrObserver>>,
    ) -> PrioritizedSegmentFetcher<P> {
        let pipeline = Pipeline::new(transport, self.config.pipeline_config())
            .with_network_status(Arc::clone(&self.network_status));
        let mut fetcher = SegmentFetcher::new(buffer_type, pipeline, abr);
        if self.config.cache_init_segments {
            fetcher = fetcher.with_init_segment_cache(Arc::new(InitSegmentCache::new()));
        }
        debug!(
            buffer_type = %buffer_type,
            low_latency = self.config.low_latency_mode,
            cache = self.config.cache_init_segments,
            "Created segment fetcher"
        );
        PrioritizedSegmentFetcher {
            fetcher,
            prioritizer: self.prioritizer.clone(),
        }
    }
}

impl Default for SegmentFetcherCreator {
    fn default() -> Self {
        Self::new(FetcherCreatorConfig::default())
    }
}

/// A [`SegmentFetcher`] whose requests go through the shared prioritizer.
pub struct PrioritizedSegmentFetcher<P> {
    fetcher: SegmentFetcher<P>,
    prioritizer: Prioritizer,
}

impl<P> Clone for PrioritizedSegmentFetcher<P> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            prioritizer: self.prioritizer.clone(),
        }
    }
}

impl<P> fmt::Debug for PrioritizedSegmentFetcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrioritizedSegmentFetcher")
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

impl<P: Send + 'static> PrioritizedSegmentFetcher<P> {
    /// Request a segment at `priority`.
    ///
    /// Nothing happens until the returned stream is polled. Cancelling `token`
    /// ends the stream with [`PipelineError::Cancelled`] whether the request
    /// is still queued, backing off or in flight.
    pub fn create_request(
        &self,
        locator: ContentLocator,
        priority: i32,
        token: CancellationToken,
    ) -> SegmentRequest<P> {
        let prioritized = self
            .prioritizer
            .create(self.fetcher.fetch(locator, token.clone()), priority);
        let handle = prioritized.handle().clone();

        let inner = Box::pin(stream! {
            let mut prioritized = prioritized;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = prioritized.next() => Some(item),
                };
                match next {
                    None => {
                        yield Err(PipelineError::Cancelled);
                        return;
                    }
                    Some(None) => return,
                    Some(Some(item)) => {
                        yield item;
                    }
                }
            }
        });
        SegmentRequest { handle, inner }
    }

    /// See [`Prioritizer::update_priority`].
    pub fn update_priority(&self, handle: &TaskHandle, priority: i32) {
        self.prioritizer.update_priority(handle, priority);
    }

    pub fn fetcher(&self) -> &SegmentFetcher<P> {
        &self.fetcher
    }

    pub fn init_segment_cache(&self) -> Option<&Arc<InitSegmentCache>> {
        self.fetcher.init_segment_cache()
    }

    /// See [`SegmentFetcher::dispose`].
    pub fn dispose(&self) {
        self.fetcher.dispose();
    }
}

/// Event stream of one prioritized segment request.
pub struct SegmentRequest<P> {
    handle: TaskHandle,
    inner: BoxStream<'static, Result<FetcherEvent<P>, PipelineError>>,
}

impl<P> SegmentRequest<P> {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }
}

impl<P> Stream for SegmentRequest<P> {
    type Item = Result<FetcherEvent<P>, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<P> fmt::Debug for SegmentRequest<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRequest")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
