//! Per-buffer-type segment fetcher.
//!
//! Wraps a [`Pipeline`] for [`ContentLocator`]s, reports request lifecycle
//! and network metrics to an [`AbrObserver`], and hands data back as
//! [`SegmentChunk`]s that the caller parses when it is ready to.

use crate::abr::{AbrEvent, AbrObserver};
use crate::cache::InitSegmentCache;
use crate::content::{BufferType, ContentLocator, SegmentDescriptor};
use crate::error::PipelineError;
use crate::pipeline::{LoadEvent, NetworkMetrics, Pipeline};
use crate::transport::{InitTimingInfo, ProgressInfo};
use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

/// Loaded data of one segment (or one partial chunk of it), not yet parsed.
pub struct SegmentChunk<P> {
    payload: Bytes,
    locator: ContentLocator,
    is_chunked: bool,
    from_cache: bool,
    pipeline: Pipeline<ContentLocator, P>,
}

impl<P: Send + 'static> SegmentChunk<P> {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn locator(&self) -> &ContentLocator {
        &self.locator
    }

    pub fn is_chunked(&self) -> bool {
        self.is_chunked
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    /// Run the transport parser. Parse failures are fatal and never retried.
    ///
    /// A whole payload that fails to parse is evicted from the init-segment
    /// cache, so the next request for it goes back to the network.
    pub fn parse(&self, init_timing: Option<&InitTimingInfo>) -> Result<P, PipelineError> {
        let parsed = self
            .pipeline
            .parse(self.payload.clone(), &self.locator, self.is_chunked, init_timing);
        if parsed.is_err() && !self.is_chunked {
            self.pipeline.evict(&self.locator);
        }
        parsed
    }
}

impl<P> fmt::Debug for SegmentChunk<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentChunk")
            .field("segment", &self.locator.segment.id)
            .field("size", &self.payload.len())
            .field("is_chunked", &self.is_chunked)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

#[derive(Debug)]
pub enum FetcherEvent<P> {
    /// Retried failure; the fetch goes on
    Warning(PipelineError),
    /// Init segment served from the cache
    Cache(SegmentChunk<P>),
    Chunk(SegmentChunk<P>),
    /// Every chunk of the segment was delivered
    ChunkComplete,
}

pub struct SegmentFetcher<P> {
    buffer_type: BufferType,
    pipeline: Pipeline<ContentLocator, P>,
    abr: Option<Arc<dyn AbrObserver>>,
    next_request_id: Arc<AtomicU64>,
    init_segment_cache: Option<Arc<InitSegmentCache>>,
}

impl<P> Clone for SegmentFetcher<P> {
    fn clone(&self) -> Self {
        Self {
            buffer_type: self.buffer_type,
            pipeline: self.pipeline.clone(),
            abr: self.abr.clone(),
            next_request_id: Arc::clone(&self.next_request_id),
            init_segment_cache: self.init_segment_cache.clone(),
        }
    }
}

impl<P> fmt::Debug for SegmentFetcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentFetcher")
            .field("buffer_type", &self.buffer_type)
            .field("pipeline", &self.pipeline)
            .field("has_abr", &self.abr.is_some())
            .finish_non_exhaustive()
    }
}

impl<P: Send + 'static> SegmentFetcher<P> {
    pub fn new(
        buffer_type: BufferType,
        pipeline: Pipeline<ContentLocator, P>,
        abr: Option<Arc<dyn AbrObserver>>,
    ) -> Self {
        Self {
            buffer_type,
            pipeline,
            abr,
            next_request_id: Arc::new(AtomicU64::new(0)),
            init_segment_cache: None,
        }
    }

    /// Serve init segments from `cache` and keep it filled from the network.
    pub fn with_init_segment_cache(mut self, cache: Arc<InitSegmentCache>) -> Self {
        self.pipeline = self.pipeline.with_cache(cache.clone());
        self.init_segment_cache = Some(cache);
        self
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn pipeline(&self) -> &Pipeline<ContentLocator, P> {
        &self.pipeline
    }

    pub fn init_segment_cache(&self) -> Option<&Arc<InitSegmentCache>> {
        self.init_segment_cache.as_ref()
    }

    /// Track teardown: drop every cached init segment and log the counters.
    pub fn dispose(&self) {
        if let Some(cache) = &self.init_segment_cache {
            cache.clear();
        }
        self.pipeline.metrics().log_summary(self.buffer_type.as_str());
    }

    /// Fetch one segment.
    ///
    /// Yields warnings and chunks (or one `Cache` item), then
    /// `ChunkComplete`, or ends with one `Err`. Dropping the stream aborts
    /// the request.
    ///
    /// A cached init segment is parsed once before being served; when that
    /// fails the entry is evicted and the segment is loaded again.
    pub fn fetch(
        &self,
        locator: ContentLocator,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<FetcherEvent<P>, PipelineError>> {
        let fetcher = self.clone();
        Box::pin(stream! {
            let span = debug_span!(
                "segment_fetch",
                buffer_type = %fetcher.buffer_type,
                segment = %locator.segment.id,
                request_id = tracing::field::Empty,
            );
            let locator = match fetcher.pipeline.resolve(locator, &token).instrument(span.clone()).await {
                Ok(locator) => locator,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            if let Some(payload) = fetcher.pipeline.cached(&locator) {
                match fetcher.pipeline.parse(payload.clone(), &locator, false, None) {
                    Ok(_) => {
                        span.in_scope(|| debug!(size = payload.len(), "Init segment served from cache"));
                        yield Ok(FetcherEvent::Cache(fetcher.chunk(payload, &locator, false, true)));
                        yield Ok(FetcherEvent::ChunkComplete);
                        return;
                    }
                    Err(error) => {
                        span.in_scope(|| warn!(error = %error, "Cached init segment could not be parsed, loading from network"));
                        fetcher.pipeline.evict(&locator);
                    }
                }
            }

            let request_id = fetcher.next_request_id.fetch_add(1, Ordering::Relaxed);
            span.record("request_id", request_id);
            let mut tracker = RequestTracker::new(
                fetcher.abr.clone(),
                fetcher.buffer_type,
                request_id,
                &locator.segment,
            );

            let mut events = fetcher.pipeline.load(locator.clone(), token);
            while let Some(event) = events.next().instrument(span.clone()).await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        tracker.end();
                        yield Err(error);
                        return;
                    }
                };
                match event {
                    LoadEvent::Request(info) => tracker.begin(info.timestamp),
                    LoadEvent::Progress(info) => tracker.progress(&info),
                    LoadEvent::Warning(error) => {
                        yield Ok(FetcherEvent::Warning(error));
                    }
                    LoadEvent::Metrics(metrics) => tracker.metrics(metrics),
                    LoadEvent::Response(response) => {
                        // Checked again before it is ever served from the cache.
                        fetcher.pipeline.store(&locator, response.data.clone());
                        yield Ok(FetcherEvent::Chunk(fetcher.chunk(response.data, &locator, false, false)));
                    }
                    LoadEvent::Chunk(data) => {
                        yield Ok(FetcherEvent::Chunk(fetcher.chunk(data, &locator, true, false)));
                    }
                    LoadEvent::ChunkComplete(_) => {}
                }
            }

            tracker.end();
            yield Ok(FetcherEvent::ChunkComplete);
        })
    }

    fn chunk(&self, payload: Bytes, locator: &ContentLocator, is_chunked: bool, from_cache: bool) -> SegmentChunk<P> {
        SegmentChunk {
            payload,
            locator: locator.clone(),
            is_chunked,
            from_cache,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Emits the ABR lifecycle of one request and guarantees a `RequestEnd`
/// for every `RequestBegin`, including when the fetch is dropped mid-flight.
struct RequestTracker {
    abr: Option<Arc<dyn AbrObserver>>,
    buffer_type: BufferType,
    id: u64,
    time: f64,
    duration: f64,
    is_init: bool,
    begun: bool,
    ended: bool,
}

impl RequestTracker {
    fn new(
        abr: Option<Arc<dyn AbrObserver>>,
        buffer_type: BufferType,
        id: u64,
        segment: &SegmentDescriptor,
    ) -> Self {
        Self {
            abr,
            buffer_type,
            id,
            time: segment.time,
            duration: segment.duration,
            is_init: segment.is_init,
            begun: false,
            ended: false,
        }
    }

    fn begin(&mut self, timestamp: Instant) {
        // Init segments carry no timing worth feeding to the estimator.
        if self.is_init || self.begun {
            return;
        }
        let Some(abr) = &self.abr else { return };
        abr.on_event(AbrEvent::RequestBegin {
            buffer_type: self.buffer_type,
            id: self.id,
            time: self.time,
            duration: self.duration,
            timestamp,
        });
        self.begun = true;
    }

    fn progress(&self, info: &ProgressInfo) {
        if !self.begun || self.ended {
            return;
        }
        let Some(abr) = &self.abr else { return };
        match info.total_size {
            Some(total) if info.size < total => abr.on_event(AbrEvent::RequestProgress {
                buffer_type: self.buffer_type,
                id: self.id,
                size: info.size,
                total_size: info.total_size,
                duration: info.duration,
                timestamp: Instant::now(),
            }),
            _ => {}
        }
    }

    fn metrics(&self, metrics: NetworkMetrics) {
        let Some(abr) = &self.abr else { return };
        abr.on_event(AbrEvent::Metrics {
            buffer_type: self.buffer_type,
            size: metrics.size,
            request_duration: metrics.request_duration,
            segment_duration: self.duration,
        });
    }

    fn end(&mut self) {
        if !self.begun || self.ended {
            return;
        }
        self.ended = true;
        if let Some(abr) = &self.abr {
            abr.on_event(AbrEvent::RequestEnd {
                buffer_type: self.buffer_type,
                id: self.id,
            });
        }
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.end();
    }
}
