//! Resolve, cache lookup, network load under backoff, parse.
//!
//! [`Pipeline::load`] covers the network part and yields raw [`LoadEvent`]s;
//! [`Pipeline::execute`] runs the whole sequence and yields parsed
//! [`PipelineEvent`]s. Both streams end either after their terminal success
//! event or with exactly one `Err`.

use crate::backoff::{AlwaysOnline, NetworkStatus, RetryError, try_urls_with_backoff};
use crate::cache::PipelineCache;
use crate::config::PipelineConfig;
use crate::content::PipelineInput;
use crate::error::{LoadError, NetworkError, PipelineError};
use crate::metrics::PipelineMetrics;
use crate::transport::{
    ChunkCompleteInfo, InitTimingInfo, LoadedResponse, LoaderCallbacks, LoaderContext,
    LoaderOutcome, ParserContext, ProgressInfo, Transport,
};
use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    /// First URL that will be tried
    pub url: Option<String>,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkMetrics {
    pub size: u64,
    pub request_duration: Duration,
}

/// Events of the network stage.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Request(RequestInfo),
    Progress(ProgressInfo),
    /// A failed attempt that will be retried; never fatal
    Warning(PipelineError),
    Metrics(NetworkMetrics),
    Response(LoadedResponse),
    Chunk(Bytes),
    ChunkComplete(ChunkCompleteInfo),
}

/// Events of a full pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent<P> {
    Request(RequestInfo),
    Progress(ProgressInfo),
    Warning(PipelineError),
    /// Payload served from the cache, before it is parsed
    Cache(Bytes),
    Metrics(NetworkMetrics),
    Response(LoadedResponse),
    Chunk(P),
    ChunkComplete(ChunkCompleteInfo),
    Data(P),
}

enum Signal {
    Progress(ProgressInfo),
    Chunk(Bytes),
    Retry(LoadError),
}

impl From<Signal> for LoadEvent {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Progress(info) => LoadEvent::Progress(info),
            Signal::Chunk(data) => LoadEvent::Chunk(data),
            Signal::Retry(error) => LoadEvent::Warning(PipelineError::load_warning(error)),
        }
    }
}

enum Step {
    Signal(Signal),
    Done(Result<LoaderOutcome, RetryError>),
}

pub struct Pipeline<I, P> {
    transport: Transport<I, P>,
    config: PipelineConfig,
    cache: Option<Arc<dyn PipelineCache<I>>>,
    metrics: Arc<PipelineMetrics>,
    network_status: Arc<dyn NetworkStatus>,
}

impl<I, P> Clone for Pipeline<I, P> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            cache: self.cache.clone(),
            metrics: Arc::clone(&self.metrics),
            network_status: Arc::clone(&self.network_status),
        }
    }
}

impl<I, P> std::fmt::Debug for Pipeline<I, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("has_cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl<I: PipelineInput, P: Send + 'static> Pipeline<I, P> {
    pub fn new(transport: Transport<I, P>, config: PipelineConfig) -> Self {
        Self {
            transport,
            config,
            cache: None,
            metrics: Arc::new(PipelineMetrics::new()),
            network_status: Arc::new(AlwaysOnline),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PipelineCache<I>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_network_status(mut self, network_status: Arc<dyn NetworkStatus>) -> Self {
        self.network_status = network_status;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Run the transport resolver, if any.
    pub async fn resolve(&self, input: I, token: &CancellationToken) -> Result<I, PipelineError> {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let Some(resolver) = &self.transport.resolver else {
            return Ok(input);
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(PipelineError::Cancelled),
            resolved = resolver.resolve(input) => {
                resolved.map_err(|e| PipelineError::resolve(e.to_string()))
            }
        }
    }

    /// Payload from the cache, counting hits and misses.
    pub fn cached(&self, input: &I) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(input) {
            Some(payload) => {
                self.metrics.record_cache_hit();
                Some(payload)
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    /// Write a whole payload to the cache, if one is configured.
    pub fn store(&self, input: &I, payload: Bytes) {
        if let Some(cache) = &self.cache {
            cache.store(input, payload);
        }
    }

    /// Drop the cached payload for `input`, if any.
    pub fn evict(&self, input: &I) {
        if let Some(cache) = &self.cache {
            cache.evict(input);
        }
    }

    pub fn parse(
        &self,
        payload: Bytes,
        input: &I,
        is_chunked: bool,
        init_timing: Option<&InitTimingInfo>,
    ) -> Result<P, PipelineError> {
        let context = ParserContext { input, is_chunked };
        self.transport
            .parser
            .parse(payload, context, init_timing)
            .map_err(|e| {
                self.metrics.record_parse_error();
                PipelineError::parse(e)
            })
    }

    /// Network stage only: `Request`, then progress/chunks/warnings, then
    /// `Metrics` followed by `Response` or `ChunkComplete`.
    ///
    /// Nothing is written to the cache here; see [`Pipeline::store`].
    pub fn load(&self, input: I, token: CancellationToken) -> BoxStream<'static, Result<LoadEvent, PipelineError>> {
        let pipeline = self.clone();
        Box::pin(stream! {
            if token.is_cancelled() {
                yield Err(PipelineError::Cancelled);
                return;
            }

            let urls = input.urls();
            let first_url = urls.first().cloned().flatten();
            debug!(url = ?first_url, candidates = urls.len(), "Starting request");
            yield Ok(LoadEvent::Request(RequestInfo {
                url: first_url,
                timestamp: Instant::now(),
            }));

            let (tx, mut rx) = mpsc::unbounded_channel();
            let request = pipeline.request_with_backoff(&input, urls, &token, tx);
            tokio::pin!(request);

            let outcome = loop {
                let step = tokio::select! {
                    biased;
                    Some(signal) = rx.recv() => Step::Signal(signal),
                    result = &mut request => Step::Done(result),
                };
                match step {
                    Step::Signal(signal) => {
                        yield Ok(LoadEvent::from(signal));
                    }
                    Step::Done(result) => break result,
                }
            };
            while let Ok(signal) = rx.try_recv() {
                yield Ok(LoadEvent::from(signal));
            }

            match outcome {
                Ok(LoaderOutcome::Loaded(response)) => {
                    pipeline
                        .metrics
                        .record_request(response.size, response.request_duration.as_millis() as u64);
                    yield Ok(LoadEvent::Metrics(NetworkMetrics {
                        size: response.size,
                        request_duration: response.request_duration,
                    }));
                    yield Ok(LoadEvent::Response(response));
                }
                Ok(LoaderOutcome::ChunkComplete(info)) => {
                    pipeline
                        .metrics
                        .record_request(info.size, info.request_duration.as_millis() as u64);
                    yield Ok(LoadEvent::Metrics(NetworkMetrics {
                        size: info.size,
                        request_duration: info.request_duration,
                    }));
                    yield Ok(LoadEvent::ChunkComplete(info));
                }
                Err(RetryError::Cancelled) => {
                    debug!("Request cancelled");
                    yield Err(PipelineError::Cancelled);
                }
                Err(RetryError::Failed(error)) => {
                    pipeline.metrics.record_load_error();
                    yield Err(PipelineError::load_fatal(error));
                }
            }
        })
    }

    /// Full run: resolve, cache, load, parse.
    ///
    /// A cached payload that fails to parse is evicted and the segment is
    /// loaded from the network instead. Network payloads are cached only
    /// once they parsed.
    pub fn execute(&self, input: I, token: CancellationToken) -> BoxStream<'static, Result<PipelineEvent<P>, PipelineError>> {
        let pipeline = self.clone();
        Box::pin(stream! {
            let input = match pipeline.resolve(input, &token).await {
                Ok(input) => input,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            if let Some(payload) = pipeline.cached(&input) {
                debug!(size = payload.len(), "Serving from cache");
                yield Ok(PipelineEvent::Cache(payload.clone()));
                match pipeline.parse(payload, &input, false, None) {
                    Ok(data) => {
                        yield Ok(PipelineEvent::Data(data));
                        return;
                    }
                    Err(error) => {
                        warn!(error = %error, "Cached payload could not be parsed, loading from network");
                        pipeline.evict(&input);
                    }
                }
            }

            let mut events = pipeline.load(input.clone(), token);
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                match event {
                    LoadEvent::Request(info) => {
                        yield Ok(PipelineEvent::Request(info));
                    }
                    LoadEvent::Progress(info) => {
                        yield Ok(PipelineEvent::Progress(info));
                    }
                    LoadEvent::Warning(error) => {
                        yield Ok(PipelineEvent::Warning(error));
                    }
                    LoadEvent::Metrics(metrics) => {
                        yield Ok(PipelineEvent::Metrics(metrics));
                    }
                    LoadEvent::Response(response) => {
                        let payload = response.data.clone();
                        yield Ok(PipelineEvent::Response(response));
                        match pipeline.parse(payload.clone(), &input, false, None) {
                            Ok(data) => {
                                pipeline.store(&input, payload);
                                yield Ok(PipelineEvent::Data(data));
                            }
                            Err(error) => {
                                yield Err(error);
                                return;
                            }
                        }
                    }
                    LoadEvent::Chunk(payload) => {
                        match pipeline.parse(payload, &input, true, None) {
                            Ok(data) => {
                                yield Ok(PipelineEvent::Chunk(data));
                            }
                            Err(error) => {
                                yield Err(error);
                                return;
                            }
                        }
                    }
                    LoadEvent::ChunkComplete(info) => {
                        yield Ok(PipelineEvent::ChunkComplete(info));
                    }
                }
            }
        })
    }

    async fn request_with_backoff(
        &self,
        input: &I,
        urls: Vec<Option<String>>,
        token: &CancellationToken,
        tx: mpsc::UnboundedSender<Signal>,
    ) -> Result<LoaderOutcome, RetryError> {
        let options = self.config.backoff_options(Arc::clone(&self.network_status));
        let progress_tx = tx.clone();
        let chunk_tx = tx.clone();
        let callbacks = LoaderCallbacks::new(
            move |info| {
                trace!(size = info.size, total_size = ?info.total_size, "Progress");
                let _ = progress_tx.send(Signal::Progress(info));
            },
            move |data| {
                let _ = chunk_tx.send(Signal::Chunk(data));
            },
        );
        let timeout = self.config.request_timeout;

        try_urls_with_backoff(
            urls,
            &options,
            token,
            |url| {
                let loader = Arc::clone(&self.transport.loader);
                let context = LoaderContext {
                    url: url.clone(),
                    callbacks: callbacks.clone(),
                    token: token.clone(),
                };
                async move {
                    let load = loader.load(input, context);
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, load)
                            .await
                            .unwrap_or_else(|_| Err(NetworkError::timeout(url).into())),
                        None => load.await,
                    }
                }
            },
            |error| {
                self.metrics.record_retry();
                let _ = tx.send(Signal::Retry(error.clone()));
            },
        )
        .await
    }
}
