//! Transport contract.
//!
//! A transport is three pluggable pieces supplied per buffer type:
//!
//! - a [`Loader`] that turns an input (plus the URL currently being tried)
//!   into bytes, reporting progress and, in low-latency mode, partial chunks
//!   through [`LoaderCallbacks`];
//! - a [`Parser`] that turns those bytes into whatever the caller buffers;
//! - an optional [`Resolver`] that rewrites the input before loading.
//!
//! The loader never retries on its own. Retries, URL rotation, timeouts and
//! cancellation are applied around it by the pipeline.

pub mod http;

use crate::content::PipelineInput;
use crate::error::{LoadError, ParseError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Bytes received so far
    pub size: u64,
    /// Expected size, when the server announced one
    pub total_size: Option<u64>,
    /// Time elapsed since the request was sent
    pub duration: Duration,
    pub url: Option<String>,
}

type ProgressFn = dyn Fn(ProgressInfo) + Send + Sync;
type ChunkFn = dyn Fn(Bytes) + Send + Sync;

/// Hooks a loader calls while a request is in flight.
#[derive(Clone)]
pub struct LoaderCallbacks {
    progress: Arc<ProgressFn>,
    chunk: Arc<ChunkFn>,
}

impl LoaderCallbacks {
    pub fn new(
        progress: impl Fn(ProgressInfo) + Send + Sync + 'static,
        chunk: impl Fn(Bytes) + Send + Sync + 'static,
    ) -> Self {
        Self {
            progress: Arc::new(progress),
            chunk: Arc::new(chunk),
        }
    }

    /// Callbacks that drop everything.
    pub fn detached() -> Self {
        Self::new(|_| {}, |_| {})
    }

    pub fn on_progress(&self, info: ProgressInfo) {
        (self.progress)(info)
    }

    /// Hand over a partial payload. Only meaningful for chunked loads.
    pub fn on_new_chunk(&self, data: Bytes) {
        (self.chunk)(data)
    }
}

impl fmt::Debug for LoaderCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCallbacks").finish_non_exhaustive()
    }
}

/// Per-attempt context handed to a loader.
#[derive(Debug, Clone)]
pub struct LoaderContext {
    /// URL chosen for this attempt; `None` when the input carries none
    pub url: Option<String>,
    pub callbacks: LoaderCallbacks,
    /// Cancelled when the caller gives up on the request
    pub token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedResponse {
    pub data: Bytes,
    pub size: u64,
    pub request_duration: Duration,
    pub url: Option<String>,
}

impl LoadedResponse {
    pub fn new(data: Bytes, request_duration: Duration, url: Option<String>) -> Self {
        Self {
            size: data.len() as u64,
            data,
            request_duration,
            url,
        }
    }
}

/// Terminal summary of a chunked load; the data itself went through `on_new_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCompleteInfo {
    pub size: u64,
    pub request_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoaderOutcome {
    Loaded(LoadedResponse),
    ChunkComplete(ChunkCompleteInfo),
}

#[async_trait]
pub trait Loader<I>: Send + Sync {
    async fn load(&self, input: &I, context: LoaderContext) -> Result<LoaderOutcome, LoadError>;
}

/// Timing carried over from a Representation's init segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitTimingInfo {
    pub timescale: u32,
}

#[derive(Debug)]
pub struct ParserContext<'a, I> {
    pub input: &'a I,
    /// `true` when the payload is one partial chunk of a low-latency load
    pub is_chunked: bool,
}

impl<I> Clone for ParserContext<'_, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I> Copy for ParserContext<'_, I> {}

pub trait Parser<I>: Send + Sync {
    type Output;

    fn parse(
        &self,
        payload: Bytes,
        context: ParserContext<'_, I>,
        init_timing: Option<&InitTimingInfo>,
    ) -> Result<Self::Output, ParseError>;
}

#[async_trait]
pub trait Resolver<I>: Send + Sync {
    async fn resolve(&self, input: I) -> Result<I, BoxError>;
}

/// Returns the input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

#[async_trait]
impl<I: Send + 'static> Resolver<I> for IdentityResolver {
    async fn resolve(&self, input: I) -> Result<I, BoxError> {
        Ok(input)
    }
}

/// Loader, parser and optional resolver for one kind of input.
pub struct Transport<I, P> {
    pub loader: Arc<dyn Loader<I>>,
    pub parser: Arc<dyn Parser<I, Output = P>>,
    pub resolver: Option<Arc<dyn Resolver<I>>>,
}

impl<I, P> Transport<I, P> {
    pub fn new(loader: Arc<dyn Loader<I>>, parser: Arc<dyn Parser<I, Output = P>>) -> Self {
        Self {
            loader,
            parser,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver<I>>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

impl<I, P> Clone for Transport<I, P> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            parser: Arc::clone(&self.parser),
            resolver: self.resolver.clone(),
        }
    }
}

impl<I, P> fmt::Debug for Transport<I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("has_resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

/// Parser output for [`PassthroughParser`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSegment {
    pub data: Bytes,
    pub is_init: bool,
    pub is_chunked: bool,
    pub timescale: Option<u32>,
}

/// Hands the payload back untouched.
pub struct PassthroughParser<I> {
    _input: PhantomData<fn(&I)>,
}

impl<I> PassthroughParser<I> {
    pub fn new() -> Self {
        Self { _input: PhantomData }
    }
}

impl<I> Default for PassthroughParser<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> fmt::Debug for PassthroughParser<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PassthroughParser")
    }
}

impl<I: PipelineInput> Parser<I> for PassthroughParser<I> {
    type Output = ParsedSegment;

    fn parse(
        &self,
        payload: Bytes,
        context: ParserContext<'_, I>,
        init_timing: Option<&InitTimingInfo>,
    ) -> Result<ParsedSegment, ParseError> {
        Ok(ParsedSegment {
            data: payload,
            is_init: context.input.is_init_segment(),
            is_chunked: context.is_chunked,
            timescale: init_timing.map(|timing| timing.timescale),
        })
    }
}
