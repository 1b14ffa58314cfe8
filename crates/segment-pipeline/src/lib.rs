//! # Segment Pipeline
//!
//! Request core of an adaptive-streaming client: everything between "the
//! player wants this segment at this priority" and "here are the bytes,
//! parse them when you can".
//!
//! ## Features
//!
//! - Exponential backoff with jitter and separate retry budgets for regular
//!   and offline failures, with rotation across CDN URLs
//! - Per-Representation init-segment cache
//! - Priority-based admission of concurrent requests, with priority updates
//!   while queued
//! - A resolve / cache / load / parse pipeline producing typed event streams,
//!   including a chunked mode for low-latency streaming
//! - Per-buffer-type segment fetchers that feed request lifecycle and
//!   bandwidth metrics to an ABR estimator
//!
//! Transports (loader, parser, optional resolver) are plugged in through the
//! traits in [`transport`]; an HTTP loader built on `reqwest` is included.

pub mod abr;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod content;
pub mod creator;
pub mod error;
pub mod fetcher;
pub mod manifest;
pub mod metrics;
pub mod pipeline;
pub mod prioritizer;
pub mod transport;

pub use abr::{AbrEvent, AbrObserver, FnObserver};
pub use backoff::{AlwaysOnline, NetworkStatus, SharedNetworkStatus};
pub use cache::{InitSegmentCache, PipelineCache};
pub use config::{BackoffConfig, FetcherCreatorConfig, ManifestFetcherConfig, PipelineConfig, RetryLimit};
pub use content::{BufferType, ContentLocator, ManifestRequest, PipelineInput, RepresentationKey, SegmentDescriptor};
pub use creator::{PrioritizedSegmentFetcher, SegmentFetcherCreator, SegmentRequest};
pub use error::{ErrorCode, LoadError, NetworkError, NetworkErrorKind, ParseError, PipelineError};
pub use fetcher::{FetcherEvent, SegmentChunk, SegmentFetcher};
pub use manifest::{FetchedManifest, ManifestEvent, ManifestFetcher, fetch_manifest};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{LoadEvent, Pipeline, PipelineEvent};
pub use prioritizer::{Prioritized, Prioritizer, TaskHandle};
pub use transport::http::HttpLoader;
pub use transport::{Loader, Parser, Resolver, Transport};
