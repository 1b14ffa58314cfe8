//! Observations consumed by the adaptive-bitrate estimator.

use crate::content::BufferType;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum AbrEvent {
    /// A network request completed
    Metrics {
        buffer_type: BufferType,
        size: u64,
        request_duration: Duration,
        /// Media duration of the segment, in seconds
        segment_duration: f64,
    },
    RequestBegin {
        buffer_type: BufferType,
        id: u64,
        /// Segment start time, in seconds
        time: f64,
        /// Segment duration, in seconds
        duration: f64,
        timestamp: Instant,
    },
    RequestProgress {
        buffer_type: BufferType,
        id: u64,
        size: u64,
        total_size: Option<u64>,
        duration: Duration,
        timestamp: Instant,
    },
    /// Always sent once for every `RequestBegin`, however the request ended
    RequestEnd { buffer_type: BufferType, id: u64 },
}

impl AbrEvent {
    pub fn buffer_type(&self) -> BufferType {
        match self {
            Self::Metrics { buffer_type, .. }
            | Self::RequestBegin { buffer_type, .. }
            | Self::RequestProgress { buffer_type, .. }
            | Self::RequestEnd { buffer_type, .. } => *buffer_type,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Metrics { .. } => None,
            Self::RequestBegin { id, .. }
            | Self::RequestProgress { id, .. }
            | Self::RequestEnd { id, .. } => Some(*id),
        }
    }
}

/// Sink for [`AbrEvent`]s. Called synchronously from the fetch path, so
/// implementations must not block.
pub trait AbrObserver: Send + Sync {
    fn on_event(&self, event: AbrEvent);
}

impl AbrObserver for mpsc::UnboundedSender<AbrEvent> {
    fn on_event(&self, event: AbrEvent) {
        // The estimator going away is not an error for the fetch.
        let _ = self.send(event);
    }
}

/// Adapts a closure into an [`AbrObserver`].
pub struct FnObserver<F>(pub F);

impl<F> AbrObserver for FnObserver<F>
where
    F: Fn(AbrEvent) + Send + Sync,
{
    fn on_event(&self, event: AbrEvent) {
        (self.0)(event)
    }
}

impl<F> fmt::Debug for FnObserver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnObserver")
    }
}
