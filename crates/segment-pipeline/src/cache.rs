//! Initialization-segment cache.
//!
//! One entry per Representation, always the payload of the most recent
//! `add`. Entries live until [`InitSegmentCache::dispose`] is called for the
//! Representation (or [`InitSegmentCache::clear`] on track teardown).

use crate::content::{ContentLocator, SegmentDescriptor};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

pub use crate::content::RepresentationKey;

/// Cache consulted by the pipeline before going to the network.
pub trait PipelineCache<I>: Send + Sync {
    fn store(&self, input: &I, payload: Bytes);
    fn lookup(&self, input: &I) -> Option<Bytes>;
    /// Forget the entry for `input`, typically after it failed to parse.
    fn evict(&self, input: &I);
}

#[derive(Debug, Default)]
pub struct InitSegmentCache {
    entries: Mutex<HashMap<RepresentationKey, Bytes>>,
}

impl InitSegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` for `representation`. Ignored for media segments.
    pub fn add(&self, representation: &RepresentationKey, segment: &SegmentDescriptor, payload: Bytes) {
        if !segment.is_init {
            return;
        }
        trace!(
            representation = %representation.representation_id,
            size = payload.len(),
            "Caching init segment"
        );
        self.entries.lock().insert(representation.clone(), payload);
    }

    /// Cached init payload for `representation`; always `None` for media segments.
    pub fn get(&self, representation: &RepresentationKey, segment: &SegmentDescriptor) -> Option<Bytes> {
        if !segment.is_init {
            return None;
        }
        self.entries.lock().get(representation).cloned()
    }

    pub fn dispose(&self, representation: &RepresentationKey) -> Option<Bytes> {
        self.entries.lock().remove(representation)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PipelineCache<ContentLocator> for InitSegmentCache {
    fn store(&self, input: &ContentLocator, payload: Bytes) {
        self.add(&input.representation_key(), &input.segment, payload);
    }

    fn lookup(&self, input: &ContentLocator) -> Option<Bytes> {
        self.get(&input.representation_key(), &input.segment)
    }

    fn evict(&self, input: &ContentLocator) {
        if !input.segment.is_init {
            return;
        }
        let key = input.representation_key();
        if self.dispose(&key).is_some() {
            trace!(representation = %key.representation_id, "Evicted init segment");
        }
    }
}
