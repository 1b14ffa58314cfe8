// Content model: the narrow view of a manifest this crate needs to locate a segment.

use std::fmt;
use std::sync::Arc;

/// Kind of media buffer a track feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Audio,
    Video,
    Text,
    Image,
}

impl BufferType {
    pub const ALL: [BufferType; 4] = [Self::Audio, Self::Video, Self::Text, Self::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub id: String,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: String,
    pub start: f64,
    pub end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    pub id: String,
    pub buffer_type: BufferType,
}

/// One encoded quality of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
}

/// Inclusive byte range, `end == None` meaning "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub id: String,
    pub is_init: bool,
    /// Start time, in seconds.
    pub time: f64,
    /// Duration, in seconds.
    pub duration: f64,
    pub timescale: u32,
    /// End time, in seconds.
    pub end: f64,
    /// CDN candidates in preference order. `None` entries mean the loader
    /// has to produce the payload without a URL.
    pub media_urls: Vec<Option<String>>,
    pub range: Option<ByteRange>,
}

impl SegmentDescriptor {
    pub fn init(id: impl Into<String>, media_urls: Vec<Option<String>>) -> Self {
        Self {
            id: id.into(),
            is_init: true,
            time: 0.0,
            duration: 0.0,
            timescale: 1,
            end: 0.0,
            media_urls,
            range: None,
        }
    }

    pub fn media(
        id: impl Into<String>,
        time: f64,
        duration: f64,
        timescale: u32,
        media_urls: Vec<Option<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            is_init: false,
            time,
            duration,
            timescale,
            end: time + duration,
            media_urls,
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Stable identity of a Representation inside a manifest.
///
/// Used as the init-segment cache key in place of object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepresentationKey {
    pub manifest_id: String,
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
}

/// Everything needed to locate a segment. Owned by the caller, cheap to clone.
#[derive(Debug, Clone)]
pub struct ContentLocator {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub segment: Arc<SegmentDescriptor>,
}

impl ContentLocator {
    pub fn representation_key(&self) -> RepresentationKey {
        RepresentationKey {
            manifest_id: self.manifest.id.clone(),
            period_id: self.period.id.clone(),
            adaptation_id: self.adaptation.id.clone(),
            representation_id: self.representation.id.clone(),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.adaptation.buffer_type
    }

    /// Same track, different segment.
    pub fn with_segment(&self, segment: SegmentDescriptor) -> Self {
        Self {
            segment: Arc::new(segment),
            ..self.clone()
        }
    }
}

/// Request for a manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub url: Option<String>,
}

impl ManifestRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
        }
    }
}

/// Anything the pipeline can be asked to fetch.
pub trait PipelineInput: fmt::Debug + Clone + Send + Sync + 'static {
    /// Candidate URLs, in the order they should be tried.
    fn urls(&self) -> Vec<Option<String>>;

    fn is_init_segment(&self) -> bool {
        false
    }

    fn byte_range(&self) -> Option<ByteRange> {
        None
    }
}

impl PipelineInput for ContentLocator {
    fn urls(&self) -> Vec<Option<String>> {
        self.segment.media_urls.clone()
    }

    fn is_init_segment(&self) -> bool {
        self.segment.is_init
    }

    fn byte_range(&self) -> Option<ByteRange> {
        self.segment.range
    }
}

impl PipelineInput for ManifestRequest {
    fn urls(&self) -> Vec<Option<String>> {
        vec![self.url.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_header() {
        let closed = ByteRange {
            start: 0,
            end: Some(1023),
        };
        assert_eq!(closed.to_header_value(), "bytes=0-1023");
        let open = ByteRange {
            start: 512,
            end: None,
        };
        assert_eq!(open.to_header_value(), "bytes=512-");
    }

    #[test]
    fn media_segment_end_is_derived() {
        let segment = SegmentDescriptor::media("s1", 4.0, 2.0, 90_000, vec![]);
        assert_eq!(segment.end, 6.0);
        assert!(!segment.is_init);
    }

    #[test]
    fn representation_key_ignores_segment() {
        let locator = ContentLocator {
            manifest: Arc::new(Manifest {
                id: "m".into(),
                is_live: false,
            }),
            period: Arc::new(Period {
                id: "p0".into(),
                start: 0.0,
                end: None,
            }),
            adaptation: Arc::new(Adaptation {
                id: "a-video".into(),
                buffer_type: BufferType::Video,
            }),
            representation: Arc::new(Representation {
                id: "r-720p".into(),
                bitrate: 2_500_000,
                mime_type: Some("video/mp4".into()),
                codecs: None,
            }),
            segment: Arc::new(SegmentDescriptor::init("init", vec![])),
        };
        let other = locator.with_segment(SegmentDescriptor::media("seg-1", 0.0, 4.0, 1, vec![]));
        assert_eq!(locator.representation_key(), other.representation_key());
        assert_eq!(other.buffer_type(), BufferType::Video);
    }

    #[test]
    fn representation_key_includes_manifest() {
        let locator = ContentLocator {
            manifest: Arc::new(Manifest {
                id: "content-a".into(),
                is_live: true,
            }),
            period: Arc::new(Period {
                id: "p0".into(),
                start: 0.0,
                end: None,
            }),
            adaptation: Arc::new(Adaptation {
                id: "a-audio".into(),
                buffer_type: BufferType::Audio,
            }),
            representation: Arc::new(Representation {
                id: "r-128k".into(),
                bitrate: 128_000,
                mime_type: None,
                codecs: None,
            }),
            segment: Arc::new(SegmentDescriptor::init("init", vec![])),
        };
        let other_content = ContentLocator {
            manifest: Arc::new(Manifest {
                id: "content-b".into(),
                is_live: true,
            }),
            ..locator.clone()
        };
        assert_ne!(locator.representation_key(), other_content.representation_key());
    }
}
