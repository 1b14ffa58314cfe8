#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use segment_pipeline::content::{Adaptation, Manifest, Period, Representation};
use segment_pipeline::transport::{
    ChunkCompleteInfo, LoadedResponse, Loader, LoaderContext, LoaderOutcome, Parser,
    ParserContext, InitTimingInfo, ProgressInfo, Transport,
};
use segment_pipeline::{BufferType, ContentLocator, LoadError, NetworkError, ParseError, SegmentDescriptor};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REQUEST_DURATION: Duration = Duration::from_millis(40);

/// One scripted loader answer.
pub enum Step {
    Ok(&'static str),
    Fail(LoadError),
    /// Chunked load: every part goes through `on_new_chunk`
    Chunks(Vec<&'static str>),
    /// Whole load reporting progress after each part
    Progress(Vec<&'static str>),
    /// Never completes
    Hang,
}

pub fn status(code: u16) -> Step {
    Step::Fail(NetworkError::http_status(code, None).into())
}

pub fn connection_reset() -> Step {
    Step::Fail(NetworkError::connection(None, "connection reset").into())
}

/// Loader answering from a script, one step per call. Runs out into `Hang`.
#[derive(Default)]
pub struct ScriptedLoader {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<Option<String>>>,
}

impl ScriptedLoader {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Option<String>> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl<I: Send + Sync> Loader<I> for ScriptedLoader {
    async fn load(&self, _input: &I, context: LoaderContext) -> Result<LoaderOutcome, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(context.url.clone());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Hang);

        match step {
            Step::Ok(body) => Ok(LoaderOutcome::Loaded(LoadedResponse::new(
                Bytes::from_static(body.as_bytes()),
                REQUEST_DURATION,
                context.url,
            ))),
            Step::Fail(error) => Err(error),
            Step::Chunks(parts) => {
                let mut size = 0;
                for part in parts {
                    size += part.len() as u64;
                    context.callbacks.on_new_chunk(Bytes::from_static(part.as_bytes()));
                }
                Ok(LoaderOutcome::ChunkComplete(ChunkCompleteInfo {
                    size,
                    request_duration: REQUEST_DURATION,
                }))
            }
            Step::Progress(parts) => {
                let total: u64 = parts.iter().map(|part| part.len() as u64).sum();
                let mut body = BytesMut::new();
                for part in parts {
                    body.extend_from_slice(part.as_bytes());
                    context.callbacks.on_progress(ProgressInfo {
                        size: body.len() as u64,
                        total_size: Some(total),
                        duration: REQUEST_DURATION,
                        url: context.url.clone(),
                    });
                }
                Ok(LoaderOutcome::Loaded(LoadedResponse::new(
                    body.freeze(),
                    REQUEST_DURATION,
                    context.url,
                )))
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

/// UTF-8 parser that rejects the payload `corrupt`.
pub struct TextParser;

impl<I> Parser<I> for TextParser {
    type Output = String;

    fn parse(
        &self,
        payload: Bytes,
        _context: ParserContext<'_, I>,
        _init_timing: Option<&InitTimingInfo>,
    ) -> Result<String, ParseError> {
        if payload.as_ref() == b"corrupt" {
            return Err(ParseError::new("corrupt payload"));
        }
        String::from_utf8(payload.to_vec()).map_err(|e| ParseError::new(e.to_string()))
    }
}

pub fn transport(loader: &Arc<ScriptedLoader>) -> Transport<ContentLocator, String> {
    let loader: Arc<dyn Loader<ContentLocator>> = loader.clone();
    Transport::new(loader, Arc::new(TextParser))
}

pub fn locator(representation: &str, segment: SegmentDescriptor) -> ContentLocator {
    locator_for(BufferType::Video, representation, segment)
}

pub fn locator_for(buffer_type: BufferType, representation: &str, segment: SegmentDescriptor) -> ContentLocator {
    ContentLocator {
        manifest: Arc::new(Manifest {
            id: "manifest".into(),
            is_live: false,
        }),
        period: Arc::new(Period {
            id: "p0".into(),
            start: 0.0,
            end: None,
        }),
        adaptation: Arc::new(Adaptation {
            id: format!("{buffer_type}-adaptation"),
            buffer_type,
        }),
        representation: Arc::new(Representation {
            id: representation.into(),
            bitrate: 1_000_000,
            mime_type: None,
            codecs: None,
        }),
        segment: Arc::new(segment),
    }
}

pub fn init_segment() -> SegmentDescriptor {
    SegmentDescriptor::init("init", vec![Some("http://cdn.test/init.mp4".into())])
}

pub fn media_segment(index: u32) -> SegmentDescriptor {
    SegmentDescriptor::media(
        format!("seg-{index}"),
        f64::from(index) * 2.0,
        2.0,
        90_000,
        vec![Some(format!("http://cdn.test/seg-{index}.m4s"))],
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
