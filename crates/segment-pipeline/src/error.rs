use std::fmt;

/// Stable codes carried by every fatal pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PipelineResolveError,
    PipelineLoadError,
    PipelineParsingError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineResolveError => "PIPELINE_RESOLVE_ERROR",
            Self::PipelineLoadError => "PIPELINE_LOAD_ERROR",
            Self::PipelineParsingError => "PIPELINE_PARSING_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The request did not complete in time.
    Timeout,
    /// Generic connection failure (DNS, refused, reset, interrupted body).
    Connection,
    /// The server answered with a non-success status.
    HttpStatus(u16),
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Connection => f.write_str("connection error"),
            Self::HttpStatus(code) => write!(f, "HTTP {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} ({message})")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub url: Option<String>,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, url: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url,
            message: message.into(),
        }
    }

    pub fn timeout(url: Option<String>) -> Self {
        Self::new(NetworkErrorKind::Timeout, url, "no response before the deadline")
    }

    pub fn connection(url: Option<String>, message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::Connection, url, message)
    }

    pub fn http_status(status: u16, url: Option<String>) -> Self {
        let message = match &url {
            Some(url) => format!("unexpected status for {url}"),
            None => "unexpected status".to_string(),
        };
        Self::new(NetworkErrorKind::HttpStatus(status), url, message)
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            NetworkErrorKind::HttpStatus(status) => Some(status),
            _ => None,
        }
    }
}

/// Error returned by a transport loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("loader failed: {reason}")]
    Other { reason: String },
}

impl LoadError {
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    pub fn as_network(&self) -> Option<&NetworkError> {
        match self {
            Self::Network(err) => Some(err),
            Self::Other { .. } => None,
        }
    }
}

/// Error returned by a transport parser. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The single error type that leaves the pipeline.
///
/// `Load` appears twice in a fetch's life: as a non-fatal value inside
/// warning events while retries are still possible, and as the fatal
/// terminal error once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("PIPELINE_RESOLVE_ERROR: {reason}")]
    Resolve { reason: String },

    #[error("PIPELINE_LOAD_ERROR: {source}")]
    Load {
        #[source]
        source: LoadError,
        fatal: bool,
    },

    #[error("PIPELINE_PARSING_ERROR: {source}")]
    Parse {
        #[source]
        source: ParseError,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn resolve(reason: impl Into<String>) -> Self {
        Self::Resolve {
            reason: reason.into(),
        }
    }

    pub fn load_fatal(source: LoadError) -> Self {
        Self::Load {
            source,
            fatal: true,
        }
    }

    pub fn load_warning(source: LoadError) -> Self {
        Self::Load {
            source,
            fatal: false,
        }
    }

    pub fn parse(source: ParseError) -> Self {
        Self::Parse { source }
    }

    /// `None` for cancellation, which is an outcome rather than a failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Resolve { .. } => Some(ErrorCode::PipelineResolveError),
            Self::Load { .. } => Some(ErrorCode::PipelineLoadError),
            Self::Parse { .. } => Some(ErrorCode::PipelineParsingError),
            Self::Cancelled => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Resolve { .. } | Self::Parse { .. } => true,
            Self::Load { fatal, .. } => *fatal,
            Self::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn network_error(&self) -> Option<&NetworkError> {
        match self {
            Self::Load { source, .. } => source.as_network(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            PipelineError::resolve("boom").code().map(|c| c.as_str()),
            Some("PIPELINE_RESOLVE_ERROR")
        );
        assert_eq!(
            PipelineError::load_fatal(LoadError::other("x"))
                .code()
                .map(|c| c.to_string()),
            Some("PIPELINE_LOAD_ERROR".to_string())
        );
        assert_eq!(
            PipelineError::parse(ParseError::new("bad box")).code(),
            Some(ErrorCode::PipelineParsingError)
        );
        assert_eq!(PipelineError::Cancelled.code(), None);
    }

    #[test]
    fn fatal_flag_follows_variant() {
        let network = LoadError::from(NetworkError::http_status(503, None));
        assert!(!PipelineError::load_warning(network.clone()).is_fatal());
        assert!(PipelineError::load_fatal(network).is_fatal());
        assert!(PipelineError::resolve("r").is_fatal());
        assert!(PipelineError::parse(ParseError::new("p")).is_fatal());
        assert!(!PipelineError::Cancelled.is_fatal());
    }

    #[test]
    fn network_error_is_reachable_from_pipeline_error() {
        let err = PipelineError::load_fatal(NetworkError::http_status(404, None).into());
        assert_eq!(err.network_error().and_then(NetworkError::status), Some(404));
        assert!(PipelineError::Cancelled.network_error().is_none());
    }

    #[test]
    fn display_includes_code() {
        let err = PipelineError::load_fatal(NetworkError::timeout(Some("http://a/b".into())).into());
        assert!(err.to_string().starts_with("PIPELINE_LOAD_ERROR"));
    }
}
