use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffOptions, NetworkStatus};

pub use crate::backoff::RetryLimit;

/// Bounds of the exponential backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry of a class
    pub base_delay: Duration,
    /// Upper bound applied after fuzzing
    pub max_delay: Duration,
}

impl BackoffConfig {
    pub fn regular() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
        }
    }

    /// Shorter delays for low-latency live streams, where a stale retry is worthless.
    pub fn low_latency() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::regular()
    }
}

/// Options for one [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retry ceiling for server/timeout failures
    pub max_retry_regular: RetryLimit,
    /// Retry ceiling for connection failures while the host reports offline
    pub max_retry_offline: RetryLimit,
    pub backoff: BackoffConfig,
    /// Deadline for a single loader call, `None` to disable
    pub request_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retry_regular: RetryLimit::Limited(4),
            max_retry_offline: RetryLimit::Unlimited,
            backoff: BackoffConfig::regular(),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_retry(mut self, limit: RetryLimit) -> Self {
        self.max_retry_regular = limit;
        self
    }

    pub fn with_max_retry_offline(mut self, limit: RetryLimit) -> Self {
        self.max_retry_offline = limit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn backoff_options(&self, network_status: Arc<dyn NetworkStatus>) -> BackoffOptions {
        BackoffOptions {
            base_delay: self.backoff.base_delay,
            max_delay: self.backoff.max_delay,
            max_retry_regular: self.max_retry_regular,
            max_retry_offline: self.max_retry_offline,
            network_status,
        }
    }
}

/// Options shared by every segment fetcher a creator hands out.
#[derive(Debug, Clone)]
pub struct FetcherCreatorConfig {
    pub max_retry_regular: RetryLimit,
    pub max_retry_offline: RetryLimit,
    /// Low-latency playback; [`FetcherCreatorConfig::with_low_latency_mode`]
    /// also switches `backoff` to [`BackoffConfig::low_latency`]
    pub low_latency_mode: bool,
    pub backoff: BackoffConfig,
    pub request_timeout: Option<Duration>,
    /// Give each buffer type its own init-segment cache
    pub cache_init_segments: bool,
}

impl Default for FetcherCreatorConfig {
    fn default() -> Self {
        Self {
            max_retry_regular: RetryLimit::Limited(4),
            max_retry_offline: RetryLimit::Unlimited,
            low_latency_mode: false,
            backoff: BackoffConfig::regular(),
            request_timeout: Some(Duration::from_secs(30)),
            cache_init_segments: true,
        }
    }
}

impl FetcherCreatorConfig {
    /// Toggle low-latency mode and pick the matching backoff preset.
    /// Call [`FetcherCreatorConfig::with_backoff`] afterwards to override it.
    pub fn with_low_latency_mode(mut self, enabled: bool) -> Self {
        self.low_latency_mode = enabled;
        self.backoff = if enabled {
            BackoffConfig::low_latency()
        } else {
            BackoffConfig::regular()
        };
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_retry(mut self, limit: RetryLimit) -> Self {
        self.max_retry_regular = limit;
        self
    }

    pub fn with_max_retry_offline(mut self, limit: RetryLimit) -> Self {
        self.max_retry_offline = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_init_segment_cache(mut self, enabled: bool) -> Self {
        self.cache_init_segments = enabled;
        self
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_retry_regular: self.max_retry_regular,
            max_retry_offline: self.max_retry_offline,
            backoff: self.backoff,
            request_timeout: self.request_timeout,
        }
    }
}

/// Options for [`ManifestFetcher`](crate::manifest::ManifestFetcher).
#[derive(Debug, Clone)]
pub struct ManifestFetcherConfig {
    pub max_retry_regular: RetryLimit,
    pub max_retry_offline: RetryLimit,
    pub backoff: BackoffConfig,
    pub request_timeout: Option<Duration>,
}

impl Default for ManifestFetcherConfig {
    fn default() -> Self {
        Self {
            max_retry_regular: RetryLimit::Limited(4),
            max_retry_offline: RetryLimit::Unlimited,
            backoff: BackoffConfig::regular(),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ManifestFetcherConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_retry_regular: self.max_retry_regular,
            max_retry_offline: self.max_retry_offline,
            backoff: self.backoff,
            request_timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::AlwaysOnline;

    #[test]
    fn default_ceilings() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retry_regular, RetryLimit::Limited(4));
        assert_eq!(config.max_retry_offline, RetryLimit::Unlimited);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn low_latency_mode_selects_short_delays() {
        let config = FetcherCreatorConfig::default().with_low_latency_mode(true);
        assert_eq!(config.pipeline_config().backoff, BackoffConfig::low_latency());
        assert_eq!(
            FetcherCreatorConfig::default().pipeline_config().backoff,
            BackoffConfig::regular()
        );
    }

    #[test]
    fn creator_accepts_custom_backoff() {
        let custom = BackoffConfig {
            base_delay: Duration::from_millis(75),
            max_delay: Duration::from_millis(1_500),
        };
        let config = FetcherCreatorConfig::default()
            .with_low_latency_mode(true)
            .with_backoff(custom);
        assert!(config.low_latency_mode);
        assert_eq!(config.pipeline_config().backoff, custom);

        let options = config.pipeline_config().backoff_options(Arc::new(AlwaysOnline));
        assert_eq!(options.base_delay, Duration::from_millis(75));
        assert_eq!(options.max_delay, Duration::from_millis(1_500));
    }

    #[test]
    fn backoff_options_carry_config() {
        let config = PipelineConfig::default()
            .with_max_retry(RetryLimit::Limited(2))
            .with_backoff(BackoffConfig::low_latency());
        let options = config.backoff_options(Arc::new(AlwaysOnline));
        assert_eq!(options.max_retry_regular, RetryLimit::Limited(2));
        assert_eq!(options.base_delay, Duration::from_millis(50));
        assert_eq!(options.max_delay, Duration::from_secs(1));
    }
}
