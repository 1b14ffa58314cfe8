// Retry-with-backoff for transport requests.
//
// Failures are split into two classes, "regular" and "offline", each with its
// own retry budget. Switching class resets the counter, so a connectivity blip
// never eats into the budget for server errors and vice versa.

use crate::error::{LoadError, NetworkErrorKind};
use rand::RngExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Relative amplitude of the random perturbation applied to every delay.
pub const FUZZ_FACTOR: f64 = 0.3;

/// Ceiling on the number of retries for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Limited(u32),
    /// Never give up; only cancellation ends the retry loop.
    Unlimited,
}

impl RetryLimit {
    /// Whether a failure numbered `retry_count` (1-based) may still be retried.
    pub fn allows(self, retry_count: u32) -> bool {
        match self {
            Self::Limited(max) => retry_count <= max,
            Self::Unlimited => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Regular,
    Offline,
}

/// Connectivity as reported by the host environment.
pub trait NetworkStatus: fmt::Debug + Send + Sync {
    fn is_offline(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_offline(&self) -> bool {
        false
    }
}

/// Writable connectivity flag, flipped by the host on online/offline changes.
#[derive(Debug, Clone, Default)]
pub struct SharedNetworkStatus {
    offline: Arc<AtomicBool>,
}

impl SharedNetworkStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }
}

impl NetworkStatus for SharedNetworkStatus {
    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retry_regular: RetryLimit,
    pub max_retry_offline: RetryLimit,
    pub network_status: Arc<dyn NetworkStatus>,
}

impl BackoffOptions {
    pub fn limit_for(&self, class: ErrorClass) -> RetryLimit {
        match class {
            ErrorClass::Regular => self.max_retry_regular,
            ErrorClass::Offline => self.max_retry_offline,
        }
    }
}

/// Multiply `delay` by a factor drawn uniformly from `[1 - FUZZ_FACTOR, 1 + FUZZ_FACTOR]`.
pub fn fuzz_delay(delay: Duration) -> Duration {
    let factor = 1.0 + rand::rng().random_range(-FUZZ_FACTOR..=FUZZ_FACTOR);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// `min(fuzz(base * 2^(retry_count - 1)), max_delay)`.
pub fn compute_retry_delay(base_delay: Duration, retry_count: u32, max_delay: Duration) -> Duration {
    // 2^exponent saturates instead of overflowing for absurd retry counts.
    let exponent = retry_count.saturating_sub(1);
    let expected = 1u32
        .checked_shl(exponent)
        .and_then(|multiplier| base_delay.checked_mul(multiplier))
        .unwrap_or(max_delay);
    fuzz_delay(expected).min(max_delay)
}

/// Timeouts, connection failures, 5xx and 404 are worth retrying.
/// 404 covers live segments that are announced before they are published.
pub fn should_retry(error: &LoadError) -> bool {
    match error {
        LoadError::Network(err) => match err.kind {
            NetworkErrorKind::Timeout | NetworkErrorKind::Connection => true,
            NetworkErrorKind::HttpStatus(status) => status >= 500 || status == 404,
        },
        LoadError::Other { .. } => false,
    }
}

pub fn classify_error(error: &LoadError, status: &dyn NetworkStatus) -> ErrorClass {
    match error {
        LoadError::Network(err) if err.kind == NetworkErrorKind::Connection && status.is_offline() => {
            ErrorClass::Offline
        }
        _ => ErrorClass::Regular,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { retry_count: u32, delay: Duration },
    GiveUp { retry_count: u32 },
}

/// Retry bookkeeping for one logical request.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    retry_count: u32,
    last_class: Option<ErrorClass>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_class(&self) -> Option<ErrorClass> {
        self.last_class
    }

    /// Switch to `class`, resetting the counter when it differs from the current one.
    pub fn observe_class(&mut self, class: ErrorClass) {
        if self.last_class != Some(class) {
            self.retry_count = 0;
            self.last_class = Some(class);
        }
    }

    /// Count one more failure of `class` and decide whether to keep going.
    pub fn on_failure(&mut self, class: ErrorClass, options: &BackoffOptions) -> RetryDecision {
        self.observe_class(class);
        self.retry_count = self.retry_count.saturating_add(1);
        if !options.limit_for(class).allows(self.retry_count) {
            return RetryDecision::GiveUp {
                retry_count: self.retry_count,
            };
        }
        RetryDecision::Retry {
            retry_count: self.retry_count,
            delay: compute_retry_delay(options.base_delay, self.retry_count, options.max_delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    Cancelled,
    Failed(LoadError),
}

/// Run `request` against each URL in turn, backing off once all of them failed.
///
/// * non-retryable error: drop that URL and try the next one right away; fatal
///   when it was the last URL left
/// * retryable error with untried URLs left: move on to the next URL right away
/// * retryable error on the last URL: count it, wait, restart from the first URL
///
/// `on_retry` is called before every new attempt.
pub async fn try_urls_with_backoff<T, F, Fut, R>(
    urls: Vec<Option<String>>,
    options: &BackoffOptions,
    token: &CancellationToken,
    mut request: F,
    mut on_retry: R,
) -> Result<T, RetryError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, LoadError>>,
    R: FnMut(&LoadError),
{
    let mut urls = if urls.is_empty() { vec![None] } else { urls };
    let mut state = BackoffState::new();
    let mut index = 0;

    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let url = urls[index].clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            result = request(url.clone()) => result,
        };
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !should_retry(&error) {
            if urls.len() <= 1 {
                return Err(RetryError::Failed(error));
            }
            urls.remove(index);
            if index >= urls.len() {
                index = 0;
            }
            debug!(url = ?url, error = %error, remaining = urls.len(), "Dropping URL after non-retryable error");
            on_retry(&error);
            continue;
        }

        let class = classify_error(&error, options.network_status.as_ref());
        state.observe_class(class);

        if index + 1 < urls.len() {
            debug!(url = ?url, error = %error, "Trying next URL");
            index += 1;
            on_retry(&error);
            continue;
        }

        match state.on_failure(class, options) {
            RetryDecision::GiveUp { retry_count } => {
                debug!(retry_count, class = ?class, "Retry budget exhausted");
                return Err(RetryError::Failed(error));
            }
            RetryDecision::Retry { retry_count, delay } => {
                warn!(
                    retry_count,
                    class = ?class,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient error"
                );
                on_retry(&error);
                tokio::select! {
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                index = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn options(regular: RetryLimit, offline: RetryLimit, status: Arc<dyn NetworkStatus>) -> BackoffOptions {
        BackoffOptions {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            max_retry_regular: regular,
            max_retry_offline: offline,
            network_status: status,
        }
    }

    fn server_error() -> LoadError {
        NetworkError::http_status(500, None).into()
    }

    fn connection_error() -> LoadError {
        NetworkError::connection(None, "reset").into()
    }

    #[test]
    fn retry_limit_allows_up_to_ceiling() {
        let limit = RetryLimit::Limited(2);
        assert!(limit.allows(1));
        assert!(limit.allows(2));
        assert!(!limit.allows(3));
        assert!(RetryLimit::Unlimited.allows(u32::MAX));
    }

    #[test]
    fn should_retry_classification() {
        assert!(should_retry(&NetworkError::timeout(None).into()));
        assert!(should_retry(&connection_error()));
        assert!(should_retry(&server_error()));
        assert!(should_retry(&NetworkError::http_status(404, None).into()));
        assert!(!should_retry(&NetworkError::http_status(403, None).into()));
        assert!(!should_retry(&NetworkError::http_status(400, None).into()));
        assert!(!should_retry(&LoadError::other("unsupported")));
    }

    #[test]
    fn offline_only_for_connection_errors_while_offline() {
        let status = SharedNetworkStatus::new();
        assert_eq!(classify_error(&connection_error(), &status), ErrorClass::Regular);
        status.set_offline(true);
        assert_eq!(classify_error(&connection_error(), &status), ErrorClass::Offline);
        assert_eq!(classify_error(&server_error(), &status), ErrorClass::Regular);
    }

    #[test]
    fn ceiling_is_per_class() {
        let opts = options(RetryLimit::Limited(2), RetryLimit::Limited(5), Arc::new(AlwaysOnline));
        let mut state = BackoffState::new();
        assert!(matches!(state.on_failure(ErrorClass::Regular, &opts), RetryDecision::Retry { retry_count: 1, .. }));
        assert!(matches!(state.on_failure(ErrorClass::Regular, &opts), RetryDecision::Retry { retry_count: 2, .. }));
        assert_eq!(
            state.on_failure(ErrorClass::Regular, &opts),
            RetryDecision::GiveUp { retry_count: 3 }
        );
    }

    #[test]
    fn switching_class_resets_counter() {
        let opts = options(RetryLimit::Limited(2), RetryLimit::Limited(2), Arc::new(AlwaysOnline));
        let mut state = BackoffState::new();
        state.on_failure(ErrorClass::Regular, &opts);
        state.on_failure(ErrorClass::Regular, &opts);
        assert!(matches!(
            state.on_failure(ErrorClass::Offline, &opts),
            RetryDecision::Retry { retry_count: 1, .. }
        ));
        assert!(matches!(
            state.on_failure(ErrorClass::Regular, &opts),
            RetryDecision::Retry { retry_count: 1, .. }
        ));
        assert_eq!(state.last_class(), Some(ErrorClass::Regular));
    }

    #[test]
    fn delay_respects_max_cap() {
        let delay = compute_retry_delay(Duration::from_millis(500), 40, Duration::from_secs(5));
        assert!(delay <= Duration::from_secs(5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn delay_stays_within_fuzz_bounds(
            base_ms in 1u64..5_000,
            retry_count in 1u32..12,
            max_ms in 1u64..60_000,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let expected = base.as_secs_f64() * 2f64.powi(retry_count as i32 - 1);
            let low = (expected * (1.0 - FUZZ_FACTOR)).min(max.as_secs_f64());
            let high = (expected * (1.0 + FUZZ_FACTOR)).min(max.as_secs_f64());

            let delay = compute_retry_delay(base, retry_count, max).as_secs_f64();
            prop_assert!(delay >= low - 1e-6, "delay {} below {}", delay, low);
            prop_assert!(delay <= high + 1e-6, "delay {} above {}", delay, high);
        }

        #[test]
        fn counter_never_mixes_classes(failures in prop::collection::vec(any::<bool>(), 1..40)) {
            let opts = options(RetryLimit::Unlimited, RetryLimit::Unlimited, Arc::new(AlwaysOnline));
            let mut state = BackoffState::new();
            let mut run = 0u32;
            let mut previous = None;
            for offline in failures {
                let class = if offline { ErrorClass::Offline } else { ErrorClass::Regular };
                run = if previous == Some(class) { run + 1 } else { 1 };
                previous = Some(class);
                match state.on_failure(class, &opts) {
                    RetryDecision::Retry { retry_count, .. } => prop_assert_eq!(retry_count, run),
                    RetryDecision::GiveUp { .. } => prop_assert!(false, "unlimited budget gave up"),
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_regular_budget() {
        let opts = options(RetryLimit::Limited(2), RetryLimit::Unlimited, Arc::new(AlwaysOnline));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let mut retries = 0;
        let result: Result<(), _> = try_urls_with_backoff(
            vec![Some("http://cdn/a".into())],
            &opts,
            &token,
            |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err(server_error()) }
            },
            |_| retries += 1,
        )
        .await;
        assert_eq!(result, Err(RetryError::Failed(server_error())));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_immediately() {
        let opts = options(RetryLimit::Limited(5), RetryLimit::Unlimited, Arc::new(AlwaysOnline));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = try_urls_with_backoff(
            vec![Some("http://cdn/a".into())],
            &opts,
            &token,
            |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err(NetworkError::http_status(403, None).into()) }
            },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_through_urls_before_backing_off() {
        let opts = options(RetryLimit::Limited(1), RetryLimit::Unlimited, Arc::new(AlwaysOnline));
        let token = CancellationToken::new();
        let seen = Mutex::new(Vec::new());
        let result = try_urls_with_backoff(
            vec![Some("a".into()), Some("b".into())],
            &opts,
            &token,
            |url| {
                let mut seen = seen.lock().unwrap();
                seen.push(url.clone());
                let attempt = seen.len();
                async move {
                    if attempt < 4 {
                        Err(server_error())
                    } else {
                        Ok(url)
                    }
                }
            },
            |_| {},
        )
        .await;
        assert_eq!(result, Ok(Some("b".to_string())));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("a".into()), Some("b".into()), Some("a".into()), Some("b".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_url_is_removed_from_rotation() {
        let opts = options(RetryLimit::Limited(1), RetryLimit::Unlimited, Arc::new(AlwaysOnline));
        let token = CancellationToken::new();
        let seen = Mutex::new(Vec::new());
        let result: Result<(), _> = try_urls_with_backoff(
            vec![Some("gone".into()), Some("flaky".into())],
            &opts,
            &token,
            |url| {
                seen.lock().unwrap().push(url.clone());
                async move {
                    match url.as_deref() {
                        Some("gone") => Err(NetworkError::http_status(410, None).into()),
                        _ => Err(server_error()),
                    }
                }
            },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("gone".into()), Some("flaky".into()), Some("flaky".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offline_failures_use_their_own_budget() {
        let status = SharedNetworkStatus::new();
        status.set_offline(true);
        let opts = options(RetryLimit::Limited(1), RetryLimit::Limited(3), Arc::new(status.clone()));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = try_urls_with_backoff(
            vec![None],
            &opts,
            &token,
            |_| {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                async move {
                    match attempt {
                        // one regular failure, then three offline ones, then success
                        1 => Err(server_error()),
                        2..=4 => Err(connection_error()),
                        _ => Ok(attempt),
                    }
                }
            },
            |_| {},
        )
        .await;
        assert_eq!(result, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let opts = BackoffOptions {
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(100),
            ..options(RetryLimit::Unlimited, RetryLimit::Unlimited, Arc::new(AlwaysOnline))
        };
        let token = CancellationToken::new();
        let canceller = token.clone();
        let result: Result<(), _> = try_urls_with_backoff(
            vec![None],
            &opts,
            &token,
            |_| async { Err(server_error()) },
            |_| canceller.cancel(),
        )
        .await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_never_calls_request() {
        let opts = options(RetryLimit::Limited(3), RetryLimit::Unlimited, Arc::new(AlwaysOnline));
        let token = CancellationToken::new();
        token.cancel();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = try_urls_with_backoff(
            vec![None],
            &opts,
            &token,
            |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Ok(()) }
            },
            |_| {},
        )
        .await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(attempts.load(Ordering::Relaxed), 0);
    }
}
