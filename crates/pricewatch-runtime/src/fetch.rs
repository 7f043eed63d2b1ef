//! Page fetching over HTTP with block-detection.
//!
//! `PageFetcher` is the seam the scheduler dispatches through; the
//! production implementation wraps reqwest and classifies responses
//! into the outcomes the health monitor understands. Tests swap in
//! scripted fetchers instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use pricewatch::{FetchResult, FetchStatus, Identity};

use crate::config::FetchConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Body substrings that indicate a captcha or bot interstitial even
/// when the response status is 200.
const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "are you a robot",
    "unusual traffic",
    "access denied",
    "verify you are human",
];

/// Abstraction over a single page fetch performed with a borrowed
/// identity. Implementations must never panic on transport errors;
/// everything maps to a `FetchResult`.
///
/// `rate_limited_before` is owned by the caller: it carries whether an
/// earlier attempt in the same run was rate-limited, so a repeat 429
/// classifies as a hard block without leaking state across targets or
/// concurrent runs.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, identity: &Identity, rate_limited_before: bool)
        -> FetchResult;
}

/// Randomized inter-request delay, mirroring human pacing.
#[derive(Debug, Clone)]
pub struct DelayPolicy {
    min: Duration,
    max: Duration,
    enabled: bool,
}

impl DelayPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            min: Duration::from_millis(config.delay_min_ms),
            max: Duration::from_millis(config.delay_max_ms),
            enabled: !config.disable_delay,
        }
    }

    /// No-op policy for tests.
    pub fn disabled() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
            enabled: false,
        }
    }

    /// Sleep for a random duration within the configured bounds,
    /// optionally stretched by the health monitor's delay factor.
    pub async fn pause(&self, factor: f64) {
        if !self.enabled {
            return;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        let base = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        let scaled = (base as f64 * factor.max(1.0)) as u64;
        tokio::time::sleep(Duration::from_millis(scaled)).await;
    }
}

/// Classify a response into a fetch status.
///
/// 403 means the identity is burned. A 429 is a rate-limit nudge the
/// first time and a hard block when the same run sees it again. A
/// clean 200 can still be a block if the body carries an interstitial
/// marker.
pub fn classify(status: u16, body: &str, prior_rate_limited: bool) -> FetchStatus {
    match status {
        403 => FetchStatus::HardBlock,
        429 if prior_rate_limited => FetchStatus::HardBlock,
        429 => FetchStatus::SoftBlock,
        s if s >= 500 => FetchStatus::NetworkError,
        s if (200..300).contains(&s) => {
            let lowered = body.to_lowercase();
            if BLOCK_MARKERS.iter().any(|m| lowered.contains(m)) {
                FetchStatus::SoftBlock
            } else {
                FetchStatus::Success
            }
        }
        _ => FetchStatus::NetworkError,
    }
}

/// Production fetcher over reqwest. The per-identity fingerprint
/// (user-agent, language, cookies) is applied per request; egress
/// follows the identity's proxy assignment, with one cached client per
/// distinct proxy endpoint plus a direct-connection client for
/// identities without one.
pub struct HttpFetcher {
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> RuntimeResult<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        Ok(Self {
            direct: Self::build_client(timeout, None)?,
            proxied: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    fn build_client(timeout: Duration, proxy: Option<&str>) -> RuntimeResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5));
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|e| RuntimeError::Config(format!("proxy {endpoint}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| RuntimeError::Config(format!("http client: {e}")))
    }

    /// Select the client matching the identity's egress path, building
    /// and caching a proxied client on first use of each endpoint.
    fn client_for(&self, identity: &Identity) -> RuntimeResult<reqwest::Client> {
        let Some(endpoint) = identity.proxy.as_deref() else {
            return Ok(self.direct.clone());
        };
        let mut cache = match self.proxied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = cache.get(endpoint) {
            return Ok(client.clone());
        }
        let client = Self::build_client(self.timeout, Some(endpoint))?;
        cache.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    fn cookie_header(identity: &Identity) -> Option<String> {
        if identity.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = identity
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        Some(pairs.join("; "))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        identity: &Identity,
        rate_limited_before: bool,
    ) -> FetchResult {
        let started = std::time::Instant::now();

        let client = match self.client_for(identity) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(identity = %identity.id, "unusable proxy endpoint: {e}");
                return FetchResult::failure(FetchStatus::NetworkError, 0);
            }
        };

        let mut request = client
            .get(url)
            .timeout(self.timeout)
            .header("user-agent", &identity.profile.user_agent)
            .header("accept-language", &identity.profile.language);
        if let Some(cookies) = Self::cookie_header(identity) {
            request = request.header("cookie", cookies);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let status = if e.is_timeout() {
                    FetchStatus::Timeout
                } else {
                    FetchStatus::NetworkError
                };
                tracing::debug!(url, %status, "fetch transport error: {e}");
                return FetchResult::failure(status, latency_ms);
            }
        };

        let http_status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let latency_ms = started.elapsed().as_millis() as u64;
        let status = classify(http_status, &body, rate_limited_before);

        tracing::debug!(url, http_status, %status, latency_ms, "fetch complete");

        FetchResult {
            status,
            raw_content: (status == FetchStatus::Success).then_some(body),
            latency_ms,
            rate_limited: http_status == 429,
        }
    }
}
