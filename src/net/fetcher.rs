//! Rate-limit-aware document fetching
//!
//! Wraps the transport with outcome classification and retry behavior:
//! 404 is a benign "not there" (`Ok(None)`), 429 sleeps a long jittered
//! backoff and retries the same request without bound, anything else non-2xx
//! fails the fetch. Every successful download is reported to the metrics
//! context exactly once, labeled by document kind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use url::Url;

use crate::metrics::Metrics;
use crate::net::{AddressPool, Transport};
use crate::scrape::{self, search::TimeUnit};
use crate::{HarvestError, Result};

/// Document kinds, as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    /// A search listing page.
    Page,
    /// A single work.
    Work,
}

impl DocKind {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Work => "work",
        }
    }
}

/// Delay policy applied when the remote site answers 429.
///
/// The base delay has to be long enough to outlive a site-side ban window;
/// the jitter spreads concurrent fetchers' retries so they do not stampede
/// back in lockstep. Each retry sleeps a duration uniform in
/// `[base, base + jitter]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(600),
            jitter: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        self.base + self.jitter.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

/// Fetches listings and works, drawing a fresh source address per request.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    pool: AddressPool,
    metrics: Arc<Metrics>,
    backoff: BackoffPolicy,
    base: Url,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, pool: AddressPool, metrics: Arc<Metrics>) -> Self {
        Self {
            transport,
            pool,
            metrics,
            backoff: BackoffPolicy::default(),
            base: Url::parse(scrape::DEFAULT_BASE_URL).expect("default base URL is well-formed"),
        }
    }

    /// Points the fetcher at a different site root (test servers).
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = base;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Downloads one search listing page. `Ok(None)` means the listing is
    /// exhausted (the search endpoint 404s past its last page).
    pub async fn fetch_listing(&self, ago: u32, unit: TimeUnit, page: u32) -> Result<Option<String>> {
        let url = scrape::search::search_url(&self.base, ago, unit, page)?;
        self.fetch(url, DocKind::Page).await
    }

    /// Downloads one work in its full, unabridged rendering. `Ok(None)` means
    /// the work no longer exists.
    pub async fn fetch_work(&self, id: u64) -> Result<Option<String>> {
        let url = scrape::work::work_url(&self.base, id)?;
        self.fetch(url, DocKind::Work).await
    }

    async fn fetch(&self, url: Url, kind: DocKind) -> Result<Option<String>> {
        loop {
            let local_addr = self.pool.pick();
            match local_addr {
                Some(addr) => tracing::debug!("downloading {url} from {addr}"),
                None => tracing::debug!("downloading {url} from default address"),
            }

            let started = Instant::now();
            let reply = self.transport.get(url.clone(), local_addr).await?;

            match reply.status {
                404 => return Ok(None),
                429 => {
                    let delay = self.backoff.delay();
                    tracing::warn!("rate limited fetching {url}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                status if (200..300).contains(&status) => {
                    self.metrics
                        .record_download(kind, reply.body.len(), started.elapsed());
                    return Ok(Some(reply.body));
                }
                status => {
                    return Err(HarvestError::RequestFailed {
                        url: url.to_string(),
                        status,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TransportReply;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::sync::Mutex;

    /// Test transport: answers from a canned status queue and records the
    /// source address requested for each call.
    struct RecordingTransport {
        replies: Mutex<VecDeque<u16>>,
        seen_addrs: Mutex<Vec<Option<IpAddr>>>,
    }

    impl RecordingTransport {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(statuses.iter().copied().collect()),
                seen_addrs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn get(&self, _url: Url, local_addr: Option<IpAddr>) -> Result<TransportReply> {
            self.seen_addrs.lock().unwrap().push(local_addr);
            let status = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra request");
            Ok(TransportReply {
                status,
                body: "<html></html>".to_string(),
            })
        }
    }

    fn fetcher(transport: Arc<RecordingTransport>, pool: AddressPool) -> (Fetcher, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let fetcher = Fetcher::new(transport, pool, metrics.clone()).with_backoff(BackoffPolicy {
            base: Duration::from_millis(20),
            jitter: Duration::from_millis(20),
        });
        (fetcher, metrics)
    }

    #[tokio::test]
    async fn not_found_is_benign() {
        let transport = RecordingTransport::new(&[404]);
        let (fetcher, metrics) = fetcher(transport, AddressPool::new(None));

        let body = fetcher.fetch_work(1).await.unwrap();
        assert!(body.is_none());
        assert_eq!(metrics.downloaded.with_label_values(&["work"]).get(), 0);
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let transport = RecordingTransport::new(&[503]);
        let (fetcher, _metrics) = fetcher(transport, AddressPool::new(None));

        let err = fetcher.fetch_work(1).await.unwrap_err();
        assert!(matches!(err, HarvestError::RequestFailed { status: 503, .. }));
    }

    #[tokio::test]
    async fn rate_limit_retries_until_success() {
        let transport = RecordingTransport::new(&[429, 429, 429, 200]);
        let (fetcher, metrics) = fetcher(transport.clone(), AddressPool::new(None));

        let started = Instant::now();
        let body = fetcher.fetch_work(1).await.unwrap();
        let elapsed = started.elapsed();

        assert!(body.is_some());
        // three sleeps, each within [base, base + jitter]
        assert!(elapsed >= Duration::from_millis(60), "slept only {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "slept {elapsed:?}");
        assert_eq!(transport.seen_addrs.lock().unwrap().len(), 4);
        // success is reported once, not once per attempt
        assert_eq!(metrics.downloaded.with_label_values(&["work"]).get(), 1);
    }

    #[tokio::test]
    async fn requests_carry_addresses_from_the_pool() {
        let transport = RecordingTransport::new(&[200]);
        let pool = AddressPool::new(Some(ipnet::IpNet::from_str("203.0.113.9/32").unwrap()));
        let (fetcher, _metrics) = fetcher(transport.clone(), pool);

        fetcher.fetch_work(1).await.unwrap();
        let seen = transport.seen_addrs.lock().unwrap();
        assert_eq!(seen.as_slice(), [Some("203.0.113.9".parse().unwrap())]);
    }
}
