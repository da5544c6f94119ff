//! In-memory directory of upstream proxy endpoints.
//!
//! The directory holds one immutable [`Snapshot`] at a time. A refresh parses
//! the whole feed first and only then swaps the snapshot pointer, so readers
//! always see either the previous list or the complete new one. A failed
//! refresh leaves the previous snapshot in place.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::FetchError;
use crate::http::fetch_text;

pub const UNKNOWN: &str = "Unknown";
pub const UNKNOWN_ORG: &str = "Unknown Org";

/// Process-wide directory shared by every request handled in this isolate.
pub static DIRECTORY: Lazy<ProxyDirectory> = Lazy::new(ProxyDirectory::default);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub ip: String,
    pub port: String,
    pub country: String,
    pub org: String,
}

impl ProxyEndpoint {
    pub fn parse_line(line: &str) -> Self {
        let mut fields = line.split(',').map(str::trim);
        let mut next = |default: &str| {
            fields
                .next()
                .filter(|f| !f.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        Self {
            ip: next(UNKNOWN),
            port: next(UNKNOWN),
            country: next(UNKNOWN),
            org: next(UNKNOWN_ORG),
        }
    }
}

/// Parse a plaintext feed: one `ip,port,country,org` entry per non-blank line.
pub fn parse_feed(text: &str) -> Vec<ProxyEndpoint> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(ProxyEndpoint::parse_line)
        .collect()
}

/// Fetch and parse a feed without touching the shared directory.
pub async fn load_feed(url: &str) -> Result<Vec<ProxyEndpoint>, FetchError> {
    Ok(parse_feed(&fetch_text(url).await?))
}

#[derive(Debug, Default)]
pub struct Snapshot {
    pub proxies: Vec<ProxyEndpoint>,
    /// Zero until the first successful refresh.
    pub generation: u64,
    pub fetched_at_ms: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Installed { count: usize, generation: u64 },
    /// Another refresh was already running; nothing was fetched.
    InFlight,
}

#[derive(Default)]
pub struct ProxyDirectory {
    current: RwLock<Arc<Snapshot>>,
    refreshing: AtomicBool,
}

impl ProxyDirectory {
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().generation > 0
    }

    /// True when the directory has never loaded or its snapshot is at least
    /// `interval_ms` old.
    pub fn is_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        let snapshot = self.snapshot();
        snapshot.generation == 0 || now_ms.saturating_sub(snapshot.fetched_at_ms) >= interval_ms
    }

    pub fn install(&self, proxies: Vec<ProxyEndpoint>, now_ms: u64) -> Arc<Snapshot> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(Snapshot {
            proxies,
            generation: current.generation + 1,
            fetched_at_ms: now_ms,
        });
        *current = Arc::clone(&next);
        next
    }

    pub async fn refresh(&self, url: &str, now_ms: u64) -> Result<RefreshOutcome, FetchError> {
        self.refresh_with(now_ms, || fetch_text(url)).await
    }

    pub async fn refresh_with<F, Fut>(
        &self,
        now_ms: u64,
        fetch: F,
    ) -> Result<RefreshOutcome, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, FetchError>>,
    {
        let Some(_guard) = RefreshGuard::acquire(&self.refreshing) else {
            return Ok(RefreshOutcome::InFlight);
        };

        let proxies = parse_feed(&fetch().await?);
        let count = proxies.len();
        let snapshot = self.install(proxies, now_ms);
        Ok(RefreshOutcome::Installed {
            count,
            generation: snapshot.generation,
        })
    }
}

struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "1.1.1.1,443,US,ACME\n2.2.2.2,80,JP,Foo\n";

    fn endpoint(ip: &str, port: &str, country: &str, org: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            ip: ip.into(),
            port: port.into(),
            country: country.into(),
            org: org.into(),
        }
    }

    #[test]
    fn parses_feed_lines_in_order() {
        assert_eq!(
            parse_feed(FEED),
            vec![
                endpoint("1.1.1.1", "443", "US", "ACME"),
                endpoint("2.2.2.2", "80", "JP", "Foo"),
            ]
        );
    }

    #[test]
    fn missing_fields_default() {
        let parsed = parse_feed("3.3.3.3,8443\n\n   \n4.4.4.4,,SG\n5.5.5.5, 443 , DE , Hetzner Online\r\n");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], endpoint("3.3.3.3", "8443", UNKNOWN, UNKNOWN_ORG));
        assert_eq!(parsed[1], endpoint("4.4.4.4", UNKNOWN, "SG", UNKNOWN_ORG));
        assert_eq!(parsed[2], endpoint("5.5.5.5", "443", "DE", "Hetzner Online"));
    }

    #[tokio::test]
    async fn refresh_installs_snapshot() {
        let directory = ProxyDirectory::default();
        assert!(!directory.is_loaded());
        assert!(directory.is_due(0, 1000));

        let outcome = directory
            .refresh_with(5_000, || async { Ok::<_, FetchError>(FEED.to_string()) })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Installed { count: 2, generation: 1 });

        let snapshot = directory.snapshot();
        assert_eq!(snapshot.proxies.len(), 2);
        assert_eq!(snapshot.proxies[0].country, "US");
        assert_eq!(snapshot.proxies[1].country, "JP");
        assert!(!directory.is_due(5_500, 1000));
        assert!(directory.is_due(6_000, 1000));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let directory = ProxyDirectory::default();

        let err = directory
            .refresh_with(1, || async { Err::<String, _>(FetchError::Status(503)) })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(503)));
        assert!(directory.snapshot().proxies.is_empty());
        assert_eq!(directory.snapshot().generation, 0);

        directory
            .refresh_with(2, || async { Ok::<_, FetchError>(FEED.to_string()) })
            .await
            .unwrap();
        let before = directory.snapshot();

        directory
            .refresh_with(3, || async { Err::<String, _>(FetchError::Transport("reset".into())) })
            .await
            .unwrap_err();
        let after = directory.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.proxies, parse_feed(FEED));
    }

    #[tokio::test]
    async fn overlapping_refresh_is_skipped() {
        let directory = ProxyDirectory::default();
        let outcome = directory
            .refresh_with(1, || async {
                let nested = directory
                    .refresh_with(1, || async { Ok::<_, FetchError>(FEED.to_string()) })
                    .await;
                assert_eq!(nested.unwrap(), RefreshOutcome::InFlight);
                Ok::<_, FetchError>("9.9.9.9,443,NL,Quad9\n".to_string())
            })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Installed { count: 1, generation: 1 });
        assert_eq!(directory.snapshot().proxies[0].ip, "9.9.9.9");

        // guard released once the refresh finished
        directory
            .refresh_with(2, || async { Ok::<_, FetchError>(FEED.to_string()) })
            .await
            .unwrap();
        assert_eq!(directory.snapshot().generation, 2);
    }

    #[test]
    fn readers_keep_their_snapshot_across_swaps() {
        let directory = ProxyDirectory::default();
        directory.install(parse_feed(FEED), 1);
        let held = directory.snapshot();
        directory.install(Vec::new(), 2);
        assert_eq!(held.proxies.len(), 2);
        assert!(directory.snapshot().proxies.is_empty());
    }
}
