//! Geolocation enrichment
//!
//! Orchestrates the two-tier cache and the ordered provider fallback
//! chain. Private, loopback, and otherwise non-routable addresses are
//! rejected before any I/O. `lookup` never fails: rate-limit exhaustion
//! and provider errors all resolve to `None`, which callers treat as
//! "enrichment unavailable".

pub mod cache;
pub mod provider;
pub mod rate_limit;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::Duration;

use crate::models::GeoResult;
use cache::GeoCache;
use provider::{GeoProvider, IpApiComProvider, IpapiCoProvider};
use rate_limit::{Clock, RateLimiter};

/// ipapi.co free quota is 30,000/month, spread to ~42 per hour
const IPAPI_CO_HOURLY_LIMIT: u32 = 42;
/// ip-api.com free quota
const IP_API_COM_MINUTE_LIMIT: u32 = 45;

/// One provider with its own rate limiter
pub struct ProviderSlot {
    pub limiter: RateLimiter,
    pub provider: Box<dyn GeoProvider>,
}

/// Cache-first lookup over an ordered provider fallback chain
pub struct GeoLookupService {
    cache: GeoCache,
    chain: Vec<ProviderSlot>,
}

impl GeoLookupService {
    pub fn new(cache: GeoCache, chain: Vec<ProviderSlot>) -> Self {
        Self { cache, chain }
    }

    /// Production chain: ipapi.co first (the larger effective quota),
    /// ip-api.com as fallback to conserve its tighter per-minute window.
    pub fn with_default_chain(cache: GeoCache, clock: Arc<dyn Clock>) -> Self {
        let chain = vec![
            ProviderSlot {
                limiter: RateLimiter::new(IPAPI_CO_HOURLY_LIMIT, Duration::hours(1), clock.clone()),
                provider: Box::new(IpapiCoProvider::new()),
            },
            ProviderSlot {
                limiter: RateLimiter::new(IP_API_COM_MINUTE_LIMIT, Duration::minutes(1), clock),
                provider: Box::new(IpApiComProvider::new()),
            },
        ];
        Self::new(cache, chain)
    }

    /// Look up geolocation for an address.
    ///
    /// Order: non-routable rejection, cache, then each provider in chain
    /// order gated by its own limiter. The first non-`None` provider
    /// result is cached and returned.
    pub async fn lookup(&self, ip: &str) -> Option<GeoResult> {
        if !is_lookupable(ip) {
            return None;
        }

        if let Some(hit) = self.cache.get(ip).await {
            return Some(hit);
        }

        for slot in &self.chain {
            if !slot.limiter.try_acquire() {
                tracing::debug!(
                    provider = slot.provider.name(),
                    ip,
                    "rate limit window exhausted, trying next provider"
                );
                continue;
            }

            if let Some(result) = slot.provider.fetch(ip).await {
                self.cache.put(ip, &result).await;
                return Some(result);
            }
        }

        tracing::warn!(ip, "all geolocation providers rate limited or failed");
        None
    }
}

/// Whether an address string is worth sending to a provider.
///
/// Empty strings, names like `localhost`, and anything that does not parse
/// as an IP address are refused, as are private and loopback ranges.
pub fn is_lookupable(ip: &str) -> bool {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        return false;
    }
    match trimmed.parse::<IpAddr>() {
        Ok(addr) => !is_private_or_local(addr),
        Err(_) => false,
    }
}

/// Standard private/loopback range table. These addresses never leave the
/// process.
pub fn is_private_or_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(v4: Ipv4Addr) -> bool {
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.octets()[0] == 0
}

fn is_private_v6(v6: Ipv6Addr) -> bool {
    if v6.is_loopback() || v6.is_unspecified() {
        return true;
    }
    // IPv4-mapped addresses never appear in real flow exports; refuse them
    if v6.to_ipv4_mapped().is_some() {
        return true;
    }
    let segments = v6.segments();
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // fc00::/7 unique-local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::rate_limit::test_clock::ManualClock;
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider that counts its calls
    struct StubProvider {
        name: &'static str,
        result: Option<GeoResult>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GeoProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _ip: &str) -> Option<GeoResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn geo(ip: &str, country: &str) -> GeoResult {
        GeoResult {
            ip: ip.to_string(),
            latitude: Some(1.0),
            longitude: Some(2.0),
            country: Some(country.to_string()),
            city: None,
            isp: None,
            asn: None,
        }
    }

    struct Fixture {
        service: GeoLookupService,
        primary_calls: Arc<AtomicUsize>,
        fallback_calls: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(
        dir: &std::path::Path,
        primary: Option<GeoResult>,
        fallback: Option<GeoResult>,
        primary_limit: u32,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = GeoCache::open(dir, clock.clone()).await.unwrap();
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));

        let chain = vec![
            ProviderSlot {
                limiter: RateLimiter::new(primary_limit, Duration::hours(1), clock.clone()),
                provider: Box::new(StubProvider {
                    name: "primary",
                    result: primary,
                    calls: primary_calls.clone(),
                }),
            },
            ProviderSlot {
                limiter: RateLimiter::new(45, Duration::minutes(1), clock.clone()),
                provider: Box::new(StubProvider {
                    name: "fallback",
                    result: fallback,
                    calls: fallback_calls.clone(),
                }),
            },
        ];

        Fixture {
            service: GeoLookupService::new(cache, chain),
            primary_calls,
            fallback_calls,
            clock,
        }
    }

    #[test]
    fn private_range_table() {
        for ip in [
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "0.1.2.3",
            "::1",
            "fe80::1",
            "fc00::1",
            "fd12::34",
            "::ffff:8.8.8.8",
        ] {
            assert!(!is_lookupable(ip), "{ip} should be refused");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "2001:4860:4860::8888"] {
            assert!(is_lookupable(ip), "{ip} should be lookupable");
        }
        assert!(!is_lookupable(""));
        assert!(!is_lookupable("localhost"));
        assert!(!is_lookupable("not-an-ip"));
    }

    #[tokio::test]
    async fn private_address_never_reaches_a_provider() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Some(geo("10.1.2.3", "US")), None, 42).await;

        assert!(f.service.lookup("10.1.2.3").await.is_none());
        assert_eq!(f.primary_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Some(geo("8.8.8.8", "US")), None, 42).await;

        let first = f.service.lookup("8.8.8.8").await.unwrap();
        let second = f.service.lookup("8.8.8.8").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_fresh_provider_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let calls = Arc::new(AtomicUsize::new(0));

        // Build the service manually so the cache and limiter share the clock
        let cache = GeoCache::open(dir.path(), clock.clone()).await.unwrap();
        let chain = vec![ProviderSlot {
            limiter: RateLimiter::new(100, Duration::hours(1), clock.clone()),
            provider: Box::new(StubProvider {
                name: "primary",
                result: Some(geo("8.8.8.8", "US")),
                calls: calls.clone(),
            }),
        }];
        let service = GeoLookupService::new(cache, chain);

        service.lookup("8.8.8.8").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::days(31));
        // The memory tier has no TTL of its own; a fresh service after the
        // advance models a lookup that lands on the file tier past its TTL.
        let cache = GeoCache::open(dir.path(), clock.clone()).await.unwrap();
        let chain = vec![ProviderSlot {
            limiter: RateLimiter::new(100, Duration::hours(1), clock.clone()),
            provider: Box::new(StubProvider {
                name: "primary",
                result: Some(geo("8.8.8.8", "DE")),
                calls: calls.clone(),
            }),
        }];
        let service = GeoLookupService::new(cache, chain);

        let refreshed = service.lookup("8.8.8.8").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.country.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn fallback_serves_when_primary_always_misses() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), None, Some(geo("9.9.9.9", "CH")), 42).await;

        let result = f.service.lookup("9.9.9.9").await.unwrap();
        assert_eq!(result.country.as_deref(), Some("CH"));
        assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_primary_limiter_skips_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            Some(geo("x", "US")),
            Some(geo("x", "CH")),
            1,
        )
        .await;

        // First lookup consumes the primary's only permit
        let first = f.service.lookup("8.8.8.8").await.unwrap();
        assert_eq!(first.country.as_deref(), Some("US"));

        // Different address, so no cache hit; primary is now exhausted
        let second = f.service.lookup("9.9.9.9").await.unwrap();
        assert_eq!(second.country.as_deref(), Some("CH"));
        assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 1);

        // After the window elapses the primary serves again
        f.clock.advance(Duration::hours(1));
        let third = f.service.lookup("4.4.4.4").await.unwrap();
        assert_eq!(third.country.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn all_providers_failing_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), None, None, 42).await;

        assert!(f.service.lookup("8.8.8.8").await.is_none());
        assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 1);
    }
}
