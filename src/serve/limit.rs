//! Per-IP token-bucket rate limiting over governor's keyed limiters, with a
//! background sweep of idle buckets.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};

use crate::prelude::*;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

pub struct IpRateLimit {
    config: RateLimit,
    global: IpLimiter,
    /// Route-prefix overrides, each with its own keyed limiter.
    routes: DashMap<String, Arc<IpLimiter>>,
}

fn make_limiter(requests_per_minute: u32, burst: u32) -> IpLimiter {
    let per_minute = NonZeroU32::new(requests_per_minute.max(1)).unwrap();
    let burst = NonZeroU32::new(burst.max(1)).unwrap();

    let quota = Quota::per_minute(per_minute).allow_burst(burst);
    RateLimiter::dashmap(quota)
}

impl IpRateLimit {
    pub fn new(config: RateLimit) -> Arc<Self> {
        let global = make_limiter(config.requests_per_minute, config.burst);

        let routes = DashMap::new();
        for (prefix, limit) in &config.routes {
            routes.insert(
                prefix.clone(),
                Arc::new(make_limiter(
                    limit.requests_per_minute,
                    limit.burst.max(limit.requests_per_minute / 10),
                )),
            );
        }

        let limiter = Arc::new(Self {
            config,
            global,
            routes,
        });

        // Idle buckets accumulate one entry per remote IP; sweep them.
        let sweeper = limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                sweeper.global.retain_recent();
                for entry in sweeper.routes.iter() {
                    entry.value().retain_recent();
                }
            }
        });

        limiter
    }

    pub fn check(&self, path: &str, ip: IpAddr) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let limiter = self
            .routes
            .iter()
            .find(|entry| path.starts_with(entry.key().as_str()))
            .map(|entry| entry.value().clone());

        let outcome = match &limiter {
            Some(route_limiter) => route_limiter.check_key(&ip),
            None => self.global.check_key(&ip),
        };

        outcome.map_err(|not_until| {
            not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
        })
    }
}

pub async fn middleware(
    State(limiter): State<Arc<IpRateLimit>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_owned();

    match limiter.check(&path, addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            debug!(ip = %addr.ip(), path = %path, "rate limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().max(1).to_string())],
                "rate limit exceeded\n",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u32, burst: u32) -> RateLimit {
        RateLimit {
            enabled: true,
            requests_per_minute: rpm,
            burst,
            routes: Default::default(),
        }
    }

    #[tokio::test]
    async fn burst_exhausts_then_rejects() {
        let limiter = IpRateLimit::new(config(60, 3));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check("/x", ip).is_ok());
        }
        assert!(limiter.check("/x", ip).is_err());

        // A different client has its own bucket.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check("/x", other).is_ok());
    }

    #[tokio::test]
    async fn route_override_applies_by_prefix() {
        let mut config = config(1000, 1000);
        config.routes.insert(
            "/api".to_owned(),
            RouteLimit {
                requests_per_minute: 10,
                burst: 1,
            },
        );

        let limiter = IpRateLimit::new(config);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();

        assert!(limiter.check("/api/sources/x", ip).is_ok());
        assert!(limiter.check("/api/sources/x", ip).is_err());
        // The global bucket is untouched.
        assert!(limiter.check("/page", ip).is_ok());
    }

    #[tokio::test]
    async fn disabled_is_a_noop() {
        let mut config = config(1, 1);
        config.enabled = false;
        let limiter = IpRateLimit::new(config);
        let ip: IpAddr = "10.0.0.4".parse().unwrap();

        for _ in 0..10 {
            assert!(limiter.check("/x", ip).is_ok());
        }
    }
}
