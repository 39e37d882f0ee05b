use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::api::AppState;
use crate::errors::AppError;

/// `max_requests` per `window`, counted per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u64,
    pub window: Duration,
}

impl RateRule {
    /// 5 per minute, 15 per hour, 100 per day.
    pub fn defaults() -> Vec<RateRule> {
        vec![
            RateRule {
                max_requests: 5,
                window: Duration::from_secs(60),
            },
            RateRule {
                max_requests: 15,
                window: Duration::from_secs(3600),
            },
            RateRule {
                max_requests: 100,
                window: Duration::from_secs(86400),
            },
        ]
    }

    /// Parse `MAX/WINDOW`, e.g. `10/1m`.
    pub fn parse(s: &str) -> anyhow::Result<RateRule> {
        let (count, window) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit '{}': expected MAX/WINDOW (e.g. 10/1m)", s))?;
        let max_requests: u64 = count
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid rate limit count in '{}'", s))?;
        let secs = parse_window(window)
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit window in '{}'", s))?;
        Ok(RateRule {
            max_requests,
            window: Duration::from_secs(secs),
        })
    }

    /// Comma-separated list of rules; an empty list disables limiting.
    pub fn parse_list(s: &str) -> anyhow::Result<Vec<RateRule>> {
        s.split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(RateRule::parse)
            .collect()
    }
}

/// Supported window formats: "1s", "1m", "1h", "1d". Zero-length and
/// overflowing windows are rejected.
fn parse_window(s: &str) -> Option<u64> {
    let s = s.trim();
    let (val, unit) = if let Some(val) = s.strip_suffix('s') {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3600)
    } else if let Some(val) = s.strip_suffix('d') {
        (val, 86400)
    } else {
        return None;
    };
    val.trim()
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(unit))
        .filter(|secs| *secs > 0)
}

struct Window {
    started: Instant,
    count: u64,
}

/// Fixed-window, in-process rate limiter keyed by caller and rule index.
pub struct RateLimiter {
    rules: Vec<RateRule>,
    windows: DashMap<(String, usize), Window>,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateRule>) -> Self {
        Self {
            rules,
            windows: DashMap::new(),
        }
    }

    /// Count one request from `caller`. On refusal returns the seconds until
    /// the exhausted window resets.
    ///
    /// Every rule is charged even when an earlier one refuses, matching a
    /// limiter that counts attempts rather than admissions.
    pub fn check(&self, caller: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut retry_after: Option<u64> = None;

        for (idx, rule) in self.rules.iter().enumerate() {
            let mut window = self
                .windows
                .entry((caller.to_string(), idx))
                .or_insert(Window { started: now, count: 0 });

            if now.duration_since(window.started) >= rule.window {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;

            if window.count > rule.max_requests {
                let remaining = rule.window.saturating_sub(now.duration_since(window.started));
                let secs = remaining.as_secs().max(1);
                retry_after = Some(retry_after.map_or(secs, |r| r.max(secs)));
            }
        }

        match retry_after {
            Some(secs) => Err(secs),
            None => Ok(()),
        }
    }

    /// Drop windows that have fully elapsed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(_, idx), w| {
            self.rules
                .get(*idx)
                .is_some_and(|rule| now.duration_since(w.started) < rule.window)
        });
        before - self.windows.len()
    }
}

/// Caller identity: peer address, else the first `X-Forwarded-For` hop.
fn caller_of(req: &Request) -> String {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware: refuses with 429 once the caller exceeds any configured rule.
pub async fn enforce(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = caller_of(&req);
    if let Err(retry_after_secs) = state.limiter.check(&caller) {
        tracing::warn!(caller = %caller, retry_after_secs, "rate limit exceeded");
        return Err(AppError::RateLimitExceeded { retry_after_secs });
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("1s"), Some(1));
        assert_eq!(parse_window("60s"), Some(60));
        assert_eq!(parse_window("1m"), Some(60));
        assert_eq!(parse_window("5m"), Some(300));
        assert_eq!(parse_window("1h"), Some(3600));
        assert_eq!(parse_window("24h"), Some(86400));
        assert_eq!(parse_window("1d"), Some(86400));
        assert_eq!(parse_window("  5m  "), Some(300)); // verify trim
    }

    #[test]
    fn test_parse_window_rejects_bad_values() {
        assert_eq!(parse_window("garbage"), None);
        assert_eq!(parse_window("1x"), None);
        assert_eq!(parse_window("0s"), None);
        assert_eq!(parse_window("m"), None);
        assert_eq!(parse_window(&format!("{}d", u64::MAX)), None);
        assert!(RateRule::parse("5/1x").is_err());
        assert!(RateRule::parse("5/0s").is_err());
        assert!(RateRule::parse_list("5/1m,10/99999999999999999d").is_err());
    }

    #[test]
    fn test_parse_rule_list() {
        let rules = RateRule::parse_list("5/1m, 15/1h,100/1d").unwrap();
        assert_eq!(rules, RateRule::defaults());
        assert!(RateRule::parse_list("").unwrap().is_empty());
        assert!(RateRule::parse("five/1m").is_err());
        assert!(RateRule::parse("5").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_per_caller_and_reset() {
        let limiter = RateLimiter::new(vec![RateRule {
            max_requests: 2,
            window: Duration::from_secs(60),
        }]);

        assert!(limiter.check("10.0.0.1").is_ok());
        assert!(limiter.check("10.0.0.1").is_ok());
        assert_eq!(limiter.check("10.0.0.1"), Err(60));
        assert!(limiter.check("10.0.0.2").is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.evict_expired(), 2);
        assert!(limiter.check("10.0.0.1").is_ok());
    }

    #[test]
    fn test_rules_with_equal_windows_count_separately() {
        let limiter = RateLimiter::new(RateRule::parse_list("5/1m,10/1m").unwrap());
        for i in 0..5 {
            assert!(limiter.check("10.0.0.9").is_ok(), "request {} refused", i + 1);
        }
        assert!(limiter.check("10.0.0.9").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_uses_each_rules_window() {
        let limiter = RateLimiter::new(RateRule::parse_list("5/1m,10/1h").unwrap());
        limiter.check("10.0.0.3").unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.evict_expired(), 1);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.evict_expired(), 1);
    }

    #[test]
    fn test_no_rules_never_limits() {
        let limiter = RateLimiter::new(vec![]);
        for _ in 0..1000 {
            assert!(limiter.check("anyone").is_ok());
        }
    }
}
