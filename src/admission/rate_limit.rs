//! Sliding-window request rate limiting

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A request budget: at most `max_requests` per `window`
///
/// Written as `N/unit` in config files, e.g. `20/minute` or `1000/day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimit {
    max_requests: u32,
    window: Duration,
}

impl RateLimit {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.window.as_secs() {
            1 => "second".to_string(),
            60 => "minute".to_string(),
            3600 => "hour".to_string(),
            86400 => "day".to_string(),
            secs => format!("{secs}s"),
        };
        write!(f, "{}/{}", self.max_requests, unit)
    }
}

impl FromStr for RateLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid rate limit '{s}', expected N/second|minute|hour|day");
        let (count, unit) = s.trim().split_once('/').ok_or_else(invalid)?;
        let max_requests: u32 = count.trim().parse().map_err(|_| invalid())?;
        if max_requests == 0 {
            return Err(invalid());
        }
        let window = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Duration::from_secs(1),
            "m" | "min" | "minute" | "minutes" => Duration::from_secs(60),
            "h" | "hour" | "hours" => Duration::from_secs(3600),
            "d" | "day" | "days" => Duration::from_secs(86400),
            other => {
                // "30s" style windows round-trip through Display.
                let secs = other
                    .strip_suffix('s')
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?;
                Duration::from_secs(secs)
            }
        };
        Ok(Self::new(max_requests, window))
    }
}

impl TryFrom<String> for RateLimit {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimit> for String {
    fn from(value: RateLimit) -> Self {
        value.to_string()
    }
}

/// Timestamps of admitted requests for one identity
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Record a hit at `now` if the budget allows it
    pub(crate) fn try_hit_at(&mut self, limit: &RateLimit, now: Instant) -> bool {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= limit.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= limit.max_requests as usize {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_limits() {
        let limit: RateLimit = "20/minute".parse().unwrap();
        assert_eq!(limit, RateLimit::per_minute(20));
        assert_eq!(
            "5/second".parse::<RateLimit>().unwrap().window(),
            Duration::from_secs(1)
        );
        assert_eq!(
            "1000/day".parse::<RateLimit>().unwrap().window(),
            Duration::from_secs(86400)
        );
        assert_eq!(
            "3/30s".parse::<RateLimit>().unwrap().window(),
            Duration::from_secs(30)
        );
        assert!("20".parse::<RateLimit>().is_err());
        assert!("0/minute".parse::<RateLimit>().is_err());
        assert!("ten/minute".parse::<RateLimit>().is_err());
        assert!("10/fortnight".parse::<RateLimit>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["20/minute", "100/hour", "7/30s"] {
            let limit: RateLimit = text.parse().unwrap();
            assert_eq!(limit.to_string(), text);
        }
    }

    #[test]
    fn test_window_rejects_over_budget() {
        let limit = RateLimit::new(2, Duration::from_secs(60));
        let mut window = SlidingWindow::default();
        let t0 = Instant::now();

        assert!(window.try_hit_at(&limit, t0));
        assert!(window.try_hit_at(&limit, t0 + Duration::from_secs(1)));
        assert!(!window.try_hit_at(&limit, t0 + Duration::from_secs(2)));

        // First hit ages out; one slot frees up.
        assert!(window.try_hit_at(&limit, t0 + Duration::from_secs(60)));
        assert!(!window.try_hit_at(&limit, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_rejected_hits_are_not_recorded() {
        let limit = RateLimit::new(1, Duration::from_secs(10));
        let mut window = SlidingWindow::default();
        let t0 = Instant::now();

        assert!(window.try_hit_at(&limit, t0));
        for i in 1..5 {
            assert!(!window.try_hit_at(&limit, t0 + Duration::from_secs(i)));
        }
        assert!(window.try_hit_at(&limit, t0 + Duration::from_secs(10)));
    }
}
