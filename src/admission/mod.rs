//! Per-client admission control
//!
//! Every generation request must obtain an [`AdmissionSlot`] before any work
//! is started. A client identity (its network address) is limited both in
//! how many streams it may hold open at once and in how many requests it may
//! issue per rate window. Rejections are immediate; nothing is queued.

mod rate_limit;

pub use rate_limit::RateLimit;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::AdmissionConfig;
use rate_limit::SlidingWindow;

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejected {
    #[error("You already have {limit} active stream(s). Please wait for them to finish.")]
    Concurrency { limit: usize },

    #[error("Too many requests. Please wait a moment before trying again.")]
    RateLimited,
}

#[derive(Default)]
struct IdentityState {
    active: Arc<AtomicUsize>,
    window: Mutex<SlidingWindow>,
}

/// Concurrency gate and rate limiter keyed by client address
pub struct AdmissionController {
    max_streams: usize,
    rate_limit: RateLimit,
    identities: DashMap<IpAddr, Arc<IdentityState>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_streams: config.max_streams_per_client.max(1),
            rate_limit: config.rate_limit,
            identities: DashMap::new(),
        }
    }

    /// Admit a request from `identity` or reject it without waiting
    pub fn try_acquire(&self, identity: IpAddr) -> Result<AdmissionSlot, AdmissionRejected> {
        self.try_acquire_at(identity, Instant::now())
    }

    pub(crate) fn try_acquire_at(
        &self,
        identity: IpAddr,
        now: Instant,
    ) -> Result<AdmissionSlot, AdmissionRejected> {
        let state = self.state(identity);

        if !state.window.lock().try_hit_at(&self.rate_limit, now) {
            tracing::debug!(client = %identity, "rate limit exceeded ({})", self.rate_limit);
            return Err(AdmissionRejected::RateLimited);
        }

        let acquired = state
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_streams).then_some(n + 1)
            })
            .is_ok();
        if !acquired {
            tracing::debug!(client = %identity, "concurrent stream limit reached");
            return Err(AdmissionRejected::Concurrency {
                limit: self.max_streams,
            });
        }

        Ok(AdmissionSlot {
            identity,
            counter: Arc::clone(&state.active),
        })
    }

    /// Give a slot back. Dropping the slot has the same effect.
    pub fn release(&self, slot: AdmissionSlot) {
        drop(slot);
    }

    /// Streams currently open for `identity`
    pub fn active_streams(&self, identity: IpAddr) -> usize {
        self.identities
            .get(&identity)
            .map(|s| s.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn max_streams_per_client(&self) -> usize {
        self.max_streams
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    fn state(&self, identity: IpAddr) -> Arc<IdentityState> {
        Arc::clone(self.identities.entry(identity).or_default().value())
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_streams", &self.max_streams)
            .field("rate_limit", &self.rate_limit)
            .field("identities", &self.identities.len())
            .finish()
    }
}

/// Permit for one open stream; released exactly once, on drop
#[derive(Debug)]
pub struct AdmissionSlot {
    identity: IpAddr,
    counter: Arc<AtomicUsize>,
}

impl AdmissionSlot {
    pub fn identity(&self) -> IpAddr {
        self.identity
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn controller(max_streams: usize, rate: &str) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_streams_per_client: max_streams,
            rate_limit: rate.parse().unwrap(),
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_second_stream_rejected_until_release() {
        let admission = controller(1, "100/minute");

        let first = admission.try_acquire(ip(1)).unwrap();
        assert_eq!(admission.active_streams(ip(1)), 1);

        let second = admission.try_acquire(ip(1));
        assert_eq!(
            second.unwrap_err(),
            AdmissionRejected::Concurrency { limit: 1 }
        );

        admission.release(first);
        assert_eq!(admission.active_streams(ip(1)), 0);
        assert!(admission.try_acquire(ip(1)).is_ok());
    }

    #[test]
    fn test_identities_are_independent() {
        let admission = controller(1, "100/minute");
        let _a = admission.try_acquire(ip(1)).unwrap();
        let _b = admission.try_acquire(ip(2)).unwrap();
        assert_eq!(admission.active_streams(ip(1)), 1);
        assert_eq!(admission.active_streams(ip(2)), 1);
        assert_eq!(admission.active_streams(ip(3)), 0);
    }

    #[test]
    fn test_rate_limit_is_distinct_rejection() {
        let admission = controller(10, "2/minute");
        let t0 = Instant::now();

        let _a = admission.try_acquire_at(ip(1), t0).unwrap();
        let _b = admission.try_acquire_at(ip(1), t0).unwrap();
        assert_eq!(
            admission.try_acquire_at(ip(1), t0).unwrap_err(),
            AdmissionRejected::RateLimited
        );
        // Window slides.
        assert!(admission
            .try_acquire_at(ip(1), t0 + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn test_rejection_messages_differ() {
        let concurrency = AdmissionRejected::Concurrency { limit: 2 }.to_string();
        let rate = AdmissionRejected::RateLimited.to_string();
        assert!(concurrency.contains("2 active stream"));
        assert_ne!(concurrency, rate);
    }

    #[test]
    fn test_slot_released_when_owner_panics() {
        let admission = Arc::new(controller(1, "100/minute"));
        let worker = {
            let admission = Arc::clone(&admission);
            std::thread::spawn(move || {
                let _slot = admission.try_acquire(ip(9)).unwrap();
                panic!("generation blew up");
            })
        };
        assert!(worker.join().is_err());
        assert_eq!(admission.active_streams(ip(9)), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_cap() {
        let admission = Arc::new(controller(3, "1000/minute"));
        let held = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = Arc::clone(&admission);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    if let Ok(slot) = admission.try_acquire(ip(7)) {
                        held.lock().push(slot);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(held.lock().len(), 3);
        assert_eq!(admission.active_streams(ip(7)), 3);
    }
}
