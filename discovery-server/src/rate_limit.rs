//! Per-IP fixed-window rate limiting
//!
//! Each (ip, event) pair gets its own counter that resets when its window
//! expires. Violations are answered with `RateLimited` by the caller.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::warn;

use crate::config::RateLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateEvent {
    Create,
    Lookup,
    Join,
}

pub struct RateLimiter {
    limits: RateLimits,
    window: Duration,
    /// (count, window start)
    counters: HashMap<(IpAddr, RateEvent), (u32, Instant)>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            window: Duration::from_secs(limits.window_secs),
            counters: HashMap::new(),
        }
    }

    fn limit(&self, event: RateEvent) -> u32 {
        match event {
            RateEvent::Create => self.limits.create,
            RateEvent::Lookup => self.limits.lookup,
            RateEvent::Join => self.limits.join,
        }
    }

    /// Count one request; false if it is over the limit
    pub fn check(&mut self, ip: IpAddr, event: RateEvent, now: Instant) -> bool {
        let limit = self.limit(event);
        let window = self.window;
        let (count, start) = self.counters.entry((ip, event)).or_insert((0, now));

        if now.saturating_duration_since(*start) >= window {
            *count = 0;
            *start = now;
        }

        if *count >= limit {
            warn!("Rate limit exceeded: {} {:?} ({} in window)", ip, event, count);
            return false;
        }
        *count += 1;
        true
    }

    /// Drop counters whose window has passed
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.counters.len();
        self.counters
            .retain(|_, (_, start)| now.saturating_duration_since(*start) < window);
        before - self.counters.len()
    }

    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}
