//! Fixed-size ring-buffer rate limiter (spec.md §4.3): 60 requests/min per
//! IP for `/publish`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const LIMIT: usize = 60;

struct Ring {
    timestamps: Vec<Instant>,
    next: usize,
}

impl Ring {
    fn new() -> Self {
        Self { timestamps: Vec::with_capacity(LIMIT), next: 0 }
    }

    /// Returns true if this call is within the limit; prunes timestamps
    /// outside the window first.
    fn check_and_record(&mut self, now: Instant) -> bool {
        self.timestamps.retain(|t| now.duration_since(*t) < WINDOW);
        if self.timestamps.len() >= LIMIT {
            return false;
        }
        if self.next < self.timestamps.len() {
            self.timestamps[self.next] = now;
        } else {
            self.timestamps.push(now);
        }
        self.next = (self.next + 1) % LIMIT.max(1);
        true
    }
}

pub struct RateLimiter {
    per_ip: Mutex<HashMap<IpAddr, Ring>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { per_ip: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if `ip` is still within the 60/min budget.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut guard = self.per_ip.lock();
        let ring = guard.entry(ip).or_insert_with(Ring::new);
        ring.check_and_record(now)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..LIMIT {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn different_ips_have_independent_budgets() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..LIMIT {
            assert!(limiter.allow(a));
        }
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b));
    }
}
