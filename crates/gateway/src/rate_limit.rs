//! Failed-auth rate limiter.
//!
//! Five failed attempts from one address lock it out for fifteen
//! minutes. The table is capped: on overflow the oldest entry that is
//! not locked out is evicted. Locked-out entries are never evicted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    failures: u32,
    last_attempt: Instant,
    locked_until: Option<Instant>,
}

pub struct RateLimiter {
    max_attempts: u32,
    lockout: Duration,
    max_entries: usize,
    table: Mutex<HashMap<IpAddr, Entry>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_LOCKOUT, DEFAULT_MAX_ENTRIES)
    }
}

impl RateLimiter {
    pub fn new(max_attempts: u32, lockout: Duration, max_entries: usize) -> Self {
        Self {
            max_attempts,
            lockout,
            max_entries,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Is this address currently locked out? Returns the remaining
    /// lockout duration when it is.
    pub fn check(&self, addr: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let entry = table.get_mut(&addr)?;
        match entry.locked_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                // Lockout expired; reset the counter.
                entry.failures = 0;
                entry.locked_until = None;
                None
            }
            None => None,
        }
    }

    /// Record a failed auth attempt. Returns the lockout duration when
    /// this failure tripped the limit.
    pub fn record_failure(&self, addr: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let mut table = self.table.lock();

        if !table.contains_key(&addr) && table.len() >= self.max_entries {
            // Evict the oldest non-locked entry to make room.
            let victim = table
                .iter()
                .filter(|(_, e)| {
                    e.locked_until.map_or(true, |until| until <= now)
                })
                .min_by_key(|(_, e)| e.last_attempt)
                .map(|(ip, _)| *ip);
            match victim {
                Some(ip) => {
                    table.remove(&ip);
                }
                None => {
                    // Every entry is locked out; refuse to track more.
                    tracing::warn!(addr = %addr, "rate limiter table full of lockouts");
                    return Some(self.lockout);
                }
            }
        }

        let entry = table.entry(addr).or_insert(Entry {
            failures: 0,
            last_attempt: now,
            locked_until: None,
        });
        entry.failures += 1;
        entry.last_attempt = now;
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            tracing::warn!(addr = %addr, failures = entry.failures, "address locked out");
            Some(self.lockout)
        } else {
            None
        }
    }

    /// Record a successful auth; clears the address's failure history.
    pub fn record_success(&self, addr: IpAddr) {
        self.table.lock().remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, n])
    }

    #[test]
    fn locks_after_max_attempts() {
        let limiter = RateLimiter::new(5, Duration::from_secs(900), 100);
        for _ in 0..4 {
            assert!(limiter.record_failure(ip(1)).is_none());
            assert!(limiter.check(ip(1)).is_none());
        }
        assert!(limiter.record_failure(ip(1)).is_some());
        assert!(limiter.check(ip(1)).is_some());
    }

    #[test]
    fn success_clears_history() {
        let limiter = RateLimiter::new(5, Duration::from_secs(900), 100);
        for _ in 0..3 {
            limiter.record_failure(ip(1));
        }
        limiter.record_success(ip(1));
        assert_eq!(limiter.len(), 0);
        // Counter restarts after success.
        for _ in 0..4 {
            assert!(limiter.record_failure(ip(1)).is_none());
        }
    }

    #[test]
    fn table_never_exceeds_cap() {
        let limiter = RateLimiter::new(5, Duration::from_secs(900), 10);
        for n in 0..50 {
            limiter.record_failure(ip(n));
        }
        assert!(limiter.len() <= 10);
    }

    #[test]
    fn locked_entries_survive_eviction() {
        let limiter = RateLimiter::new(2, Duration::from_secs(900), 3);
        // Lock out two addresses.
        for n in 0..2 {
            limiter.record_failure(ip(n));
            limiter.record_failure(ip(n));
            assert!(limiter.check(ip(n)).is_some());
        }
        // Churn many more addresses through the remaining slot.
        for n in 10..30 {
            limiter.record_failure(ip(n));
        }
        assert!(limiter.len() <= 3);
        // The locked addresses were never evicted.
        assert!(limiter.check(ip(0)).is_some());
        assert!(limiter.check(ip(1)).is_some());
    }

    #[test]
    fn expired_lockout_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(0), 10);
        limiter.record_failure(ip(1));
        // Zero-duration lockout expires immediately.
        assert!(limiter.check(ip(1)).is_none());
        // Next failure locks again rather than compounding.
        assert!(limiter.record_failure(ip(1)).is_some());
    }
}
