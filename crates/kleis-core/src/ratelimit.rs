use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Admin,
    Proxy,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    max_failures: u32,
    window_ms: i64,
    block_ms: i64,
}

impl RateLimitScope {
    fn policy(self) -> Policy {
        match self {
            RateLimitScope::Admin => Policy {
                max_failures: 12,
                window_ms: 60_000,
                block_ms: 5 * 60_000,
            },
            RateLimitScope::Proxy => Policy {
                max_failures: 120,
                window_ms: 60_000,
                block_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    window_start: i64,
    failures: u32,
    blocked_until: Option<i64>,
    last_seen: i64,
}

const PRUNE_THRESHOLD: usize = 5_000;
const IDLE_EVICT_MS: i64 = 60 * 60_000;

/// Per-client-IP failure backoff. Process-local by design; horizontal
/// scaling would substitute a shared store with atomic increment.
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<(String, RateLimitScope), Entry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Err(retry_after_secs)` while a block is active.
    pub fn check(&self, client_ip: &str, scope: RateLimitScope, now_ms: i64) -> Result<(), i64> {
        let mut entries = self.entries.lock().expect("rate limit map lock");
        let Some(entry) = entries.get_mut(&(client_ip.to_string(), scope)) else {
            return Ok(());
        };
        entry.last_seen = now_ms;
        match entry.blocked_until {
            Some(until) if until > now_ms => Err(((until - now_ms) + 999) / 1000),
            Some(_) => {
                entry.blocked_until = None;
                entry.failures = 0;
                entry.window_start = now_ms;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_failure(&self, client_ip: &str, scope: RateLimitScope, now_ms: i64) {
        let policy = scope.policy();
        let mut entries = self.entries.lock().expect("rate limit map lock");
        if entries.len() > PRUNE_THRESHOLD {
            entries.retain(|_, entry| now_ms - entry.last_seen <= IDLE_EVICT_MS);
        }

        let entry = entries
            .entry((client_ip.to_string(), scope))
            .or_insert(Entry {
                window_start: now_ms,
                failures: 0,
                blocked_until: None,
                last_seen: now_ms,
            });
        entry.last_seen = now_ms;
        if now_ms - entry.window_start > policy.window_ms {
            entry.window_start = now_ms;
            entry.failures = 0;
        }
        entry.failures += 1;
        if entry.failures >= policy.max_failures {
            entry.blocked_until = Some(now_ms + policy.block_ms);
        }
    }

    pub fn record_success(&self, client_ip: &str, scope: RateLimitScope) {
        let mut entries = self.entries.lock().expect("rate limit map lock");
        entries.remove(&(client_ip.to_string(), scope));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("rate limit map lock").len()
    }
}
