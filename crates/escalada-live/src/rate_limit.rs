//! Sliding-window command budgets, checked before any box lock is taken.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use escalada_store::BoxId;
use serde::Serialize;

use crate::config::{RateKeyScope, RateLimitConfig};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateStats {
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub blocked: bool,
    pub blocked_for_ms: Option<u64>,
    pub command_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct KeyHistory {
    requests: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    commands: HashMap<String, VecDeque<Instant>>,
}

impl KeyHistory {
    fn blocked_at(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.requests.is_empty()
            && self.commands.values().all(VecDeque::is_empty)
            && self.blocked_at(now).is_none()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while window
        .front()
        .is_some_and(|ts| now.saturating_duration_since(*ts) >= span)
    {
        window.pop_front();
    }
}

fn count_within(window: &VecDeque<Instant>, now: Instant, span: Duration) -> usize {
    window
        .iter()
        .filter(|ts| now.saturating_duration_since(**ts) < span)
        .count()
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    keys: Mutex<HashMap<String, KeyHistory>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Budget key for a command, following the configured scope.
    pub fn key_for(&self, box_id: Option<BoxId>, session_id: Option<&str>) -> String {
        let scope = match box_id {
            Some(id) => format!("box:{id}"),
            None => "global".to_string(),
        };
        match (self.config.key_scope, session_id) {
            (RateKeyScope::BoxSession, Some(session)) => format!("{scope}:session:{session}"),
            _ => scope,
        }
    }

    pub fn check(&self, key: &str, command_type: &str) -> RateDecision {
        self.check_at(key, command_type, Instant::now())
    }

    /// Check and, when allowed, record one request at `now`.
    pub fn check_at(&self, key: &str, command_type: &str, now: Instant) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::Allowed;
        }
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let history = keys.entry(key.to_string()).or_default();

        if history.blocked_at(now).is_some() {
            return RateDecision::Limited(format!("{key} is rate-limited, try again later"));
        }

        prune(&mut history.requests, now, MINUTE);
        if count_within(&history.requests, now, SECOND) >= self.config.max_per_second {
            history.blocked_until = Some(now + self.config.block);
            tracing::warn!(key, limit = self.config.max_per_second, "per-second limit exceeded");
            return RateDecision::Limited("too many requests per second".into());
        }
        if history.requests.len() >= self.config.max_per_minute {
            history.blocked_until = Some(now + self.config.block);
            tracing::warn!(key, limit = self.config.max_per_minute, "per-minute limit exceeded");
            return RateDecision::Limited("too many requests per minute".into());
        }

        let command_window = history.commands.entry(command_type.to_string()).or_default();
        prune(command_window, now, MINUTE);
        if let Some(limit) = self.config.command_limits.get(command_type) {
            if command_window.len() >= *limit {
                tracing::warn!(key, command_type, limit, "per-command limit exceeded");
                return RateDecision::Limited(format!("too many {command_type} commands"));
            }
        }

        command_window.push_back(now);
        history.requests.push_back(now);
        RateDecision::Allowed
    }

    pub fn stats(&self, key: &str) -> RateStats {
        self.stats_at(key, Instant::now())
    }

    pub fn stats_at(&self, key: &str, now: Instant) -> RateStats {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(history) = keys.get(key) else {
            return RateStats::default();
        };
        let blocked_for = history.blocked_at(now);
        RateStats {
            requests_last_second: count_within(&history.requests, now, SECOND),
            requests_last_minute: count_within(&history.requests, now, MINUTE),
            blocked: blocked_for.is_some(),
            blocked_for_ms: blocked_for.map(|d| d.as_millis() as u64),
            command_counts: history
                .commands
                .iter()
                .map(|(name, window)| (name.clone(), count_within(window, now, MINUTE)))
                .filter(|(_, count)| *count > 0)
                .collect(),
        }
    }

    /// Drop history older than `max_age` and forget idle keys. Returns the
    /// number of keys removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(max_age, Instant::now())
    }

    pub fn cleanup_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        for history in keys.values_mut() {
            prune(&mut history.requests, now, max_age);
            for window in history.commands.values_mut() {
                prune(window, now, max_age);
            }
            history.commands.retain(|_, window| !window.is_empty());
        }
        let before = keys.len();
        keys.retain(|_, history| !history.is_idle(now));
        before - keys.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
