//! Sliding-window rate limiter — bounds request rate per sender and per
//! channel with independent 60-second windows.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const WINDOW: Duration = Duration::from_secs(60);

/// Rate limit configuration. Disabled by default.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Requests per minute per user. 0 disables the user check.
    pub per_user_rpm: u32,
    /// Requests per minute per channel. 0 disables the channel check.
    pub per_channel_rpm: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            per_user_rpm: 30,
            per_channel_rpm: 100,
            enabled: false,
        }
    }
}

#[derive(Default)]
struct Windows {
    users: HashMap<String, VecDeque<Instant>>,
    channels: HashMap<String, VecDeque<Instant>>,
}

/// Sliding-window limiter. A request is recorded only when every check
/// passes, so rejected requests do not consume quota.
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        SlidingWindowRateLimiter {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check whether a request is allowed. Returns `(allowed, reason)`;
    /// the reason is empty when allowed.
    pub fn check(&self, user_key: &str, channel_key: &str) -> (bool, String) {
        self.check_at(user_key, channel_key, Instant::now())
    }

    /// As `check`, with an explicit clock for tests.
    pub fn check_at(&self, user_key: &str, channel_key: &str, now: Instant) -> (bool, String) {
        if !self.config.enabled {
            return (true, String::new());
        }

        let mut windows = self.windows.lock().unwrap();

        if self.config.per_user_rpm > 0 && !user_key.is_empty() {
            if let Some(reason) = check_window(
                &mut windows.users,
                user_key,
                now,
                self.config.per_user_rpm,
                "user",
            ) {
                return (false, reason);
            }
        }
        if self.config.per_channel_rpm > 0 && !channel_key.is_empty() {
            if let Some(reason) = check_window(
                &mut windows.channels,
                channel_key,
                now,
                self.config.per_channel_rpm,
                "channel",
            ) {
                return (false, reason);
            }
        }

        if !user_key.is_empty() {
            windows.users.entry(user_key.to_string()).or_default().push_back(now);
        }
        if !channel_key.is_empty() {
            windows
                .channels
                .entry(channel_key.to_string())
                .or_default()
                .push_back(now);
        }
        (true, String::new())
    }

    /// Clear windows for the given keys; with both empty, clear everything.
    pub fn reset(&self, user_key: &str, channel_key: &str) {
        let mut windows = self.windows.lock().unwrap();
        if !user_key.is_empty() {
            windows.users.remove(user_key);
        }
        if !channel_key.is_empty() {
            windows.channels.remove(channel_key);
        }
        if user_key.is_empty() && channel_key.is_empty() {
            windows.users.clear();
            windows.channels.clear();
        }
    }

    /// Counts of tracked keys, for diagnostics.
    pub fn stats(&self) -> (usize, usize) {
        let windows = self.windows.lock().unwrap();
        (windows.users.len(), windows.channels.len())
    }
}

fn check_window(
    windows: &mut HashMap<String, VecDeque<Instant>>,
    key: &str,
    now: Instant,
    limit: u32,
    label: &str,
) -> Option<String> {
    let Some(dq) = windows.get_mut(key) else {
        return None;
    };
    while dq.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
        dq.pop_front();
    }
    if dq.len() >= limit as usize {
        return Some(format!(
            "Rate limit exceeded for {label} '{key}': {limit} requests per minute"
        ));
    }
    None
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
