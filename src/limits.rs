use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::http::HeaderMap;
use tokio::sync::Mutex;

use crate::{auth::AuthContext, config::RateLimitSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit_per_minute: u32,
    pub remaining_per_minute: u32,
    pub limit_per_hour: u32,
    pub remaining_per_hour: u32,
    pub reset_minute: u64,
    pub reset_hour: u64,
}

impl RateLimitSnapshot {
    pub fn to_header_pairs(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-ratelimit-limit-minute".to_owned(),
                self.limit_per_minute.to_string(),
            ),
            (
                "x-ratelimit-remaining-minute".to_owned(),
                self.remaining_per_minute.to_string(),
            ),
            (
                "x-ratelimit-limit-hour".to_owned(),
                self.limit_per_hour.to_string(),
            ),
            (
                "x-ratelimit-remaining-hour".to_owned(),
                self.remaining_per_hour.to_string(),
            ),
            ("x-ratelimit-reset-minute".to_owned(), self.reset_minute.to_string()),
            ("x-ratelimit-reset-hour".to_owned(), self.reset_hour.to_string()),
        ]
    }
}

#[derive(Debug)]
pub enum RateLimitError {
    PerMinute(RateLimitSnapshot),
    PerHour(RateLimitSnapshot),
}

impl RateLimitError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::PerMinute(_) => "Rate limit exceeded (per minute). Please try again later.",
            Self::PerHour(_) => "Rate limit exceeded (per hour). Please try again later.",
        }
    }

    pub fn snapshot(&self) -> &RateLimitSnapshot {
        match self {
            Self::PerMinute(snapshot) | Self::PerHour(snapshot) => snapshot,
        }
    }
}

/// Clients tracked before idle ones are swept.
const PRUNE_THRESHOLD: usize = 1_024;

/// Fixed-window request counters per client, aligned to wall-clock minutes
/// and hours. Disabled unless configured.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    usage: Mutex<HashMap<String, ClientUsage>>,
}

#[derive(Debug, Clone)]
struct ClientUsage {
    minute_started_at: u64,
    hour_started_at: u64,
    requests_in_minute: u32,
    requests_in_hour: u32,
}

impl ClientUsage {
    fn new(now: u64) -> Self {
        Self {
            minute_started_at: window_start(now, 60),
            hour_started_at: window_start(now, 3_600),
            requests_in_minute: 0,
            requests_in_hour: 0,
        }
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Counts one request for `client`. Returns `None` when limiting is off.
    pub async fn check_and_consume(
        &self,
        client: &str,
    ) -> Result<Option<RateLimitSnapshot>, RateLimitError> {
        if !self.settings.enabled {
            return Ok(None);
        }
        self.consume_at(client, unix_timestamp()).await.map(Some)
    }

    async fn consume_at(&self, client: &str, now: u64) -> Result<RateLimitSnapshot, RateLimitError> {
        let mut usage_map = self.usage.lock().await;
        if usage_map.len() >= PRUNE_THRESHOLD && !usage_map.contains_key(client) {
            prune_idle(&mut usage_map, now);
        }
        let usage = usage_map
            .entry(client.to_owned())
            .or_insert_with(|| ClientUsage::new(now));

        refresh_windows(now, usage);

        if usage.requests_in_minute >= self.settings.per_minute {
            return Err(RateLimitError::PerMinute(self.snapshot(usage, now)));
        }
        if usage.requests_in_hour >= self.settings.per_hour {
            return Err(RateLimitError::PerHour(self.snapshot(usage, now)));
        }

        usage.requests_in_minute = usage.requests_in_minute.saturating_add(1);
        usage.requests_in_hour = usage.requests_in_hour.saturating_add(1);

        Ok(self.snapshot(usage, now))
    }

    fn snapshot(&self, usage: &ClientUsage, now: u64) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit_per_minute: self.settings.per_minute,
            remaining_per_minute: self
                .settings
                .per_minute
                .saturating_sub(usage.requests_in_minute),
            limit_per_hour: self.settings.per_hour,
            remaining_per_hour: self.settings.per_hour.saturating_sub(usage.requests_in_hour),
            reset_minute: window_start(now, 60).saturating_add(60),
            reset_hour: window_start(now, 3_600).saturating_add(3_600),
        }
    }
}

/// API key when one was presented, else the forwarded client address.
pub fn client_key(headers: &HeaderMap, auth: &AuthContext) -> String {
    if auth.api_key.is_some() {
        return auth.client_id.clone();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|ip| format!("ip:{ip}"))
        .unwrap_or_else(|| "anonymous".to_owned())
}

/// Drops clients whose hour window has already rolled over. Their counters
/// would reset on the next request anyway.
fn prune_idle(usage_map: &mut HashMap<String, ClientUsage>, now: u64) {
    let hour_start = window_start(now, 3_600);
    usage_map.retain(|_, usage| usage.hour_started_at == hour_start);
}

fn refresh_windows(now: u64, usage: &mut ClientUsage) {
    let minute_start = window_start(now, 60);
    if usage.minute_started_at != minute_start {
        usage.minute_started_at = minute_start;
        usage.requests_in_minute = 0;
    }

    let hour_start = window_start(now, 3_600);
    if usage.hour_started_at != hour_start {
        usage.hour_started_at = hour_start;
        usage.requests_in_hour = 0;
    }
}

fn window_start(now: u64, length: u64) -> u64 {
    (now / length) * length
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
