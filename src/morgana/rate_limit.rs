//! Per-conversation rate limiting.
//!
//! Enforced by the conversation manager **before** supervisor dispatch: a
//! rejected message never reaches the actor tree. The [`RateLimiter`] trait
//! is the collaborator seam (distributed deployments plug in a shared
//! store); [`InMemoryRateLimiter`] is the in-process sliding-window
//! reference implementation.
//!
//! Three windows are tracked — per-minute, per-hour, per-day — and a zero
//! threshold disables its window.

use crate::morgana::config::RateLimitConfig;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Which limit a rejected message ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitWindow {
    Minute,
    Hour,
    Day,
}

impl RateLimitWindow {
    fn length(self) -> Duration {
        match self {
            RateLimitWindow::Minute => Duration::from_secs(60),
            RateLimitWindow::Hour => Duration::from_secs(60 * 60),
            RateLimitWindow::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl fmt::Display for RateLimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitWindow::Minute => write!(f, "minute"),
            RateLimitWindow::Hour => write!(f, "hour"),
            RateLimitWindow::Day => write!(f, "day"),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub violated_window: Option<RateLimitWindow>,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    /// The pass decision.
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            violated_window: None,
            retry_after_seconds: None,
        }
    }
}

/// Collaborator seam for rate limiting.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check whether a message for `conversation_id` may proceed, recording
    /// it when allowed.
    async fn check_and_record(&self, conversation_id: &str) -> RateLimitDecision;
}

/// Sliding-window limiter over in-process state.
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    history: Arc<RwLock<HashMap<String, VecDeque<Instant>>>>,
}

impl InMemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The canned answer for a violated window, honoring configured
    /// overrides.
    pub fn error_message(&self, window: RateLimitWindow) -> String {
        window_message(&self.config, window)
    }

    fn thresholds(&self) -> [(RateLimitWindow, u32); 3] {
        [
            (RateLimitWindow::Minute, self.config.max_messages_per_minute),
            (RateLimitWindow::Hour, self.config.max_messages_per_hour),
            (RateLimitWindow::Day, self.config.max_messages_per_day),
        ]
    }
}

/// The canned answer for a violated window: the configured override when
/// present, the built-in default otherwise.
pub fn window_message(config: &RateLimitConfig, window: RateLimitWindow) -> String {
    let configured = match window {
        RateLimitWindow::Minute => config.error_message_minute.as_deref(),
        RateLimitWindow::Hour => config.error_message_hour.as_deref(),
        RateLimitWindow::Day => config.error_message_day.as_deref(),
    };
    match configured {
        Some(text) => text.to_string(),
        None => default_window_message(window).to_string(),
    }
}

/// Default canned answer per window.
pub fn default_window_message(window: RateLimitWindow) -> &'static str {
    match window {
        RateLimitWindow::Minute => "You are sending messages too quickly. Please wait a moment.",
        RateLimitWindow::Hour => "Hourly message limit reached. Please try again later.",
        RateLimitWindow::Day => "Daily message limit reached. Please try again tomorrow.",
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_record(&self, conversation_id: &str) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::allowed();
        }

        let now = Instant::now();
        let mut history = self.history.write().await;
        let timestamps = history
            .entry(conversation_id.to_string())
            .or_insert_with(VecDeque::new);

        // Nothing older than the widest window matters.
        let day = RateLimitWindow::Day.length();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) > day {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        for (window, threshold) in self.thresholds().iter() {
            if *threshold == 0 {
                continue;
            }
            let length = window.length();
            let in_window = timestamps
                .iter()
                .filter(|t| now.duration_since(**t) <= length)
                .count() as u32;
            if in_window >= *threshold {
                let retry_after = timestamps
                    .iter()
                    .find(|t| now.duration_since(**t) <= length)
                    .map(|oldest| {
                        length
                            .checked_sub(now.duration_since(*oldest))
                            .unwrap_or_default()
                            .as_secs()
                            .max(1)
                    });
                log::info!(
                    "rate limit hit: conversation={} window={} count={}",
                    conversation_id,
                    window,
                    in_window
                );
                return RateLimitDecision {
                    allowed: false,
                    violated_window: Some(*window),
                    retry_after_seconds: retry_after,
                };
            }
        }

        timestamps.push_back(now);
        RateLimitDecision::allowed()
    }
}

/// Limiter used when rate limiting is disabled entirely.
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check_and_record(&self, _conversation_id: &str) -> RateLimitDecision {
        RateLimitDecision::allowed()
    }
}
