//! Bearer-token provisioning and refresh budgeting.
//!
//! The host application supplies tokens through [`AuthProvider`]; the
//! [`TokenCoordinator`] enforces the refresh budget (at most 3 refreshes
//! per 5-minute window on 401) and carries the Basic fallback credential
//! used by telemetry only — schedule fetches never fall back to Basic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ploutils::TimeSource;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Supplies bearer tokens for the admin API.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current token, if any.
    async fn current_token(&self) -> Option<String>;

    /// Obtain a fresh token after a 401. `None` means the provider
    /// could not refresh.
    async fn refresh_token(&self) -> Option<String>;
}

/// Fallback Basic credential, telemetry only.
const DEFAULT_BASIC_CREDENTIAL: &str = "playola-client:4f5a8d1e";

const REFRESH_WINDOW_SECS: i64 = 300;
const MAX_REFRESHES_PER_WINDOW: usize = 3;

/// Wraps an [`AuthProvider`] with refresh budgeting.
pub struct TokenCoordinator {
    provider: Arc<dyn AuthProvider>,
    time: Arc<dyn TimeSource>,
    refresh_times: Mutex<VecDeque<DateTime<Utc>>>,
    basic_credential: String,
}

impl TokenCoordinator {
    pub fn new(provider: Arc<dyn AuthProvider>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            provider,
            time,
            refresh_times: Mutex::new(VecDeque::new()),
            basic_credential: DEFAULT_BASIC_CREDENTIAL.to_string(),
        }
    }

    /// Override the telemetry fallback credential (`user:password`).
    pub fn with_basic_credential(mut self, credential: impl Into<String>) -> Self {
        self.basic_credential = credential.into();
        self
    }

    /// Current bearer token, if the provider has one.
    pub async fn bearer(&self) -> Option<String> {
        self.provider.current_token().await
    }

    /// Refresh after a 401, within the budget.
    ///
    /// Returns `None` either when the provider cannot refresh or when
    /// the 3-per-5-minutes budget is exhausted.
    pub async fn refresh_after_unauthorized(&self) -> Option<String> {
        if !self.take_refresh_slot() {
            warn!("TokenCoordinator: refresh budget exhausted, not refreshing");
            return None;
        }
        debug!("TokenCoordinator: refreshing token after 401");
        self.provider.refresh_token().await
    }

    /// `Basic ...` header value for telemetry calls.
    pub fn basic_authorization(&self) -> String {
        format!("Basic {}", BASE64.encode(self.basic_credential.as_bytes()))
    }

    fn take_refresh_slot(&self) -> bool {
        let now = self.time.now();
        let mut times = self.refresh_times.lock().unwrap();
        while let Some(front) = times.front() {
            if now - *front >= Duration::seconds(REFRESH_WINDOW_SECS) {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() >= MAX_REFRESHES_PER_WINDOW {
            return false;
        }
        times.push_back(now);
        true
    }
}
