//! HTTP client for the station schedule endpoint

use crate::auth::TokenCoordinator;
use crate::error::{ApiError, Result};
use crate::models::{Schedule, Spin};
use ploutils::TimeSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default admin API base URL
pub const DEFAULT_BASE_URL: &str = "https://admin-api.playola.fm";

/// Default timeout for a single HTTP request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a whole resource
pub const DEFAULT_RESOURCE_TIMEOUT_SECS: u64 = 300;

/// Fetches and parses station schedules.
///
/// # Example
///
/// ```no_run
/// use ploapi::{ScheduleClient, TokenCoordinator};
/// # async fn run(tokens: std::sync::Arc<TokenCoordinator>) -> ploapi::Result<()> {
/// let client = ScheduleClient::builder()
///     .base_url("https://admin-api.playola.fm")
///     .tokens(tokens)
///     .build()?;
/// let schedule = client.fetch_schedule("station-1").await?;
/// println!("{} spins", schedule.spins.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ScheduleClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCoordinator>,
    time: Arc<dyn TimeSource>,
}

impl ScheduleClient {
    pub fn builder() -> ScheduleClientBuilder {
        ScheduleClientBuilder::default()
    }

    /// Fetches the schedule for a station.
    ///
    /// On a 401, asks the token coordinator for one refresh and retries
    /// once. Schedule fetches never fall back to the Basic credential.
    pub async fn fetch_schedule(&self, station_id: &str) -> Result<Schedule> {
        let url = format!(
            "{}/v1/stations/{}/schedule?includeRelatedTexts=true",
            self.base_url, station_id
        );

        let token = self.tokens.bearer().await;
        let mut response = self.get(&url, token.as_deref()).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            match self.tokens.refresh_after_unauthorized().await {
                Some(fresh) => {
                    debug!("ScheduleClient: retrying schedule fetch with fresh token");
                    response = self.get(&url, Some(&fresh)).await?;
                }
                None => return Err(ApiError::Unauthorized),
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            warn!("ScheduleClient: schedule fetch returned {}", status);
            return Err(ApiError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(ApiError::from_transport)?;
        let spins: Vec<Spin> = serde_json::from_str(&body)?;
        debug!(
            "ScheduleClient: fetched {} spins for {}",
            spins.len(),
            station_id
        );

        Ok(Schedule::new(
            station_id.to_string(),
            spins,
            self.time.now(),
        ))
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(ApiError::from_transport)
    }
}

/// Builder for [`ScheduleClient`]
#[derive(Default)]
pub struct ScheduleClientBuilder {
    base_url: Option<String>,
    tokens: Option<Arc<TokenCoordinator>>,
    time: Option<Arc<dyn TimeSource>>,
    request_timeout: Option<Duration>,
    resource_timeout: Option<Duration>,
}

impl ScheduleClientBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn tokens(mut self, tokens: Arc<TokenCoordinator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn resource_timeout(mut self, timeout: Duration) -> Self {
        self.resource_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ScheduleClient> {
        let tokens = self
            .tokens
            .ok_or_else(|| ApiError::other("ScheduleClient requires a TokenCoordinator"))?;

        let request_timeout = self
            .request_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        let resource_timeout = self
            .resource_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_RESOURCE_TIMEOUT_SECS));

        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .timeout(resource_timeout)
            .build()
            .map_err(ApiError::from_transport)?;

        Ok(ScheduleClient {
            client,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            tokens,
            time: self
                .time
                .unwrap_or_else(|| Arc::new(ploutils::SystemTimeSource::new())),
        })
    }
}
