//! Listening-session beacon client.
//!
//! Thin wrapper over the two telemetry endpoints. The periodic loop that
//! drives it lives in the player crate; failures here are reported as
//! warnings by the caller and are never fatal to playback.

use crate::auth::TokenCoordinator;
use crate::error::{ApiError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListeningSessionBody<'a> {
    device_id: &'a str,
    station_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionBody<'a> {
    device_id: &'a str,
}

/// Client for `POST /v1/listeningSessions` and its `/end` sibling.
#[derive(Clone)]
pub struct TelemetryClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCoordinator>,
    device_id: String,
}

impl TelemetryClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<TokenCoordinator>,
        device_id: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            device_id: device_id.into(),
        }
    }

    /// Signals that this device is (still) listening to a station.
    pub async fn report_listening(&self, station_id: &str) -> Result<()> {
        let url = format!("{}/v1/listeningSessions", self.base_url);
        let body = ListeningSessionBody {
            device_id: &self.device_id,
            station_id,
        };
        self.post_with_retry(&url, &body).await
    }

    /// Signals the end of the listening session.
    pub async fn report_end(&self) -> Result<()> {
        let url = format!("{}/v1/listeningSessions/end", self.base_url);
        let body = EndSessionBody {
            device_id: &self.device_id,
        };
        self.post_with_retry(&url, &body).await
    }

    /// POST with Bearer when available, Basic otherwise; one token
    /// refresh and one retry on 401.
    async fn post_with_retry<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let authorization = match self.tokens.bearer().await {
            Some(token) => format!("Bearer {}", token),
            None => self.tokens.basic_authorization(),
        };

        let status = self.post(url, body, &authorization).await?;
        if status != reqwest::StatusCode::UNAUTHORIZED {
            return check_status(status);
        }

        let authorization = match self.tokens.refresh_after_unauthorized().await {
            Some(fresh) => format!("Bearer {}", fresh),
            // Télémétrie uniquement : repli sur le Basic configuré
            None => self.tokens.basic_authorization(),
        };
        let status = self.post(url, body, &authorization).await?;
        check_status(status)
    }

    async fn post<B: Serialize>(
        &self,
        url: &str,
        body: &B,
        authorization: &str,
    ) -> Result<reqwest::StatusCode> {
        debug!("TelemetryClient: POST {}", url);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;
        Ok(response.status())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Status(status.as_u16()))
    }
}
