//! Integration tests for ploapi

use chrono::{TimeZone, Utc};
use ploapi::{AuthProvider, ScheduleClient, TelemetryClient, TokenCoordinator};
use ploutils::ManualTimeSource;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Provider whose current token can be invalid until refreshed.
struct SwitchingProvider {
    refreshed: AtomicBool,
}

impl SwitchingProvider {
    fn new() -> Self {
        Self {
            refreshed: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl AuthProvider for SwitchingProvider {
    async fn current_token(&self) -> Option<String> {
        if self.refreshed.load(Ordering::SeqCst) {
            Some("fresh-token".to_string())
        } else {
            Some("stale-token".to_string())
        }
    }

    async fn refresh_token(&self) -> Option<String> {
        self.refreshed.store(true, Ordering::SeqCst);
        Some("fresh-token".to_string())
    }
}

struct NoTokenProvider;

#[async_trait::async_trait]
impl AuthProvider for NoTokenProvider {
    async fn current_token(&self) -> Option<String> {
        None
    }

    async fn refresh_token(&self) -> Option<String> {
        None
    }
}

fn tokens(provider: Arc<dyn AuthProvider>) -> Arc<TokenCoordinator> {
    let clock = ManualTimeSource::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    Arc::new(TokenCoordinator::new(provider, Arc::new(clock)))
}

fn mock_schedule_json() -> serde_json::Value {
    json!([
        {
            "id": "spin-1",
            "stationId": "station-1",
            "airtime": "2025-06-01T12:00:00.000+0000",
            "startingVolume": 1.0,
            "audioBlock": {
                "id": "block-1",
                "title": "So What",
                "artist": "Miles Davis",
                "durationMS": 540000,
                "endOfMessageMS": 535000,
                "downloadUrl": "https://cdn.example.com/so-what.mp3",
                "type": "song"
            },
            "fades": []
        },
        {
            "id": "spin-2",
            "stationId": "station-1",
            "airtime": "2025-06-01T12:08:55.000+0000",
            "startingVolume": 0.2,
            "audioBlock": {
                "id": "block-2",
                "title": "Station ID",
                "artist": "Playola",
                "durationMS": 8000,
                "endOfMessageMS": 8000,
                "downloadUrl": "https://cdn.example.com/station-id.mp3",
                "type": "audio_image"
            },
            "fades": [{"atMS": 2000, "toVolume": 1.0}]
        }
    ])
}

#[tokio::test]
async fn test_fetch_schedule() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/stations/station-1/schedule"))
        .and(query_param("includeRelatedTexts", "true"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_schedule_json()))
        .mount(&server)
        .await;

    let provider = Arc::new(SwitchingProvider::new());
    provider.refreshed.store(true, Ordering::SeqCst);

    let client = ScheduleClient::builder()
        .base_url(server.uri())
        .tokens(tokens(provider))
        .build()
        .unwrap();

    let schedule = client.fetch_schedule("station-1").await.unwrap();
    assert_eq!(schedule.station_id, "station-1");
    assert_eq!(schedule.spins.len(), 2);
    // Triés par airtime croissant
    assert_eq!(schedule.spins[0].id, "spin-1");
    assert_eq!(schedule.spins[1].id, "spin-2");
    assert_eq!(schedule.spins[1].starting_volume, 0.2);
}

#[tokio::test]
async fn test_fetch_schedule_refreshes_on_401() {
    let server = MockServer::start().await;

    // Le token périmé prend un 401…
    Mock::given(method("GET"))
        .and(path("/v1/stations/station-1/schedule"))
        .and(header("authorization", "Bearer stale-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    // …le token rafraîchi passe.
    Mock::given(method("GET"))
        .and(path("/v1/stations/station-1/schedule"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_schedule_json()))
        .expect(1)
        .mount(&server)
        .await;

    let client = ScheduleClient::builder()
        .base_url(server.uri())
        .tokens(tokens(Arc::new(SwitchingProvider::new())))
        .build()
        .unwrap();

    let schedule = client.fetch_schedule("station-1").await.unwrap();
    assert_eq!(schedule.spins.len(), 2);
    server.verify().await;
}

#[tokio::test]
async fn test_fetch_schedule_unauthorized_without_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/stations/station-1/schedule"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = ScheduleClient::builder()
        .base_url(server.uri())
        .tokens(tokens(Arc::new(NoTokenProvider)))
        .build()
        .unwrap();

    let err = client.fetch_schedule("station-1").await.unwrap_err();
    assert!(matches!(err, ploapi::ApiError::Unauthorized));
}

#[tokio::test]
async fn test_fetch_schedule_http_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = ScheduleClient::builder()
        .base_url(server.uri())
        .tokens(tokens(Arc::new(NoTokenProvider)))
        .build()
        .unwrap();

    let err = client.fetch_schedule("station-1").await.unwrap_err();
    assert!(matches!(err, ploapi::ApiError::Status(500)));
}

#[tokio::test]
async fn test_telemetry_beacon_with_bearer() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/listeningSessions"))
        .and(header("authorization", "Bearer fresh-token"))
        .and(body_json(json!({
            "deviceId": "device-42",
            "stationId": "station-1"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Arc::new(SwitchingProvider::new());
    provider.refreshed.store(true, Ordering::SeqCst);

    let client = TelemetryClient::new(server.uri(), tokens(provider), "device-42");
    client.report_listening("station-1").await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn test_telemetry_falls_back_to_basic() {
    let server = MockServer::start().await;

    // Sans token : Authorization Basic, peu importe la valeur exacte
    Mock::given(method("POST"))
        .and(path("/v1/listeningSessions/end"))
        .and(body_json(json!({"deviceId": "device-42"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = TelemetryClient::new(server.uri(), tokens(Arc::new(NoTokenProvider)), "device-42");
    client.report_end().await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn test_telemetry_retries_once_on_401() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/listeningSessions"))
        .and(header("authorization", "Bearer stale-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/listeningSessions"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = TelemetryClient::new(
        server.uri(),
        tokens(Arc::new(SwitchingProvider::new())),
        "device-42",
    );
    client.report_listening("station-1").await.unwrap();
    server.verify().await;
}
