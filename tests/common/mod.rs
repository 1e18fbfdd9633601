//! In-process stand-ins for the CoinGecko and MLflow HTTP APIs.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{
        header::{ACCEPT, RETRY_AFTER},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Datelike, NaiveDate};
use coingecko_pipeline::coingecko::{ClientConfig, CoinGeckoClient, API_KEY_HEADER};
use coingecko_pipeline::CoinId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub const API_KEY: &str = "test-key";

/// One request seen by the fake CoinGecko API.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub coin: String,
    pub date: String,
    pub localization: Option<String>,
    pub api_key: Option<String>,
    pub accept: Option<String>,
    pub received_at: Instant,
}

#[derive(Default)]
pub struct FakeCoinGecko {
    /// Coins answered with 404
    pub unknown: Vec<String>,
    /// Coins answered with 200 and an empty `{}` body
    pub empty: Vec<String>,
    /// Coin -> number of 500 responses still to send
    pub failures: Mutex<HashMap<String, u32>>,
    /// Coin -> number of 429 responses (with `retry-after: 1`) still to send
    pub rate_limited: Mutex<HashMap<String, u32>>,
    pub requests: Mutex<Vec<HistoryRequest>>,
}

impl FakeCoinGecko {
    pub fn requests(&self) -> Vec<HistoryRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, coin: &str) -> usize {
        self.requests().iter().filter(|r| r.coin == coin).count()
    }
}

/// Deterministic, non-monotonic price so both directions occur.
pub fn synthetic_price(coin: &str, date: NaiveDate) -> f64 {
    let seed = coin.bytes().map(u64::from).sum::<u64>();
    let day = date.num_days_from_ce() as u64;
    let wiggle = ((day * 37 + seed * 11) % 23) as f64;
    (seed as f64) * (1.0 + wiggle / 100.0)
}

pub fn history_document(coin: &str, date: NaiveDate) -> Value {
    let price = synthetic_price(coin, date);
    json!({
        "id": coin,
        "symbol": &coin[..3.min(coin.len())],
        "name": coin.to_uppercase(),
        "image": {
            "thumb": format!("https://assets.example/thumb/{}.png", coin),
            "small": format!("https://assets.example/small/{}.png", coin)
        },
        "market_data": {
            "current_price": {"usd": price, "eur": price * 0.9},
            "market_cap": {"usd": price * 1.0e6},
            "total_volume": {"usd": price * 1.0e4 + date.day() as f64}
        },
        "community_data": {
            "reddit_average_posts_48h": 1.5,
            "reddit_average_comments_48h": 12.0,
            "reddit_accounts_active_48h": 300
        }
    })
}

async fn history(
    State(api): State<Arc<FakeCoinGecko>>,
    Path(coin): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let date = query.get("date").cloned().unwrap_or_default();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    api.requests.lock().unwrap().push(HistoryRequest {
        coin: coin.clone(),
        date: date.clone(),
        localization: query.get("localization").cloned(),
        api_key: header(API_KEY_HEADER),
        accept: header(ACCEPT.as_str()),
        received_at: Instant::now(),
    });

    if api.unknown.contains(&coin) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "coin not found"}))).into_response();
    }
    if api.empty.contains(&coin) {
        return Json(json!({})).into_response();
    }
    {
        let mut limited = api.rate_limited.lock().unwrap();
        if let Some(remaining) = limited.get_mut(&coin) {
            if *remaining > 0 {
                *remaining -= 1;
                return (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "1")]).into_response();
            }
        }
    }
    {
        let mut failures = api.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&coin) {
            if *remaining > 0 {
                *remaining -= 1;
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    match NaiveDate::parse_from_str(&date, "%d-%m-%Y") {
        Ok(day) => Json(history_document(&coin, day)).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Serves `api` on an ephemeral port and returns its base URL.
pub async fn spawn_coingecko(api: Arc<FakeCoinGecko>) -> String {
    let app = Router::new()
        .route("/api/v3/coins/:id/history", get(history))
        .with_state(api);
    serve(app).await + "/api/v3"
}

/// Client pointed at a fake server, without pacing and with tiny backoff.
pub fn test_client(base_url: &str) -> CoinGeckoClient {
    paced_client(base_url, 0.0)
}

/// Like [`test_client`] but spacing requests at `requests_per_second`.
pub fn paced_client(base_url: &str, requests_per_second: f64) -> CoinGeckoClient {
    let config = ClientConfig {
        base_url: base_url.to_string(),
        max_retries: 3,
        requests_per_second,
        timeout_seconds: 5,
        backoff_base_ms: 1,
    };
    CoinGeckoClient::new(config, API_KEY).unwrap()
}

pub fn coins(ids: &[&str]) -> Vec<CoinId> {
    ids.iter().map(|id| CoinId::new(*id).unwrap()).collect()
}

#[derive(Default)]
pub struct FakeMlflow {
    /// (endpoint, request body) in arrival order
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Artifact path -> uploaded bytes
    pub artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeMlflow {
    pub fn endpoints(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn body_of(&self, endpoint: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(e, _)| e == endpoint)
            .map(|(_, body)| body.clone())
    }
}

async fn mlflow_create(State(api): State<Arc<FakeMlflow>>, Json(body): Json<Value>) -> Json<Value> {
    api.calls.lock().unwrap().push(("runs/create".to_string(), body));
    Json(json!({"run": {"info": {"run_id": "run-123"}}}))
}

async fn mlflow_log_batch(State(api): State<Arc<FakeMlflow>>, Json(body): Json<Value>) -> Json<Value> {
    api.calls.lock().unwrap().push(("runs/log-batch".to_string(), body));
    Json(json!({}))
}

async fn mlflow_update(State(api): State<Arc<FakeMlflow>>, Json(body): Json<Value>) -> Json<Value> {
    api.calls.lock().unwrap().push(("runs/update".to_string(), body));
    Json(json!({}))
}

async fn mlflow_artifact(
    State(api): State<Arc<FakeMlflow>>,
    Path(path): Path<String>,
    body: Bytes,
) -> StatusCode {
    api.artifacts.lock().unwrap().insert(path, body.to_vec());
    StatusCode::OK
}

/// Serves a fake MLflow tracking server and returns its base URL.
pub async fn spawn_mlflow(api: Arc<FakeMlflow>) -> String {
    let app = Router::new()
        .route("/api/2.0/mlflow/runs/create", post(mlflow_create))
        .route("/api/2.0/mlflow/runs/log-batch", post(mlflow_log_batch))
        .route("/api/2.0/mlflow/runs/update", post(mlflow_update))
        .route("/api/2.0/mlflow-artifacts/artifacts/*path", put(mlflow_artifact))
        .with_state(api);
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
