use crate::analytics::{round_to, AnalysisResult, PortfolioAnalyzer, PortfolioItem};
use crate::config::{Settings, ALLOWED_ORIGINS, DEFAULT_PERIOD, VALUE_PRECISION};
use crate::data::PriceSource;
use crate::error::AnalyticsError;
use crate::predictor::ModelCell;
use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub type SharedAnalyzer = PortfolioAnalyzer<Box<dyn PriceSource>>;

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<SharedAnalyzer>,
    pub model: Arc<ModelCell>,
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct PortfolioEntry {
    ticker: String,
    weight: f64,
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    portfolio: Vec<PortfolioEntry>,
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    DEFAULT_PERIOD.to_string()
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    return_value: f64,
    current_volatility: f64,
}

#[derive(Debug, Serialize, PartialEq)]
struct PredictResponse {
    predicted_next_volatility: f64,
}

pub fn router(state: AppState, api_version: &str) -> Router {
    let origins: Vec<HeaderValue> = ALLOWED_ORIGINS
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(root))
        .route("/finance", get(finance_info))
        .route(&format!("/api/{}/analyze", api_version), post(analyze))
        .route(
            &format!("/api/{}/predict-volatility", api_version),
            post(predict_volatility),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(settings: &Settings, state: AppState) -> Result<()> {
    // Load the model up front; a failure only disables prediction.
    if let Err(e) = state.model.get() {
        warn!("Volatility prediction disabled: {}", e);
    }

    let app = router(state, &settings.api_version);
    let addr = format!("0.0.0.0:{}", settings.port);
    info!("finsight listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "finsight backend is running" }))
}

async fn finance_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "Finance API", "version": "1.0" }))
}

async fn analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalysisResult>, (StatusCode, Json<ApiError>)> {
    let items: Vec<PortfolioItem> = req
        .portfolio
        .iter()
        .map(|p| PortfolioItem::new(&p.ticker, p.weight))
        .collect();

    let result = state
        .analyzer
        .analyze(&items, &req.period)
        .await
        .map_err(analytics_err)?;
    Ok(Json(result))
}

async fn predict_volatility(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, (StatusCode, Json<ApiError>)> {
    let raw = state
        .model
        .predict(req.return_value, req.current_volatility)
        .map_err(analytics_err)?;
    Ok(Json(PredictResponse {
        predicted_next_volatility: round_to(raw, VALUE_PRECISION),
    }))
}

fn status_for(err: &AnalyticsError) -> StatusCode {
    match err {
        AnalyticsError::InvalidPortfolio(_) | AnalyticsError::InvalidWeights => {
            StatusCode::BAD_REQUEST
        }
        AnalyticsError::DataUnavailable(_) | AnalyticsError::NoPriceData(_) => {
            StatusCode::NOT_FOUND
        }
        AnalyticsError::InsufficientHistory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AnalyticsError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AnalyticsError::Upstream(_) => StatusCode::BAD_GATEWAY,
    }
}

fn analytics_err(err: AnalyticsError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!("request failed: {}", err);
    }
    (
        status,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}
