//! JSON HTTP surface over the aggregation pipeline and the reminder scheduler.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use xtrobe_adapters::{ASTRONOMY, LAUNCH_SCHEDULE, SPACE_NEWS};
use xtrobe_notify::{NotificationScheduler, NotifyConfig, ScheduleRejection};
use xtrobe_sync::{SyncConfig, SyncPipeline};

pub const CRATE_NAME: &str = "xtrobe-web";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub sync: SyncConfig,
    pub notify: NotifyConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("XTROBE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            sync: SyncConfig::from_env(),
            notify: NotifyConfig::from_env(),
        }
    }
}

pub struct AppState {
    pub pipeline: SyncPipeline,
    pub scheduler: NotificationScheduler,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline, scheduler: NotificationScheduler) -> Self {
        Self {
            pipeline,
            scheduler,
        }
    }

    /// Wire the production collaborators. Needs a running tokio runtime.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let pipeline = SyncPipeline::new(config.sync.clone())
            .await
            .context("building sync pipeline")?;
        let mailer = config.notify.build_mailer()?;
        let scheduler = NotificationScheduler::new(mailer, config.notify.sender.clone())?;
        Ok(Self::new(pipeline, scheduler))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape", get(space_news_handler))
        .route("/astronomy", get(astronomy_handler))
        .route("/calenderevents", get(launch_schedule_handler))
        .route("/sources/{id}", get(source_handler))
        .route("/notify", post(notify_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "xtrobe web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppConfig::from_env()).await
}

async fn space_news_handler(State(state): State<Arc<AppState>>) -> Response {
    aggregate_response(&state, SPACE_NEWS).await
}

async fn astronomy_handler(State(state): State<Arc<AppState>>) -> Response {
    aggregate_response(&state, ASTRONOMY).await
}

async fn launch_schedule_handler(State(state): State<Arc<AppState>>) -> Response {
    aggregate_response(&state, LAUNCH_SCHEDULE).await
}

async fn source_handler(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Response {
    aggregate_response(&state, &source_id).await
}

async fn aggregate_response(state: &AppState, source_id: &str) -> Response {
    match state.pipeline.run_source(source_id).await {
        Ok(report) => Json(json!({ "status": "success", "data": report.records })).into_response(),
        Err(err) => {
            warn!(source_id, error = %err, "aggregation run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    email: Option<String>,
    event_title: Option<String>,
    launch_time: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn notify_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Response {
    let fields = payload.ok().and_then(|Json(req)| {
        Some((
            required(req.email)?,
            required(req.event_title)?,
            required(req.launch_time)?,
        ))
    });
    let Some((email, title, launch_time)) = fields else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing required fields" })),
        )
            .into_response();
    };

    match state.scheduler.schedule(&email, &title, &launch_time) {
        Ok(task_id) => Json(json!({
            "message": "Notification scheduled successfully",
            "task_id": task_id.to_string(),
        }))
        .into_response(),
        Err(rejection) => {
            let status = match rejection {
                ScheduleRejection::InvalidFormat(_) => StatusCode::BAD_REQUEST,
                ScheduleRejection::PastDeadline(_) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (status, Json(json!({ "error": rejection.to_string() }))).into_response()
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
