use std::path::PathBuf;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use vanish_common::MAX_UPLOAD_SIZE;
use vanish_storage::{SweeperStatus, TtlStore, parse_ttl};

use crate::blob::{self, DEFAULT_CONTENT_TYPE};
use crate::error::AppError;

const FILE_FIELD: &str = "uploaded_file";
const TTL_FIELD: &str = "ttl";

/// Estado compartilhado pelos handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: TtlStore,
    pub sweeper: watch::Receiver<SweeperStatus>,
    /// Base das URLs devolvidas no upload; sem ela usa o header `Host`.
    pub public_url: Option<String>,
}

/// Parte do router que depende do modo de execução.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_upload_bytes: usize,
    /// Em produção, diretório do build do front servido em `/` e `/static`.
    /// Sem ele o router libera CORS para o servidor de desenvolvimento.
    pub static_dir: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: MAX_UPLOAD_SIZE,
            static_dir: None,
        }
    }
}

pub fn create_router(state: AppState, config: &RouterConfig) -> Router {
    let api = Router::new()
        .route("/images", post(upload))
        .route("/images/{id}", get(fetch).delete(remove))
        .route("/images/{id}/preview", get(preview))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state);

    let app = match &config.static_dir {
        Some(dir) => api
            .nest_service("/static", ServeDir::new(dir))
            .fallback_service(ServeDir::new(dir)),
        None => api.layer(CorsLayer::permissive()),
    };

    app.layer(TraceLayer::new_for_http())
}

struct Upload {
    data: Bytes,
    content_type: String,
    file_name: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<String>, AppError> {
    let mut file = None;
    let mut ttl_raw = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        match field.name() {
            Some(FILE_FIELD) => {
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_owned();
                let file_name = field.file_name().map(str::to_owned);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?;
                file = Some(Upload {
                    data,
                    content_type,
                    file_name,
                });
            }
            Some(TTL_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.body_text()))?;
                ttl_raw = Some(text);
            }
            _ => {}
        }
    }

    let upload = file.ok_or_else(|| AppError::BadRequest(format!("campo '{FILE_FIELD}' ausente")))?;
    // TTL inválido é rejeitado antes de qualquer escrita
    let ttl = parse_ttl(ttl_raw.as_deref())?;

    info!(
        file_name = upload.file_name.as_deref().unwrap_or("-"),
        content_type = %upload.content_type,
        size = upload.data.len(),
        ttl_ms = ttl.map(|t| t.as_millis() as u64),
        "upload recebido"
    );

    let id = Uuid::new_v4().to_string();
    let value = blob::encode(&upload.content_type, &upload.data);
    let store = state.store.clone();
    let key = id.clone();
    tokio::task::spawn_blocking(move || store.put(key.as_bytes(), value, ttl)).await??;

    info!(%id, "upload gravado");
    Ok(Json(format!("{}/images/{id}", base_url(&state, &headers))))
}

fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.public_url {
        return url.trim_end_matches('/').to_owned();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

async fn fetch(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let raw = state.store.get(id.as_bytes())?;
    let (content_type, data) =
        blob::decode(raw).ok_or_else(|| AppError::Internal(format!("envelope inválido para {id}")))?;
    debug!(%id, %content_type, size = data.len(), "blob servido");

    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

async fn preview(Path(id): Path<String>) -> Result<Html<String>, AppError> {
    // O id vai parar dentro de HTML.
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(AppError::BadRequest(format!("id inválido: {id}")));
    }
    Ok(Html(format!("<img src='/images/{id}'></img>")))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let store = state.store.clone();
    let key = id.clone();
    tokio::task::spawn_blocking(move || store.delete(key.as_bytes())).await??;
    info!(%id, "blob removido");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    sweeper: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthBody>) {
    let current = state.sweeper.borrow().clone();
    let (code, body) = match current {
        SweeperStatus::Running => (
            StatusCode::OK,
            HealthBody {
                status: "ok",
                sweeper: "running",
                error: None,
            },
        ),
        SweeperStatus::Stopped => (
            StatusCode::OK,
            HealthBody {
                status: "ok",
                sweeper: "stopped",
                error: None,
            },
        ),
        SweeperStatus::Failed(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthBody {
                status: "degraded",
                sweeper: "failed",
                error: Some(msg),
            },
        ),
    };
    (code, Json(body))
}
