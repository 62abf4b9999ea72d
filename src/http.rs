//! The control-plane HTTP surface (spec §6): the thin axum layer translating query-string
//! requests into [`Reconciler`] calls. All request-shape details (CLI argument parsing is the
//! sibling concern, §1 "out of scope") live here only as far as the wire contract in §6 demands.

use crate::config::Paths;
use crate::error::ProxyError;
use crate::reconciler::Reconciler;
use crate::service::AttrMap;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use http::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub paths: Paths,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/docker-flow-proxy/reconfigure", put(reconfigure))
        .route("/v1/docker-flow-proxy/remove", delete(remove))
        .route("/v1/docker-flow-proxy/reload", get(reload))
        .route("/v1/docker-flow-proxy/config", get(get_config))
        .route("/v1/docker-flow-proxy/certs", get(get_certs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps the error taxonomy in spec §7 onto HTTP status codes.
struct ApiError(ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProxyError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamUnreachable { .. }
            | ProxyError::TemplateNotFound { .. }
            | ProxyError::TemplateMalformed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::IOError(_) | ProxyError::ReloadFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RegistryError(_) | ProxyError::DiscovererError(_) | ProxyError::DecodeError(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        (status, self.0.to_string()).into_response()
    }
}

#[tracing::instrument(level = "debug", skip(state, params))]
async fn reconfigure(State(state): State<AppState>, Query(params): Query<AttrMap>) -> Result<StatusCode, ApiError> {
    state.reconciler.reconfigure(&params).await?;
    Ok(StatusCode::OK)
}

#[derive(serde::Deserialize)]
struct RemoveParams {
    #[serde(rename = "serviceName")]
    service_name: String,
}

#[tracing::instrument(level = "debug", skip(state))]
async fn remove(State(state): State<AppState>, Query(params): Query<RemoveParams>) -> Result<StatusCode, ApiError> {
    state.reconciler.remove_service(&params.service_name).await?;
    Ok(StatusCode::OK)
}

#[derive(serde::Deserialize, Default)]
struct ReloadParams {
    #[serde(default)]
    recreate: bool,
    #[serde(rename = "listenerAddr", default)]
    listener_addr: Option<String>,
}

/// `recreate=true` rebuilds the entire map from the discoverer sidecar (`ReloadConfig`);
/// otherwise either notifies the discoverer or pulls the registry catalog (`ReloadAll`),
/// depending on whether a `listenerAddr` was supplied (spec §4.5).
#[tracing::instrument(level = "debug", skip(state))]
async fn reload(State(state): State<AppState>, Query(params): Query<ReloadParams>) -> Result<StatusCode, ApiError> {
    if params.recreate {
        let addr = params.listener_addr.ok_or_else(|| {
            ApiError(ProxyError::InvalidInput("listenerAddr is required when recreate=true".into()))
        })?;
        state.reconciler.reload_config(&addr).await?;
    } else {
        state.reconciler.reload_all(params.listener_addr.as_deref()).await?;
    }
    Ok(StatusCode::OK)
}

#[tracing::instrument(level = "debug", skip(state))]
async fn get_config(State(state): State<AppState>) -> Result<Vec<u8>, ApiError> {
    let bytes = tokio::fs::read(state.paths.haproxy_cfg())
        .await
        .map_err(|source| ApiError(ProxyError::TemplateNotFound { path: state.paths.haproxy_cfg(), source }))?;
    Ok(bytes)
}

/// Reads whatever `*.pem` bundles are present under `<ConfigsPath>/certs`. Loading/validating
/// cert material is an out-of-scope collaborator (spec §1); this only surfaces what's on disk.
#[tracing::instrument(level = "debug", skip(state))]
async fn get_certs(State(state): State<AppState>) -> Result<Json<HashMap<String, String>>, ApiError> {
    let certs_dir = state.paths.configs_path.join("certs");
    let mut certs = HashMap::new();

    let mut entries = match tokio::fs::read_dir(&certs_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Json(certs)),
        Err(source) => return Err(ApiError(ProxyError::TemplateNotFound { path: certs_dir, source })),
    };

    while let Some(entry) = entries.next_entry().await.map_err(|source| {
        ApiError(ProxyError::TemplateNotFound { path: certs_dir.clone(), source })
    })? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|n| n.to_str()) else { continue };
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            certs.insert(name.to_string(), contents);
        }
    }
    Ok(Json(certs))
}
