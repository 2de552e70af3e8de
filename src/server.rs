//! HTTP surface: request validation and status mapping in front of the
//! [`Resolver`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::error;
use crate::error::ProxyError;
use crate::resolver::{CacheStats, Resolution, Resolver};
use crate::upstream::{CacheKey, Fetcher};

pub const SUPPORTED_MODULES: &[&str] = &["contract"];
pub const SUPPORTED_ACTIONS: &[&str] = &["getsourcecode", "getabi"];

pub struct AppState<F> {
    resolver: Arc<Resolver<F>>,
    explorers: Arc<HashSet<String>>,
}

impl<F> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            explorers: self.explorers.clone(),
        }
    }
}

impl<F: Fetcher> AppState<F> {
    pub fn new(resolver: Arc<Resolver<F>>, explorers: impl IntoIterator<Item = String>) -> Self {
        Self {
            resolver,
            explorers: Arc::new(explorers.into_iter().collect()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiQuery {
    pub module: String,
    pub action: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateQuery {
    pub address: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Proxy(ProxyError),
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        ApiError::Proxy(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.to_string()),
            ApiError::Proxy(ProxyError::Upstream(e)) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ApiError::Proxy(e) => {
                error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router<F: Fetcher + 'static>(state: AppState<F>) -> Router {
    Router::new()
        .route("/{explorer}/api", get(cached_api::<F>).delete(invalidate::<F>))
        .route("/stats", get(cache_stats::<F>))
        .with_state(state)
}

/// EIP-55 form of a 20-byte hex address, with or without `0x`.
pub fn checksum_address(raw: &str) -> Option<String> {
    raw.trim().parse::<Address>().ok().map(|address| to_checksum(&address, None))
}

fn check_explorer<F>(state: &AppState<F>, explorer: &str) -> Result<(), ApiError> {
    if state.explorers.contains(explorer) {
        Ok(())
    } else {
        Err(ApiError::BadRequest("explorer not supported"))
    }
}

async fn cached_api<F: Fetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(explorer): Path<String>,
    Query(query): Query<ApiQuery>,
) -> Result<Response, ApiError> {
    check_explorer(&state, &explorer)?;
    if !SUPPORTED_MODULES.contains(&query.module.as_str()) {
        return Err(ApiError::BadRequest("module not supported"));
    }
    if !SUPPORTED_ACTIONS.contains(&query.action.as_str()) {
        return Err(ApiError::BadRequest("action not supported"));
    }
    let address = checksum_address(&query.address).ok_or(ApiError::BadRequest("invalid address"))?;

    let key = CacheKey::new(explorer, query.module, query.action, address);
    let response = match state.resolver.resolve(&key).await? {
        Resolution::Good(value) => (StatusCode::OK, Json(value)).into_response(),
        Resolution::NotVerified(value) => (StatusCode::NOT_FOUND, Json(value)).into_response(),
    };
    Ok(response)
}

async fn invalidate<F: Fetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(explorer): Path<String>,
    Query(query): Query<InvalidateQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_explorer(&state, &explorer)?;
    let address = checksum_address(&query.address).ok_or(ApiError::BadRequest("invalid address"))?;
    let deleted = state.resolver.invalidate(&explorer, &address).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn cache_stats<F: Fetcher + 'static>(
    State(state): State<AppState<F>>,
) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.resolver.stats()?))
}
