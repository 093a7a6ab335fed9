//! Main axum router and HTTP request handlers for the ref-pinning proxy.
//!
//! Routes:
//! - `*    /health-check`                         - Liveness probe
//! - `GET  /metrics`                              - Prometheus metrics
//! - `*    /{owner}/{name}:{ref}/info/refs`       - Rewritten reference advertisement
//! - `*    /{owner}/{name}:{ref}/git-upload-pack` - Pack negotiation relay
//! - anything else                                - Placeholder or 404

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use futures_util::TryStreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{Endpoint, Outcome, Route};
use crate::refs::{self, RewriteError};
use crate::repo::RepoId;
use crate::upstream::{forwardable_headers, UpstreamError};
use crate::AppState;

const PLACEHOLDER: &str =
    "Use your creativity and build in your mind an elegant web page in this blank space.";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health-check", any(handle_health))
        .route("/metrics", get(handle_metrics))
        // Repository paths contain a `:` inside a segment, so they are
        // matched by hand rather than with route patterns.
        .fallback(dispatch)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_health() -> &'static str {
    "ok"
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

/// Entry point for every path that is not a fixed route.
async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(%remote, method = %req.method(), uri = %req.uri(), "request");

    let metrics = &state.metrics.metrics;
    let path = req.uri().path();
    if path == "/" {
        metrics.record_request(Route::Placeholder, Outcome::Ok);
        return placeholder();
    }

    let Some(repo) = RepoId::parse(path) else {
        metrics.record_request(Route::Unsupported, Outcome::UnsupportedUrl);
        return AppError::UnsupportedUrl.into_response();
    };

    let (route, result) = match repo.subpath.as_str() {
        "/info/refs" => (Route::InfoRefs, handle_info_refs(&state, &repo).await),
        "/git-upload-pack" => (
            Route::UploadPack,
            handle_upload_pack(&state, &repo, req).await,
        ),
        _ => (Route::Placeholder, Ok(placeholder())),
    };

    let outcome = match &result {
        Ok(_) => Outcome::Ok,
        Err(err) => err.outcome(),
    };
    metrics.record_request(route, outcome);
    result.into_response()
}

fn placeholder() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        PLACEHOLDER,
    )
        .into_response()
}

/// `/{owner}/{name}:{ref}/info/refs`
///
/// Serves the upstream advertisement with `HEAD` and `master` pinned to the
/// requested ref.
#[instrument(skip(state), fields(repo = %repo))]
async fn handle_info_refs(state: &AppState, repo: &RepoId) -> Result<Response, AppError> {
    let advertisement = resolve_refs(state, repo).await?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-advertisement",
        )],
        advertisement,
    )
        .into_response())
}

/// `/{owner}/{name}:{ref}/git-upload-pack`
///
/// Confirms the ref still resolves, then streams the negotiation to upstream
/// and the pack back to the client without buffering either side.
#[instrument(skip(state, req), fields(repo = %repo))]
async fn handle_upload_pack(
    state: &AppState,
    repo: &RepoId,
    req: Request,
) -> Result<Response, AppError> {
    resolve_refs(state, repo).await?;

    let (parts, body) = req.into_parts();
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    let started = Instant::now();
    let relayed = state.upstream.upload_pack(repo, &parts.headers, body).await;
    state.metrics.metrics.observe_upstream(
        Endpoint::UploadPack,
        started.elapsed().as_secs_f64(),
        relayed.is_err(),
    );
    let upstream_resp = relayed.map_err(|err| match err {
        UpstreamError::NotFound => AppError::RepoNotFound {
            url: state.upstream.repo_url(repo),
        },
        other => AppError::BadGateway(format!("Cannot obtain upload pack from upstream: {other}")),
    })?;

    let headers = forwardable_headers(upstream_resp.headers());
    debug!(
        content_length = ?upstream_resp.content_length(),
        "streaming upload-pack response"
    );

    let metrics = Arc::clone(&state.metrics.metrics);
    let stream = upstream_resp
        .bytes_stream()
        .inspect_ok(move |chunk| {
            metrics.relayed_bytes_total.inc_by(chunk.len() as u64);
        });

    let mut response = Response::new(Body::from_stream(stream));
    *response.headers_mut() = headers;
    Ok(response)
}

/// Fetch and rewrite the advertisement for `repo`, classifying failures.
async fn resolve_refs(state: &AppState, repo: &RepoId) -> Result<Vec<u8>, AppError> {
    let started = Instant::now();
    let fetched = state.upstream.fetch_refs(repo).await;
    state.metrics.metrics.observe_upstream(
        Endpoint::InfoRefs,
        started.elapsed().as_secs_f64(),
        fetched.is_err(),
    );

    let advertisement = fetched.map_err(|err| match err {
        UpstreamError::NotFound => AppError::RepoNotFound {
            url: state.upstream.repo_url(repo),
        },
        other => AppError::BadGateway(format!("Cannot obtain refs from upstream: {other}")),
    })?;

    refs::rewrite_advertisement(&advertisement, &repo.git_ref).map_err(|err| match err {
        RewriteError::RefNotFound => AppError::RefNotFound {
            url: state.upstream.repo_url(repo),
            git_ref: repo.git_ref.clone(),
        },
        RewriteError::Malformed(e) => {
            AppError::BadGateway(format!("Cannot obtain refs from upstream: {e}"))
        }
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The path does not name a repository and ref.
    UnsupportedUrl,
    /// Upstream does not know the repository (or refuses to show it).
    RepoNotFound { url: String },
    /// The repository exists but has no such branch or tag.
    RefNotFound { url: String, git_ref: String },
    /// Upstream failed or sent something unparseable.
    BadGateway(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    fn outcome(&self) -> Outcome {
        match self {
            AppError::UnsupportedUrl => Outcome::UnsupportedUrl,
            AppError::RepoNotFound { .. } => Outcome::RepoNotFound,
            AppError::RefNotFound { .. } => Outcome::RefNotFound,
            AppError::BadGateway(_) | AppError::Internal(_) => Outcome::BadGateway,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::UnsupportedUrl => {
                (StatusCode::NOT_FOUND, "Unsupported URL pattern.").into_response()
            }
            AppError::RepoNotFound { url } => {
                warn!(%url, "upstream repository not found");
                (
                    StatusCode::NOT_FOUND,
                    format!("Repository not found at {url}"),
                )
                    .into_response()
            }
            AppError::RefNotFound { url, git_ref } => {
                warn!(%url, %git_ref, "ref not found upstream");
                (
                    StatusCode::NOT_FOUND,
                    format!("Repository at {url} has no branch or tag \"{git_ref}\""),
                )
                    .into_response()
            }
            AppError::BadGateway(msg) => {
                warn!(error = %msg, "upstream failure");
                (StatusCode::BAD_GATEWAY, msg).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
