//! HTTP surface: `POST /download` plus the static front-end.
//!
//! A download runs validate -> resolve -> probe -> sanitize -> stream. The
//! probe process is always reaped before the stream process is spawned, and
//! every failure that happens before the first media byte is answered with a
//! JSON error. Requests share nothing except the immutable [`AppState`].

use std::{path::PathBuf, sync::Arc};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, header},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use tracing::{Instrument, info, info_span, warn};

use crate::{
    config::RuntimeConfig,
    error::{ClassifiedError, ErrorKind},
    format,
    probe,
    process::ToolCommand,
    rate_limit::{self, RateLimiter},
    relay::MediaRelay,
    request::RetrievalRequest,
    sanitize::sanitize_title,
    static_files,
};

#[derive(Clone)]
pub struct AppState {
    pub tool: Arc<ToolCommand>,
    pub public_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            tool: Arc::new(ToolCommand::new(config.tool.clone())),
            public_dir: Arc::new(config.public_dir.clone()),
        }
    }
}

/// Full application router for `config`, rate limiting included when enabled.
pub fn router(config: &RuntimeConfig) -> Router {
    let limiter = config
        .rate_limit
        .enabled
        .then(|| Arc::new(RateLimiter::new(&config.rate_limit)));
    router_with_state(AppState::new(config), limiter)
}

pub fn router_with_state(state: AppState, limiter: Option<Arc<RateLimiter>>) -> Router {
    let app = Router::new()
        .route("/download", post(download))
        .fallback(static_files::serve)
        .with_state(state);

    match limiter {
        Some(limiter) => app.layer(middleware::from_fn_with_state(limiter, rate_limit::enforce)),
        None => app,
    }
}

async fn download(State(state): State<AppState>, body: Bytes) -> Response {
    match handle_download(&state, &body).await {
        Ok(response) => response,
        Err(err) => {
            if err.status().is_client_error() {
                info!(kind = ?err.kind, "rejected download request: {}", err);
            } else {
                warn!(
                    kind = ?err.kind,
                    retry = ?err.kind.retry_hint(),
                    "download failed: {}",
                    err
                );
            }
            err.into_response()
        }
    }
}

async fn handle_download(state: &AppState, body: &[u8]) -> Result<Response, ClassifiedError> {
    let request = RetrievalRequest::from_body(body)?;
    let span = info_span!(
        "download",
        url = %request.source_url,
        format = request.container.tag(),
        quality = %request.quality,
    );
    run_download(state, request).instrument(span).await
}

async fn run_download(
    state: &AppState,
    request: RetrievalRequest,
) -> Result<Response, ClassifiedError> {
    let spec = format::resolve(request.container, &request.quality);

    let metadata = probe::probe(&state.tool, &request.source_url).await?;
    let title = sanitize_title(&metadata.title);
    info!(%title, "probe complete; starting stream");

    // Both header values are fixed before the stream process exists.
    let content_type = HeaderValue::from_static(spec.content_type);
    let disposition = HeaderValue::from_str(&spec.content_disposition(&title)).map_err(|err| {
        ClassifiedError::new(
            ErrorKind::StreamLaunchFailed,
            format!("Could not build download headers: {err}"),
        )
    })?;

    let mut relay = MediaRelay::new(&request.source_url);
    relay.launch(&state.tool, &spec)?;
    relay.prime().await?;
    debug_assert!(relay.state().headers_committed());

    let mut response = Body::from_stream(relay.into_stream()).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}
