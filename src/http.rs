//! HTTP control surface: trigger an immediate cycle, expose metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::actions::ActionEngine;
use crate::config::Settings;
use crate::engine::EngineClient;
use crate::Trigger;

struct AppState<E: EngineClient> {
    engine: Arc<ActionEngine<E>>,
    trigger_tx: Sender<Trigger>,
    token: Option<String>,
    metrics_enabled: bool,
}

pub async fn serve<E: EngineClient>(
    engine: Arc<ActionEngine<E>>,
    settings: Arc<Settings>,
    trigger_tx: Sender<Trigger>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        engine,
        trigger_tx,
        token: settings.http_api_token.clone(),
        metrics_enabled: settings.http_api_metrics,
    });

    let app = Router::new()
        .route("/v1/update", post(trigger_update))
        .route("/v1/metrics", get(render_metrics))
        .with_state(state);

    let addr = format!("{}:{}", settings.http_api_host, settings.http_api_port);
    log::info!("Starting HTTP API on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await.map_err(Into::into)
}

/// `POST /v1/update`: queue a cycle. A trigger received while a cycle is
/// already queued coalesces into it.
async fn trigger_update<E: EngineClient>(
    State(state): State<Arc<AppState<E>>>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(state.token.as_deref(), &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.trigger_tx.try_send(Trigger::Http) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(TrySendError::Full(_)) => {
            log::debug!("Cycle already queued; coalescing HTTP trigger");
            StatusCode::NO_CONTENT
        }
        Err(TrySendError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// `GET /v1/metrics`: Prometheus text format, when enabled.
async fn render_metrics<E: EngineClient>(
    State(state): State<Arc<AppState<E>>>,
    headers: HeaderMap,
) -> Result<([(header::HeaderName, &'static str); 1], String), StatusCode> {
    if !authorized(state.token.as_deref(), &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if !state.metrics_enabled {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics.render(),
    ))
}

fn authorized(token: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(token) = token else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {token}"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_no_token_configured_allows_everything() {
        assert!(authorized(None, &headers_with(None)));
        assert!(authorized(None, &headers_with(Some("Bearer whatever"))));
    }

    #[test]
    fn test_token_requires_matching_bearer_header() {
        assert!(authorized(
            Some("s3cret"),
            &headers_with(Some("Bearer s3cret"))
        ));
        assert!(!authorized(Some("s3cret"), &headers_with(None)));
        assert!(!authorized(
            Some("s3cret"),
            &headers_with(Some("Bearer wrong"))
        ));
        assert!(!authorized(Some("s3cret"), &headers_with(Some("s3cret"))));
    }
}
