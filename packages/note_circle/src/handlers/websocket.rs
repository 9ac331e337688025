use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;
use crate::ws;

/// WebSocket upgrade endpoint. Validates the Origin header before
/// upgrading, to block cross-site WebSocket hijacking.
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());

    if !origin_allowed(origin, host, state.config.server.allowed_origin.as_deref()) {
        warn!(
            origin = origin.unwrap_or("<none>"),
            "rejected websocket upgrade"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let coordinator = state.coordinator.clone();
    let hub = state.hub.clone();
    let config = state.config.clone();
    let metrics = state.metrics.clone();

    ws.max_message_size(state.config.websocket.max_message_bytes)
        .on_upgrade(move |socket| ws::serve_connection(socket, coordinator, hub, config, metrics))
}

/// An origin is accepted when it is localhost (any port), the configured
/// allowed origin, or same-host as the request.
fn origin_allowed(origin: Option<&str>, host: Option<&str>, allowed: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return false;
    };

    let is_localhost = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .is_some_and(|rest| {
            rest == "localhost"
                || rest.starts_with("localhost:")
                || rest == "127.0.0.1"
                || rest.starts_with("127.0.0.1:")
        });
    if is_localhost {
        return true;
    }

    if allowed.is_some_and(|allowed| allowed == origin) {
        return true;
    }

    // Same-origin requests: Origin matches the Host we were reached on.
    host.is_some_and(|host| {
        origin == format!("http://{host}") || origin == format!("https://{host}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_origins_are_accepted() {
        assert!(origin_allowed(Some("http://localhost:3000"), None, None));
        assert!(origin_allowed(Some("https://localhost"), None, None));
        assert!(origin_allowed(Some("http://127.0.0.1:8080"), None, None));
    }

    #[test]
    fn missing_origin_is_rejected() {
        assert!(!origin_allowed(None, Some("example.com"), None));
    }

    #[test]
    fn configured_origin_is_accepted() {
        assert!(origin_allowed(
            Some("https://circle.example.com"),
            None,
            Some("https://circle.example.com"),
        ));
        assert!(!origin_allowed(
            Some("https://evil.example.com"),
            None,
            Some("https://circle.example.com"),
        ));
    }

    #[test]
    fn same_host_origin_is_accepted() {
        assert!(origin_allowed(
            Some("https://example.com"),
            Some("example.com"),
            None,
        ));
        assert!(!origin_allowed(
            Some("https://other.com"),
            Some("example.com"),
            None,
        ));
    }
}
