//! HTTP binding of the gateway router
//!
//! `POST` carries calls, `GET` opens (or resumes) the session's event stream,
//! `DELETE` terminates the session. Both `/` and `/mcp` are served.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures_util::Stream;
use nimbus_gateway::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, LAST_EVENT_ID_HEADER, METHOD_NOT_FOUND, PARSE_ERROR,
    SESSION_ID_HEADER, SESSION_NOT_FOUND,
};
use nimbus_gateway::{
    Delivery, EventStream, GatewayError, ResponseEnvelope, Routed, Router, StreamItem,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

type AppState = Arc<Router>;

/// Build the axum application
pub fn app(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .route("/", get(handle_get).post(handle_post).delete(handle_delete))
        .route(
            "/mcp",
            get(handle_get).post(handle_post).delete(handle_delete),
        )
        .route("/debug", get(handle_debug))
        .layer(CorsLayer::permissive())
        .with_state(router)
}

/// Serve until `shutdown` fires. Open sessions are closed first so live
/// event streams end and connections can drain.
pub async fn serve(router: Arc<Router>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("nimbus listening on http://{}", listener.local_addr()?);

    let registry = router.registry().clone();
    axum::serve(listener, app(router))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutting down; closing open sessions");
            registry.shutdown_all().await;
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn status_for_code(code: i64) -> StatusCode {
    match code {
        PARSE_ERROR | INVALID_REQUEST | INVALID_PARAMS => StatusCode::BAD_REQUEST,
        METHOD_NOT_FOUND | SESSION_NOT_FOUND => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn status_for(envelope: &ResponseEnvelope) -> StatusCode {
    envelope
        .error()
        .map(|e| status_for_code(e.code))
        .unwrap_or(StatusCode::OK)
}

fn with_session(mut response: Response, session_id: Option<&str>) -> Response {
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn respond(routed: Routed) -> Response {
    let response = match routed.delivery {
        Delivery::Reply(envelope) => (status_for(&envelope), Json(envelope)).into_response(),
        Delivery::Accepted => StatusCode::ACCEPTED.into_response(),
        Delivery::Stream(stream) => sse(stream).into_response(),
    };
    with_session(response, routed.session_id.as_deref())
}

fn sse(stream: EventStream) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(session_id = %stream.session_id(), "Streaming events over SSE");
    let events = futures_util::stream::unfold(stream, |mut stream| async move {
        let event = match stream.next().await? {
            StreamItem::Event(event) => SseEvent::default()
                .id(event.sequence.to_string())
                .data(event.payload.to_string()),
            StreamItem::Error(error) => SseEvent::default()
                .event("error")
                .data(json!({ "code": error.code, "message": error.message }).to_string()),
        };
        Some((Ok::<_, Infallible>(event), stream))
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn handle_post(State(router): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let session = session_header(&headers);
    respond(router.route_bytes(&body, session.as_deref()).await)
}

async fn handle_get(State(router): State<AppState>, headers: HeaderMap) -> Response {
    let session = session_header(&headers);
    match router.subscribe(session.as_deref(), last_event_id(&headers)).await {
        Ok(Routed {
            session_id,
            delivery: Delivery::Reply(envelope),
        }) => {
            // Probe: catalogue plus the minted id, for clients that cannot read headers
            let mut body = envelope.to_value();
            body["status"] = json!("success");
            body["message"] = json!("Probe session created");
            body["sessionId"] = json!(session_id);
            with_session(Json(body).into_response(), session_id.as_deref())
        }
        Ok(routed) => respond(routed),
        Err(e) => {
            let envelope = ResponseEnvelope::err(None, &e);
            (status_for(&envelope), Json(envelope)).into_response()
        }
    }
}

async fn handle_delete(State(router): State<AppState>, headers: HeaderMap) -> Response {
    let session = session_header(&headers);
    match router.terminate(session.as_deref()).await {
        Ok(state) => with_session(
            Json(json!({ "status": "ok", "state": state })).into_response(),
            session.as_deref(),
        ),
        Err(GatewayError::SessionNotFound(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "Invalid or missing session ID"
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_debug(State(router): State<AppState>) -> Response {
    Json(router.introspect().await).into_response()
}
