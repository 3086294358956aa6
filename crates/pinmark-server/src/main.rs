//! Pinmark image server.
//!
//! Stores uploaded images with their comments and mask, and relays live
//! annotation events to everyone viewing the same image.

mod state;

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use pinmark_core::api::SUPPORTED_IMAGE_TYPES;
use pinmark_core::mask::PNG_SIGNATURE;
use pinmark_core::protocol::{ImageSnapshot, WireEvent};
use serde::Deserialize;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upload limit; images are stored whole in memory
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_ADDR: &str = "0.0.0.0:3030";

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinmark_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = match std::env::var("PINMARK_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid PINMARK_ADDR: {}", e);
            return;
        }
    };
    let public_url = std::env::var("PINMARK_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{}", addr.port()));

    let state = Arc::new(AppState::new(public_url.clone()));
    let app = router(state);

    info!("Pinmark server listening on {}", addr);
    info!("Public URL: {}", public_url);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/pic", post(create_image))
        .route("/pic/{id}", get(image_or_channel))
        .route("/pic/{id}/comments", post(post_comment))
        .route("/pic/{id}/image", get(image_bytes))
        .route("/pic/{id}/mask", get(mask_bytes))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "Pinmark image server. POST images to /pic, connect WebSocket to /pic/{id}"
}

async fn health() -> &'static str {
    "OK"
}

fn not_found(id: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No image with id {}", id))
}

/// `POST /pic`: multipart with an optional `title` and an `image` file.
async fn create_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<ImageSnapshot>> {
    let mut title = None;
    let mut upload: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("title") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                title = Some(text).filter(|t| !t.trim().is_empty());
            }
            Some("image") => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                upload = Some((content_type, bytes));
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let Some((content_type, bytes)) = upload else {
        return Err((StatusCode::BAD_REQUEST, "Missing image field".to_string()));
    };
    if !SUPPORTED_IMAGE_TYPES.contains(&content_type.as_str()) {
        return Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Unsupported image type: {}", content_type),
        ));
    }

    let snapshot = state.create_image(title, &content_type, bytes.to_vec());
    info!("Created image {} ({} bytes)", snapshot.id, bytes.len());
    Ok(Json(snapshot))
}

/// `GET /pic/{id}`: the snapshot as JSON, or the live channel on upgrade.
async fn image_or_channel(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(snapshot) = state.snapshot(&id) else {
        return not_found(&id).into_response();
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, id, state)),
        Err(_) => Json(snapshot).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CommentForm {
    message: String,
    left: f64,
    top: f64,
}

/// `POST /pic/{id}/comments`
async fn post_comment(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Form(form): Form<CommentForm>,
) -> ApiResult<Json<ImageSnapshot>> {
    if form.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty comment".to_string()));
    }
    let snapshot = state
        .add_comment(&id, form.left, form.top, form.message)
        .ok_or_else(|| not_found(&id))?;
    debug!("Comment on {} at ({}, {})", id, form.left, form.top);
    Ok(Json(snapshot))
}

async fn image_bytes(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let (content_type, bytes) = state.image(&id).ok_or_else(|| not_found(&id))?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn mask_bytes(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let bytes = state.mask(&id).ok_or_else(|| not_found(&id))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// Relay loop for one viewer: mask frames in, events out.
async fn handle_socket(socket: WebSocket, id: String, state: Arc<AppState>) {
    let Some((mut rx, snapshot)) = state.subscribe(&id) else {
        return;
    };
    let (mut sender, mut receiver) = socket.split();
    info!("Viewer joined image {}", id);

    match (WireEvent::Pic { pic: snapshot }).to_json() {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("Failed to encode snapshot for {}: {}", id, e),
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if !data.starts_with(&PNG_SIGNATURE) {
                            warn!("Rejected non-PNG mask for {} ({} bytes)", id, data.len());
                            let reply = WireEvent::Error { message: "mask must be a PNG".to_string() };
                            if let Ok(json) = reply.to_json() {
                                let _ = sender.send(Message::Text(json.into())).await;
                            }
                            continue;
                        }
                        debug!("Mask for {} ({} bytes)", id, data.len());
                        // Broadcast reaches this viewer too
                        state.set_mask(&id, data.to_vec());
                    }
                    Some(Ok(Message::Text(_))) => {
                        let reply = WireEvent::Error { message: "text frames are not accepted".to_string() };
                        if let Ok(json) = reply.to_json() {
                            let _ = sender.send(Message::Text(json.into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Viewer of {} lagged by {} events", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!("Viewer left image {}", id);
}
