//! In-process fake ComfyUI server for integration tests.
//!
//! Serves the HTTP routes and the event channel the client uses. Once a
//! prompt is posted, every open channel replays the scripted frames and
//! then waits for the client to hang up.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Prompt id the fake server assigns to every submission.
pub const PROMPT_ID: &str = "prompt-1";

/// One scripted event-channel frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// `executing` event for `node` (`None` = prompt finished).
pub fn executing(node: Option<&str>, prompt_id: &str) -> Frame {
    Frame::Text(
        json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}).to_string(),
    )
}

pub fn status(queue_remaining: u32) -> Frame {
    Frame::Text(
        json!({
            "type": "status",
            "data": {"status": {"exec_info": {"queue_remaining": queue_remaining}}}
        })
        .to_string(),
    )
}

pub fn execution_start(prompt_id: &str) -> Frame {
    Frame::Text(
        json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}).to_string(),
    )
}

pub fn progress(value: i64, max: i64, prompt_id: &str) -> Frame {
    Frame::Text(
        json!({
            "type": "progress",
            "data": {"value": value, "max": max, "prompt_id": prompt_id, "node": "5"}
        })
        .to_string(),
    )
}

pub fn execution_error(node_id: &str, message: &str) -> Frame {
    Frame::Text(
        json!({
            "type": "execution_error",
            "data": {
                "prompt_id": PROMPT_ID,
                "node_id": node_id,
                "node_type": "ReActorFaceSwap",
                "exception_message": message,
                "exception_type": "RuntimeError"
            }
        })
        .to_string(),
    )
}

/// Binary image frame: event type 1, format 2 (PNG), then the payload.
pub fn image_frame(payload: &[u8]) -> Frame {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&2u32.to_be_bytes());
    bytes.extend_from_slice(payload);
    Frame::Binary(bytes)
}

/// A small solid-colour PNG.
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// A frame sequence for a job that pushes `images` from node 9, with
/// traffic from another client's prompt interleaved.
pub fn successful_run(images: &[Vec<u8>]) -> Vec<Frame> {
    let mut frames = vec![
        status(1),
        execution_start(PROMPT_ID),
        executing(Some("2"), "other-prompt"),
        executing(Some("5"), PROMPT_ID),
        progress(1, 2, PROMPT_ID),
        progress(2, 2, PROMPT_ID),
        executing(Some("9"), PROMPT_ID),
    ];
    frames.extend(images.iter().map(|image| image_frame(image)));
    frames.push(executing(None, "other-prompt"));
    frames.push(executing(None, PROMPT_ID));
    frames
}

#[derive(Debug, Default)]
pub struct Counters {
    /// Every request that reached a route, rejected ones included.
    pub requests: AtomicUsize,
    pub uploads: AtomicUsize,
    pub prompts: AtomicUsize,
    pub ws_connections: AtomicUsize,
    pub history: AtomicUsize,
    pub views: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// One received upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub overwrite: Option<String>,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct FakeOptions {
    /// Require `Authorization: Bearer <token>` on every route.
    pub token: Option<String>,
    pub frames: Vec<Frame>,
    /// Body of `GET /history/{prompt_id}`.
    pub history: Option<Value>,
    /// Body of `GET /view`.
    pub view_image: Vec<u8>,
    /// Answer uploads of this filename with a 500.
    pub reject_upload: Option<String>,
    /// Hold every upload without answering.
    pub stall_uploads: bool,
    /// Drop the event channel right after the scripted frames.
    pub close_after_frames: bool,
}

pub struct FakeState {
    options: FakeOptions,
    prompt_posted: Notify,
    pub counters: Counters,
    pub uploads: Mutex<Vec<Upload>>,
    pub prompt_bodies: Mutex<Vec<Value>>,
    pub queue_deletes: Mutex<Vec<String>>,
}

pub struct FakeComfy {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeComfy {
    pub async fn start(options: FakeOptions) -> Self {
        let state = Arc::new(FakeState {
            options,
            prompt_posted: Notify::new(),
            counters: Counters::default(),
            uploads: Mutex::new(Vec::new()),
            prompt_bodies: Mutex::new(Vec::new()),
            queue_deletes: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(submit_prompt))
            .route("/ws", get(event_channel))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/queue", post(queue))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Plain-text server address for `--server`.
    pub fn server(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> usize {
        Counters::get(&self.state.counters.requests)
    }

    pub fn prompts(&self) -> usize {
        Counters::get(&self.state.counters.prompts)
    }

    pub fn ws_connections(&self) -> usize {
        Counters::get(&self.state.counters.ws_connections)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn prompt_bodies(&self) -> Vec<Value> {
        self.state.prompt_bodies.lock().unwrap().clone()
    }

    pub fn queue_deletes(&self) -> Vec<String> {
        self.state.queue_deletes.lock().unwrap().clone()
    }
}

fn authorized(state: &FakeState, headers: &HeaderMap) -> bool {
    let Some(token) = &state.options.token else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {token}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

async fn upload_image(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let mut filename = None;
    let mut overwrite = None;
    let mut bytes = 0;
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name() {
            Some("image") => {
                filename = field.file_name().map(str::to_string);
                bytes = field.bytes().await.unwrap().len();
            }
            Some("overwrite") => overwrite = Some(field.text().await.unwrap()),
            _ => {}
        }
    }

    let Some(filename) = filename else {
        return (StatusCode::BAD_REQUEST, "missing image").into_response();
    };
    if state.options.stall_uploads {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    if state.options.reject_upload.as_deref() == Some(filename.as_str()) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk full").into_response();
    }
    state.counters.uploads.fetch_add(1, Ordering::SeqCst);
    state.uploads.lock().unwrap().push(Upload {
        filename: filename.clone(),
        overwrite,
        bytes,
    });

    Json(json!({"name": filename, "subfolder": "", "type": "input"})).into_response()
}

async fn submit_prompt(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    state.counters.prompts.fetch_add(1, Ordering::SeqCst);
    state.prompt_bodies.lock().unwrap().push(body);
    state.prompt_posted.notify_one();

    Json(json!({"prompt_id": PROMPT_ID, "number": 0, "node_errors": {}})).into_response()
}

async fn event_channel(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    state.counters.ws_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| replay(socket, state))
}

async fn replay(mut socket: WebSocket, state: Arc<FakeState>) {
    tokio::select! {
        _ = state.prompt_posted.notified() => {}
        _ = socket.recv() => return,
    }

    for frame in &state.options.frames {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.clone().into()),
            Frame::Binary(bytes) => Message::Binary(bytes.clone().into()),
        };
        if socket.send(message).await.is_err() {
            return;
        }
    }
    if state.options.close_after_frames {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn history(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Path(prompt_id): Path<String>,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    state.counters.history.fetch_add(1, Ordering::SeqCst);

    let body = state
        .options
        .history
        .clone()
        .filter(|_| prompt_id == PROMPT_ID)
        .unwrap_or_else(|| json!({}));
    Json(body).into_response()
}

async fn view(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    state.counters.views.fetch_add(1, Ordering::SeqCst);

    if query.get("type").map(String::as_str) != Some("output") {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    }
    (
        [(CONTENT_TYPE, "image/png")],
        state.options.view_image.clone(),
    )
        .into_response()
}

async fn queue(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let deleted = body["delete"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|id| id.as_str().map(str::to_string));
    state.queue_deletes.lock().unwrap().extend(deleted);
    StatusCode::OK.into_response()
}
