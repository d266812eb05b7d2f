#![allow(dead_code)]

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use opencode_bridge_gateway::config::{BackendConfig, GatewayConfig};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};

/// Replaced by the session id when a scripted frame is published.
pub const SESSION: &str = "{session}";
const CLOSE_FEED: &str = "__close_feed__";

/// What the fake server does when a message is posted.
#[derive(Clone)]
pub struct Script {
    pub reply_status: StatusCode,
    pub reply: Value,
    /// Raw SSE payloads published on `/event` before the reply is returned.
    pub frames: Vec<String>,
    pub close_feed: bool,
}

impl Script {
    pub fn reply(parts: &[&str]) -> Self {
        let parts = parts
            .iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect::<Vec<_>>();
        Self {
            reply_status: StatusCode::OK,
            reply: json!({"info": {"id": "msg_bot"}, "parts": parts, "success": true}),
            frames: Vec::new(),
            close_feed: false,
        }
    }

    pub fn failing(status: StatusCode) -> Self {
        Self {
            reply_status: status,
            reply: json!({"error": "provider exploded"}),
            frames: Vec::new(),
            close_feed: false,
        }
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    pub fn closing_feed(mut self) -> Self {
        self.close_feed = true;
        self
    }
}

pub fn assistant_updated(message_id: &str) -> String {
    json!({
        "type": "message.updated",
        "properties": {"info": {"id": message_id, "sessionID": SESSION, "role": "assistant"}}
    })
    .to_string()
}

pub fn text_part(message_id: &str, delta: &str) -> String {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {"messageID": message_id, "sessionID": SESSION, "type": "text", "text": delta},
            "delta": delta
        }
    })
    .to_string()
}

pub fn step_finish(message_id: &str) -> String {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": {"messageID": message_id, "sessionID": SESSION, "type": "step-finish", "reason": "stop"}
        }
    })
    .to_string()
}

pub fn session_idle() -> String {
    json!({"type": "session.idle", "properties": {"sessionID": SESSION}}).to_string()
}

/// Frames a real server interleaves with ours: the echoed user message,
/// another session's traffic and a frame that is not JSON.
pub fn noise() -> Vec<String> {
    vec![
        text_part("msg_user", "Hello!"),
        json!({
            "type": "message.part.updated",
            "properties": {
                "part": {"messageID": "msg_other", "sessionID": "ses_other", "type": "text"},
                "delta": "not ours"
            }
        })
        .to_string(),
        "this is not json".to_owned(),
    ]
}

/// Two deltas of an assistant reply, finished by `step-finish`.
pub fn streamed_reply() -> Vec<String> {
    let mut frames = noise();
    frames.extend([
        assistant_updated("msg_bot"),
        text_part("msg_bot", "Hello"),
        text_part("msg_bot", " there"),
        step_finish("msg_bot"),
    ]);
    frames
}

#[derive(Clone)]
struct FakeState {
    script: Arc<Script>,
    creates: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    messages: Arc<AtomicUsize>,
    events: broadcast::Sender<String>,
    last_message: Arc<parking_lot::Mutex<Option<Value>>>,
}

/// In-process stand-in for an OpenCode server on an ephemeral port.
pub struct FakeOpenCode {
    pub addr: SocketAddr,
    state: FakeState,
}

impl FakeOpenCode {
    pub async fn start(script: Script) -> Self {
        let (events, _) = broadcast::channel(256);
        let state = FakeState {
            script: Arc::new(script),
            creates: Arc::new(AtomicUsize::new(0)),
            deletes: Arc::new(AtomicUsize::new(0)),
            messages: Arc::new(AtomicUsize::new(0)),
            events,
            last_message: Arc::new(parking_lot::Mutex::new(None)),
        };

        let app = Router::new()
            .route("/session", get(list_sessions).post(create_session))
            .route("/session/:id", delete(delete_session))
            .route("/session/:id/message", post(post_message))
            .route("/event", get(event_feed))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake server");
        });

        Self { addr, state }
    }

    pub fn creates(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.state.deletes.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> usize {
        self.state.messages.load(Ordering::SeqCst)
    }

    pub fn last_message(&self) -> Option<Value> {
        self.state.last_message.lock().clone()
    }

    pub fn backend_config(&self) -> BackendConfig {
        let mut backend = GatewayConfig::default()
            .backends
            .remove("opencode")
            .expect("default opencode backend");
        backend.host = self.addr.ip().to_string();
        backend.port = self.addr.port();
        backend
    }

    /// Default gateway config pointed at this server, with one API key and
    /// periodic health checks off.
    pub fn gateway_config(&self, api_key: &str) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.backends.insert("opencode".to_owned(), self.backend_config());
        config.auth.keys = vec![api_key.to_owned()];
        config.rate_limit.enabled = false;
        config.health_check_interval_secs = 0;
        config
    }
}

async fn list_sessions() -> Json<Value> {
    Json(json!([]))
}

async fn create_session(State(state): State<FakeState>) -> Json<Value> {
    let n = state.creates.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"id": format!("ses_{n}")}))
}

async fn delete_session(State(state): State<FakeState>, Path(_id): Path<String>) -> Json<Value> {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    Json(json!(true))
}

async fn post_message(
    State(state): State<FakeState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.messages.fetch_add(1, Ordering::SeqCst);
    *state.last_message.lock() = Some(body);

    for frame in &state.script.frames {
        let _ = state.events.send(frame.replace(SESSION, &id));
    }
    if state.script.close_feed {
        let _ = state.events.send(CLOSE_FEED.to_owned());
    }

    (state.script.reply_status, Json(state.script.reply.clone())).into_response()
}

async fn event_feed(State(state): State<FakeState>) -> Response {
    let mut rx = state.events.subscribe();
    let frames = async_stream::stream! {
        yield Ok::<String, Infallible>(": connected\n\n".to_owned());
        loop {
            match rx.recv().await {
                Ok(frame) if frame == CLOSE_FEED => break,
                Ok(frame) => yield Ok(format!("data: {frame}\n\n")),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(frames))
        .expect("event feed response")
}
