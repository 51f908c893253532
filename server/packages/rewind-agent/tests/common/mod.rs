#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use rewind_agent::router::{build_router_with_state, AppState};
use rewind_agent_connection::mock::MockConnector;
use serde_json::Value;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn new(connector: &MockConnector) -> Self {
        let (app, state) = build_router_with_state(Arc::new(AppState::new(Arc::new(
            connector.clone(),
        ))));
        Self { app, state }
    }
}

#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

pub fn fast_echo() -> MockConnector {
    MockConnector::echo().with_word_delay(Duration::ZERO)
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, bytes) = send_raw(app, method, path, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn send_raw(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Bytes) {
    let request = json_request(method, path, body);
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, bytes)
}

pub fn json_request(method: Method, path: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    builder.body(body).expect("request")
}

/// Runs a query to completion and returns its frames.
pub async fn query(app: &Router, body: Value) -> Vec<SseFrame> {
    let (status, bytes) = send_raw(app, Method::POST, "/v1/query", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "query status");
    parse_sse(&String::from_utf8_lossy(&bytes))
}

pub fn parse_sse(text: &str) -> Vec<SseFrame> {
    text.split("\n\n").filter_map(parse_frame).collect()
}

fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = String::new();
    for line in block.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(chunk) = line.strip_prefix("data:") {
            data.push_str(chunk.trim_start());
        }
    }
    Some(SseFrame {
        event: event?,
        data: serde_json::from_str(&data).ok()?,
    })
}

/// Reads frames from a live SSE body until `stop` matches or the body ends.
pub async fn read_frames_until(
    body: &mut (impl futures::Stream<Item = Result<Bytes, axum::Error>> + Unpin),
    buffer: &mut String,
    stop: impl Fn(&SseFrame) -> bool,
) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    loop {
        while let Some(end) = buffer.find("\n\n") {
            let block = buffer[..end].to_string();
            buffer.drain(..end + 2);
            if let Some(frame) = parse_frame(&block) {
                let done = stop(&frame);
                frames.push(frame);
                if done {
                    return frames;
                }
            }
        }
        let next = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("sse frame in time");
        match next {
            Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
            _ => return frames,
        }
    }
}

pub fn assistant_text(frames: &[SseFrame]) -> String {
    frames
        .iter()
        .filter(|frame| frame.event == "assistant")
        .flat_map(|frame| {
            frame.data["content"]
                .as_array()
                .cloned()
                .unwrap_or_default()
        })
        .filter_map(|block| block["text"].as_str().map(str::to_string))
        .collect()
}
