mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::*;
use http_body_util::BodyExt;
use rewind_agent_connection::mock::MockConnector;
use rewind_agent_connection::ConnectOptions;
use serde_json::json;
use tower::util::ServiceExt;

#[tokio::test]
async fn health_reports_ok() {
    let test_app = TestApp::new(&fast_echo());
    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn query_streams_init_user_assistant_and_result() {
    let connector = fast_echo();
    let test_app = TestApp::new(&connector);

    let frames = query(&test_app.app, json!({ "prompt": "hello there" })).await;

    let kinds: Vec<&str> = frames.iter().map(|frame| frame.event.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"init"));
    assert_eq!(kinds.get(1), Some(&"user"));
    assert_eq!(kinds.last(), Some(&"result"));
    assert_eq!(assistant_text(&frames), "Echo: hello there");
    assert_eq!(frames[0].data["session_id"], "mock-session-1");
    assert_eq!(frames[0].data["type"], "init");
    assert_eq!(
        frames.last().map(|frame| frame.data["subtype"].clone()),
        Some(json!("success"))
    );
}

#[tokio::test]
async fn follow_up_with_last_session_id_reuses_connection() {
    let connector = fast_echo();
    let log = connector.log();
    let test_app = TestApp::new(&connector);

    let first = query(&test_app.app, json!({ "prompt": "one" })).await;
    let session_id = first[0].data["session_id"]
        .as_str()
        .expect("session id")
        .to_string();

    let second = query(
        &test_app.app,
        json!({ "prompt": "two", "last_session_id": session_id }),
    )
    .await;
    assert_eq!(second[0].data["session_id"], session_id.as_str());
    assert_eq!(assistant_text(&second), "Echo: two");

    assert_eq!(log.connects(), vec![ConnectOptions::new_session()]);
    assert_eq!(log.queries(), vec!["one".to_string(), "two".to_string()]);

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], session_id.as_str());
    assert_eq!(sessions[0]["turns"], 2);
    assert_eq!(sessions[0]["busy"], false);
}

#[tokio::test]
async fn blank_last_session_id_starts_a_new_session() {
    let connector = fast_echo();
    let log = connector.log();
    let test_app = TestApp::new(&connector);

    query(&test_app.app, json!({ "prompt": "one" })).await;
    let frames = query(
        &test_app.app,
        json!({ "prompt": "two", "last_session_id": "  " }),
    )
    .await;

    assert_eq!(frames[0].data["session_id"], "mock-session-2");
    assert_eq!(
        log.connects(),
        vec![ConnectOptions::new_session(), ConnectOptions::new_session()]
    );
}

#[tokio::test]
async fn unknown_last_session_id_resumes_that_session() {
    let connector = fast_echo();
    let log = connector.log();
    let test_app = TestApp::new(&connector);

    let frames = query(
        &test_app.app,
        json!({ "prompt": "again", "last_session_id": "earlier-session" }),
    )
    .await;

    assert_eq!(frames[0].data["session_id"], "earlier-session");
    assert_eq!(log.connects(), vec![ConnectOptions::resume("earlier-session")]);
}

#[tokio::test]
async fn empty_prompt_is_rejected_with_problem_details() {
    let test_app = TestApp::new(&fast_echo());
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/query",
        Some(json!({ "prompt": "   " })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:rewind-agent:error:invalid_request");
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn connect_failure_is_service_unavailable() {
    let connector = fast_echo().failing("agent binary missing");
    let test_app = TestApp::new(&connector);
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/query",
        Some(json!({ "prompt": "hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["type"], "urn:rewind-agent:error:connection_unavailable");
}

#[tokio::test]
async fn interrupting_unknown_session_is_not_found() {
    let test_app = TestApp::new(&fast_echo());
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/missing/interrupt",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:rewind-agent:error:session_not_found");
}

#[tokio::test]
async fn interrupting_idle_session_conflicts() {
    let test_app = TestApp::new(&fast_echo());
    let frames = query(&test_app.app, json!({ "prompt": "hi" })).await;
    let session_id = frames[0].data["session_id"].as_str().expect("session id");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/interrupt"),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "urn:rewind-agent:error:conflict");
}

#[tokio::test]
async fn interrupt_ends_stream_with_interrupted_frame() {
    let connector = MockConnector::stalling().with_word_delay(Duration::ZERO);
    let log = connector.log();
    let test_app = TestApp::new(&connector);

    let response = test_app
        .app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/v1/query",
            Some(json!({ "prompt": "long task" })),
        ))
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut buffer = String::new();
    let started =
        read_frames_until(&mut body, &mut buffer, |frame| frame.event == "assistant").await;
    assert_eq!(started[0].event, "init");
    let session_id = started[0].data["session_id"]
        .as_str()
        .expect("session id")
        .to_string();

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/interrupt"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let rest = read_frames_until(&mut body, &mut buffer, |_| false).await;
    let last = rest.last().expect("closing frame");
    assert_eq!(last.event, "interrupted");
    assert_eq!(last.data["type"], "urn:rewind-agent:error:stream_interrupted");
    assert_eq!(log.interrupt_count(), 1);

    // Interrupted turns are not recorded.
    let (_, sessions) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(sessions["sessions"][0]["turns"], 0);
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let connector = fast_echo();
    let log = connector.log();
    let test_app = TestApp::new(&connector);

    query(&test_app.app, json!({ "prompt": "one" })).await;
    query(&test_app.app, json!({ "prompt": "two" })).await;

    rewind_agent::router::shutdown_sessions(&test_app.state).await;

    assert_eq!(log.close_count(), 2);
    let (_, body) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(body["sessions"], json!([]));
}

#[tokio::test]
async fn openapi_lists_routes() {
    let test_app = TestApp::new(&fast_echo());
    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);

    let paths = body["paths"].as_object().expect("paths");
    assert!(paths.contains_key("/v1/query"));
    assert!(paths.contains_key("/v1/sessions/{session_id}/interrupt"));
}

#[tokio::test]
async fn malformed_body_is_client_error() {
    let test_app = TestApp::new(&fast_echo());
    let response = test_app
        .app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/v1/query",
            Some(json!({ "message": "no prompt field" })),
        ))
        .await
        .expect("request handled");
    assert!(response.status().is_client_error());
    let _ = response.into_body().collect().await;
}
