//! Chat dispatch against a wiremock gateway: header construction, model
//! rewriting, retry behaviour and stream normalization.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio_stream::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portkey_pipe::{ChatRequest, Config, Pipe, PipeError, PipeOutput, StreamFormat, UserInfo};

fn config_for(server: &MockServer) -> Config {
    Config {
        api_key: "pk-test".into(),
        base_url: format!("{}/v1", server.uri()),
        auto_discover_models: false,
        retries_non_stream: 3,
        retry_backoff_factor: 0.0,
        request_timeout_secs: 10,
        ..Config::default()
    }
}

fn completion() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "hello there" },
            "finish_reason": "stop"
        }]
    })
}

fn chat(model: &str, stream: bool) -> ChatRequest {
    ChatRequest::new(model)
        .with_stream(stream)
        .with_field("messages", json!([{ "role": "user", "content": "hi" }]))
        .with_field("temperature", json!(0.3))
}

async fn collect_lines(output: PipeOutput) -> Vec<String> {
    output
        .into_stream()
        .expect("expected a stream")
        .map(|r| r.expect("stream item"))
        .collect()
        .await
}

#[tokio::test]
async fn non_streaming_rewrites_model_and_sends_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer pk-test"))
        .and(header("content-type", "application/json"))
        .and(header("x-portkey-metadata", r#"{"email":"ada@example.com"}"#))
        .and(body_partial_json(json!({
            "model": "@openai-slug/gpt-4o",
            "stream": false,
            "temperature": 0.3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let user = UserInfo {
        email: Some("ada@example.com".into()),
        ..UserInfo::default()
    };
    let out = pipe
        .pipe(chat("portkey_manifold_pipe.@openai-slug/gpt-4o", false), Some(&user))
        .await
        .unwrap();

    let body = out.into_json().expect("expected JSON");
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");
}

#[tokio::test]
async fn forwarded_identity_headers_reach_gateway() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .mount(&server)
        .await;

    let cfg = Config {
        forward_user_info_headers: true,
        send_metadata_header: false,
        ..config_for(&server)
    };
    let pipe = Pipe::new(cfg).unwrap();
    let user = UserInfo {
        name: Some("Ada".into()),
        chat_id: Some("chat-7".into()),
        ..UserInfo::default()
    };
    pipe.pipe(chat("gpt-4o", false), Some(&user)).await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let h = &received[0].headers;
    assert_eq!(h.get("x-openwebui-user-name").unwrap(), "Ada");
    assert_eq!(h.get("x-openwebui-chat-id").unwrap(), "chat-7");
    assert!(h.get("x-openwebui-user-email").is_none());
    assert!(h.get("x-portkey-metadata").is_none());
}

#[tokio::test]
async fn non_streaming_retries_503_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let out = pipe.pipe(chat("gpt-4o", false), None).await.unwrap();
    assert!(out.into_json().is_some());
}

#[tokio::test]
async fn non_streaming_exhausted_retries_report_last_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": { "message": "upstream overloaded", "type": "server_error", "request_id": "req-9" }
        })))
        .expect(4)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let err = pipe.pipe(chat("gpt-4o", false), None).await.unwrap_err();
    assert_eq!(err.http_status(), Some(503));
    assert_eq!(
        err.to_string(),
        "Portkey HTTP 503 — upstream overloaded | type=server_error | request_id=req-9"
    );
}

#[tokio::test]
async fn retry_after_on_429_delays_the_retry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let started = Instant::now();
    let out = pipe.pipe(chat("gpt-4o", false), None).await.unwrap();
    assert!(out.into_json().is_some());
    assert!(
        started.elapsed() >= Duration::from_millis(950),
        "retry came after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn retry_after_on_500_is_ignored() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).insert_header("retry-after", "30"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let started = Instant::now();
    pipe.pipe(chat("gpt-4o", false), None).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "retry waited {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn non_ascii_metadata_is_escaped_on_the_wire() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let user = UserInfo {
        name: Some("José".into()),
        email: Some("josé@example.com".into()),
        ..UserInfo::default()
    };
    pipe.pipe(chat("gpt-4o", false), Some(&user)).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let meta = received[0].headers.get("x-portkey-metadata").unwrap();
    assert_eq!(
        meta.as_bytes(),
        br#"{"name":"Jos\u00e9","email":"jos\u00e9@example.com"}"#
    );
}

#[tokio::test]
async fn non_streaming_client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request body"))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let err = pipe.pipe(chat("gpt-4o", false), None).await.unwrap_err();
    assert_eq!(err.to_string(), "Portkey HTTP 400 — bad request body");
}

#[tokio::test]
async fn streaming_503_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let err = pipe.pipe(chat("gpt-4o", true), None).await.unwrap_err();
    assert!(matches!(err, PipeError::Http { status: 503, .. }));
}

#[tokio::test]
async fn stream_defaults_to_true_and_normalizes_jsonl() {
    let server = MockServer::start().await;

    let sse_body = [
        r#"data: {"choices": [{"delta": {"content": "Hel"}}]}"#,
        "",
        ": keep-alive",
        "",
        r#"data: {"choices": [{"delta": {"content": "lo"}}]}"#,
        "",
        "data: [DONE]",
        "",
    ]
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let cfg = Config {
        stream_format: StreamFormat::Jsonl,
        ..config_for(&server)
    };
    let pipe = Pipe::new(cfg).unwrap();
    let request = ChatRequest::new("gpt-4o")
        .with_field("messages", json!([{ "role": "user", "content": "hi" }]));
    let lines = collect_lines(pipe.pipe(request, None).await.unwrap()).await;

    assert_eq!(
        lines,
        vec![
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            ": keep-alive",
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ]
    );

    let received = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(sent.get("stream").is_none(), "absent stream flag is forwarded as absent");
}

#[tokio::test]
async fn sse_format_passes_lines_through() {
    let server = MockServer::start().await;

    let sse_body = "event: message\ndata: {\"a\": 1}\n\ndata: [DONE]\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body))
        .mount(&server)
        .await;

    let cfg = Config {
        stream_format: StreamFormat::Sse,
        ..config_for(&server)
    };
    let pipe = Pipe::new(cfg).unwrap();
    let lines = collect_lines(pipe.pipe(chat("gpt-4o", true), None).await.unwrap()).await;

    assert_eq!(
        lines,
        vec!["event: message", "data: {\"a\": 1}", "data: [DONE]"]
    );
}

#[tokio::test]
async fn missing_api_key_makes_no_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(0)
        .mount(&server)
        .await;

    let cfg = Config {
        api_key: String::new(),
        ..config_for(&server)
    };
    let pipe = Pipe::new(cfg).unwrap();
    let err = pipe.pipe(chat("gpt-4o", false), None).await.unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn untyped_host_payload_is_accepted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "model": "vendor.model", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(1)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let body = json!({ "model": "pipe.vendor.model", "stream": false, "messages": [] });
    let user = json!({ "id": 17, "role": "user", "valves": {} });
    let out = pipe.pipe_value(body, Some(&user)).await.unwrap();
    assert!(out.into_json().is_some());

    let received = server.received_requests().await.unwrap();
    let meta = received[0].headers.get("x-portkey-metadata").unwrap();
    assert_eq!(meta.to_str().unwrap(), r#"{"id":17,"role":"user"}"#);
}

#[tokio::test]
async fn invalid_json_success_body_is_decode_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let err = pipe.pipe(chat("gpt-4o", false), None).await.unwrap_err();
    assert!(matches!(err, PipeError::Decode(_)));
}

#[tokio::test]
async fn concurrent_dispatches_share_one_pipe() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(8)
        .mount(&server)
        .await;

    let pipe = Pipe::new(config_for(&server)).unwrap();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipe = pipe.clone();
        handles.push(tokio::spawn(async move {
            pipe.pipe(chat("gpt-4o", false), None).await.map(|o| o.into_json())
        }));
    }
    for h in handles {
        assert!(h.await.unwrap().unwrap().is_some());
    }
}
