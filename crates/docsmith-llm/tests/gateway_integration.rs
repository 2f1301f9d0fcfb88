//! End-to-end tests: the gateway driving the real HTTP backends against
//! local wiremock servers.

use docsmith_core::{GatewayError, Role, TokenUsage};
use docsmith_llm::{CallOptions, Gateway, GatewaySettings, StreamCallbacks};
use docsmith_session::Conversation;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// OpenAI primary with an Anthropic fallback, both pointed at `server`.
fn settings(server: &MockServer, max_attempts: u32, timeout_ms: u64) -> GatewaySettings {
    settings_for(&server.uri(), max_attempts, timeout_ms)
}

fn settings_for(uri: &str, max_attempts: u32, timeout_ms: u64) -> GatewaySettings {
    let toml = format!(
        r#"
        [gateway]
        primary_provider = "openai"
        fallback_providers = ["anthropic"]

        [gateway.retry_policy]
        max_attempts = {max_attempts}
        backoff_base_ms = 0
        backoff_max_ms = 0

        [[providers]]
        id = "openai"
        kind = "openai"
        credential = "sk-openai"
        model = "gpt-4o-mini"
        timeout_ms = {timeout_ms}
        api_base_url = "{uri}"

        [[providers]]
        id = "anthropic"
        kind = "anthropic"
        credential = "sk-anthropic"
        model = "claude-3-5-haiku-latest"
        timeout_ms = {timeout_ms}
        api_base_url = "{uri}"
        "#
    );
    GatewaySettings::from_toml_str(&toml).unwrap()
}

fn openai_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
    }))
}

fn anthropic_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "content": [{"type": "text", "text": content}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 20, "output_tokens": 6}
    }))
}

fn sse(events: &[serde_json::Value], done_marker: bool) -> ResponseTemplate {
    let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    if done_marker {
        body.push_str("data: [DONE]\n\n");
    }
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

#[derive(Default)]
struct Observed {
    chunks: Vec<String>,
    content: Option<String>,
    usage: Option<TokenUsage>,
    errors: Vec<String>,
}

fn observe() -> (StreamCallbacks, Arc<Mutex<Observed>>) {
    let observed = Arc::new(Mutex::new(Observed::default()));
    let (a, b, c) = (observed.clone(), observed.clone(), observed.clone());
    let callbacks = StreamCallbacks::new()
        .on_chunk(move |t| a.lock().unwrap().chunks.push(t.to_string()))
        .on_complete(move |done| {
            let mut o = b.lock().unwrap();
            o.content = Some(done.content);
            o.usage = Some(done.usage);
        })
        .on_error(move |e| c.lock().unwrap().errors.push(e.to_string()));
    (callbacks, observed)
}

#[tokio::test]
async fn test_openai_call_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-openai"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(openai_reply("Generated overview."))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 3, 5_000)).unwrap();
    let completion = gateway
        .call("Write an overview", false, CallOptions::default())
        .await
        .unwrap();

    assert_eq!(completion.content, "Generated overview.");
    assert_eq!(completion.provider, "openai");
    assert_eq!(completion.usage, TokenUsage::new(12, 4));
}

#[tokio::test]
async fn test_rate_limit_is_retried_on_same_provider() {
    let server = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |_req: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).set_body_string("slow down")
            } else {
                openai_reply("after retry")
            }
        })
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 3, 5_000)).unwrap();
    let completion = gateway.call("q", false, CallOptions::default()).await.unwrap();

    assert_eq!(completion.content, "after retry");
    assert_eq!(completion.provider, "openai");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bad_credential_falls_back_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-anthropic"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(anthropic_reply("from fallback"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 3, 5_000)).unwrap();
    let completion = gateway.call("q", false, CallOptions::default()).await.unwrap();

    assert_eq!(completion.content, "from fallback");
    assert_eq!(completion.provider, "anthropic");
    assert_eq!(completion.usage, TokenUsage::new(20, 6));
}

#[tokio::test]
async fn test_exhaustion_carries_per_provider_reasons() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 2, 5_000)).unwrap();
    let err = gateway.call("q", true, CallOptions::default()).await.unwrap_err();

    assert!(err.is_enhancement_unavailable());
    let failures = match err {
        GatewayError::AllProvidersExhausted { failures } => failures,
        other => panic!("expected exhaustion, got {other:?}"),
    };
    assert_eq!(failures.len(), 2);
    assert_eq!((failures[0].provider.as_str(), failures[0].attempts), ("openai", 2));
    assert!(failures[0].reason.contains("503"));
    assert_eq!((failures[1].provider.as_str(), failures[1].attempts), ("anthropic", 1));
    assert!(failures[1].reason.contains("400"));
}

#[tokio::test]
async fn test_slow_provider_times_out_per_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_reply("too slow").set_delay(std::time::Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(anthropic_reply("fast enough"))
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 2, 200)).unwrap();
    let completion = gateway.call("q", false, CallOptions::default()).await.unwrap();
    assert_eq!(completion.provider, "anthropic");
}

#[tokio::test]
async fn test_cached_call_hits_server_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_reply("cached"))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let first = gateway.call("Same prompt", true, CallOptions::default()).await.unwrap();
    let second = gateway.call("  same   PROMPT ", true, CallOptions::default()).await.unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.content, "cached");

    gateway.clear_cache().await.unwrap();
    let third = gateway.call("Same prompt", true, CallOptions::default()).await.unwrap();
    assert!(!third.cached);
}

#[tokio::test]
async fn test_history_is_sent_ahead_of_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "You write READMEs."},
                {"role": "user", "content": "What is Docsmith?"},
                {"role": "assistant", "content": "A generator."},
                {"role": "user", "content": "Expand on that."}
            ]
        })))
        .respond_with(openai_reply("expanded"))
        .expect(1)
        .mount(&server)
        .await;

    let mut history = Conversation::with_system_message("You write READMEs.");
    history.add_message(Role::User, "What is Docsmith?");
    history.add_message(Role::Assistant, "A generator.");

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let completion = gateway
        .call("Expand on that.", false, CallOptions::default().with_history(history))
        .await
        .unwrap();
    assert_eq!(completion.content, "expanded");
}

#[tokio::test]
async fn test_openai_stream_delivers_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(sse(
            &[
                json!({"choices": [{"delta": {"role": "assistant"}}]}),
                json!({"choices": [{"delta": {"content": "Test "}}]}),
                json!({"choices": [{"delta": {"content": "response"}}]}),
                json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
            ],
            true,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway.stream("prompt", CallOptions::default(), callbacks).await;

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["Test ", "response"]);
    assert_eq!(observed.content.as_deref(), Some("Test response"));
    assert_eq!(observed.usage, Some(TokenUsage::new(5, 2)));
    assert!(observed.errors.is_empty());
}

#[tokio::test]
async fn test_anthropic_stream_delivers_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse(
            &[
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 9}}}),
                json!({"type": "content_block_start", "index": 0}),
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hello"}}),
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": " there"}}),
                json!({"type": "message_delta", "usage": {"output_tokens": 3}}),
                json!({"type": "message_stop"}),
            ],
            false,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway
        .stream("prompt", CallOptions::default().with_provider("anthropic"), callbacks)
        .await;

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["Hello", " there"]);
    assert_eq!(observed.content.as_deref(), Some("Hello there"));
    assert_eq!(observed.usage, Some(TokenUsage::new(9, 3)));
}

#[tokio::test]
async fn test_stream_error_event_interrupts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse(
            &[
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Par"}}),
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            ],
            false,
        ))
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway
        .stream("prompt", CallOptions::default().with_provider("anthropic"), callbacks)
        .await;

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["Par"]);
    assert!(observed.content.is_none());
    assert_eq!(observed.errors.len(), 1);
    assert!(observed.errors[0].contains("Overloaded"));
}

#[tokio::test]
async fn test_is_functional_probes_primary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_reply("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    assert!(gateway.is_functional().await);
}

#[tokio::test]
async fn test_openai_stream_without_done_marker_is_interrupted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse(
            &[json!({"choices": [{"delta": {"content": "Partial ans"}}]})],
            false,
        ))
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway.stream("prompt", CallOptions::default(), callbacks).await;

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["Partial ans"]);
    assert!(observed.content.is_none());
    assert_eq!(observed.errors.len(), 1);
    assert!(observed.errors[0].contains("completion marker"));
}

#[tokio::test]
async fn test_anthropic_stream_without_message_stop_is_interrupted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse(
            &[
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 9}}}),
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Half"}}),
            ],
            false,
        ))
        .mount(&server)
        .await;

    let gateway = Gateway::from_settings(settings(&server, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway
        .stream("prompt", CallOptions::default().with_provider("anthropic"), callbacks)
        .await;

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["Half"]);
    assert!(observed.content.is_none());
    assert_eq!(observed.errors.len(), 1);
    assert!(observed.errors[0].contains("completion marker"));
}

/// Reads one HTTP request (headers plus `Content-Length` body) off `socket`.
async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        request.extend_from_slice(&buf[..n]);
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let body_len = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map_or(0, |v| v.trim().parse::<usize>().unwrap());
        if request.len() >= header_end + 4 + body_len {
            return;
        }
    }
}

#[tokio::test]
async fn test_stream_keeps_character_split_across_reads() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());

    let body = format!(
        "data: {}\n\ndata: [DONE]\n\n",
        json!({"choices": [{"delta": {"content": "caf\u{e9}"}}]})
    )
    .into_bytes();
    // Cut right after the first byte of "é".
    let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        socket.write_all(&body[..split]).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        socket.write_all(&body[split..]).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let gateway = Gateway::from_settings(settings_for(&uri, 1, 5_000)).unwrap();
    let (callbacks, observed) = observe();
    gateway.stream("prompt", CallOptions::default(), callbacks).await;
    server.await.unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.chunks, ["caf\u{e9}"]);
    assert_eq!(observed.content.as_deref(), Some("caf\u{e9}"));
    assert!(observed.errors.is_empty());
}
