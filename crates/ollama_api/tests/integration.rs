use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use ollama_api::{
    ChatPayload, OllamaApiClient, OllamaApiConfig, OllamaApiError, RetryPolicy, WireMessage,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
enum ScriptedResponse {
    Respond {
        status: u16,
        content_type: &'static str,
        chunks: Vec<ResponseChunk>,
    },
    Reset,
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    head: String,
    body: Vec<u8>,
}

impl RecordedRequest {
    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body should be JSON")
    }
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let recorded = Arc::clone(&recorded);

            async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let recorded = Arc::clone(&recorded);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, recorded).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            recorded,
            handle,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().expect("recorded lock").clone()
    }

    fn client(&self) -> OllamaApiClient {
        let config = OllamaApiConfig::new(&self.base_url).with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        });
        OllamaApiClient::new(config).expect("client")
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn response_ndjson(status: u16, lines: &[&str]) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "application/x-ndjson",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: ndjson(lines),
        }],
    }
}

fn response_json(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "application/json",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn ndjson(lines: &[&str]) -> Vec<u8> {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    body.into_bytes()
}

fn payload() -> ChatPayload {
    ChatPayload::new("llama3.1:8b", vec![WireMessage::new("user", "hi")])
}

const DELTA_HELLO: &str =
    r#"{"model":"llama3.1:8b","message":{"role":"assistant","content":"hello"},"done":false}"#;
const DONE_WITH_USAGE: &str = r#"{"model":"llama3.1:8b","message":{"role":"assistant","content":""},"done":true,"eval_count":5,"prompt_eval_count":11}"#;

#[tokio::test]
async fn chat_stream_collects_chunks_until_done() {
    let server = ScriptedServer::new(vec![response_ndjson(200, &[DELTA_HELLO, DONE_WITH_USAGE])]).await;
    let client = server.client();

    let result = client
        .chat_stream(&payload(), None)
        .await
        .expect("stream should succeed");

    assert_eq!(result.content(), "hello");
    assert_eq!(result.chunks.len(), 2);
    assert_eq!(result.chunks[1].eval_count, Some(5));

    let recorded = server.recorded();
    assert_eq!(recorded[0].request_line(), "POST /api/chat HTTP/1.1");
    let body = recorded[0].json();
    assert_eq!(body["model"], "llama3.1:8b");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["content"], "hi");

    server.shutdown();
}

#[tokio::test]
async fn chat_stream_without_done_is_incomplete() {
    let server = ScriptedServer::new(vec![response_ndjson(200, &[DELTA_HELLO])]).await;
    let client = server.client();

    let error = client
        .chat_stream(&payload(), None)
        .await
        .expect_err("missing done must fail");
    assert!(matches!(error, OllamaApiError::IncompleteStream));

    server.shutdown();
}

#[tokio::test]
async fn in_stream_error_line_surfaces_as_stream_failure() {
    let server = ScriptedServer::new(vec![response_ndjson(
        200,
        &[DELTA_HELLO, r#"{"error":"llama runner process has terminated"}"#],
    )])
    .await;
    let client = server.client();

    let mut seen = Vec::new();
    let error = client
        .stream_chat_with_handler(&payload(), None, |chunk| seen.push(chunk))
        .await
        .expect_err("error line must fail");

    assert!(matches!(
        error,
        OllamaApiError::StreamFailed { ref message } if message.contains("terminated")
    ));
    assert_eq!(seen.len(), 1);

    server.shutdown();
}

#[tokio::test]
async fn retryable_status_then_success() {
    let server = ScriptedServer::new(vec![
        response_json(503, r#"{"error":"server busy"}"#),
        response_ndjson(200, &[DONE_WITH_USAGE]),
    ])
    .await;
    let client = server.client();

    let result = timeout(Duration::from_secs(5), client.chat_stream(&payload(), None))
        .await
        .expect("retry path should be bounded")
        .expect("stream should eventually succeed");

    assert_eq!(result.chunks.len(), 1);
    assert_eq!(server.request_count(), 2);

    server.shutdown();
}

#[tokio::test]
async fn missing_model_status_fails_without_retry() {
    let server = ScriptedServer::new(vec![response_json(
        404,
        r#"{"error":"model \"nope\" not found, try pulling it first"}"#,
    )])
    .await;
    let client = server.client();

    let error = client
        .chat_stream(&payload(), None)
        .await
        .expect_err("404 must fail");
    assert!(error.is_model_not_found());
    assert!(error.to_string().contains("not found"));
    assert_eq!(server.request_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn connection_resets_exhaust_retries() {
    let server = ScriptedServer::new(vec![
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
    ])
    .await;
    let client = server.client();

    let error = timeout(Duration::from_secs(10), client.chat_stream(&payload(), None))
        .await
        .expect("retry path should resolve")
        .expect_err("connection reset should surface as failure");

    assert!(matches!(
        error,
        OllamaApiError::RetryExhausted { status: None, .. }
    ));
    assert!(server.request_count() >= 4);

    server.shutdown();
}

#[tokio::test]
async fn cancellation_during_stream() {
    let server = ScriptedServer::new(vec![ScriptedResponse::Respond {
        status: 200,
        content_type: "application/x-ndjson",
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: ndjson(&[DELTA_HELLO]),
            },
            ResponseChunk {
                delay_ms: 500,
                bytes: ndjson(&[DONE_WITH_USAGE]),
            },
        ],
    }])
    .await;
    let client = Arc::new(server.client());

    let cancellation = Arc::new(AtomicBool::new(false));
    let stream_task = tokio::spawn({
        let client = Arc::clone(&client);
        let cancellation = Arc::clone(&cancellation);
        async move { client.chat_stream(&payload(), Some(&cancellation)).await }
    });

    sleep(Duration::from_millis(120)).await;
    cancellation.store(true, Ordering::Release);

    let error = timeout(Duration::from_secs(5), stream_task)
        .await
        .expect("stream task should resolve")
        .expect("join handle should resolve")
        .expect_err("cancellation should abort stream");

    assert!(matches!(error, OllamaApiError::Cancelled));
    server.shutdown();
}

#[tokio::test]
async fn catalog_endpoints_report_models_and_context_length() {
    let server = ScriptedServer::new(vec![
        response_json(
            200,
            r#"{"models":[{"name":"llama3.1:8b","model":"llama3.1:8b","size":1},{"name":"qwen3:4b"}]}"#,
        ),
        response_json(
            200,
            r#"{"model_info":{"general.architecture":"llama","llama.context_length":131072}}"#,
        ),
        response_json(404, r#"{"error":"model 'ghost' not found"}"#),
    ])
    .await;
    let client = server.client();

    let models = client.list_models(None).await.expect("tags should load");
    assert_eq!(models.len(), 2);
    assert_eq!(models[1].name, "qwen3:4b");

    let length = client
        .context_length("llama3.1:8b", None)
        .await
        .expect("show should load");
    assert_eq!(length, Some(131072));

    let missing = client
        .context_length("ghost", None)
        .await
        .expect("missing model is not an error");
    assert_eq!(missing, None);

    let recorded = server.recorded();
    assert_eq!(recorded[0].request_line(), "GET /api/tags HTTP/1.1");
    assert_eq!(recorded[1].request_line(), "POST /api/show HTTP/1.1");
    assert_eq!(recorded[1].json()["model"], "llama3.1:8b");

    server.shutdown();
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let Ok(request) = read_request(&mut socket).await else {
        return;
    };

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    recorded.lock().expect("recorded lock").push(request);
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| response_json(500, r#"{"error":"unexpected request"}"#));

    match response {
        ScriptedResponse::Reset => {}
        ScriptedResponse::Respond {
            status,
            content_type,
            chunks,
        } => {
            let headers = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                status_reason(status),
                content_type,
            );

            if socket.write_all(headers.as_bytes()).await.is_err() {
                return;
            }

            for chunk in chunks {
                if chunk.delay_ms > 0 {
                    sleep(Duration::from_millis(chunk.delay_ms)).await;
                }
                let prefix = format!("{:X}\r\n", chunk.bytes.len());
                if socket.write_all(prefix.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(&chunk.bytes).await.is_err() {
                    return;
                }
                if socket.write_all(b"\r\n").await.is_err() {
                    return;
                }
            }

            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];

    let head_end = loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        request.extend_from_slice(&buffer[..n]);
        if let Some(position) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..head_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = request[head_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..n]);
    }

    Ok(RecordedRequest { head, body })
}
