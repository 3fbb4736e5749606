//! HTTP-level tests: a real server on an ephemeral port with scripted models.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use lingua_stream_service::{
    AppConfig, ModelRegistry, build_router,
    config::PipelineKind,
    error::ServiceError,
    model::{DecodeParams, ModelKey, ModelMetadata, TextGenerator},
};

struct Fixed(Result<&'static str, &'static str>);

#[async_trait]
impl TextGenerator for Fixed {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: "fixed".into(),
            backend: "test",
            source: "memory".into(),
        }
    }

    async fn generate(&self, _input: &str, _: &DecodeParams) -> Result<String, ServiceError> {
        self.0
            .map(str::to_string)
            .map_err(|m| ServiceError::Inference(m.to_string()))
    }
}

async fn spawn_server(entries: Vec<(ModelKey, Fixed)>) -> SocketAddr {
    let config = Arc::new(AppConfig {
        pipeline: PipelineKind::Seq2Seq,
        char_delay: Duration::ZERO,
        ..AppConfig::default()
    });
    let registry = ModelRegistry::from_entries(
        entries
            .into_iter()
            .map(|(key, model)| (key, Arc::new(model) as Arc<dyn TextGenerator>)),
    )
    .expect("registry");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = build_router(config, Arc::new(registry));

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server run");
    });

    addr
}

async fn default_server() -> SocketAddr {
    spawn_server(vec![
        (ModelKey::TranslateEnAr, Fixed(Ok("سلام"))),
        (ModelKey::TranslateArEn, Fixed(Ok("peace"))),
        (ModelKey::RephraseEn, Fixed(Ok("Hi there"))),
    ])
    .await
}

/// Data payload of every SSE frame in `body`.
fn frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}

struct Streamed {
    status: u16,
    content_type: String,
    frames: Vec<String>,
}

async fn post_generate(addr: SocketAddr, body: serde_json::Value) -> Streamed {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/generate"))
        .json(&body)
        .send()
        .await
        .expect("POST /generate");
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let text = resp.text().await.expect("body");
    Streamed {
        status,
        content_type,
        frames: frames(&text),
    }
}

#[tokio::test]
async fn english_translation_streams_until_end_marker() {
    let addr = default_server().await;
    let streamed =
        post_generate(addr, serde_json::json!({"text": "Hello world", "task": "translate"})).await;

    assert_eq!(streamed.status, 200);
    assert!(streamed.content_type.starts_with("text/event-stream"));
    assert_eq!(streamed.frames, vec!["س", "ل", "ا", "م", "[END_OF_STREAM]"]);
}

#[tokio::test]
async fn arabic_translation_uses_reverse_direction() {
    let addr = default_server().await;
    let streamed =
        post_generate(addr, serde_json::json!({"text": "سلام عليكم", "task": "translate"})).await;

    assert_eq!(streamed.frames.concat(), "peace[END_OF_STREAM]");
}

#[tokio::test]
async fn task_defaults_to_translate() {
    let addr = default_server().await;
    let streamed = post_generate(addr, serde_json::json!({"text": "Hello"})).await;

    assert_eq!(streamed.frames.last().map(String::as_str), Some("[END_OF_STREAM]"));
    assert_eq!(streamed.frames.len(), 5);
}

#[tokio::test]
async fn english_rephrase_is_relayed() {
    let addr = default_server().await;
    let streamed =
        post_generate(addr, serde_json::json!({"text": "Hello", "task": "rephrase"})).await;

    assert_eq!(streamed.frames, vec!["Hi there", "[END_OF_STREAM]"]);
}

#[tokio::test]
async fn unsupported_task_yields_error_frame() {
    let addr = default_server().await;
    let streamed =
        post_generate(addr, serde_json::json!({"text": "Hello", "task": "summarize"})).await;

    assert_eq!(streamed.status, 200);
    assert_eq!(streamed.frames, vec!["[ERROR]"]);
}

#[tokio::test]
async fn malformed_body_is_a_json_bad_request() {
    let addr = default_server().await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/generate"))
        .header("content-type", "application/json")
        .body("{\"text\": ")
        .send()
        .await
        .expect("POST /generate");

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.expect("json error body");
    assert!(
        body["error"]
            .as_str()
            .is_some_and(|m| m.starts_with("invalid request:")),
        "unexpected body {body}"
    );
}

#[tokio::test]
async fn model_failure_yields_single_error_frame() {
    let addr = spawn_server(vec![(ModelKey::TranslateEnAr, Fixed(Err("weights corrupted")))]).await;
    let streamed =
        post_generate(addr, serde_json::json!({"text": "Hello", "task": "translate"})).await;

    assert_eq!(streamed.frames, vec!["[ERROR]"]);
}

#[tokio::test]
async fn index_page_and_script_are_served() {
    let addr = default_server().await;

    let resp = reqwest::get(format!("http://{addr}/")).await.expect("GET /");
    assert_eq!(resp.status(), 200);
    let html = resp.text().await.expect("html");
    assert!(html.contains("id=\"text-input\""));

    let resp = reqwest::get(format!("http://{addr}/static/script.js"))
        .await
        .expect("GET script");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/javascript");
    let js = resp.text().await.expect("js");
    assert!(js.contains("/generate"));
    assert!(js.contains("Regenerate"));
}

#[tokio::test]
async fn metadata_lists_registered_models() {
    let addr = default_server().await;

    let resp = reqwest::get(format!("http://{addr}/metadata")).await.expect("GET /metadata");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["pipeline"], "seq2seq");
    let keys: Vec<_> = body["models"]
        .as_array()
        .expect("models")
        .iter()
        .map(|m| m["key"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["translate_en_ar", "translate_ar_en", "rephrase_en"]);
}

#[tokio::test]
async fn health_check() {
    let addr = default_server().await;
    let body = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("GET /health")
        .text()
        .await
        .expect("text");
    assert_eq!(body, "ok");
}
