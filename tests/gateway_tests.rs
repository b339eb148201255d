//! Gateway integration tests
//!
//! End-to-end behavior of the /v1/chat entry point: provider dispatch,
//! key failover, free-tier authentication, quota enforcement and usage
//! accounting, against a mocked upstream

use aigateway::config::settings::*;
use aigateway::handlers::create_router_with_store;
use aigateway::services::ledger::{MemoryStore, UsageStore};
use aigateway::utils::week::current_week_epoch;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use httpmock::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Create test settings pointed at a mock upstream
fn create_test_settings(free_tier_base: &str) -> Settings {
    Settings {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8083,
        },
        free_tier: FreeTierConfig {
            system_api_key: "sk-system-test".to_string(),
            base_url: free_tier_base.to_string(),
            conversation_model: "deepseek-ai/DeepSeek-V3.2".to_string(),
            analysis_model: "deepseek-ai/DeepSeek-V3.2".to_string(),
            image_model: "gemini-3-pro-image-preview".to_string(),
            image_base_url: "https://images.example.com/api".to_string(),
            weekly_limit: 200,
            image_limit: 10,
            admin_user_ids: vec!["admin-user".to_string()],
        },
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        request: RequestConfig {
            timeout: 10,
            stream_timeout: 30,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        },
    }
}

fn create_app(settings: Settings, store: Arc<MemoryStore>) -> Router {
    create_router_with_store(settings, store).expect("Failed to create router")
}

/// Base64url-encode without padding
fn encode_segment(bytes: &[u8]) -> String {
    const TABLE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let mut accum = 0u32;
        for (i, b) in chunk.iter().enumerate() {
            accum |= (*b as u32) << (16 - i * 8);
        }
        let chars = match chunk.len() {
            3 => 4,
            2 => 3,
            _ => 2,
        };
        for i in 0..chars {
            out.push(TABLE[((accum >> (18 - i * 6)) & 0x3F) as usize] as char);
        }
    }
    out
}

/// Build an unsigned bearer token for a user id
fn bearer_token(user_id: &str) -> String {
    let exp = Utc::now().timestamp() + 3600;
    let payload = format!("{{\"user_id\":\"{}\",\"exp\":{}}}", user_id, exp);
    format!(
        "Bearer {}.{}.{}",
        encode_segment(b"{\"alg\":\"RS256\"}"),
        encode_segment(payload.as_bytes()),
        "unsigned"
    )
}

/// Seed a usage record for the current week
async fn seed_usage(store: &MemoryStore, user_id: &str, conversations: u32, bonus: u32) {
    store
        .put(
            &format!("usage:{}", user_id),
            json!({
                "conversationCount": conversations,
                "imageCount": 0,
                "bonusCredits": bonus,
                "week": current_week_epoch(),
                "createdAt": 0,
                "lastUpdated": 0
            })
            .to_string(),
        )
        .await
        .unwrap();
}

async fn post_chat(app: Router, auth: Option<&str>, body: Value) -> (StatusCode, Value, String) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes).to_string();
    let value = serde_json::from_str(&text).unwrap_or(Value::Null);
    (status, value, text)
}

fn chat_body() -> Value {
    json!({
        "requestBody": {
            "messages": [{"role": "user", "content": "Hello"}]
        },
        "stream": false
    })
}

fn completion_response() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "deepseek-ai/DeepSeek-V3.2",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hi there"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "aigateway");
}

#[tokio::test]
async fn test_free_tier_requires_authentication() {
    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let (status, body, _) = post_chat(app, None, chat_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authentication_error");
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let expired = Utc::now().timestamp() - 60;
    let payload = format!("{{\"user_id\":\"u1\",\"exp\":{}}}", expired);
    let token = format!(
        "Bearer x.{}.y",
        encode_segment(payload.as_bytes())
    );

    let (status, _, _) = post_chat(app, Some(&token), chat_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unconfigured_free_tier_returns_503() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = create_test_settings("https://api.example.com/v1");
    settings.free_tier.system_api_key.clear();
    let app = create_app(settings, store);

    let (status, _, _) = post_chat(app, Some(&bearer_token("u1")), chat_body()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_exhausted_quota_rejected_before_dispatch() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(completion_response());
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    seed_usage(&store, "u1", 200, 0).await;
    let app = create_app(create_test_settings(&server.base_url()), store);

    let (status, body, _) = post_chat(app, Some(&bearer_token("u1")), chat_body()).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["needsUpgrade"], true);
    assert_eq!(body["remaining"], 0);
    // The upstream provider is never contacted
    assert_eq!(upstream.hits_async().await, 0);
}

#[tokio::test]
async fn test_bonus_credits_extend_the_weekly_limit() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(completion_response());
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    seed_usage(&store, "u1", 200, 5).await;
    let app = create_app(create_test_settings(&server.base_url()), store);

    let (status, body, _) = post_chat(app, Some(&bearer_token("u1")), chat_body()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.hits_async().await, 1);
    // Upstream echo augmented with the new count
    assert_eq!(body["_systemCredits"]["conversationCount"], 201);
    assert_eq!(body["_systemCredits"]["remaining"], 4);
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
}

#[tokio::test]
async fn test_analysis_task_bypasses_quota() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(completion_response());
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    seed_usage(&store, "u1", 200, 0).await;
    let app = create_app(create_test_settings(&server.base_url()), store.clone());

    let mut body = chat_body();
    body["taskType"] = json!("analysis");
    let (status, response, _) = post_chat(app, Some(&bearer_token("u1")), body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.hits_async().await, 1);
    // Analysis calls are not billed
    assert!(response.get("_systemCredits").is_none());
    let raw = store.get("usage:u1").await.unwrap().unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["conversationCount"], 200);
}

#[tokio::test]
async fn test_check_action_reports_quota() {
    let store = Arc::new(MemoryStore::new());
    seed_usage(&store, "u1", 42, 5).await;
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let body = json!({"action": "check"});
    let (status, response, _) = post_chat(app, Some(&bearer_token("u1")), body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["conversationCount"], 42);
    assert_eq!(response["weeklyLimit"], 200);
    assert_eq!(response["bonusCredits"], 5);
    assert_eq!(response["remaining"], 163);
    assert_eq!(response["imageCount"], 0);
    assert_eq!(response["imageLimit"], 10);
    assert_eq!(response["imageRemaining"], 10);
    assert_eq!(response["model"], "deepseek-ai/DeepSeek-V3.2");
    assert_eq!(response["isAdmin"], false);
}

#[tokio::test]
async fn test_admin_flag_in_check_response() {
    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let body = json!({"action": "check"});
    let (_, response, _) = post_chat(app, Some(&bearer_token("admin-user")), body).await;
    assert_eq!(response["isAdmin"], true);
}

#[tokio::test]
async fn test_free_tier_streaming_relays_and_bills() {
    let server = MockServer::start_async().await;
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                    data: [DONE]\n\n";
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body);
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings(&server.base_url()), store.clone());

    let mut body = chat_body();
    body["stream"] = json!(true);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .header("authorization", bearer_token("u1"))
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    // Upstream SSE lines are relayed untouched
    assert!(text.contains("data: {\"choices\""));
    assert!(text.contains("data: [DONE]"));
    assert_eq!(upstream.hits_async().await, 1);

    // Billed optimistically before the stream was relayed
    let raw = store.get("usage:u1").await.unwrap().unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["conversationCount"], 1);
}

#[tokio::test]
async fn test_openai_key_failover_is_transparent() {
    let server = MockServer::start_async().await;
    let bad_key = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer key-bad-1234567890");
            then.status(403)
                .json_body(json!({"error": {"message": "invalid api key", "type": "auth"}}));
        })
        .await;
    let good_key = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer key-good-1234567890");
            then.status(200).json_body(completion_response());
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://unused.example.com"), store);

    let body = json!({
        "credentials": {
            "id": "cfg-failover",
            "apiKey": "key-bad-1234567890,key-good-1234567890",
            "baseUrl": server.base_url(),
            "protocol": "openai",
            "model": "gpt-4o"
        },
        "requestBody": {
            "messages": [{"role": "user", "content": "Hello"}]
        },
        "stream": false
    });

    let (status, response, _) = post_chat(app, None, body).await;

    // The caller never observes the intermediate key failure
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["text"], "Hi there");
    assert_eq!(bad_key.hits_async().await, 1);
    assert_eq!(good_key.hits_async().await, 1);
}

#[tokio::test]
async fn test_fatal_upstream_error_is_not_retried() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(400)
                .json_body(json!({"error": {"message": "invalid request", "type": "invalid"}}));
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://unused.example.com"), store);

    let body = json!({
        "credentials": {
            "id": "cfg-fatal",
            "apiKey": "key-only-1234567890",
            "baseUrl": server.base_url(),
            "protocol": "openai",
            "model": "gpt-4o"
        },
        "requestBody": {
            "messages": [{"role": "user", "content": "Hello"}]
        }
    });

    let (status, response, _) = post_chat(app, None, body).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(response["error"], "upstream_error");
    assert_eq!(upstream.hits_async().await, 1);
}

#[tokio::test]
async fn test_gemini_protocol_end_to_end() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST).path("/models/gemini-test:generateContent");
            then.status(200).json_body(json!({
                "candidates": [{
                    "content": {"parts": [
                        {"thought": true, "text": "let me think"},
                        {"text": "The answer is 4"}
                    ]},
                    "groundingMetadata": {"webSearchQueries": ["2+2"]}
                }]
            }));
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://unused.example.com"), store);

    let body = json!({
        "credentials": {
            "apiKey": "gemini-key-1234567890",
            "baseUrl": server.base_url(),
            "protocol": "gemini",
            "model": "gemini-test"
        },
        "requestBody": {
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "what is 2+2?"}
            ]
        }
    });

    let (status, response, _) = post_chat(app, None, body).await;

    assert_eq!(status, StatusCode::OK);
    // Thought text is filtered, grounding is surfaced
    assert_eq!(response["text"], "The answer is 4");
    assert_eq!(response["usedSearch"], true);
    assert_eq!(upstream.hits_async().await, 1);
}

#[tokio::test]
async fn test_missing_request_body_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let app = create_app(create_test_settings("https://api.example.com/v1"), store);

    let body = json!({
        "credentials": {
            "apiKey": "key-1234567890",
            "baseUrl": "https://api.example.com/v1",
            "protocol": "openai",
            "model": "gpt-4o"
        }
    });

    let (status, response, _) = post_chat(app, None, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "invalid_request_error");
}
