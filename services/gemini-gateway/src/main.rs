//! Gemini Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys from the environment or a key file
//! 2. Serves text generation and roleplay scenario endpoints
//! 3. Rotates across keys on failure, backing off when the whole pool is
//!    rate limited

mod config;
mod error;
mod handlers;
mod metrics;
mod roleplay;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use backend::GeminiClientFactory;
use key_pool::{Dispatcher, Pool, RetryPolicy};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::handlers::{GatewayState, GenerateBody};
use crate::roleplay::RoleplayInput;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrent in-flight requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/generate", post(generate_handler))
        .route("/v1/roleplay", post(roleplay_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Build the key pool and dispatcher from loaded configuration.
fn build_gateway(config: &Config) -> Result<GatewayState> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.gemini.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let factory = GeminiClientFactory::new(http, &config.gemini.base_url, &config.gemini.model);

    let pool = Pool::build(config.api_keys.iter().cloned(), &factory);
    let policy = RetryPolicy::default().with_max_pool_retries(config.dispatch.max_pool_retries);
    let dispatcher = Dispatcher::new(Arc::new(pool), policy);

    Ok(GatewayState::new(dispatcher, &config.gemini.model))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.gemini.base_url,
        model = %config.gemini.model,
        max_pool_retries = config.dispatch.max_pool_retries,
        "configuration loaded"
    );

    let gateway = build_gateway(&config)?;
    if gateway.pool_size() == 0 {
        error!("no Gemini API keys configured; generation requests will fail until restart");
    } else {
        info!(keys = gateway.pool_size(), "loaded Gemini API keys");
    }

    let app_state = AppState {
        gateway,
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, pool size, uptime, request counters.
/// Returns 503 when the pool has no keys.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let keys = gateway.pool_size();
    let body = serde_json::json!({
        "status": if keys > 0 { "healthy" } else { "unhealthy" },
        "keys_loaded": keys,
        "model": gateway.model,
        "uptime_seconds": gateway.started_at.elapsed().as_secs(),
        "requests_served": gateway.requests_total.load(Ordering::Relaxed),
        "errors_total": gateway.errors_total.load(Ordering::Relaxed),
    });
    let status_code = if keys > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn generate_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<GenerateBody>,
) -> Response {
    handlers::generate(&state.gateway, body, new_request_id()).await
}

async fn roleplay_handler(
    State(state): State<AppState>,
    axum::Json(input): axum::Json<RoleplayInput>,
) -> Response {
    handlers::roleplay(&state.gateway, input, new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// App state with the given keys pointing at `base_url`.
    fn test_app_state(base_url: &str, keys: &[&str]) -> AppState {
        let mut config = Config::default();
        config.gemini.base_url = base_url.to_string();
        config.gemini.timeout_secs = 5;
        config.api_keys = keys.iter().map(|k| Secret::new(k.to_string())).collect();

        AppState {
            gateway: build_gateway(&config).unwrap(),
            prometheus: test_prometheus_handle(),
        }
    }

    /// Start a mock Gemini API answering every request with `status` and `body`.
    async fn start_mock_gemini(
        status: StatusCode,
        body: serde_json::Value,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new().fallback(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    fn candidate(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        })
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_with_keys_is_healthy() {
        let state = test_app_state("http://unused", &["AIzaKeyOne", "AIzaKeyTwo"]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["keys_loaded"], 2);
        assert_eq!(json["model"], "gemini-2.5-flash");
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_with_empty_pool_is_unhealthy() {
        let state = test_app_state("http://unused", &[]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["keys_loaded"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused", &["AIzaKeyOne"]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn generate_with_empty_pool_returns_no_api_keys() {
        let state = test_app_state("http://unused", &[]);
        let app = build_router(state.clone(), 1000);
        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"prompt": "Hallo"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "no_api_keys");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("GEMINI_API_KEYS")
        );
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got: {request_id}");
        assert_eq!(state.gateway.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn generate_returns_model_text() {
        let (base_url, _server) =
            start_mock_gemini(StatusCode::OK, candidate("Guten Morgen!")).await;
        let state = test_app_state(&base_url, &["AIzaKeyOne"]);
        let app = build_router(state.clone(), 1000);

        let response = app
            .oneshot(post_json(
                "/v1/generate",
                serde_json::json!({"prompt": "Sag hallo", "system": "Antworte kurz"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["text"], "Guten Morgen!");
        assert_eq!(json["model"], "gemini-2.5-flash");
        assert_eq!(state.gateway.requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(state.gateway.errors_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn generate_passes_quota_error_through() {
        // A 30s hint exceeds the 10s wait ceiling, so there is no pool retry.
        let (base_url, _server) = start_mock_gemini(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": {
                    "code": 429,
                    "message": "Quota exceeded for metric generate_content. Please retry in 30s.",
                    "status": "RESOURCE_EXHAUSTED"
                }
            }),
        )
        .await;
        let state = test_app_state(&base_url, &["AIzaKeyOne", "AIzaKeyTwo"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"prompt": "Hallo"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "backend_error");
        assert_eq!(
            json["error"]["message"],
            "[429 RESOURCE_EXHAUSTED] Quota exceeded for metric generate_content. Please retry in 30s."
        );
    }

    #[tokio::test]
    async fn generate_passes_client_error_status_through() {
        let (base_url, _server) = start_mock_gemini(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": {
                    "code": 400,
                    "message": "API key not valid. Please pass a valid API key.",
                    "status": "INVALID_ARGUMENT"
                }
            }),
        )
        .await;
        let state = test_app_state(&base_url, &["AIzaBadKey"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"prompt": "Hallo"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("API key not valid")
        );
    }

    #[tokio::test]
    async fn generate_with_dead_upstream_returns_502() {
        let state = test_app_state("http://127.0.0.1:1", &["AIzaKeyOne"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"prompt": "Hallo"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "backend_error");
    }

    #[tokio::test]
    async fn generate_without_prompt_is_rejected() {
        let state = test_app_state("http://unused", &["AIzaKeyOne"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json("/v1/generate", serde_json::json!({"system": "x"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn roleplay_returns_scenario() {
        let scenario = serde_json::json!({
            "scenario": "Вчера вы были в ресторане и забыли там зонт.",
            "aiRole": "Официант",
            "userRole": "Гость",
            "initialMessage": "Guten Tag! Waren Sie gestern Abend bei uns?",
            "objectives": ["Объяснить, что вы забыли", "Рассказать о вчерашнем вечере в Perfekt"]
        });
        let (base_url, _server) =
            start_mock_gemini(StatusCode::OK, candidate(&scenario.to_string())).await;
        let state = test_app_state(&base_url, &["AIzaKeyOne"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json(
                "/v1/roleplay",
                serde_json::json!({
                    "topic_title": "Im Restaurant",
                    "user_level": "A2",
                    "vocabulary": ["der Regenschirm"]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ai_role"], "Официант");
        assert_eq!(json["initial_message"], "Guten Tag! Waren Sie gestern Abend bei uns?");
        assert_eq!(json["objectives"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn roleplay_with_invalid_model_output_returns_502() {
        let (base_url, _server) =
            start_mock_gemini(StatusCode::OK, candidate("Ich kann das nicht.")).await;
        let state = test_app_state(&base_url, &["AIzaKeyOne"]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(post_json(
                "/v1/roleplay",
                serde_json::json!({"topic_title": "Arbeit", "user_level": "B1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "invalid_model_output");
    }

    #[tokio::test]
    async fn roleplay_rotates_past_key_with_invalid_output() {
        // The mock answers garbage for one key and a valid scenario for the other.
        let scenario = serde_json::json!({
            "scenario": "Вы ищете квартиру в Берлине.",
            "aiRole": "Арендодатель",
            "userRole": "Студент",
            "initialMessage": "Hallo! Sie interessieren sich für die Wohnung?",
            "objectives": ["Узнать цену", "Договориться о просмотре"]
        })
        .to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let tried = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let server_tried = tried.clone();
        let _server = tokio::spawn(async move {
            let app = axum::Router::new().fallback(move |headers: axum::http::HeaderMap| {
                let scenario = scenario.clone();
                let tried = server_tried.clone();
                async move {
                    let key = headers
                        .get("x-goog-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tried.lock().unwrap().push(key.clone());
                    let text = if key == "AIzaGoodKey" {
                        scenario
                    } else {
                        "Entschuldigung, ich verstehe nicht.".to_string()
                    };
                    axum::Json(candidate(&text))
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&base_url, &["AIzaBadKey", "AIzaGoodKey"]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(post_json(
                "/v1/roleplay",
                serde_json::json!({"topic_title": "Wohnungssuche", "user_level": "B1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ai_role"], "Арендодатель");
        let tried = tried.lock().unwrap().clone();
        assert_eq!(tried.last().map(String::as_str), Some("AIzaGoodKey"));
        assert!(tried.len() <= 2, "tried: {tried:?}");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let state = test_app_state("http://unused", &["AIzaKeyOne"]);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/v1/other").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
