use crate::config::{AuthConfig, ServerConfig};
use crate::orchestrator::{InferenceRequest, Orchestrator, OrchestratorError};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

const MISSING_PARAMETERS: &str = "Missing required parameters";
const PROCESSING_ERROR: &str = "Received an error while processing";
const ACCESS_DENIED: &str = "Access denied";
const AUTH_REALM: &str = "Basic realm=\"DarkNode\"";

/// Query parameter carrying the source locator.
const SOURCE_PARAM: &str = "payload";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub auth: Option<Arc<AuthConfig>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, auth: Option<AuthConfig>) -> Self {
        Self {
            orchestrator,
            auth: auth.map(Arc::new),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/", get(detect_batch))
        .route("/events", get(detect_stream))
        .layer(middleware::from_fn_with_state(state.clone(), require_basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build an orchestrator request from query parameters.
///
/// `payload` is the source locator, `record`, `bgr24` and `tiny` are flags,
/// everything else is passed through to the worker.
pub fn request_from_query(mut query: HashMap<String, String>) -> InferenceRequest {
    let source = query.remove(SOURCE_PARAM);
    let record = take_flag(&mut query, "record");
    let bgr24 = take_flag(&mut query, "bgr24");
    let tiny = take_flag(&mut query, "tiny");

    InferenceRequest {
        source,
        record,
        bgr24,
        tiny,
        extra: query
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
    }
}

fn take_flag(query: &mut HashMap<String, String>, name: &str) -> bool {
    query
        .remove(name)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "" | "0" | "false")
}

fn error_response(error: &OrchestratorError) -> Response {
    match error {
        OrchestratorError::InvalidRequest(_) => {
            (StatusCode::BAD_REQUEST, MISSING_PARAMETERS).into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, PROCESSING_ERROR).into_response(),
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "Still alive"
}

/// Run a detection and answer with all results at once
#[instrument(skip(state, query))]
async fn detect_batch(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match state.orchestrator.run_batch(request_from_query(query)).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Run a detection and stream results as server-sent events
#[instrument(skip(state, query))]
async fn detect_stream(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match state.orchestrator.run_stream(request_from_query(query)) {
        Ok(events) => {
            let stream = ReceiverStream::new(events).map(|event| Event::default().json_data(&event));
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Reject requests without the configured credentials.
async fn require_basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(auth) = state.auth.as_deref() else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_credentials)
        .map(|(name, pass)| name == auth.name && pass == auth.pass)
        .unwrap_or(false);

    if authorized {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Rejected request without valid credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, AUTH_REALM)],
        ACCESS_DENIED,
    )
        .into_response()
}

/// Decode `Basic <base64(name:pass)>`.
fn parse_basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, pass) = decoded.split_once(':')?;

    Some((name.to_string(), pass.to_string()))
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(state: AppState, config: &ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(address = %addr, "Starting API server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, StagingConfig};
    use crate::job::{Job, ProgressMessage};
    use crate::orchestrator::OrchestratorSettings;
    use crate::resource_store::ResourceStore;
    use crate::stager::AssetStager;
    use crate::worker_pool::{PoolError, WorkerPool};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Echoes two detections; fails when the request carries `fail`.
    struct EchoPool;

    #[async_trait]
    impl WorkerPool for EchoPool {
        async fn submit(
            &self,
            job: Job,
            messages: mpsc::Sender<ProgressMessage>,
        ) -> Result<(), PoolError> {
            let _ = messages.send(ProgressMessage(json!({"label": "cat"}))).await;
            let _ = messages
                .send(ProgressMessage(json!({"record": job.record})))
                .await;

            if job.extra_params.contains_key("fail") {
                Err(PoolError::JobFailed("scripted failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct TestApp {
        _tmp: TempDir,
        router: Router,
        store: ResourceStore,
        source: String,
    }

    fn app(auth: Option<AuthConfig>) -> TestApp {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("cat.jpg");
        std::fs::write(&source, b"jpeg").unwrap();

        let store = ResourceStore::new(tmp.path().join("scratch"), Duration::from_secs(60));
        let staging = StagingConfig {
            allow_local_files: true,
            ..Default::default()
        };
        let stager = AssetStager::new(store.clone(), &staging).unwrap();
        let orchestrator = Orchestrator::new(
            stager,
            Arc::new(EchoPool),
            OrchestratorSettings {
                video_extensions: staging.video_extensions.clone(),
                detector: DetectorConfig::default(),
                stream_buffer: 8,
            },
        );

        TestApp {
            router: create_router(AppState::new(orchestrator, auth)),
            store,
            source: source.to_string_lossy().into_owned(),
            _tmp: tmp,
        }
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn credentials() -> AuthConfig {
        AuthConfig {
            name: "admin".to_string(),
            pass: "secret".to_string(),
        }
    }

    #[test]
    fn test_request_from_query() {
        let query: HashMap<String, String> = [
            ("payload", "https://cdn/cat.jpg"),
            ("record", "1"),
            ("bgr24", "false"),
            ("tiny", ""),
            ("thresh", "0.4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let request = request_from_query(query);
        assert_eq!(request.source.as_deref(), Some("https://cdn/cat.jpg"));
        assert!(request.record);
        assert!(!request.bgr24);
        assert!(!request.tiny);
        assert_eq!(request.extra.len(), 1);
        assert_eq!(request.extra["thresh"], json!("0.4"));
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("FALSE"));
    }

    #[test]
    fn test_parse_basic_credentials() {
        let header = format!("Basic {}", STANDARD.encode("admin:se:cret"));
        assert_eq!(
            parse_basic_credentials(&header),
            Some(("admin".to_string(), "se:cret".to_string()))
        );
        assert_eq!(parse_basic_credentials("Bearer abc"), None);
        assert_eq!(parse_basic_credentials("Basic !!!"), None);
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = app(None);
        let response = app.router.oneshot(get_request("/healthcheck")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Still alive");
    }

    #[tokio::test]
    async fn test_missing_payload_is_bad_request() {
        let app = app(None);

        let response = app.router.clone().oneshot(get_request("/?record=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, MISSING_PARAMETERS);

        let response = app.router.oneshot(get_request("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_returns_json_array() {
        let app = app(None);
        let uri = format!("/?payload={}&record=true", app.source);

        let response = app.router.oneshot(get_request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body, json!([{"label": "cat"}, {"record": true}]));
        app.store.shutdown();
    }

    #[tokio::test]
    async fn test_batch_failure_is_server_error() {
        let app = app(None);
        let uri = format!("/?payload={}&fail=1", app.source);

        let response = app.router.oneshot(get_request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, PROCESSING_ERROR);
        app.store.shutdown();
    }

    #[tokio::test]
    async fn test_stream_sends_events_then_closes() {
        let app = app(None);
        let uri = format!("/events?payload={}&fail=1", app.source);

        let response = app.router.oneshot(get_request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let body = body_text(response).await;
        let events: Vec<Value> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], json!({"name": "detection", "data": {"label": "cat"}}));
        assert_eq!(events[2]["name"], "error");
        app.store.shutdown();
    }

    #[tokio::test]
    async fn test_auth_rejects_missing_credentials() {
        let app = app(Some(credentials()));

        let response = app.router.oneshot(get_request("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], AUTH_REALM);
        assert_eq!(body_text(response).await, ACCESS_DENIED);
    }

    #[tokio::test]
    async fn test_auth_rejects_wrong_password() {
        let app = app(Some(credentials()));
        let request = Request::builder()
            .uri("/healthcheck")
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode("admin:wrong")),
            )
            .body(Body::empty())
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_accepts_valid_credentials() {
        let app = app(Some(credentials()));
        let request = Request::builder()
            .uri("/healthcheck")
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode("admin:secret")),
            )
            .body(Body::empty())
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
