use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::ORIGIN},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    errors::{AppError, GenerationError, Result, SERVICE_UNAVAILABLE_MESSAGE},
    models::{GenerateRequestBody, GenerateResponseBody},
    providers::OpenRouterProvider,
};

const PROMPT_REQUIRED_MESSAGE: &str = "Prompt text is required.";
const NO_IMAGE_MESSAGE: &str = "API returned successfully but did not provide an image.";
const INVALID_BODY_MESSAGE: &str = "Invalid request body.";

#[derive(Clone, Default)]
pub struct AppState {
    provider: Option<Arc<OpenRouterProvider>>,
}

impl AppState {
    pub fn new(provider: Option<OpenRouterProvider>) -> Self {
        Self {
            provider: provider.map(Arc::new),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let configured = state.is_configured();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "server", %addr, configured, "generation proxy listening");

    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::other(format!("proxy server error: {err}")))?;

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "configured": state.is_configured(),
    }))
}

async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<GenerateRequestBody>, JsonRejection>,
) -> (StatusCode, Json<GenerateResponseBody>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(target: "server", reason = %rejection.body_text(), "rejected request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(GenerateResponseBody::error(INVALID_BODY_MESSAGE, "bad_request")),
            );
        }
    };

    let Some(provider) = state.provider.as_ref() else {
        warn!(target: "server", "generation requested but OPENROUTER_API_KEY is not configured");
        return failure(&GenerationError::ServiceUnavailable(
            "OPENROUTER_API_KEY is not configured".to_string(),
        ));
    };

    let request = body.into_request();
    if request.prompt_text.trim().is_empty() {
        return failure(&GenerationError::NoPromptProvided);
    }

    let request_id = Uuid::new_v4();
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    info!(
        target: "server",
        %request_id,
        variant = %request.variant,
        has_image = request.image.is_some(),
        face_lock = request.face_lock,
        "generation requested"
    );

    match provider.generate_with_origin(&request, origin).await {
        Ok(result) => {
            info!(target: "server", %request_id, "generation succeeded");
            (StatusCode::OK, Json(GenerateResponseBody::thumbnail(result.data)))
        }
        Err(err) => {
            warn!(target: "server", %request_id, error = %err, "generation failed");
            failure(&err)
        }
    }
}

fn failure(err: &GenerationError) -> (StatusCode, Json<GenerateResponseBody>) {
    (status_for(err), Json(GenerateResponseBody::error(public_message(err), err.code())))
}

pub fn status_for(err: &GenerationError) -> StatusCode {
    match err {
        GenerationError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GenerationError::NoPromptProvided => StatusCode::BAD_REQUEST,
        GenerationError::FaceMatchFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GenerationError::UpstreamFailure(_) | GenerationError::EmptyResult => {
            StatusCode::BAD_GATEWAY
        }
    }
}

/// Configuration detail stays in the log; callers only see the admin message.
fn public_message(err: &GenerationError) -> String {
    match err {
        GenerationError::ServiceUnavailable(_) => SERVICE_UNAVAILABLE_MESSAGE.to_string(),
        GenerationError::NoPromptProvided => PROMPT_REQUIRED_MESSAGE.to_string(),
        GenerationError::FaceMatchFailed(message) | GenerationError::UpstreamFailure(message) => {
            message.clone()
        }
        GenerationError::EmptyResult => NO_IMAGE_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::config::OpenRouterConfig;

    fn offline_provider() -> OpenRouterProvider {
        OpenRouterProvider::from_config(&OpenRouterConfig {
            api_key: "sk-test".into(),
            base_url: "http://127.0.0.1:9".into(),
            image_model: "image".into(),
            chat_model: "chat".into(),
            referer: "https://ai-thumbnails-maker.com".into(),
            title: "AI Thumbnail Maker".into(),
            timeout: Duration::from_secs(1),
        })
        .expect("client")
    }

    fn generate(body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/generate")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn unconfigured_proxy_answers_service_unavailable() {
        let (status, body) = send(
            router(AppState::default()),
            generate(json!({ "promptText": "Hello", "quality": "preview" })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], SERVICE_UNAVAILABLE_MESSAGE);
        assert_eq!(body["code"], "service_unavailable");
        assert!(!body.to_string().contains("OPENROUTER_API_KEY"));
    }

    #[tokio::test]
    async fn blank_prompt_is_a_bad_request() {
        let state = AppState::new(Some(offline_provider()));
        let (status, body) = send(
            router(state),
            generate(json!({ "promptText": "   ", "quality": "final", "faceLock": false })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], PROMPT_REQUIRED_MESSAGE);
        assert_eq!(body["code"], "no_prompt");
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_bad_gateway() {
        let state = AppState::new(Some(offline_provider()));
        let (status, body) = send(
            router(state),
            generate(json!({ "promptText": "Speedrun recap", "quality": "preview" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "upstream_failure");
    }

    #[tokio::test]
    async fn malformed_body_is_a_json_bad_request() {
        let (status, body) = send(
            router(AppState::default()),
            generate(json!({ "promptText": "Hi", "quality": "ultra" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], INVALID_BODY_MESSAGE);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn generate_rejects_other_methods() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/generate")
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(router(AppState::default()), request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reports_configuration() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(router(AppState::default()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "configured": false }));
    }

    #[test]
    fn failures_map_to_distinct_statuses() {
        assert_eq!(
            status_for(&GenerationError::FaceMatchFailed("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&GenerationError::EmptyResult), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&GenerationError::UpstreamFailure(
                "Failed to generate detailed prompt. Status: 429".into()
            )),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(public_message(&GenerationError::EmptyResult), NO_IMAGE_MESSAGE);
    }
}
