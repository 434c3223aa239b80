//! Axum web server for rewind.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, State},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::error::WebError;
use super::ws::handle_websocket;
use crate::config::ServerSettings;
use crate::protocol::SyncPayload;
use crate::supervisor::SessionManager;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct WebAppState {
    session: Arc<SessionManager>,
    poll_interval: Duration,
}

impl WebAppState {
    pub fn new(session: Arc<SessionManager>, poll_interval: Duration) -> Self {
        Self {
            session,
            poll_interval,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint handler.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current timeline, layout and cursor of the active target.
async fn sync(State(state): State<WebAppState>) -> Result<Json<SyncPayload>, WebError> {
    Ok(Json(state.session.sync_payload()?))
}

#[derive(Serialize)]
struct UploadResponse {
    target: String,
}

/// Replace the target script with the raw request body.
async fn upload(
    State(state): State<WebAppState>,
    body: Bytes,
) -> Result<impl IntoResponse, WebError> {
    if std::str::from_utf8(&body).is_err() {
        return Err(WebError::BadRequest("script must be UTF-8 text".into()));
    }
    let path = state.session.upload(&body).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            target: path.display().to_string(),
        }),
    ))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebAppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, state.session.clone(), state.poll_interval).await
    })
}

/// Build the Axum router with all routes.
pub fn build_router(state: WebAppState, cors_permissive: bool) -> Router {
    let cors = if cors_permissive {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/sync", get(sync))
        .route("/upload", post(upload))
        .route("/ws", get(ws_handler));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the web server until `shutdown` resolves, then stop the watcher.
pub async fn run_server(
    state: WebAppState,
    settings: &ServerSettings,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let session = state.session.clone();
    let app = build_router(state, settings.cors_permissive);

    tracing::info!("Starting web server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    session.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::supervisor::{ChildProcess, Launcher};
    use crate::util::Paths;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::io;
    use tower::ServiceExt;

    struct Parked;

    impl ChildProcess for Parked {
        fn pid(&self) -> u32 {
            1
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            Ok(Some(0))
        }

        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ParkedLauncher;

    impl Launcher for ParkedLauncher {
        fn launch(&mut self) -> io::Result<Box<dyn ChildProcess>> {
            Ok(Box::new(Parked))
        }
    }

    fn test_state() -> (tempfile::TempDir, WebAppState) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Paths::new(dir.path()));
        let session = SessionManager::new(&config, Box::new(ParkedLauncher)).unwrap();
        (
            dir,
            WebAppState::new(Arc::new(session), Duration::from_millis(10)),
        )
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, state) = test_state();
        let app = build_router(state, true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_sync_without_target_is_404() {
        let (_dir, state) = test_state();
        let app = build_router(state, true);

        let response = app
            .oneshot(Request::builder().uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "Not Found");
    }

    #[tokio::test]
    async fn test_upload_then_sync() {
        let (_dir, state) = test_state();
        let app = build_router(state, true);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/upload")
                    .body(Body::from("x = 1\n# note\nprint(x)\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(json_body(response).await["target"]
            .as_str()
            .unwrap()
            .ends_with("main.py"));

        let response = app
            .oneshot(Request::builder().uri("/api/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sync = json_body(response).await;
        assert_eq!(sync["timeline"], serde_json::json!([]));
        assert_eq!(sync["timeline_id"], serde_json::Value::Null);
        assert_eq!(sync["nodes"][1]["id"], "3");
        assert_eq!(sync["nodes"][1]["data"]["source_segment"], "print(x)");
    }

    #[tokio::test]
    async fn test_upload_rejects_binary() {
        let (_dir, state) = test_state();
        let app = build_router(state, true);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/upload")
                    .body(Body::from(vec![0xff, 0xfe, 0x00]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
