//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use notifyd_core::config::ServerConfig;
use notifyd_scheduler::{EventBus, NotifydDb};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<NotifydDb>,
    /// Notification snapshots are pushed here after create/update.
    pub bus: EventBus,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(db: Arc<NotifydDb>, bus: EventBus) -> Self {
        Self {
            db,
            bus,
            start_time: Instant::now(),
        }
    }
}

/// Origins allowed by CORS: the local UI plus the configured client origin.
fn allowed_origins(config: &ServerConfig) -> Vec<HeaderValue> {
    let local = format!("http://localhost:{}", config.port);
    [local.as_str(), config.client_origin.as_str()]
        .into_iter()
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect()
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/healthchecker", get(routes::health_check))
        .route(
            "/clients",
            get(routes::list_clients).post(routes::create_client),
        )
        .route(
            "/clients/{id}",
            get(routes::get_client)
                .put(routes::update_client)
                .delete(routes::delete_client),
        )
        .route(
            "/notifications",
            get(routes::list_notifications).post(routes::create_notification),
        )
        .route(
            "/notifications/{id}",
            get(routes::get_notification)
                .put(routes::update_notification)
                .delete(routes::delete_notification),
        )
        .route(
            "/notifications/{id}/messages",
            get(routes::notification_messages),
        );

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(config))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
pub async fn start<F>(config: &ServerConfig, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state, config);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use notifyd_scheduler::QueueSizes;
    use std::path::Path;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let db = Arc::new(NotifydDb::open(Path::new(":memory:")).unwrap());
        let (bus, _rx) = EventBus::new(QueueSizes::default());
        AppState::new(db, bus)
    }

    #[test]
    fn test_allowed_origins() {
        let config = ServerConfig {
            port: 8000,
            client_origin: "https://notify.example.org".into(),
        };
        let origins = allowed_origins(&config);
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "http://localhost:8000");

        let local_only = allowed_origins(&ServerConfig::default());
        assert_eq!(local_only.len(), 1);
    }

    #[tokio::test]
    async fn test_router_serves_api_routes() {
        let app = build_router(test_state(), &ServerConfig::default());

        let resp = app
            .clone()
            .oneshot(Request::get("/api/healthchecker").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/clients/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(Request::get("/healthchecker").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_creates_client_from_json() {
        let app = build_router(test_state(), &ServerConfig::default());
        let resp = app
            .oneshot(
                Request::post("/api/clients")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"phone_number":79990001122,"phone_code":"999","tag":"vip"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
}
