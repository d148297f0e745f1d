//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use notifyd_core::NotifydError;
use notifyd_core::types::{ClientRequest, Notification, NotificationRequest};
use notifyd_scheduler::Page;
use serde_json::{Value, json};

use crate::server::AppState;

/// Status code plus JSON body.
pub type ApiResponse = (StatusCode, Json<Value>);

fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn created(body: Value) -> ApiResponse {
    (StatusCode::CREATED, Json(body))
}

/// Map a store/validation error to a response.
fn error_response(err: NotifydError) -> ApiResponse {
    let status = match &err {
        NotifydError::NotFound(_) => StatusCode::NOT_FOUND,
        NotifydError::Validation(_) | NotifydError::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    if status == StatusCode::BAD_GATEWAY {
        tracing::error!("❌ Request failed: {err}");
    }
    (status, Json(json!({"ok": false, "error": err.to_string()})))
}

/// Hand a stored snapshot to the pipeline. The row is already saved, so a
/// closed bus is only logged; the next boot re-seeds it.
async fn publish(state: &AppState, notification: Notification) {
    let id = notification.id;
    if let Err(err) = state.bus.push_notification(notification).await {
        tracing::error!("❌ Notification {id} saved but not queued: {err}");
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "message": "notifyd is up and dispatching notifications",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Clients ──────────────────────────────────────────────

pub async fn create_client(
    State(state): State<AppState>,
    Json(req): Json<ClientRequest>,
) -> ApiResponse {
    if let Err(err) = req.validate() {
        return error_response(err);
    }
    match state.db.create_client(req) {
        Ok(client) => {
            tracing::info!("👤 Client {} created", client.id);
            created(json!({"ok": true, "client": client}))
        }
        Err(err) => error_response(err),
    }
}

pub async fn list_clients(State(state): State<AppState>) -> ApiResponse {
    match state.db.list_clients() {
        Ok(clients) => ok(json!({"ok": true, "count": clients.len(), "clients": clients})),
        Err(err) => error_response(err),
    }
}

pub async fn get_client(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    match state.db.get_client(id) {
        Ok(client) => ok(json!({"ok": true, "client": client})),
        Err(err) => error_response(err),
    }
}

pub async fn update_client(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ClientRequest>,
) -> ApiResponse {
    if let Err(err) = req.validate() {
        return error_response(err);
    }
    match state.db.update_client(id, req) {
        Ok(client) => ok(json!({"ok": true, "client": client})),
        Err(err) => error_response(err),
    }
}

pub async fn delete_client(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    match state.db.delete_client(id) {
        Ok(()) => ok(json!({"ok": true})),
        Err(err) => error_response(err),
    }
}

// ─── Notifications ────────────────────────────────────────

/// Create a notification and queue it for scheduling.
pub async fn create_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> ApiResponse {
    if let Err(err) = req.validate() {
        return error_response(err);
    }
    let notification = match state.db.create_notification(req) {
        Ok(n) => n,
        Err(err) => return error_response(err),
    };
    tracing::info!("🔔 Notification {} created", notification.id);
    publish(&state, notification.clone()).await;
    created(json!({"ok": true, "notification": notification}))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResponse {
    match state.db.list_notifications(page) {
        Ok(notifications) => ok(json!({
            "ok": true,
            "page": page.page,
            "limit": page.limit,
            "count": notifications.len(),
            "notifications": notifications,
        })),
        Err(err) => error_response(err),
    }
}

pub async fn get_notification(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    match state.db.get_notification(id) {
        Ok(notification) => ok(json!({"ok": true, "notification": notification})),
        Err(err) => error_response(err),
    }
}

/// Update a notification and queue the new snapshot.
pub async fn update_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<NotificationRequest>,
) -> ApiResponse {
    if let Err(err) = req.validate() {
        return error_response(err);
    }
    let notification = match state.db.update_notification(id, req) {
        Ok(n) => n,
        Err(err) => return error_response(err),
    };
    tracing::info!("🔔 Notification {id} updated");
    publish(&state, notification.clone()).await;
    ok(json!({"ok": true, "notification": notification}))
}

/// Delete a notification. A task already running for it is left alone.
pub async fn delete_notification(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    match state.db.delete_notification(id) {
        Ok(()) => {
            tracing::info!("🗑️ Notification {id} deleted");
            ok(json!({"ok": true}))
        }
        Err(err) => error_response(err),
    }
}

pub async fn notification_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(page): Query<Page>,
) -> ApiResponse {
    if let Err(err) = state.db.get_notification(id) {
        return error_response(err);
    }
    match state.db.messages_for_notification(id, page) {
        Ok(messages) => ok(json!({
            "ok": true,
            "page": page.page,
            "limit": page.limit,
            "count": messages.len(),
            "messages": messages,
        })),
        Err(err) => error_response(err),
    }
}
