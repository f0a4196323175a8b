//! HTTP entry point for device sessions
//!
//! `GET <path>?deviceId=..&by=mac|imei` verifies the caller's bearer token,
//! resolves the device, checks read access in the device's most specific
//! policy domain, and only then switches protocols and hands the socket to
//! the session hub.

use crate::auth::{IdentityVerifier, VerifiedIdentity};
use crate::broker::DeviceBus;
use crate::directory::{DeviceDirectory, DeviceRecord, PolicyEnforcer};
use crate::error::{AuthError, DirectoryError, UpgradeError};
use crate::identity::{self, IdentifierKind};
use crate::session::{codes, FrameKind, ServerFrame, SessionConnection, SessionHub, SessionOptions};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Policy object and action checked before a session is opened
const POLICY_OBJECT: &str = "devices";
const POLICY_ACTION: &str = "read";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub bus: Arc<dyn DeviceBus>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub policy: Arc<dyn PolicyEnforcer>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub options: SessionOptions,
}

/// Build the router: the session endpoint at `path`, hub stats at
/// `<path>/stats`, and `/health`.
pub fn router(state: AppState, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .route(&format!("{}/stats", path.trim_end_matches('/')), get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub by: Option<String>,
    pub token: Option<String>,
}

/// Everything needed to open an authorized session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub user_id: String,
    pub device_id: String,
    pub kind: IdentifierKind,
    pub device_key: String,
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MissingDeviceId | Self::InvalidKind | Self::InvalidDeviceId(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::DeviceNotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Lookup(_) | Self::PolicyCheck(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::Unauthorized(AuthError::MissingToken) => {
                json!({"error": "Authentication required"})
            }
            Self::Unauthorized(e) => {
                json!({"error": "Authentication required", "details": e.to_string()})
            }
            Self::MissingDeviceId => json!({"error": "deviceId parameter required"}),
            Self::InvalidKind => json!({"error": "by parameter must be 'imei' or 'mac'"}),
            Self::InvalidDeviceId(e) => {
                json!({"error": "Invalid device ID format", "details": e.to_string()})
            }
            Self::DeviceNotFound => json!({"error": "Device not found"}),
            Self::Lookup(e) => {
                json!({"error": "Failed to verify device", "details": e.to_string()})
            }
            Self::PolicyCheck(_) => json!({"error": "Permission check failed"}),
            Self::Forbidden => json!({"error": "Access denied to device"}),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Bearer token from the `Authorization` header, else the `token` query parameter.
pub fn bearer_token(headers: &HeaderMap, query: &UpgradeQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .or_else(|| query.token.clone().filter(|t| !t.is_empty()))
}

/// Policy domain for `device`: partition, else project, else the caller's org.
pub fn policy_domain(device: &DeviceRecord, identity: &VerifiedIdentity) -> String {
    device.policy_domain().unwrap_or_else(|| match &identity.org {
        Some(org) => format!("org:{org}"),
        None => "org".to_string(),
    })
}

/// Run every pre-upgrade check.
pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &UpgradeQuery,
) -> Result<SessionTarget, UpgradeError> {
    let token = bearer_token(headers, query)
        .ok_or(UpgradeError::Unauthorized(AuthError::MissingToken))?;
    let identity = state
        .verifier
        .verify_token(&token)
        .await
        .map_err(UpgradeError::Unauthorized)?;

    let raw_id = query
        .device_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(UpgradeError::MissingDeviceId)?;
    let kind = match query.by.as_deref() {
        None | Some("") => IdentifierKind::Mac,
        Some(by) => by.parse().map_err(|_| UpgradeError::InvalidKind)?,
    };
    let device_id = kind.normalize(raw_id).map_err(UpgradeError::InvalidDeviceId)?;

    let device = match state.directory.get_device_by_identifier(&device_id, kind).await {
        Ok(device) => device,
        Err(DirectoryError::NotFound) => return Err(UpgradeError::DeviceNotFound),
        Err(e) => return Err(UpgradeError::Lookup(e)),
    };

    let domain = policy_domain(&device, &identity);
    let allowed = state
        .policy
        .enforce(&identity.user_id, &domain, POLICY_OBJECT, POLICY_ACTION)
        .await
        .map_err(|e| {
            error!(
                user_id = %identity.user_id,
                domain = %domain,
                error = %e,
                "Permission check failed"
            );
            UpgradeError::PolicyCheck(e)
        })?;
    if !allowed && !identity.is_super_user {
        return Err(UpgradeError::Forbidden);
    }

    // The broker keys devices by hardware address; fall back to the
    // requested id for records without one.
    let device_key = if device.mac.is_empty() {
        device_id.clone()
    } else {
        identity::normalize(&device.mac)
    };

    Ok(SessionTarget {
        user_id: identity.user_id,
        device_id,
        kind,
        device_key,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
) -> Response {
    let target = match authorize(&state, &headers, &query).await {
        Ok(target) => target,
        Err(e) => {
            warn!(device_id = ?query.device_id, error = %e, "Session upgrade rejected");
            return e.into_response();
        }
    };

    ws.max_message_size(state.options.max_message_size)
        .on_upgrade(move |socket| start_session(state, target, socket))
}

async fn start_session(state: AppState, target: SessionTarget, mut socket: WebSocket) {
    let conn = Arc::new(SessionConnection::new(
        target.user_id,
        target.device_id,
        target.kind,
        target.device_key,
        state.bus.clone(),
        state.options.clone(),
    ));

    if let Err(e) = state.hub.register(conn.clone()) {
        error!(
            user_id = %conn.user_id(),
            device_id = %conn.device_id(),
            error = %e,
            "Session registration failed"
        );
        let frame = ServerFrame::error(
            conn.device_id(),
            "Connection registration failed",
            codes::REGISTRATION_FAILED,
            Some(e.to_string()),
        );
        if let Ok(text) = frame.to_json() {
            let _ = socket.send(Message::Text(text.into())).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        conn.close();
        return;
    }

    if let Err(e) = conn.subscribe() {
        warn!(
            connection_id = %conn.id(),
            device_id = %conn.device_id(),
            error = %e,
            "Device subscription failed"
        );
    }

    let welcome = ServerFrame::new(
        FrameKind::Connected,
        conn.device_id(),
        Some(json!({
            "device_id": conn.device_id(),
            "device_by": conn.identifier_kind(),
            "connection_id": conn.id(),
            "message": "WebSocket connection established",
        })),
    );
    let _ = conn.send(&welcome);

    info!(
        connection_id = %conn.id(),
        user_id = %conn.user_id(),
        device_id = %conn.device_id(),
        by = %conn.identifier_kind(),
        "WebSocket connection established"
    );

    conn.run(socket, state.hub.clone()).await;
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.hub.is_shut_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "shutting_down"})));
    }
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
