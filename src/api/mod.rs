// =============================================================================
// ariproxy - Cloud API Façade
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   A small stand-in for the vendor's REST API, answering the routes the
//   mobile and home-automation clients use from the gateway's decoded device
//   state. Writes are turned into parameter write requests to the device.
//
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ariproxy_iot::{Broker, DeviceRegistry};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

use crate::config::ApiSection;

pub mod velis;

/// Header carrying the session token
pub const AUTH_HEADER: &str = "ar.authtoken";

const LOGIN_PATH: &str = "/accounts/login";

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub broker: Broker,
    pub registry: Arc<DeviceRegistry>,
    pub settings: Arc<ApiSection>,
}

impl ApiState {
    pub fn new(broker: Broker, registry: Arc<DeviceRegistry>, settings: ApiSection) -> Self {
        ApiState {
            broker,
            registry,
            settings: Arc::new(settings),
        }
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    info!("🔧 Building API routes");
    Router::new()
        .route(LOGIN_PATH, post(login))
        .route("/remote/plants", get(remote_plants))
        .route("/velis/plants", get(velis::plants))
        .route("/velis/sePlantData/:gw", get(velis::plant_data))
        .route("/velis/sePlantData/:gw/temperature", post(velis::set_temperature))
        .route("/velis/sePlantData/:gw/mode", post(velis::set_mode))
        .route("/velis/sePlantData/:gw/limits", get(velis::limits))
        .route("/velis/reports/:gw", get(velis::reports))
        .fallback(default_handler)
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject every request but login without the expected token.
async fn require_token(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if state.settings.debug {
        info!("📥 API request: {} {}", request.method(), path);
    }

    if path != LOGIN_PATH {
        let token = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok());
        if token != Some(state.settings.token().as_str()) {
            debug!("Invalid token for {}", path);
            return (StatusCode::BAD_REQUEST, "Invalid token").into_response();
        }
    }

    let response = next.run(request).await;
    if state.settings.debug {
        info!("📤 API response for {}: {}", path, response.status());
    }
    response
}

/// Parse a request body leniently; anything but JSON reads as `null`.
pub(crate) fn json_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|e| {
        debug!("Error while decoding body: {}", e);
        Value::Null
    })
}

#[instrument(level = "debug", skip(state, body))]
async fn login(State(state): State<ApiState>, body: Bytes) -> Json<Value> {
    let body = json_body(&body);
    let Some(credentials) = body.as_object() else {
        return Json(Value::Null);
    };

    let settings = &state.settings;
    if !settings.username.is_empty() {
        let usr = credentials.get("usr").and_then(Value::as_str);
        let pwd = credentials.get("pwd").and_then(Value::as_str);
        if usr != Some(settings.username.as_str()) || pwd != Some(settings.password.as_str()) {
            info!("🔐 Login rejected");
            return Json(json!({ "error": "invalid username/password" }));
        }
    }

    Json(json!({ "token": settings.token() }))
}

async fn remote_plants() -> Json<Value> {
    Json(json!([]))
}

async fn default_handler() -> Json<Value> {
    Json(json!({}))
}
