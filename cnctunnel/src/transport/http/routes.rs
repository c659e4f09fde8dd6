//! HTTP route handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::admission::ReserveError;
use crate::config::TunnelConfig;
use crate::service::TunnelService;

/// Header the admin UI sends its API key in.
pub const API_KEY_HEADER: &str = "api_key";

#[derive(Debug, Default, Deserialize)]
pub struct SlotRequestQuery {
    pub clients: Option<String>,
    pub password: Option<String>,
}

impl SlotRequestQuery {
    /// Requested group size. Anything unparseable counts as 0, which the
    /// amount check then refuses.
    fn amount(&self) -> i64 {
        self.clients
            .as_deref()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub api_key: String,
}

fn reserve_error_status(err: &ReserveError) -> StatusCode {
    match err {
        ReserveError::Unauthorized => StatusCode::UNAUTHORIZED,
        ReserveError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        ReserveError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ReserveError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        ReserveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn request_slots(
    State(service): State<Arc<TunnelService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<SlotRequestQuery>,
) -> Response {
    match service.reserve(peer.ip(), query.amount(), query.password.as_deref()) {
        Ok(ids) => Json(ids).into_response(),
        Err(e) => reserve_error_status(&e).into_response(),
    }
}

async fn status(State(service): State<Arc<TunnelService>>) -> String {
    service.status_snapshot().to_text()
}

async fn maintenance(State(service): State<Arc<TunnelService>>) -> StatusCode {
    service.enter_maintenance();
    StatusCode::OK
}

async fn login(
    State(service): State<Arc<TunnelService>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match service.login(&request.username, &request.password) {
        Ok(api_key) => Json(LoginResponse { api_key }).into_response(),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn is_authorized(service: &TunnelService, headers: &HeaderMap) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| service.check_api_key(key))
}

async fn ui_status(State(service): State<Arc<TunnelService>>, headers: HeaderMap) -> Response {
    if !is_authorized(&service, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(service.ui_status()).into_response()
}

async fn get_configuration(
    State(service): State<Arc<TunnelService>>,
    headers: HeaderMap,
) -> Response {
    if !is_authorized(&service, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(service.current_configuration()).into_response()
}

async fn apply_configuration(
    State(service): State<Arc<TunnelService>>,
    headers: HeaderMap,
    body: Result<Json<TunnelConfig>, JsonRejection>,
) -> Response {
    if !is_authorized(&service, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let config = match body {
        Ok(Json(config)) => config,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Rejected configuration body");
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };

    service.apply_configuration(config);
    StatusCode::OK.into_response()
}

async fn enable_tunnel(State(service): State<Arc<TunnelService>>, headers: HeaderMap) -> Response {
    if !is_authorized(&service, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    service.enable_tunnel();
    StatusCode::OK.into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Permissive CORS for the admin UI. Preflights never reach the router.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, api_key"),
    );
    response
}

pub fn routes(service: Arc<TunnelService>) -> Router {
    Router::new()
        .route("/request", get(request_slots))
        .route("/status", get(status))
        .route("/maintenance/", get(maintenance))
        .route("/maintenance/{*rest}", get(maintenance))
        .route("/ui/login", post(login))
        .route("/ui/status", get(ui_status))
        .route(
            "/ui/configuration",
            get(get_configuration)
                .post(apply_configuration)
                .put(enable_tunnel)
                .fallback(not_found),
        )
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(service)
}
