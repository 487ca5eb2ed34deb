//! Axum middleware used by the gateway router.
//!
//! * [`request_id_middleware`] makes sure every request carries an
//!   `X-Request-ID` and echoes it on the response.
//! * [`access_log_middleware`] writes one access line per request and records
//!   HTTP metrics.
//! * [`require_admission`] wraps guarded routes: it acquires a slot before the
//!   handler runs and releases it on every exit path by holding the
//!   [`AdmissionPermit`](crate::core::AdmissionPermit) across `next.run`.
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;

use crate::{
    adapters::{error::ApiError, http_handler::AppState},
    core::{ClientInfo, ConnectionToken},
    metrics::HttpRequestTimer,
    tracing_setup::{ACCESS_TARGET, create_request_span},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the current request, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Inserted into request extensions once a guarded request holds a slot.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub token: ConnectionToken,
    pub request_id: String,
}

fn incoming_request_id(req: &Request) -> Option<String> {
    let value = req.headers().get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    if value.is_empty() || value.len() > MAX_REQUEST_ID_LEN {
        return None;
    }
    Some(value.to_string())
}

/// Honour an incoming `X-Request-ID` or mint a UUID, and echo it back.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = incoming_request_id(&req).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&request_id).ok();

    if let Some(value) = &header_value {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }
    req.extensions_mut().insert(RequestId(request_id));

    let mut response = next.run(req).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Identify the caller: the first `X-Forwarded-For` hop when trusted, else the
/// peer address, else "unknown".
pub fn client_identity(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Log one line per request on the `access` target.
pub async fn access_log_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = client_identity(&req, state.config.trust_forwarded_for);
    let request_id = request_id_of(&req);

    let mut timer = HttpRequestTimer::new(method.as_str());
    let span = create_request_span(method.as_str(), &path, &request_id);
    let response = next.run(req).instrument(span.clone()).await;

    let status = response.status();
    let duration = timer.elapsed();
    timer.set_status(status.as_u16());
    span.record("http.status_code", status.as_u16());
    span.record("duration_ms", duration.as_millis() as u64);

    tracing::info!(
        target: ACCESS_TARGET,
        "{} \"{} {}\" {} {:.3}s [{}]",
        client,
        method,
        path,
        status.as_u16(),
        duration.as_secs_f64(),
        request_id
    );

    response
}

/// Run the rest of the stack only while holding an admission slot.
pub async fn require_admission(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&req);
    let mut client = ClientInfo::new(
        client_identity(&req, state.config.trust_forwarded_for),
        req.uri().path(),
        req.method().as_str(),
        request_id.clone(),
    );
    if let Some(user_agent) = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        client = client.with_user_agent(user_agent);
    }

    let permit = match state.controller.acquire_default(client).await {
        Ok(permit) => permit,
        Err(rejection) => {
            return ApiError::Busy {
                rejection,
                request_id,
            }
            .into_response();
        }
    };

    req.extensions_mut().insert(Admitted {
        token: permit.token(),
        request_id,
    });

    let response = next.run(req).await;
    permit.release();
    response
}
