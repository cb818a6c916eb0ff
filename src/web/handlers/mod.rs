//! WHEP resource handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, HOST,
            LOCATION, ORIGIN,
        },
        HeaderMap, HeaderValue, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{PolicyOverrides, SdpOffer};

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Optional transport tweaks carried in the WHEP URL
#[derive(Debug, Default, Deserialize)]
pub struct WhepQuery {
    pub transport: Option<String>,
    pub flexfec: Option<String>,
}

fn resource_location(scheme: &str, headers: &HeaderMap, uri: &Uri) -> String {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    format!("{}://{}{}", scheme, host, uri.path())
}

/// POST: negotiate a new session on the request path
pub async fn whep_offer(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<WhepQuery>,
    body: Bytes,
) -> Result<Response> {
    let overrides = PolicyOverrides::parse(query.transport.as_deref(), query.flexfec.as_deref())?;
    let sdp = String::from_utf8(body.to_vec())
        .map_err(|_| AppError::BadRequest("offer is not valid UTF-8".to_string()))?;
    if sdp.trim().is_empty() {
        return Err(AppError::BadRequest("empty offer".to_string()));
    }

    let path = uri.path().to_string();
    debug!("WHEP offer on {} ({:?})", path, overrides);

    // Negotiation runs to completion even if the client disconnects
    let manager = state.sessions.clone();
    let session_path = path.clone();
    let answer = tokio::spawn(async move {
        manager
            .create_session_with(&session_path, SdpOffer::new(sdp), &overrides)
            .await
    })
    .await
    .map_err(|e| AppError::TransportError(format!("Session task failed: {}", e)))??;

    let location = resource_location(state.scheme(), &headers, &uri);
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location), (CONTENT_TYPE, SDP_CONTENT_TYPE.to_string())],
        answer.sdp,
    )
        .into_response())
}

/// DELETE: tear down the session on the request path
pub async fn whep_delete(State(state): State<Arc<AppState>>, uri: Uri) -> Result<StatusCode> {
    let manager = state.sessions.clone();
    let path = uri.path().to_string();
    tokio::spawn(async move { manager.delete_session(&path).await })
        .await
        .map_err(|e| AppError::TransportError(format!("Session task failed: {}", e)))??;
    Ok(StatusCode::OK)
}

/// OPTIONS: CORS preflight, echoing whatever the browser asks for
pub async fn whep_preflight(headers: HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();
    if let Some(origin) = headers.get(ORIGIN) {
        out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        out.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if let Some(method) = headers.get(ACCESS_CONTROL_REQUEST_METHOD) {
        out.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }
    if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        out.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

pub async fn unsupported_method() -> StatusCode {
    StatusCode::BAD_REQUEST
}
