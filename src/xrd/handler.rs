//! Content-negotiated HTTP serving of resource descriptors.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::{Error, Resource};

/// Content type of the JSON carrier.
pub const CONTENT_TYPE_JRD: &str = "application/jrd+json";

/// Content type of the XML carrier.
pub const CONTENT_TYPE_XRD: &str = "application/xrd+xml";

/// Serves a backend lookup result as an HTTP response.
///
/// `Access-Control-Allow-Origin` defaults to `*` on every response because
/// discovery documents are meant to be fetched cross-origin. A missing
/// resource maps to 404; other backend failures map to 500 with the detail
/// kept in the log.
pub fn serve(request_headers: &HeaderMap, result: Result<Resource, Error>) -> Response {
    let mut response = match result {
        Ok(resource) => encode(request_headers, &resource),
        Err(Error::NoSuchResource) => {
            (StatusCode::NOT_FOUND, "no such resource\n").into_response()
        }
        Err(error) => {
            tracing::error!(%error, "descriptor backend failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };

    let headers = response.headers_mut();
    if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    response
}

fn encode(request_headers: &HeaderMap, resource: &Resource) -> Response {
    if wants_json(request_headers) {
        match serde_json::to_vec(resource) {
            Ok(body) => {
                ([(header::CONTENT_TYPE, CONTENT_TYPE_JRD)], body).into_response()
            }
            Err(error) => {
                tracing::error!(%error, "failed to encode descriptor as JSON");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    } else {
        ([(header::CONTENT_TYPE, CONTENT_TYPE_XRD)], resource.to_xml()).into_response()
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    accept.split(',').any(|part| {
        let essence = part.split(';').next().unwrap_or("").trim();
        essence.eq_ignore_ascii_case(CONTENT_TYPE_JRD)
            || essence.eq_ignore_ascii_case("application/json")
    })
}
