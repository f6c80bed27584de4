//! Client side of descriptor lookup.

use axum::http::StatusCode;

use super::{Error, Resource};

/// Fetches the descriptor at `url`, decoding by response content type.
pub async fn get(client: &reqwest::Client, url: &str) -> Result<Resource, Error> {
    let response = client.get(url).send().await?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(Error::Status(status));
    }

    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let body = response.bytes().await?;

    match content_type.as_str() {
        "application/xrd+xml" | "application/xml" | "text/xml" => Resource::from_xml(
            std::str::from_utf8(&body).map_err(|e| Error::Xml(e.to_string()))?,
        ),
        "application/jrd+json" | "application/json" | "" => Ok(serde_json::from_slice(&body)?),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}
