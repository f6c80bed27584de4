//! Salmon endpoint: accepts signed reply activities and hands them to the
//! backend once their envelope verifies against the author's public key.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};

use crate::envelope::MagicEnvelope;
use crate::error::AppError;
use crate::feed::{self, Entry, Person};
use crate::{AppState, codec, pki};

/// The salmon link relation.
pub const REL: &str = "salmon";

const CONTENT_TYPE_XML: &str = "application/magic-envelope+xml";
const CONTENT_TYPE_JSON: &str = "application/magic-envelope+json";

/// Receives verified salmon entries and resolves author keys.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Retrieves the public key for an account URI, typically over LRDD
    /// discovery ([`pki::KeyResolver`]).
    async fn public_key(&self, account_uri: &str) -> Result<codec::PublicKey, pki::Error>;

    /// Called once an entry's envelope has been verified.
    async fn notify(&self, entry: &Entry) -> Result<(), anyhow::Error>;
}

/// POST /salmon
pub async fn handle<B: crate::Backend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let envelope = match content_type.as_str() {
        CONTENT_TYPE_XML | "application/xml" => MagicEnvelope::from_xml(
            std::str::from_utf8(&body)
                .map_err(|_| AppError::Validation("envelope is not valid UTF-8".to_string()))?,
        )?,
        CONTENT_TYPE_JSON | "application/json" => MagicEnvelope::from_json(&body)?,
        other => return Err(AppError::UnsupportedMediaType(other.to_string())),
    };

    let payload = envelope.unverified_data()?;
    if envelope.data.media_type != feed::MEDIA_TYPE {
        return Err(AppError::UnsupportedMediaType(format!(
            "unsupported content type within magic envelope: {}",
            envelope.data.media_type
        )));
    }

    let entry = Entry::from_xml(
        std::str::from_utf8(&payload)
            .map_err(|_| AppError::Validation("entry is not valid UTF-8".to_string()))?,
    )?;

    let account_uri = entry
        .author
        .as_ref()
        .and_then(Person::account_uri)
        .ok_or_else(|| {
            AppError::Validation("cannot find account URI from payload".to_string())
        })?;

    let key = state.backend.public_key(&account_uri).await?;
    envelope.verify(&key)?;

    state
        .backend
        .notify(&entry)
        .await
        .map_err(AppError::Internal)?;

    Ok(StatusCode::ACCEPTED)
}
