//! salmonrun - the server side of a federated social-feed protocol stack
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP Layer (Axum)                      │
//! │  - /hub subscription endpoint                               │
//! │  - /salmon signed-reply endpoint                            │
//! │  - /.well-known discovery endpoints                         │
//! │  - per-topic feed endpoints                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Protocol Layer                          │
//! │  - Publisher (verification, fan-out, leases)                │
//! │  - Magic envelopes (RSA-SHA256 sign/verify)                 │
//! │  - Descriptor lookup (LRDD / WebFinger)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Backend                              │
//! │  - feed storage, key lookup, reply intake                   │
//! │  - in-memory implementation provided                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `hub`: PubSubHubbub publisher and its HTTP endpoint
//! - `salmon`: signed-reply endpoint
//! - `envelope`: magic envelope container and signatures
//! - `codec`: base64url and the magic public key format
//! - `pki`: public key discovery
//! - `xrd`: resource descriptors, discovery endpoints and clients
//! - `feed`: Atom Activity Streams adapter
//! - `backend`: in-memory backend
//! - `config`: configuration management
//! - `error`: error types

pub mod backend;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod hub;
pub mod pki;
pub mod salmon;
pub mod xrd;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;

use crate::error::AppError;

/// Well-known link relations used across the protocol suite.
pub mod rel {
    pub const PROFILE_PAGE: &str = "http://webfinger.net/rel/profile-page";
    pub const UPDATES_FROM: &str = "http://schemas.google.com/g/2010#updates-from";
    pub const SALMON: &str = "salmon";
    pub const MAGIC_PUBLIC_KEY: &str = "magic-public-key";
    pub const SUBSCRIBE: &str = "http://ostatus.org/schema/1.0/subscribe";
}

/// Path the hub endpoint is mounted at.
pub const HUB_PATH: &str = "/hub";

/// Path the salmon endpoint is mounted at.
pub const SALMON_PATH: &str = "/salmon";

/// Everything the surrounding application provides to run a server:
/// the notification source for the hub, key lookup and reply intake for
/// salmon, WebFinger descriptors, and feed documents for topic URLs.
#[async_trait]
pub trait Backend:
    hub::Backend<Event = feed::Feed> + salmon::Backend + xrd::webfinger::Backend
{
    /// Returns the feed document served for a topic (the request's
    /// path and query).
    async fn feed(&self, topic: &str) -> Result<feed::Feed, anyhow::Error>;
}

/// Application state shared across all handlers
pub struct AppState<B: Backend> {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// The backend behind every endpoint
    pub backend: Arc<B>,

    /// The hub publisher
    pub publisher: hub::Publisher<B>,

    /// HTTP client for callback and discovery requests
    pub http_client: reqwest::Client,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            backend: self.backend.clone(),
            publisher: self.publisher.clone(),
            http_client: self.http_client.clone(),
        }
    }
}

impl<B: Backend> AppState<B> {
    /// Initialize application state: build the shared HTTP client and the
    /// publisher on top of `backend`.
    pub fn new(config: config::AppConfig, backend: Arc<B>) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("salmonrun/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(config.hub.http_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        let publisher = hub::Publisher::new(backend.clone(), http_client.clone());

        Ok(Self {
            config: Arc::new(config),
            backend,
            publisher,
            http_client,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments. Every path that is not an
/// endpoint serves the backend's feed for that topic.
pub fn build_router<B: Backend>(state: AppState<B>) -> Router {
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", get(health_check))
        .route(xrd::hostmeta::WELL_KNOWN_PATH, get(xrd::hostmeta::handle::<B>))
        .route(xrd::webfinger::WELL_KNOWN_PATH, get(xrd::webfinger::handle::<B>))
        .route(HUB_PATH, post(hub::handle::<B>))
        .route(SALMON_PATH, post(salmon::handle::<B>))
        .fallback(get(serve_feed::<B>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the feed document for a topic URL.
async fn serve_feed<B: Backend>(
    State(state): State<AppState<B>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let topic = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let feed = state
        .backend
        .feed(&topic)
        .await
        .map_err(AppError::Internal)?;

    Ok((
        [(header::CONTENT_TYPE, feed::MEDIA_TYPE)],
        feed.to_xml(),
    )
        .into_response())
}

async fn health_check() -> &'static str {
    "OK"
}
