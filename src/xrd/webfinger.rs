//! WebFinger: per-resource descriptor lookup under `/.well-known/webfinger`.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use url::Url;

use super::{Error, Resource, client, handler};
use crate::{AppState, Backend as ServerBackend};

/// Well-known path of the WebFinger endpoint.
pub const WELL_KNOWN_PATH: &str = "/.well-known/webfinger";

/// LRDD template pointing at the WebFinger endpoint.
pub const WELL_KNOWN_PATH_TEMPLATE: &str = "/.well-known/webfinger?resource={uri}";

/// Serves descriptors for the resources this server knows about.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Looks up the descriptor for `uri`. `rels` narrows the requested link
    /// relations; an empty slice asks for all of them. Returns
    /// [`Error::NoSuchResource`] for unknown resources.
    async fn resource(&self, uri: &str, rels: &[String]) -> Result<Resource, Error>;
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    #[serde(default)]
    resource: String,
}

/// GET /.well-known/webfinger?resource=<uri>
pub async fn handle<B: ServerBackend>(
    State(state): State<AppState<B>>,
    Query(query): Query<ResourceQuery>,
    headers: HeaderMap,
) -> Response {
    let result = state.backend.resource(&query.resource, &[]).await;
    handler::serve(&headers, result)
}

/// Queries a remote host's WebFinger endpoint for `resource_uri`.
pub async fn get(
    client: &reqwest::Client,
    host: &str,
    resource_uri: &str,
) -> Result<Resource, Error> {
    let mut url = Url::parse(&format!("https://{host}{WELL_KNOWN_PATH}"))?;
    url.query_pairs_mut().append_pair("resource", resource_uri);
    client::get(client, url.as_str()).await
}
