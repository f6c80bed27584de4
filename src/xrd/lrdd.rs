//! Link-based resource descriptor discovery.
//!
//! Resolves an arbitrary resource URI to its descriptor: take the host from
//! the URI, fetch that host's metadata, find the `lrdd` link and expand its
//! URI template with the resource URI.

use url::Url;

use super::{Error, Resource, client, hostmeta};

/// The LRDD link relation.
pub const REL: &str = "lrdd";

/// Expands `{uri}` occurrences in an LRDD template.
pub fn execute_template(template: &str, resource_uri: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(resource_uri.as_bytes()).collect();
    template.replace("{uri}", &encoded)
}

fn host_for(resource_uri: &str) -> Result<String, Error> {
    let parsed = Url::parse(resource_uri)?;
    if let Some(host) = parsed.host_str() {
        return Ok(match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        });
    }

    // Opaque URIs like acct:user@host carry the host after the @.
    parsed
        .path()
        .split_once('@')
        .map(|(_, host)| host.to_string())
        .ok_or(Error::NoHost)
}

/// Retrieves the descriptor for `resource_uri`.
pub async fn get(client: &reqwest::Client, resource_uri: &str) -> Result<Resource, Error> {
    let host = host_for(resource_uri)?;
    let host_meta = hostmeta::get(client, &host).await?;

    let link = host_meta.link(REL).ok_or(Error::MissingLink(REL))?;
    let template = link.template.as_deref().unwrap_or_default();
    client::get(client, &execute_template(template, resource_uri)).await
}
