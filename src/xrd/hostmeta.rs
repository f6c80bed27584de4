//! Web host metadata: the descriptor served at `/.well-known/host-meta`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use super::{Link, Resource, client, handler, lrdd, webfinger};
use crate::{AppState, Backend};

/// Well-known path of the host metadata document.
pub const WELL_KNOWN_PATH: &str = "/.well-known/host-meta";

/// Builds the host metadata descriptor for a server rooted at `root_url`:
/// a single `lrdd` link pointing subscribers at the WebFinger endpoint.
pub fn resource(root_url: &str) -> Resource {
    Resource {
        links: vec![Link {
            rel: lrdd::REL.to_string(),
            media_type: Some(handler::CONTENT_TYPE_JRD.to_string()),
            template: Some(format!(
                "{}{}",
                root_url.trim_end_matches('/'),
                webfinger::WELL_KNOWN_PATH_TEMPLATE
            )),
            ..Link::default()
        }],
        ..Resource::default()
    }
}

/// GET /.well-known/host-meta
pub async fn handle<B: Backend>(State(state): State<AppState<B>>, headers: HeaderMap) -> Response {
    handler::serve(&headers, Ok(resource(&state.config.server.base_url())))
}

/// Fetches a host's metadata document.
pub async fn get(client: &reqwest::Client, host: &str) -> Result<Resource, super::Error> {
    client::get(client, &format!("https://{host}{WELL_KNOWN_PATH}")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exposes_the_webfinger_template() {
        let resource = resource("http://example.com");
        let link = resource.link(lrdd::REL).expect("lrdd link");
        assert_eq!(
            link.template.as_deref(),
            Some("http://example.com/.well-known/webfinger?resource={uri}")
        );
    }

    #[test]
    fn trailing_slash_does_not_double_up() {
        let resource = resource("http://example.com/");
        let link = resource.link(lrdd::REL).unwrap();
        assert_eq!(
            link.template.as_deref(),
            Some("http://example.com/.well-known/webfinger?resource={uri}")
        );
    }
}
