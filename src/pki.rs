//! Public key discovery for envelope verification.
//!
//! An author's account URI resolves to a descriptor over LRDD; the
//! descriptor's `magic-public-key` link carries the key as a data URL.

use thiserror::Error;

use crate::codec::{self, PublicKey};
use crate::xrd::{self, Resource};

/// The magic-public-key link relation.
pub const REL_MAGIC_PUBLIC_KEY: &str = "magic-public-key";

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing magic-public-key link")]
    MissingKeyLink,

    #[error(transparent)]
    Key(#[from] codec::Error),

    #[error(transparent)]
    Discovery(#[from] xrd::Error),
}

/// Extracts a resource's public key from its descriptor.
pub fn resource_public_key(resource: &Resource) -> Result<PublicKey, Error> {
    let link = resource
        .link(REL_MAGIC_PUBLIC_KEY)
        .ok_or(Error::MissingKeyLink)?;
    Ok(codec::parse_public_key_data_url(
        link.href.as_deref().unwrap_or_default(),
    )?)
}

/// Resolves account URIs to public keys with LRDD discovery.
///
/// Keys are looked up per request; callers that need caching layer it on
/// top.
#[derive(Clone)]
pub struct KeyResolver {
    client: reqwest::Client,
}

impl KeyResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches the public key for `account_uri`.
    pub async fn public_key(&self, account_uri: &str) -> Result<PublicKey, Error> {
        let resource = xrd::lrdd::get(&self.client, account_uri).await?;
        resource_public_key(&resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrd::Link;

    #[test]
    fn extracts_the_key_from_a_descriptor() {
        let key_text = "RSA.mVgY8RN6URBTstndvmUUPb4UZTdwvwmddSKE5z_jvKUEK6yk1u3rrC9yN8k6FilGj9K0eeUPe2hf4Pj-5CmHww.AQAB";
        let resource = Resource {
            subject: Some("acct:bob@example.com".to_string()),
            links: vec![Link {
                rel: REL_MAGIC_PUBLIC_KEY.to_string(),
                href: Some(format!("data:application/magic-public-key,{key_text}")),
                ..Link::default()
            }],
            ..Resource::default()
        };

        let key = resource_public_key(&resource).expect("key extracts");
        assert_eq!(codec::format_public_key(&key), key_text);
    }

    #[test]
    fn missing_link_is_an_error() {
        assert!(matches!(
            resource_public_key(&Resource::default()),
            Err(Error::MissingKeyLink)
        ));
    }

    #[test]
    fn malformed_data_url_is_an_error() {
        let resource = Resource {
            links: vec![Link {
                rel: REL_MAGIC_PUBLIC_KEY.to_string(),
                href: Some("https://example.com/key.pem".to_string()),
                ..Link::default()
            }],
            ..Resource::default()
        };
        assert!(matches!(
            resource_public_key(&resource),
            Err(Error::Key(codec::Error::NotKeyDataUrl))
        ));
    }
}
