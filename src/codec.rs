//! Base64url codec and the magic public key textual format.
//!
//! The envelope ecosystem uses unpadded base64url for almost everything, but
//! signature-input fields are padded, and remote implementations disagree on
//! padding when they emit envelopes. The decoder therefore accepts both
//! variants and ignores embedded whitespace.

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix of a magic public key data URL.
///
/// The parser accepts only this exact prefix; general data URL syntax
/// (media type parameters, base64 payloads) is not supported.
pub const KEY_DATA_URL_PREFIX: &str = "data:application/magic-public-key,";

/// Errors produced by the key codec.
#[derive(Debug, Error)]
pub enum Error {
    /// The key type segment is not one this codec understands.
    #[error("unknown key type")]
    UnknownKeyType,

    /// The key text has the wrong shape or encodes an unusable key.
    #[error("malformed public key")]
    MalformedKey,

    /// A segment is not valid base64url, padded or not.
    #[error("invalid base64url data: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The string does not start with [`KEY_DATA_URL_PREFIX`].
    #[error("not a magic public key data URL")]
    NotKeyDataUrl,
}

/// A public key in one of the formats the magic-key codec understands.
///
/// Only RSA is defined today; the enum keeps the textual codec honest about
/// the key types it supports.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
}

/// Encodes `data` as unpadded base64url.
pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decodes base64url `data`, stripping all whitespace first.
///
/// Unpadded input is tried first; padded input is accepted as a fallback
/// because some remote implementations pad where the wire format says not to.
pub fn decode(data: &str) -> Result<Vec<u8>, Error> {
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    match URL_SAFE_NO_PAD.decode(compact.as_bytes()) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(URL_SAFE.decode(compact.as_bytes())?),
    }
}

/// Padded base64url, used only when building signature input strings.
pub(crate) fn encode_padded(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// Formats a public key into the `application/magic-key` textual form,
/// `RSA.<n>.<e>` with big-endian unsigned integers in unpadded base64url.
pub fn format_public_key(key: &PublicKey) -> String {
    match key {
        PublicKey::Rsa(key) => format!(
            "RSA.{}.{}",
            encode(&key.n().to_bytes_be()),
            encode(&key.e().to_bytes_be())
        ),
    }
}

/// Parses a public key from the `application/magic-key` textual form.
pub fn parse_public_key(text: &str) -> Result<PublicKey, Error> {
    let segments: Vec<&str> = text.split('.').collect();
    if !segments[0].eq_ignore_ascii_case("RSA") {
        return Err(Error::UnknownKeyType);
    }
    if segments.len() != 3 {
        return Err(Error::MalformedKey);
    }

    let n = BigUint::from_bytes_be(&decode(segments[1])?);
    let e = BigUint::from_bytes_be(&decode(segments[2])?);
    RsaPublicKey::new(n, e)
        .map(PublicKey::Rsa)
        .map_err(|_| Error::MalformedKey)
}

/// Returns the key identifier used to label signatures: the unpadded
/// base64url of SHA-256 over the magic-key text.
pub fn public_key_id(key: &PublicKey) -> String {
    encode(Sha256::digest(format_public_key(key).as_bytes()).as_slice())
}

/// Returns the data URL form of a public key.
pub fn public_key_data_url(key: &PublicKey) -> String {
    format!("{}{}", KEY_DATA_URL_PREFIX, format_public_key(key))
}

/// Parses a public key data URL.
pub fn parse_public_key_data_url(url: &str) -> Result<PublicKey, Error> {
    let text = url.strip_prefix(KEY_DATA_URL_PREFIX).ok_or(Error::NotKeyDataUrl)?;
    parse_public_key(text)
}
