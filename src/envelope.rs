//! Magic envelope: a signed message container with XML and JSON carriers.
//!
//! An envelope bundles a payload (base64url, with a declared media type)
//! together with one or more RSA-SHA256 signatures over a keyed signature
//! base string. The JSON carrier flattens the data pair into the envelope
//! object (`data` / `data_type` as siblings of `encoding` and `alg`), which
//! is a surprising asymmetry with the XML carrier but required for interop.

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use thiserror::Error;

use crate::codec::{self, PublicKey};

/// XML namespace of the envelope carrier.
pub const XML_NAMESPACE: &str = "http://salmon-protocol.org/ns/magic-env";

/// The only payload encoding defined by the format.
pub const ENCODING_BASE64URL: &str = "base64url";

/// The only signature algorithm defined by the format.
pub const ALG_RSA_SHA256: &str = "RSA-SHA256";

/// Errors produced when building, parsing or verifying envelopes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no signature in envelope")]
    NoSignature,

    #[error("unknown signature algorithm {0:?}")]
    UnknownAlg(String),

    #[error("cannot sign an envelope with two different algorithms")]
    AlgConflict,

    #[error("unknown envelope encoding {0:?}")]
    UnknownEncoding(String),

    #[error("signature verification failed")]
    Verification,

    #[error(transparent)]
    Key(#[from] codec::Error),

    #[error("signing failed: {0}")]
    Sign(rsa::Error),

    #[error("malformed envelope: {0}")]
    Xml(String),

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// A magic envelope: a message bundled with signatures over that message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MagicEnvelope {
    pub data: MagicData,
    pub encoding: String,
    pub alg: String,
    pub sigs: Vec<MagicSig>,
}

/// The payload of an envelope: a media type and a base64url value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MagicData {
    pub media_type: String,
    pub value: String,
}

/// A single signature entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MagicSig {
    #[serde(default)]
    pub key_id: String,
    pub value: String,
}

impl MagicEnvelope {
    /// Creates an envelope carrying `payload` and signs it with `key`.
    pub fn create(media_type: &str, payload: &[u8], key: &RsaPrivateKey) -> Result<Self, Error> {
        let mut envelope = MagicEnvelope {
            data: MagicData {
                media_type: media_type.to_string(),
                value: codec::encode(payload),
            },
            encoding: ENCODING_BASE64URL.to_string(),
            alg: String::new(),
            sigs: Vec::new(),
        };
        envelope.sign(key)?;
        Ok(envelope)
    }

    /// Appends a signature made with `key`.
    ///
    /// Fails if the envelope is already signed with a different algorithm.
    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<(), Error> {
        if !self.alg.is_empty() && self.alg != ALG_RSA_SHA256 {
            return Err(Error::AlgConflict);
        }
        self.alg = ALG_RSA_SHA256.to_string();

        let hashed = self.compute_hash();
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .map_err(Error::Sign)?;

        let public = PublicKey::Rsa(key.to_public_key());
        self.sigs.push(MagicSig {
            key_id: codec::public_key_id(&public),
            value: codec::encode(&signature),
        });
        Ok(())
    }

    /// Returns the envelope's message without checking any signature.
    pub fn unverified_data(&self) -> Result<Vec<u8>, Error> {
        match self.encoding.as_str() {
            ENCODING_BASE64URL => Ok(codec::decode(&self.data.value)?),
            other => Err(Error::UnknownEncoding(other.to_string())),
        }
    }

    /// Checks that the envelope is signed with `key`.
    ///
    /// Signatures are tried in order. A plain verification failure moves on
    /// to the next signature; any other error (malformed base64, unknown
    /// algorithm) aborts. The last error is returned when nothing matches.
    pub fn verify(&self, key: &PublicKey) -> Result<(), Error> {
        if self.sigs.is_empty() {
            return Err(Error::NoSignature);
        }

        let mut last = Error::NoSignature;
        for sig in &self.sigs {
            match self.verify_signature(key, &sig.value) {
                Ok(()) => return Ok(()),
                Err(error @ Error::Verification) => last = error,
                Err(error) => return Err(error),
            }
        }
        Err(last)
    }

    fn verify_signature(&self, key: &PublicKey, signature: &str) -> Result<(), Error> {
        let raw = codec::decode(signature)?;
        let hashed = self.compute_hash();

        if !self.alg.eq_ignore_ascii_case(ALG_RSA_SHA256) {
            return Err(Error::UnknownAlg(self.alg.clone()));
        }
        let PublicKey::Rsa(key) = key;
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &raw)
            .map_err(|_| Error::Verification)
    }

    /// The signature base string hashes the data value as it appears on the
    /// wire (unpadded base64url) joined with the *padded* base64url of the
    /// media type, encoding and algorithm strings. The mixed padding is
    /// required for interop with existing implementations.
    fn compute_hash(&self) -> Vec<u8> {
        let base = format!(
            "{}.{}.{}.{}",
            self.data.value,
            codec::encode_padded(self.data.media_type.as_bytes()),
            codec::encode_padded(self.encoding.as_bytes()),
            codec::encode_padded(self.alg.as_bytes()),
        );
        Sha256::digest(base.as_bytes()).as_slice().to_vec()
    }

    /// Parses the XML carrier. Namespace prefixes are ignored, so both
    /// `<me:env>` and `<env>` forms are accepted; chardata is kept verbatim
    /// because the data value participates in the signature base string.
    pub fn from_xml(input: &str) -> Result<Self, Error> {
        #[derive(Clone)]
        enum Field {
            Data,
            Encoding,
            Alg,
            Sig { key_id: String },
        }

        let mut reader = Reader::from_str(input);
        let mut envelope = MagicEnvelope::default();
        let mut seen_root = false;
        let mut current: Option<Field> = None;
        let mut text = String::new();

        loop {
            match reader.read_event().map_err(|e| Error::Xml(e.to_string()))? {
                XmlEvent::Start(start) => {
                    text.clear();
                    current = match start.local_name().as_ref() {
                        b"env" => {
                            seen_root = true;
                            None
                        }
                        b"data" => {
                            envelope.data.media_type = attribute(&start, b"type")?;
                            Some(Field::Data)
                        }
                        b"encoding" => Some(Field::Encoding),
                        b"alg" => Some(Field::Alg),
                        b"sig" => Some(Field::Sig {
                            key_id: attribute(&start, b"key_id")?,
                        }),
                        _ => None,
                    };
                }
                XmlEvent::Text(chunk) => {
                    if current.is_some() {
                        text.push_str(&chunk.unescape().map_err(|e| Error::Xml(e.to_string()))?);
                    }
                }
                XmlEvent::CData(chunk) => {
                    if current.is_some() {
                        text.push_str(
                            std::str::from_utf8(&chunk.into_inner())
                                .map_err(|e| Error::Xml(e.to_string()))?,
                        );
                    }
                }
                XmlEvent::End(_) => match current.take() {
                    Some(Field::Data) => envelope.data.value = std::mem::take(&mut text),
                    Some(Field::Encoding) => envelope.encoding = std::mem::take(&mut text),
                    Some(Field::Alg) => envelope.alg = std::mem::take(&mut text),
                    Some(Field::Sig { key_id }) => envelope.sigs.push(MagicSig {
                        key_id,
                        value: std::mem::take(&mut text),
                    }),
                    None => {}
                },
                XmlEvent::Empty(start) => match start.local_name().as_ref() {
                    b"data" => envelope.data.media_type = attribute(&start, b"type")?,
                    b"sig" => envelope.sigs.push(MagicSig {
                        key_id: attribute(&start, b"key_id")?,
                        value: String::new(),
                    }),
                    _ => {}
                },
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(Error::Xml("missing env element".to_string()));
        }
        Ok(envelope)
    }

    /// Serializes the XML carrier with the envelope namespace as default.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = write!(out, "<env xmlns=\"{XML_NAMESPACE}\">");
        let _ = write!(
            out,
            "<data type=\"{}\">{}</data>",
            escape(&self.data.media_type),
            escape(&self.data.value)
        );
        let _ = write!(out, "<encoding>{}</encoding>", escape(&self.encoding));
        let _ = write!(out, "<alg>{}</alg>", escape(&self.alg));
        for sig in &self.sigs {
            if sig.key_id.is_empty() {
                let _ = write!(out, "<sig>{}</sig>", escape(&sig.value));
            } else {
                let _ = write!(
                    out,
                    "<sig key_id=\"{}\">{}</sig>",
                    escape(&sig.key_id),
                    escape(&sig.value)
                );
            }
        }
        out.push_str("</env>");
        out
    }

    /// Parses the JSON carrier.
    pub fn from_json(input: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(input)?)
    }
}

fn attribute(start: &BytesStart<'_>, name: &[u8]) -> Result<String, Error> {
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| Error::Xml(e.to_string()))?;
        if attribute.key.local_name().as_ref() == name {
            return Ok(attribute
                .unescape_value()
                .map_err(|e| Error::Xml(e.to_string()))?
                .into_owned());
        }
    }
    Ok(String::new())
}

/// JSON carrier shape: the data pair is flattened into the envelope object.
#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    data: String,
    data_type: String,
    encoding: String,
    alg: String,
    #[serde(default)]
    sigs: Vec<MagicSig>,
}

impl Serialize for MagicEnvelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EnvelopeJson {
            data: self.data.value.clone(),
            data_type: self.data.media_type.clone(),
            encoding: self.encoding.clone(),
            alg: self.alg.clone(),
            sigs: self.sigs.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MagicEnvelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let carrier = EnvelopeJson::deserialize(deserializer)?;
        Ok(MagicEnvelope {
            data: MagicData {
                media_type: carrier.data_type,
                value: carrier.data,
            },
            encoding: carrier.encoding,
            alg: carrier.alg,
            sigs: carrier.sigs,
        })
    }
}
