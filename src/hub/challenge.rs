//! Random token generation for verification handshakes.
//!
//! Challenges double as HMAC secrets on the subscriber side, so the source
//! must be a cryptographic RNG.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::codec;

const CHALLENGE_LEN: usize = 32;

/// Returns 32 random bytes as unpadded base64url.
pub fn generate() -> Result<String, rand::Error> {
    let mut bytes = [0u8; CHALLENGE_LEN];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(codec::encode(&bytes))
}
