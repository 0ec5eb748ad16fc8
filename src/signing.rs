use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the canonical byte form, hex-encoded.
pub fn sign(secret: &str, bytes: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(bytes);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, bytes: &[u8], signature: &str) -> Result<(), SyncError> {
    let raw = hex::decode(signature)
        .map_err(|_| SyncError::Auth("malformed signature".to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(bytes);
    mac.verify_slice(&raw)
        .map_err(|_| SyncError::Auth("signature mismatch".to_string()))
}
