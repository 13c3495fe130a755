//! Webhook signature verification
//!
//! Deliveries carry `X-Signature: sha256=<hex>`, an HMAC-SHA256 of the raw
//! body keyed with the tenant's webhook secret. Comparison is constant time.
//!
//! Request lookups have no body, so they sign `"{timestamp}\n{path}"`
//! instead and must always send the timestamp header.

use crate::error::{Error, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Optional header carrying the send time in unix seconds
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Check `signature` (hex, optionally `sha256=`-prefixed) against `body`
pub fn verify(body: &[u8], signature: &str, secret: &str) -> bool {
    let hex_sig = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or_else(|| signature.trim());

    let expected = match hex::decode(hex_sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Produce the header value a sender would attach to `body`
pub fn sign(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Sign a lookup of `path` sent at `timestamp` (unix seconds)
pub fn sign_lookup(timestamp: &str, path: &str, secret: &str) -> Result<String> {
    sign(lookup_message(timestamp, path).as_bytes(), secret)
}

/// Check a lookup signature; a path or timestamp change invalidates it
pub fn verify_lookup(timestamp: &str, path: &str, signature: &str, secret: &str) -> bool {
    verify(lookup_message(timestamp, path).as_bytes(), signature, secret)
}

fn lookup_message(timestamp: &str, path: &str) -> String {
    format!("{}\n{}", timestamp.trim(), path)
}

/// Reject deliveries whose timestamp header is outside `tolerance_secs` of now
pub fn check_timestamp(header: &str, tolerance_secs: i64) -> Result<()> {
    let sent: i64 = header.trim().parse().map_err(|_| Error::StaleTimestamp)?;
    let skew = (Utc::now().timestamp() - sent).abs();
    if skew > tolerance_secs {
        return Err(Error::StaleTimestamp);
    }
    Ok(())
}
