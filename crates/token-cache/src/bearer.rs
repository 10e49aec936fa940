//! Bearer token payload decoding
//!
//! A self-describing bearer token is a JWT-shaped string: three dot-separated
//! segments whose middle segment is base64-encoded JSON carrying the claims.
//! The cache only reads the numeric `exp` claim; signatures are never
//! verified — expiry tracking is the sole concern here.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use crate::error::{Error, Result};

/// Extract the `exp` claim (unix seconds) from a three-segment bearer token.
///
/// Fails with `InvalidToken` when the token is empty, has a segment count
/// other than 3, or its payload does not decode to JSON; fails with
/// `MissingExpiry` when the claims carry no numeric `exp`.
pub(crate) fn expiry_claim(token: &str) -> Result<f64> {
    if token.is_empty() {
        return Err(Error::InvalidToken("empty token".into()));
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::InvalidToken(format!(
            "expected 3 dot-separated segments, found {}",
            segments.len()
        )));
    }

    let payload = decode_segment(segments[1])?;
    let claims: serde_json::Value = serde_json::from_str(&payload)
        .map_err(|e| Error::InvalidToken(format!("payload is not valid JSON: {e}")))?;

    claims
        .get("exp")
        .and_then(serde_json::Value::as_f64)
        .ok_or(Error::MissingExpiry)
}

/// Decode one base64 segment into UTF-8 text.
///
/// Padding is optional in the wild: the segment is padded with `=` up to a
/// multiple-of-4 length before decoding. Tokens minted with the URL-safe
/// alphabet (standard for JWTs) are accepted alongside the standard alphabet.
fn decode_segment(segment: &str) -> Result<String> {
    let mut padded = String::from(segment);
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = match STANDARD.decode(&padded) {
        Ok(bytes) => bytes,
        // When the fallback fails too, report the standard-alphabet error:
        // it names the first failure
        Err(primary) => URL_SAFE_NO_PAD
            .decode(segment.trim_end_matches('='))
            .map_err(|_| Error::InvalidToken(format!("payload is not valid base64: {primary}")))?,
    };

    String::from_utf8(bytes)
        .map_err(|e| Error::InvalidToken(format!("payload is not valid UTF-8: {e}")))
}
