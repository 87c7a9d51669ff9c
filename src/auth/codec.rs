// Token payload decoding (no signature verification)

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde_json::Value;

use super::types::Claims;
use crate::error::AuthError;

/// base64url that accepts the payload with or without `=` padding
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the payload segment of a `header.payload.signature` token.
///
/// Only reads `exp` and `user_id`; the signature is the issuer's concern.
pub fn decode(token: &str) -> Result<Claims, AuthError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(AuthError::Decode(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let bytes = PAYLOAD_ENGINE
        .decode(segments[1])
        .map_err(|e| AuthError::Decode(format!("payload is not base64url: {}", e)))?;

    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Decode(format!("payload is not JSON: {}", e)))?;

    let exp = match payload.get("exp") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.floor() as i64))
            .ok_or_else(|| AuthError::Decode("exp out of range".to_string()))?,
        Some(_) => return Err(AuthError::Decode("exp is not a number".to_string())),
        None => return Err(AuthError::Decode("missing exp claim".to_string())),
    };

    let subject = match payload.get("user_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    Ok(Claims { exp, subject })
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(12).collect();
    format!("{}...", prefix)
}

/// Build an unsigned token carrying the given payload
#[cfg(any(test, feature = "test-utils"))]
pub fn encode_unsigned(payload: &Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.sig", header, body)
}
