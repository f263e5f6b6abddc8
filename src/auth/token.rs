// JWT helpers for the automatic refresh timer

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Read the `exp` claim from a JWT without verifying it.
/// Returns `None` for anything that is not a three-part token with a numeric `exp`.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// How long to wait before refreshing: `lead` ahead of expiry, never negative
pub fn refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    lead: std::time::Duration,
) -> std::time::Duration {
    let lead = chrono::Duration::from_std(lead).unwrap_or(chrono::Duration::zero());
    (expires_at - lead - now)
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}

/// Short prefix of a token for logs
pub fn preview(token: &str) -> String {
    let end = token
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    format!("{}...", &token[..end])
}

#[cfg(test)]
pub(crate) fn make_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"reader","exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}
