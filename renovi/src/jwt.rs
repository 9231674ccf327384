//! Best-effort JWT payload inspection
//!
//! Tokens are otherwise opaque strings; the only property this module cares
//! about is the numeric `exp` claim, used as a fallback when the token
//! authority did not report an explicit lifetime. Nothing here validates
//! signatures, and nothing here panics on malformed input.

use base64::Engine;
use renovi_clock::{Clock, DurationSecs, UnixTime};
use serde::Deserialize;

/// The claims of a decoded JWT payload
#[derive(Clone, Debug, Deserialize)]
pub struct Claims {
    /// The expiry instant, if the token carries one
    #[serde(default)]
    pub exp: Option<UnixTime>,
    /// All remaining payload fields, untyped
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Decodes the payload segment of a JWT without validating it
///
/// Returns `None` for anything that is not a three-segment token with a
/// base64url JSON object in the middle.
pub fn decode(token: &str) -> Option<Claims> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let _signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }

    serde_json::from_slice(&decode_segment(payload)?).ok()
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};

    // Tolerate both padded and unpadded encoders
    URL_SAFE_NO_PAD
        .decode(segment)
        .or_else(|_| URL_SAFE.decode(segment))
        .ok()
}

/// The expiry instant claimed by the token, if decodable
pub fn expiry_of(token: &str) -> Option<UnixTime> {
    decode(token)?.exp
}

/// Whether the token is expired at `now`, expiring `offset` seconds early
///
/// A token whose expiry cannot be determined is treated as already expired.
pub fn is_expired_at(token: &str, now: UnixTime, offset: DurationSecs) -> bool {
    match expiry_of(token) {
        Some(exp) => now + offset >= exp,
        None => true,
    }
}

/// Whether the token is expired according to the given clock
pub fn is_expired(token: &str, clock: &impl Clock, offset: DurationSecs) -> bool {
    is_expired_at(token, clock.now(), offset)
}

/// Seconds remaining until expiry at `now`; zero when expired or unknown
pub fn seconds_until_expiry_at(token: &str, now: UnixTime) -> DurationSecs {
    match expiry_of(token) {
        Some(exp) => exp - now,
        None => DurationSecs::ZERO,
    }
}

/// Seconds remaining until expiry according to the given clock
pub fn seconds_until_expiry(token: &str, clock: &impl Clock) -> DurationSecs {
    seconds_until_expiry_at(token, clock.now())
}
