use renovi_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, RefreshToken};

/// An access token and its paired refresh token as issued by the authority
///
/// The lifetimes are relative to the instant the pair was received. The token
/// manager converts them into absolute instants exactly once, at receipt;
/// they are never reinterpreted later.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenPair {
    /// The access token
    pub access_token: AccessToken,
    /// The refresh token
    pub refresh_token: RefreshToken,
    /// Seconds until the access token expires, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
    /// Seconds until the refresh token expires, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<DurationSecs>,
}

impl TokenPair {
    /// Constructs a pair with no reported lifetimes
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in: None,
            refresh_expires_in: None,
        }
    }

    /// Sets the reported access token lifetime
    #[must_use]
    pub fn with_expires_in(mut self, expires_in: DurationSecs) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Sets the reported refresh token lifetime
    #[must_use]
    pub fn with_refresh_expires_in(mut self, refresh_expires_in: DurationSecs) -> Self {
        self.refresh_expires_in = Some(refresh_expires_in);
        self
    }

    /// The absolute access token expiry for a pair received at `received_at`
    ///
    /// A reported lifetime takes priority over whatever the token itself may
    /// claim; the token's own `exp` claim is only consulted in its absence.
    /// A reported lifetime of zero is treated as unreported.
    pub fn access_expiry(&self, received_at: UnixTime) -> Option<UnixTime> {
        self.expires_in
            .filter(|ttl| *ttl > DurationSecs::ZERO)
            .map(|ttl| received_at + ttl)
            .or_else(|| crate::jwt::expiry_of(self.access_token.as_str()))
    }

    /// The absolute refresh token expiry for a pair received at `received_at`
    pub fn refresh_expiry(&self, received_at: UnixTime) -> Option<UnixTime> {
        self.refresh_expires_in
            .filter(|ttl| *ttl > DurationSecs::ZERO)
            .map(|ttl| received_at + ttl)
            .or_else(|| crate::jwt::expiry_of(self.refresh_token.as_str()))
    }
}

/// Configuration for when a proactive refresh should be attempted
///
/// The effective lead time is `min(proactive_offset, ttl * max_offset_fraction)`,
/// so short-lived tokens are refreshed proportionally early rather than
/// immediately. The resulting delay never drops below `min_refresh_delay`,
/// which keeps a pathological lifetime from producing a refresh spin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefreshScheduleConfig {
    /// How far ahead of expiry to refresh (default: 300 seconds)
    pub proactive_offset: DurationSecs,
    /// Ceiling on the lead time as a fraction of the lifetime (default: 0.8)
    pub max_offset_fraction: f64,
    /// Minimum delay before any proactive refresh fires (default: 10 seconds)
    pub min_refresh_delay: DurationSecs,
}

impl Default for RefreshScheduleConfig {
    fn default() -> Self {
        Self {
            proactive_offset: DurationSecs(300),
            max_offset_fraction: 0.8,
            min_refresh_delay: DurationSecs(10),
        }
    }
}

impl RefreshScheduleConfig {
    /// The delay before a proactive refresh of a token with the given lifetime
    pub fn proactive_delay(&self, ttl: DurationSecs) -> DurationSecs {
        let offset = self.proactive_offset.min(ttl * self.max_offset_fraction);
        (ttl - offset).max(self.min_refresh_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lifetimes_refresh_a_fixed_offset_early() {
        let config = RefreshScheduleConfig::default();
        assert_eq!(config.proactive_delay(DurationSecs(3600)), DurationSecs(3300));
    }

    #[test]
    fn short_lifetimes_cap_the_offset_by_fraction() {
        let config = RefreshScheduleConfig::default();
        // offset = min(300, 100 * 0.8) = 80
        assert_eq!(config.proactive_delay(DurationSecs(100)), DurationSecs(20));
    }

    #[test]
    fn delay_never_drops_below_the_floor() {
        let config = RefreshScheduleConfig::default();
        assert_eq!(config.proactive_delay(DurationSecs(5)), DurationSecs(10));
        assert_eq!(config.proactive_delay(DurationSecs::ZERO), DurationSecs(10));
    }

    #[test]
    fn reported_lifetime_beats_the_token_expiry_claim() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let jwt = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"exp":5000}"#),
        );
        let pair = TokenPair::new(
            AccessToken::new(jwt),
            RefreshToken::from_static("refresh"),
        )
        .with_expires_in(DurationSecs(100));

        assert_eq!(pair.access_expiry(UnixTime(1000)), Some(UnixTime(1100)));
    }

    #[test]
    fn token_expiry_claim_is_the_fallback() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let jwt = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"exp":5000}"#),
        );
        let pair = TokenPair::new(
            AccessToken::new(jwt),
            RefreshToken::from_static("refresh"),
        );

        assert_eq!(pair.access_expiry(UnixTime(1000)), Some(UnixTime(5000)));
        assert_eq!(pair.refresh_expiry(UnixTime(1000)), None);
    }

    #[test]
    fn zero_lifetime_is_treated_as_unreported() {
        let pair = TokenPair::new(
            AccessToken::from_static("opaque"),
            RefreshToken::from_static("refresh"),
        )
        .with_expires_in(DurationSecs::ZERO);

        assert_eq!(pair.access_expiry(UnixTime(1000)), None);
    }
}
