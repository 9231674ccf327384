//! A refresh transport speaking to an OAuth2-style token endpoint
//!
//! The endpoint's request and response shapes vary between authorities, so
//! both are driven by a declarative [`FieldMapping`] rather than hard-coded
//! names.

use serde_json::{Map, Value};

use super::RefreshTransport;
use crate::{
    error::{AuthError, BoxError},
    tokens::TokenPair,
    AccessToken, ClientId, ClientSecret, RefreshToken, RefreshTokenRef,
};
use async_trait::async_trait;
use renovi_clock::DurationSecs;

/// Field names used when talking to the token endpoint
#[derive(Clone, Debug)]
pub struct FieldMapping {
    /// Value sent as `grant_type`, omitted when `None` (default: `refresh_token`)
    pub grant_type: Option<String>,
    /// Request parameter carrying the refresh token (default: `refresh_token`)
    pub refresh_token_param: String,
    /// Response field carrying the access token (default: `access_token`)
    pub access_token_field: String,
    /// Response field carrying the rotated refresh token (default: `refresh_token`)
    pub refresh_token_field: String,
    /// Response field carrying the access token lifetime (default: `expires_in`)
    pub expires_in_field: String,
    /// Response field carrying the refresh token lifetime (default: `refresh_expires_in`)
    pub refresh_expires_in_field: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            grant_type: Some(String::from("refresh_token")),
            refresh_token_param: String::from("refresh_token"),
            access_token_field: String::from("access_token"),
            refresh_token_field: String::from("refresh_token"),
            expires_in_field: String::from("expires_in"),
            refresh_expires_in_field: String::from("refresh_expires_in"),
        }
    }
}

/// How the refresh request body is encoded
#[derive(Clone, Copy, Debug)]
pub enum BodyStyle {
    /// `application/json`
    Json,
    /// `application/x-www-form-urlencoded`
    Form,
}

/// Client credentials presented alongside the refresh token
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,
    /// The client secret
    pub client_secret: ClientSecret,
}

/// A refresh transport backed by an HTTP token endpoint
#[derive(Clone, Debug)]
pub struct HttpRefreshTransport {
    client: reqwest::Client,
    token_url: reqwest::Url,
    revocation_url: Option<reqwest::Url>,
    credentials: Option<ClientCredentials>,
    mapping: FieldMapping,
    style: BodyStyle,
}

impl HttpRefreshTransport {
    /// Constructs a transport posting JSON to the given token endpoint
    pub fn new(client: reqwest::Client, token_url: reqwest::Url) -> Self {
        Self {
            client,
            token_url,
            revocation_url: None,
            credentials: None,
            mapping: FieldMapping::default(),
            style: BodyStyle::Json,
        }
    }

    /// Presents client credentials with each refresh
    #[must_use]
    pub fn with_credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Overrides the request and response field names
    #[must_use]
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Overrides the request body encoding
    #[must_use]
    pub fn with_body_style(mut self, style: BodyStyle) -> Self {
        self.style = style;
        self
    }

    /// Enables best-effort revocation against the given endpoint
    #[must_use]
    pub fn with_revocation_url(mut self, revocation_url: reqwest::Url) -> Self {
        self.revocation_url = Some(revocation_url);
        self
    }

    fn request_body(&self, refresh_token: &RefreshTokenRef) -> Map<String, Value> {
        let mut body = Map::new();
        if let Some(grant_type) = &self.mapping.grant_type {
            body.insert(String::from("grant_type"), Value::from(grant_type.as_str()));
        }
        body.insert(
            self.mapping.refresh_token_param.clone(),
            Value::from(refresh_token.as_str()),
        );
        if let Some(credentials) = &self.credentials {
            body.insert(
                String::from("client_id"),
                Value::from(credentials.client_id.as_str()),
            );
            body.insert(
                String::from("client_secret"),
                Value::from(credentials.client_secret.as_str()),
            );
        }
        body
    }

    fn post(&self, url: reqwest::Url, body: &Map<String, Value>) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match self.style {
            BodyStyle::Json => request.json(body),
            BodyStyle::Form => request.form(body),
        }
    }
}

fn classify_status(status: reqwest::StatusCode) -> AuthError {
    // A 401 or 403 from the token endpoint means the refresh token itself
    // was not accepted, not that the caller lacked permission.
    match status.as_u16() {
        401 | 403 => AuthError::Unauthorized,
        status => AuthError::ServerError { status },
    }
}

fn parse_token_response(
    payload: &Value,
    mapping: &FieldMapping,
    current_refresh: &RefreshTokenRef,
) -> Result<TokenPair, AuthError> {
    let access_token = payload
        .get(&mapping.access_token_field)
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(|token| AccessToken::new(token.to_owned()))
        .ok_or_else(|| {
            AuthError::token_invalid(format!(
                "token response is missing `{}`",
                mapping.access_token_field
            ))
        })?;

    // Authorities that do not rotate refresh tokens omit the field; the
    // presented token stays valid in that case.
    let refresh_token = payload
        .get(&mapping.refresh_token_field)
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(|token| RefreshToken::new(token.to_owned()))
        .unwrap_or_else(|| current_refresh.to_owned());

    let expires_in = payload
        .get(&mapping.expires_in_field)
        .and_then(Value::as_u64)
        .map(DurationSecs);
    let refresh_expires_in = payload
        .get(&mapping.refresh_expires_in_field)
        .and_then(Value::as_u64)
        .map(DurationSecs);

    Ok(TokenPair {
        access_token,
        refresh_token,
        expires_in,
        refresh_expires_in,
    })
}

#[async_trait]
impl RefreshTransport for HttpRefreshTransport {
    #[tracing::instrument(
        level = "debug",
        name = "refresh_token_exchange",
        skip_all,
        fields(url = %self.token_url)
    )]
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, BoxError> {
        let body = self.request_body(refresh_token);
        let response = self
            .post(self.token_url.clone(), &body)
            .send()
            .await
            .map_err(AuthError::network)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                "token endpoint rejected the refresh"
            );
            return Err(classify_status(status).into());
        }

        let payload: Value = response.json().await.map_err(|error| {
            AuthError::token_invalid(format!("token response was not valid JSON: {error}"))
        })?;

        let pair = parse_token_response(&payload, &self.mapping, refresh_token)?;
        tracing::debug!(
            expires_in = pair.expires_in.map(|d| d.0),
            rotated = pair.refresh_token.as_str() != refresh_token.as_str(),
            "token endpoint issued a fresh pair"
        );
        Ok(pair)
    }

    async fn revoke(&self, refresh_token: &RefreshTokenRef) -> Result<(), BoxError> {
        let Some(revocation_url) = &self.revocation_url else {
            return Ok(());
        };

        let mut body = Map::new();
        body.insert(String::from("token"), Value::from(refresh_token.as_str()));
        if let Some(credentials) = &self.credentials {
            body.insert(
                String::from("client_id"),
                Value::from(credentials.client_id.as_str()),
            );
        }

        let response = self
            .post(revocation_url.clone(), &body)
            .send()
            .await
            .map_err(AuthError::network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_refresh() -> &'static RefreshTokenRef {
        RefreshTokenRef::from_str("current-refresh")
    }

    #[test]
    fn parses_a_standard_token_response() {
        let payload = serde_json::json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 3600,
            "refresh_expires_in": 86400,
        });

        let pair =
            parse_token_response(&payload, &FieldMapping::default(), current_refresh()).unwrap();
        assert_eq!(pair.access_token.as_str(), "new-access");
        assert_eq!(pair.refresh_token.as_str(), "new-refresh");
        assert_eq!(pair.expires_in, Some(DurationSecs(3600)));
        assert_eq!(pair.refresh_expires_in, Some(DurationSecs(86400)));
    }

    #[test]
    fn missing_rotation_falls_back_to_the_presented_refresh_token() {
        let payload = serde_json::json!({
            "access_token": "new-access",
            "expires_in": 3600,
        });

        let pair =
            parse_token_response(&payload, &FieldMapping::default(), current_refresh()).unwrap();
        assert_eq!(pair.refresh_token.as_str(), "current-refresh");
        assert_eq!(pair.refresh_expires_in, None);
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let payload = serde_json::json!({ "access_token": "" });

        let err = parse_token_response(&payload, &FieldMapping::default(), current_refresh())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TokenInvalid);
    }

    #[test]
    fn custom_field_mapping_is_honored() {
        let mapping = FieldMapping {
            access_token_field: String::from("jwt"),
            refresh_token_field: String::from("renewal"),
            expires_in_field: String::from("ttl"),
            ..FieldMapping::default()
        };
        let payload = serde_json::json!({
            "jwt": "new-access",
            "renewal": "new-refresh",
            "ttl": 120,
        });

        let pair = parse_token_response(&payload, &mapping, current_refresh()).unwrap();
        assert_eq!(pair.access_token.as_str(), "new-access");
        assert_eq!(pair.refresh_token.as_str(), "new-refresh");
        assert_eq!(pair.expires_in, Some(DurationSecs(120)));
    }

    #[test]
    fn token_endpoint_statuses_classify_structurally() {
        use crate::error::ErrorKind;

        assert_eq!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::FORBIDDEN).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY).kind(),
            ErrorKind::ServerError
        );
    }

    #[test]
    fn request_body_includes_credentials_and_grant_type() {
        let transport = HttpRefreshTransport::new(
            reqwest::Client::new(),
            "https://auth.example.com/token".parse().unwrap(),
        )
        .with_credentials(ClientCredentials {
            client_id: ClientId::from_static("client-1"),
            client_secret: ClientSecret::from_static("hush"),
        });

        let body = transport.request_body(current_refresh());
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["refresh_token"], "current-refresh");
        assert_eq!(body["client_id"], "client-1");
        assert_eq!(body["client_secret"], "hush");
    }
}
