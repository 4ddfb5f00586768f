//! DTOs for the Kangaroo authority's OAuth2 endpoints

use std::collections::HashMap;

use serde::{Deserialize, Serialize, Serializer};

use crate::clock::{DurationSecs, UnixTime};
use crate::tokens::OAuth2Token;
use crate::{AccessToken, ClientIdRef, PasswordRef, RefreshToken, RefreshTokenRef};

/// The resource owner password credentials grant payload
#[derive(Debug)]
pub(crate) struct PasswordCredentials<'a> {
    /// The client ID
    pub client_id: &'a ClientIdRef,

    /// The resource owner's username
    pub username: &'a str,

    /// The resource owner's password
    pub password: &'a PasswordRef,

    /// The space-joined scope list, omitted when empty
    pub scope: Option<&'a str>,
}

impl Serialize for PasswordCredentials<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("PasswordCredentials", 5)?;
        ser.serialize_field("grant_type", "password")?;
        ser.serialize_field("client_id", &self.client_id)?;
        ser.serialize_field("username", &self.username)?;
        ser.serialize_field("password", &self.password)?;
        if let Some(scope) = self.scope {
            ser.serialize_field("scope", scope)?;
        } else {
            ser.skip_field("scope")?;
        }
        ser.end()
    }
}

/// The refresh token grant payload
#[derive(Debug)]
pub(crate) struct RefreshCredentials<'a> {
    /// The client ID
    pub client_id: &'a ClientIdRef,

    /// The refresh token being exchanged
    pub refresh_token: &'a RefreshTokenRef,

    /// The scope list carried over from the refreshed token
    pub scope: Option<&'a str>,
}

impl Serialize for RefreshCredentials<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshCredentials", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("client_id", &self.client_id)?;
        ser.serialize_field("refresh_token", &self.refresh_token)?;
        if let Some(scope) = self.scope {
            ser.serialize_field("scope", scope)?;
        } else {
            ser.skip_field("scope")?;
        }
        ser.end()
    }
}

/// The wire shape of a successful token response
///
/// The issue date is not part of this payload; it is derived from the
/// response's `Date` header when the token is constructed.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    pub token_type: String,
    pub expires_in: DurationSecs,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Combines the wire payload with the derived issue date
    pub fn into_token(self, issue_date: UnixTime) -> OAuth2Token {
        let mut token = OAuth2Token::new(
            self.access_token,
            self.token_type,
            issue_date,
            self.expires_in,
        );
        if let Some(refresh_token) = self.refresh_token {
            token = token.with_refresh_token(refresh_token);
        }
        if let Some(scope) = self.scope {
            token = token.with_scope(scope);
        }
        token
    }
}

/// The introspected state of a token, per RFC 7662
///
/// Only `active` is required. When introspection fails or no token is
/// present, consumers fall back to [`TokenIntrospection::inactive`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenIntrospection {
    /// Whether the presented token is currently active
    pub active: bool,

    /// The space-separated scope list associated with this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// The client the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// A human-readable identifier for the resource owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// The type of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// When the token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<UnixTime>,

    /// When the token was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<UnixTime>,

    /// The time before which the token must not be used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<UnixTime>,

    /// The subject of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// The intended audience of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// The issuer of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// The token's unique identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Any extension members reported by the authority
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TokenIntrospection {
    /// The fallback value reported when introspection cannot be performed
    pub fn inactive() -> Self {
        Self::default()
    }
}
