use serde::{Deserialize, Serialize};

use crate::clock::{Clock, DurationSecs, System, UnixTime};
use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// A token issued by the Kangaroo authorization server
///
/// The issue date is not part of the server's response body. It is derived
/// from the response's `Date` header by the authority client, so expiry math
/// does not depend on the local clock agreeing with the server's.
///
/// Tokens round-trip through JSON for persistence. A stored token that is
/// missing its issue date or lifetime deserializes with those values zeroed,
/// which makes it evaluate as already expired rather than raising an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Token {
    access_token: AccessToken,
    token_type: String,
    #[serde(default)]
    issue_date: UnixTime,
    #[serde(default)]
    expires_in: DurationSecs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl OAuth2Token {
    /// Constructs a token from its required parts
    pub fn new(
        access_token: AccessToken,
        token_type: impl Into<String>,
        issue_date: UnixTime,
        expires_in: DurationSecs,
    ) -> Self {
        Self {
            access_token,
            token_type: token_type.into(),
            issue_date,
            expires_in,
            refresh_token: None,
            scope: None,
        }
    }

    /// Attaches a refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Attaches a space-delimited scope list
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the token's type, usually `Bearer`
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Gets the time the token was issued
    #[inline]
    pub fn issue_date(&self) -> UnixTime {
        self.issue_date
    }

    /// Gets the token's lifetime
    #[inline]
    pub fn expires_in(&self) -> DurationSecs {
        self.expires_in
    }

    /// Gets the refresh token, if one was granted
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the granted scope list, space-delimited, if one was reported
    #[inline]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Gets the time at which the token expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.issue_date + self.expires_in
    }

    /// The value of an `Authorization` header carrying this token
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.as_str())
    }

    /// Whether the token would still be valid as of the provided time
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        time < self.expiry()
    }

    /// Whether the token is valid according to the provided clock
    #[inline]
    pub fn is_valid_with_clock<C: Clock>(&self, clock: &C) -> bool {
        self.is_valid_at(clock.now())
    }

    /// Whether the token is valid right now
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.is_valid_with_clock(&System)
    }

    /// Logical negation of [`is_valid_at`][Self::is_valid_at()]
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        !self.is_valid_at(time)
    }

    /// Logical negation of [`is_valid`][Self::is_valid()]
    #[inline]
    pub fn is_expired(&self) -> bool {
        !self.is_valid()
    }
}

/// Whether a possibly-absent token would be valid as of the provided time
///
/// An absent token is never valid.
#[inline]
pub fn is_valid_at(token: Option<&OAuth2Token>, time: UnixTime) -> bool {
    token.map_or(false, |t| t.is_valid_at(time))
}

/// Whether a possibly-absent token is valid right now
#[inline]
pub fn is_valid(token: Option<&OAuth2Token>) -> bool {
    is_valid_at(token, System.now())
}

/// Logical negation of [`is_valid_at`]
#[inline]
pub fn is_expired_at(token: Option<&OAuth2Token>, time: UnixTime) -> bool {
    !is_valid_at(token, time)
}

/// Logical negation of [`is_valid`]
#[inline]
pub fn is_expired(token: Option<&OAuth2Token>) -> bool {
    !is_valid(token)
}
