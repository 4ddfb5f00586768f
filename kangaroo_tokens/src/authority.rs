//! A client for the Kangaroo authority's OAuth2 lifecycle endpoints
//!
//! The [`AuthorityClient`] performs the four token lifecycle operations
//! (login, refresh, introspect, revoke) against a remote authority and keeps
//! the [`TokenStore`] in sync with their outcomes. It is constructed over a
//! bare [`reqwest::Client`] rather than a middleware-wrapped one, so the
//! lifecycle calls themselves are never subject to token attachment or
//! retry-on-401 handling.
//!
//! Refreshes are coalesced per refresh credential: concurrent callers
//! holding the same credential share a single network exchange and observe
//! the identical settlement.

use std::{
    collections::HashMap,
    error, fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{header, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::clock::{Clock, System, UnixTime};
use crate::store::TokenStore;
use crate::tokens::OAuth2Token;
use crate::{ClientId, Password, RefreshToken, RefreshTokenRef};

pub mod dto;

pub use dto::TokenIntrospection;

/// A lazily-resolved source for the authority's API root
///
/// Deployments that discover the authority URL at runtime (for example,
/// from a configuration endpoint) implement this trait; a fixed
/// [`Url`] works directly. The root is resolved at most once per client.
#[async_trait]
pub trait ApiRootSource: Send + Sync {
    /// Resolves the API root off of which the lifecycle endpoints are built
    async fn resolve(&self) -> Result<Url, Box<dyn error::Error + Send + Sync + 'static>>;
}

#[async_trait]
impl ApiRootSource for Url {
    async fn resolve(&self) -> Result<Url, Box<dyn error::Error + Send + Sync + 'static>> {
        Ok(self.clone())
    }
}

/// Client configuration for the authority
#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    /// The client ID presented on every grant request
    pub client_id: ClientId,

    /// The scopes requested at login, joined with spaces on the wire
    pub scopes: Vec<String>,
}

impl AuthorityConfig {
    /// Constructs a configuration with no requested scopes
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            scopes: Vec::new(),
        }
    }

    /// Replaces the requested scope list
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    fn joined_scopes(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.join(" "))
        }
    }
}

/// An error from a token lifecycle operation
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Login was attempted without a username or password
    #[error("no login or password provided")]
    MissingCredentials,

    /// Refresh was attempted without a token or refresh credential
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The operation requires a token with an access credential and type
    #[error("empty token")]
    EmptyToken,

    /// The API root source failed to produce a root URL
    #[error("unable to resolve the authority api root")]
    RootResolution(#[source] Box<dyn error::Error + Send + Sync + 'static>),

    /// A lifecycle endpoint could not be derived from the API root
    #[error("invalid endpoint derived from the authority api root")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The request could not be sent to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),

    /// The authority answered with an error status and a body
    #[error("error response from authority: {body}")]
    ErrorWithBody {
        /// The underlying status error
        #[source]
        source: reqwest::Error,
        /// The body of the error response
        body: String,
    },

    /// The response body could not be read
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),

    /// The response body could not be deserialized
    #[error("error deserializing response from authority")]
    Decode(#[from] serde_json::Error),

    /// A coalesced refresh operation settled with an error
    ///
    /// Every caller sharing the in-flight refresh receives the same
    /// underlying error.
    #[error("token refresh failed")]
    RefreshFailed(#[source] Arc<AuthorityError>),
}

/// The lifecycle endpoints derived from the API root
#[derive(Debug)]
struct Endpoints {
    token: Url,
    introspect: Url,
    revoke: Url,
}

impl Endpoints {
    fn from_root(root: &Url) -> Result<Self, AuthorityError> {
        Ok(Self {
            token: endpoint(root, "token")?,
            introspect: endpoint(root, "introspect")?,
            revoke: endpoint(root, "revoke")?,
        })
    }
}

fn endpoint(root: &Url, leaf: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}",
        root.as_str().trim_end_matches('/'),
        leaf
    ))
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<OAuth2Token>, Arc<AuthorityError>>>>;

/// A client for the Kangaroo authority
///
/// Cloning is cheap; clones share the resolved endpoints, the refresh
/// ledger, and the token store.
#[derive(Clone)]
pub struct AuthorityClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    root: Box<dyn ApiRootSource>,
    config: AuthorityConfig,
    store: TokenStore,
    endpoints: OnceCell<Endpoints>,
    refreshes: Mutex<HashMap<RefreshToken, SharedRefresh>>,
}

impl AuthorityClient {
    /// Constructs a new client
    ///
    /// `http` should be a bare client: wrapping it in token-attaching
    /// middleware would recursively intercept the lifecycle calls.
    pub fn new(
        http: reqwest::Client,
        root: impl ApiRootSource + 'static,
        config: AuthorityConfig,
        store: TokenStore,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                root: Box::new(root),
                config,
                store,
                endpoints: OnceCell::new(),
                refreshes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The token store this client publishes lifecycle outcomes to
    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    /// Exchanges resource owner credentials for a token
    ///
    /// Fails without any network traffic when either credential is empty.
    /// On success the token is annotated with an issue date derived from
    /// the response's `Date` header and published to the store. A failed
    /// login leaves the store untouched.
    #[tracing::instrument(err, skip_all)]
    pub async fn login(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<OAuth2Token, AuthorityError> {
        if username.is_empty() || password.as_str().is_empty() {
            return Err(AuthorityError::MissingCredentials);
        }

        let endpoints = self.inner.endpoints().await?;
        let scope = self.inner.config.joined_scopes();
        let credentials = dto::PasswordCredentials {
            client_id: &self.inner.config.client_id,
            username,
            password,
            scope: scope.as_deref(),
        };

        let token = self
            .inner
            .request_token(endpoints.token.clone(), &credentials)
            .await?;

        if let Err(error) = self.inner.store.set(Some(&token)).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to persist token after login"
            );
        }

        Ok(token)
    }

    /// Exchanges a refresh credential for a new token
    ///
    /// Fails without any network traffic when the token is absent or has no
    /// refresh credential. Concurrent calls carrying the same refresh
    /// credential are coalesced into a single network exchange; every
    /// caller observes the same settlement. A successful refresh publishes
    /// the new token to the store; a failed one clears the store, ending
    /// the session.
    #[tracing::instrument(err, skip_all)]
    pub async fn refresh(
        &self,
        token: Option<&OAuth2Token>,
    ) -> Result<Arc<OAuth2Token>, AuthorityError> {
        let token = token.ok_or(AuthorityError::NoRefreshToken)?;
        let refresh_token = token
            .refresh_token()
            .ok_or(AuthorityError::NoRefreshToken)?
            .to_owned();
        let scope = token.scope().map(str::to_owned);

        // The check-then-insert must happen under one lock acquisition so
        // two callers cannot both miss and start independent exchanges.
        let operation = {
            let mut ledger = self
                .inner
                .refreshes
                .lock()
                .expect("refresh ledger poisoned");
            if let Some(operation) = ledger.get(&refresh_token) {
                tracing::debug!("joining in-flight refresh");
                operation.clone()
            } else {
                let operation = refresh_operation(&self.inner, refresh_token.clone(), scope);
                ledger.insert(refresh_token, operation.clone());
                operation
            }
        };

        operation.await.map_err(AuthorityError::RefreshFailed)
    }

    /// Asks the authority for the introspected state of a token
    ///
    /// Fails without any network traffic when the token is absent or
    /// missing its credential or type.
    #[tracing::instrument(err, skip_all)]
    pub async fn introspect(
        &self,
        token: Option<&OAuth2Token>,
    ) -> Result<TokenIntrospection, AuthorityError> {
        let token = require_presentable(token)?;
        let endpoints = self.inner.endpoints().await?;

        let response = self
            .inner
            .http
            .post(endpoints.introspect.clone())
            .header(header::AUTHORIZATION, token.authorization())
            .form(&[("token", token.access_token().as_str())])
            .send()
            .await
            .map_err(AuthorityError::RequestSend)?;

        tracing::debug!(
            response.status = response.status().as_u16(),
            "received introspection response"
        );

        if let Err(error) = response.error_for_status_ref() {
            let body = response.text().await.map_err(AuthorityError::BodyRead)?;
            return Err(AuthorityError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = response.bytes().await.map_err(AuthorityError::BodyRead)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Asks the authority to revoke a token
    ///
    /// Returns `Ok(true)` and clears the store only when the authority
    /// confirms revocation with HTTP 205. Any failure, and any other
    /// success status, leaves the store untouched.
    #[tracing::instrument(err, skip_all)]
    pub async fn revoke(&self, token: Option<&OAuth2Token>) -> Result<bool, AuthorityError> {
        let token = require_presentable(token)?;
        let endpoints = self.inner.endpoints().await?;

        let response = self
            .inner
            .http
            .post(endpoints.revoke.clone())
            .header(header::AUTHORIZATION, token.authorization())
            .form(&[("token", token.access_token().as_str())])
            .send()
            .await
            .map_err(AuthorityError::RequestSend)?;

        tracing::debug!(
            response.status = response.status().as_u16(),
            "received revocation response"
        );

        if let Err(error) = response.error_for_status_ref() {
            let body = response.text().await.map_err(AuthorityError::BodyRead)?;
            return Err(AuthorityError::ErrorWithBody {
                source: error,
                body,
            });
        }

        if response.status() != StatusCode::RESET_CONTENT {
            return Ok(false);
        }

        if let Err(error) = self.inner.store.set(None).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to clear token store after revocation"
            );
        }
        Ok(true)
    }
}

impl fmt::Debug for AuthorityClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthorityClient")
            .field("client_id", &self.inner.config.client_id)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

fn require_presentable(token: Option<&OAuth2Token>) -> Result<&OAuth2Token, AuthorityError> {
    token
        .filter(|t| !t.access_token().as_str().is_empty() && !t.token_type().is_empty())
        .ok_or(AuthorityError::EmptyToken)
}

/// Builds the shared future backing one ledger entry
///
/// The entry is evicted once the exchange settles, so a credential that is
/// refreshed again later starts a fresh exchange rather than replaying the
/// settled result.
fn refresh_operation(
    inner: &Arc<Inner>,
    refresh_token: RefreshToken,
    scope: Option<String>,
) -> SharedRefresh {
    let inner = Arc::clone(inner);
    let ledger_key = refresh_token.clone();
    async move {
        let result = inner
            .execute_refresh(&refresh_token, scope.as_deref())
            .await;

        match &result {
            Ok(token) => {
                if let Err(error) = inner.store.set(Some(token)).await {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to persist refreshed token"
                    );
                }
            }
            Err(_) => {
                if let Err(error) = inner.store.set(None).await {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to clear token store after failed refresh"
                    );
                }
            }
        }

        inner
            .refreshes
            .lock()
            .expect("refresh ledger poisoned")
            .remove(&ledger_key);

        result.map(Arc::new).map_err(Arc::new)
    }
    .boxed()
    .shared()
}

impl Inner {
    async fn endpoints(&self) -> Result<&Endpoints, AuthorityError> {
        self.endpoints
            .get_or_try_init(|| async {
                let root = self
                    .root
                    .resolve()
                    .await
                    .map_err(AuthorityError::RootResolution)?;
                tracing::debug!(api_root = %root, "resolved authority api root");
                Endpoints::from_root(&root)
            })
            .await
    }

    async fn execute_refresh(
        &self,
        refresh_token: &RefreshTokenRef,
        scope: Option<&str>,
    ) -> Result<OAuth2Token, AuthorityError> {
        let endpoints = self.endpoints().await?;
        let credentials = dto::RefreshCredentials {
            client_id: &self.config.client_id,
            refresh_token,
            scope,
        };
        self.request_token(endpoints.token.clone(), &credentials)
            .await
    }

    async fn request_token<S: Serialize>(
        &self,
        token_url: Url,
        credentials: &S,
    ) -> Result<OAuth2Token, AuthorityError> {
        tracing::trace!("requesting token from authority");

        let response = self
            .http
            .post(token_url)
            .form(credentials)
            .send()
            .await
            .map_err(AuthorityError::RequestSend)?;

        tracing::debug!(
            response.status = response.status().as_u16(),
            "received token response from issuing authority"
        );

        if let Err(error) = response.error_for_status_ref() {
            let body = response.text().await.map_err(AuthorityError::BodyRead)?;
            return Err(AuthorityError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let issue_date = issue_time_from_headers(response.headers(), &System);
        let body = response.bytes().await.map_err(AuthorityError::BodyRead)?;
        let payload: dto::TokenResponse = serde_json::from_slice(&body)?;
        let token = payload.into_token(issue_date);

        tracing::info!(
            has_refresh_token = token.refresh_token().is_some(),
            lifetime = token.expires_in().0,
            issued = token.issue_date().0,
            expiry = token.expiry().0,
            "received new token"
        );

        Ok(token)
    }
}

/// Derives a token's issue date from the response's `Date` header
///
/// An explicit two-step decode-or-default: a missing or unparsable header
/// falls back to the provided clock without masking other failures.
fn issue_time_from_headers<C: Clock>(headers: &header::HeaderMap, clock: &C) -> UnixTime {
    let parsed = headers
        .get(header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
        .and_then(|date| u64::try_from(date.timestamp()).ok());

    match parsed {
        Some(seconds) => UnixTime(seconds),
        None => clock.now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn headers_with_date(value: &str) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::DATE, value.parse().unwrap());
        headers
    }

    #[test]
    fn issue_time_uses_the_date_header() {
        let headers = headers_with_date("Wed, 21 Oct 2015 07:28:00 GMT");
        let clock = TestClock::new(UnixTime(42));
        assert_eq!(
            issue_time_from_headers(&headers, &clock),
            UnixTime(1445412480)
        );
    }

    #[test]
    fn issue_time_falls_back_to_the_clock_when_header_is_absent() {
        let headers = header::HeaderMap::new();
        let clock = TestClock::new(UnixTime(42));
        assert_eq!(issue_time_from_headers(&headers, &clock), UnixTime(42));
    }

    #[test]
    fn issue_time_falls_back_to_the_clock_when_header_is_garbage() {
        let headers = headers_with_date("not a date");
        let clock = TestClock::new(UnixTime(42));
        assert_eq!(issue_time_from_headers(&headers, &clock), UnixTime(42));
    }

    #[test]
    fn endpoints_are_derived_from_the_root() {
        let root = Url::parse("https://auth.example.com/v1/").unwrap();
        let endpoints = Endpoints::from_root(&root).unwrap();
        assert_eq!(endpoints.token.as_str(), "https://auth.example.com/v1/token");
        assert_eq!(
            endpoints.introspect.as_str(),
            "https://auth.example.com/v1/introspect"
        );
        assert_eq!(
            endpoints.revoke.as_str(),
            "https://auth.example.com/v1/revoke"
        );
    }
}
