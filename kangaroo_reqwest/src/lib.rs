//! Middleware to automatically attach bearer tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`BearerAuthMiddleware`] in the middleware stack to present
//! the current token held by a [`TokenStore`] on each outbound request.
//!
//! When the backend answers `401 Unauthorized`, the middleware asks its
//! [`AuthorityClient`] to refresh the session and replays the request once
//! with the refreshed token. A failed refresh ends the session and the
//! original `401` response is returned unchanged, so callers observe the
//! authorization failure rather than a synthetic error.
//!
//! If a request already has an `Authorization` header value by the time
//! the middleware executes, the existing value is left in place, allowing
//! overrides to be specified as required.
//!
//! ```
//! use kangaroo_reqwest::BearerAuthMiddleware;
//! use kangaroo_tokens::{storage::MemoryStorage, AuthorityClient, AuthorityConfig, ClientId, TokenStore};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! # use std::sync::Arc;
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let store = TokenStore::open(Arc::new(MemoryStorage::new())).await;
//! # let authority = AuthorityClient::new(
//! #     Client::new(),
//! #     reqwest::Url::parse("https://auth.example.com/v1").unwrap(),
//! #     AuthorityConfig::new(ClientId::from_static("admin-ui")),
//! #     store.clone(),
//! # );
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(BearerAuthMiddleware::new(store, authority))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to attach the token only
//! conditionally, which matters when one middleware stack talks to several
//! backends and the session token must only ever reach its own API.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use kangaroo_reqwest::{BearerAuthMiddleware, HttpsOnly, SameOrigin};
//! use predicates::prelude::PredicateBooleanExt;
//! # use kangaroo_tokens::{storage::MemoryStorage, AuthorityClient, AuthorityConfig, ClientId, TokenStore};
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let store = TokenStore::open(Arc::new(MemoryStorage::new())).await;
//! # let api_root = reqwest::Url::parse("https://api.example.com/v1").unwrap();
//! # let authority = AuthorityClient::new(
//! #     reqwest::Client::new(),
//! #     api_root.clone(),
//! #     AuthorityConfig::new(ClientId::from_static("admin-ui")),
//! #     store.clone(),
//! # );
//!
//! BearerAuthMiddleware::new(store, authority)
//!     .with_predicate(HttpsOnly.and(SameOrigin::new(&api_root)));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use kangaroo_tokens::{AuthorityClient, OAuth2Token, TokenStore};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next, Result};

/// A middleware that injects the current session token into outgoing
/// requests and retries once on `401 Unauthorized`
#[derive(Clone, Debug)]
pub struct BearerAuthMiddleware<P> {
    store: TokenStore,
    authority: AuthorityClient,
    predicate: P,
}

impl BearerAuthMiddleware<HttpsOnly> {
    /// Construct a new middleware over a token store and authority client
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(store: TokenStore, authority: AuthorityClient) -> Self {
        Self {
            store,
            authority,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> BearerAuthMiddleware<P> {
        BearerAuthMiddleware {
            store: self.store,
            authority: self.authority,
            predicate,
        }
    }
}

fn bearer_header(token: &OAuth2Token) -> header::HeaderValue {
    let authorization = token.authorization();
    let mut header_value = BytesMut::with_capacity(authorization.len());
    header_value.put_slice(authorization.as_bytes());
    let mut value =
        header::HeaderValue::from_maybe_shared(header_value).expect("only valid header bytes");
    value.set_sensitive(true);
    value
}

#[async_trait::async_trait]
impl<P> Middleware for BearerAuthMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        let token = self.store.current();
        if kangaroo_tokens::is_valid(token.as_deref()) {
            if let Some(token) = token.as_deref() {
                tracing::trace!(
                    token.issued = token.issue_date().0,
                    token.expiry = token.expiry().0,
                    "attaching session token"
                );
                req.headers_mut()
                    .entry(header::AUTHORIZATION)
                    .or_insert_with(|| bearer_header(token));
            }
        }

        // Captured before the send consumes the request; a streaming body
        // cannot be cloned and such requests are never replayed.
        let retry_req = req.try_clone();
        let response = next.clone().run(req, extensions).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (Some(mut retry_req), Some(token)) = (retry_req, token) else {
            return Ok(response);
        };

        match self.authority.refresh(Some(&token)).await {
            Ok(refreshed) => {
                tracing::debug!("replaying unauthorized request with refreshed token");
                retry_req
                    .headers_mut()
                    .insert(header::AUTHORIZATION, bearer_header(&refreshed));
                next.run(retry_req, extensions).await
            }
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::debug!(error, "session refresh failed, returning the original response");
                Ok(response)
            }
        }
    }
}

/// Only attach a session token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach a session token if the request shares an origin with the
/// configured API root
///
/// Origin comparison covers the scheme, the host, and the port, with
/// scheme-default ports treated as equal to an explicit port.
#[derive(Clone, Debug)]
pub struct SameOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl SameOrigin {
    /// Construct a new predicate from the URL whose origin requests must share
    pub fn new(url: &Url) -> Self {
        Self {
            scheme: url.scheme().to_owned(),
            host: url.host_str().unwrap_or_default().to_owned(),
            port: url.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        let url = req.url();
        url.scheme() == self.scheme
            && url.host_str() == Some(self.host.as_str())
            && url.port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin == {}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
