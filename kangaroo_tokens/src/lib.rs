//! Token lifecycle management for clients of the Kangaroo authorization
//! service
//!
//! This library keeps a client application's OAuth2 session in one place:
//! a persistent, observable [`TokenStore`] that owns the current token, an
//! [`AuthorityClient`] that performs the lifecycle operations (login,
//! refresh, introspect, revoke) against the authority and publishes their
//! outcomes to the store, and derived watchers that downstream logic such
//! as route guards can follow.
//!
//! Two behaviors carry most of the weight:
//!
//! * Token validity is computed from an issue date derived from the
//!   authority's `Date` response header, not from the local clock at the
//!   time the response happened to be decoded.
//! * Refreshes are coalesced per refresh credential. However many callers
//!   notice an expired session at once, a given refresh credential is
//!   exchanged over the network exactly once, and every caller observes
//!   the identical settlement.
//!
//! # Getting started
//!
//! Open a store over a durable medium, then construct a client for the
//! authority. The [`reqwest::Client`] handed to the authority should be a
//! bare one: the lifecycle calls must bypass any token-attaching
//! middleware.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kangaroo_tokens::{
//!     storage::FileStorage, AuthorityClient, AuthorityConfig, ClientId, Password, TokenStore,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(FileStorage::new(".kangaroo".into()));
//! let store = TokenStore::open(storage).await;
//!
//! let authority = AuthorityClient::new(
//!     reqwest::Client::new(),
//!     reqwest::Url::parse("https://auth.example.com/v1")?,
//!     AuthorityConfig::new(ClientId::from_static("admin-ui")).with_scopes(["openid"]),
//!     store.clone(),
//! );
//!
//! let token = authority
//!     .login("admin", &Password::from_static("hunter2"))
//!     .await?;
//!
//! tracing::info!(expiry = token.expiry().0, "logged in");
//! # Ok(())
//! # }
//! ```
//!
//! Consumers should treat the store as the single source of truth and
//! re-read it rather than holding a token across an await point; a
//! concurrent refresh may have replaced the value.
//!
//! # Features
//!
//! * `file` (default): provides [`storage::FileStorage`], a file-per-key
//!   durable medium suitable for sharing a session between processes on
//!   the same filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
mod braids;
pub mod clock;
pub mod storage;
mod store;
mod tokens;
pub mod watchers;

pub use authority::{
    ApiRootSource, AuthorityClient, AuthorityConfig, AuthorityError, TokenIntrospection,
};
pub use braids::*;
pub use store::{StoreError, TokenStore, DEFAULT_TOKEN_KEY};
pub use tokens::{is_expired, is_expired_at, is_valid, is_valid_at, OAuth2Token};
pub use watchers::{IntrospectionWatcher, LoggedInWatcher};
