use std::{error, fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::watch;

use crate::storage::{KeyValueStorage, StorageError};
use crate::tokens::OAuth2Token;

/// The storage key under which Kangaroo deployments persist the session token
pub const DEFAULT_TOKEN_KEY: &str = "_kangaroo_token";

/// An error while persisting a token value
#[derive(Debug, Error)]
pub enum StoreError {
    /// The token value could not be serialized
    #[error("unable to serialize token for persistence")]
    Serialize(#[from] serde_json::Error),
    /// The durable medium rejected the write
    #[error("unable to write token to durable storage")]
    Storage(#[source] StorageError),
}

/// The persistent, observable cell holding the current session token
///
/// The store is the exclusive owner of the token value. Every write is
/// persisted to the durable medium first, and the value published to
/// observers is the round-tripped (serialized, then decoded) form, so
/// observers only ever see shapes that survive persistence. Receivers
/// obtained from [`subscribe`][TokenStore::subscribe()] replay the latest
/// value immediately.
///
/// Consumers must not cache the token across an await point. Re-read the
/// store via [`current`][TokenStore::current()] instead; a concurrent
/// refresh or logout may have replaced the value in the meantime.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    tx: watch::Sender<Option<Arc<OAuth2Token>>>,
}

impl TokenStore {
    /// Opens a store over the default Kangaroo token key
    pub async fn open(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::open_with_key(storage, DEFAULT_TOKEN_KEY).await
    }

    /// Opens a store over a custom key, hydrating from the durable medium
    ///
    /// An absent or unparsable cell hydrates as `None`. That is not an
    /// error; it is an anonymous session.
    pub async fn open_with_key(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>) -> Self {
        let key = key.into();
        let initial = match storage.load(&key).await {
            Ok(raw) => decode(raw.as_deref()),
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    key = %key,
                    "unable to hydrate token from durable storage"
                );
                None
            }
        };
        let (tx, _) = watch::channel(initial.map(Arc::new));
        Self { storage, key, tx }
    }

    /// The key this store watches in the durable medium
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Synchronously reads the latest published token value
    pub fn current(&self) -> Option<Arc<OAuth2Token>> {
        self.tx.borrow().clone()
    }

    /// Subscribes to the token value
    ///
    /// The receiver immediately holds the latest value; await
    /// [`changed`][watch::Receiver::changed()] for subsequent writes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<OAuth2Token>>> {
        self.tx.subscribe()
    }

    /// Persists and publishes a new token value
    ///
    /// `None` records an ended session. The published value is the decoded
    /// form of what was written, never the raw input.
    pub async fn set(&self, token: Option<&OAuth2Token>) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&token)?;
        self.storage
            .store(&self.key, &raw)
            .await
            .map_err(StoreError::Storage)?;

        let decoded = decode(Some(&raw));
        self.tx.send_replace(decoded.map(Arc::new));
        Ok(())
    }

    /// Applies a change made to the durable medium by another context
    ///
    /// Call this when the medium reports that `key` changed externally (for
    /// example, another process rotating a shared credentials file). If the
    /// key matches the watched key, the cell is re-read and its decoded
    /// value published without being re-written, keeping the notification
    /// path decoupled from the write path.
    pub async fn changed_externally(&self, key: &str) {
        if key != self.key {
            return;
        }

        let decoded = match self.storage.load(&self.key).await {
            Ok(raw) => decode(raw.as_deref()),
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    key = %self.key,
                    "unable to re-read token after external change"
                );
                None
            }
        };
        self.tx.send_replace(decoded.map(Arc::new));
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Decodes a raw cell value, treating absent or malformed content as no value
fn decode(raw: Option<&str>) -> Option<OAuth2Token> {
    let raw = raw?;
    match serde_json::from_str::<Option<OAuth2Token>>(raw) {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "malformed token in durable storage, treating as absent"
            );
            None
        }
    }
}
