//! Streams derived from the token store
//!
//! Route guards and navigation logic want a replay-latest view of "are we
//! logged in" and of the token's introspected claims, without every
//! consumer re-deriving them. Each watcher here spawns a background task
//! that follows the [`TokenStore`] and republishes the derived value on a
//! [`watch`] channel of its own.

use std::sync::Arc;

use tokio::sync::watch;

use crate::authority::{AuthorityClient, TokenIntrospection};
use crate::clock::{Clock, System};
use crate::store::TokenStore;
use crate::tokens;

/// A replay-latest view of whether a live session exists
///
/// The value is recomputed from the validity evaluator on every store
/// emission, so an explicit logout and a refresh failure both drive it to
/// `false` as soon as the store clears.
#[derive(Clone, Debug)]
pub struct LoggedInWatcher {
    rx: watch::Receiver<bool>,
}

impl LoggedInWatcher {
    /// Spawns a watcher following the given store on the system clock
    pub fn spawn(store: &TokenStore) -> Self {
        Self::spawn_with_clock(store, System)
    }

    /// Spawns a watcher using the given clock
    pub fn spawn_with_clock<C>(store: &TokenStore, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        let mut token_rx = store.subscribe();
        let initial = tokens::is_valid_at(store.current().as_deref(), clock.now());
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(async move {
            while token_rx.changed().await.is_ok() {
                let logged_in = {
                    let token = token_rx.borrow_and_update();
                    tokens::is_valid_at(token.as_deref(), clock.now())
                };
                if tx.send(logged_in).is_err() {
                    tracing::debug!("no logged-in listeners remain, halting");
                    break;
                }
            }
        });

        Self { rx }
    }

    /// The latest derived value
    pub fn is_logged_in(&self) -> bool {
        *self.rx.borrow()
    }

    /// Subscribes to the derived value
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// A replay-latest view of the current token's introspected claims
///
/// Every store emission triggers one introspection call. When the call
/// fails, or when no token is present, the published value falls back to
/// [`TokenIntrospection::inactive`] rather than surfacing an error.
#[derive(Clone, Debug)]
pub struct IntrospectionWatcher {
    rx: watch::Receiver<Arc<TokenIntrospection>>,
}

impl IntrospectionWatcher {
    /// Spawns a watcher introspecting every value the store emits
    pub fn spawn(store: &TokenStore, authority: AuthorityClient) -> Self {
        let mut token_rx = store.subscribe();
        let (tx, rx) = watch::channel(Arc::new(TokenIntrospection::inactive()));

        tokio::spawn(async move {
            loop {
                let token = token_rx.borrow_and_update().clone();
                let details = match authority.introspect(token.as_deref()).await {
                    Ok(details) => details,
                    Err(error) => {
                        tracing::debug!(
                            error = (&error as &dyn std::error::Error),
                            "introspection failed, reporting inactive"
                        );
                        TokenIntrospection::inactive()
                    }
                };
                if tx.send(Arc::new(details)).is_err() {
                    tracing::debug!("no introspection listeners remain, halting");
                    break;
                }
                if token_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        Self { rx }
    }

    /// The latest introspected details
    pub fn current(&self) -> Arc<TokenIntrospection> {
        self.rx.borrow().clone()
    }

    /// Subscribes to the introspected details
    pub fn subscribe(&self) -> watch::Receiver<Arc<TokenIntrospection>> {
        self.rx.clone()
    }
}

/// Route-guard predicate: permits navigation only with a live session
pub fn require_logged_in(store: &TokenStore) -> bool {
    tokens::is_valid(store.current().as_deref())
}

/// Route-guard predicate: permits navigation only without a live session
pub fn require_logged_out(store: &TokenStore) -> bool {
    !require_logged_in(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DurationSecs, UnixTime};
    use crate::storage::MemoryStorage;
    use crate::tokens::OAuth2Token;
    use crate::AccessToken;

    fn valid_token() -> OAuth2Token {
        OAuth2Token::new(
            AccessToken::from_static("access-token"),
            "Bearer",
            System.now(),
            DurationSecs(3600),
        )
    }

    fn expired_token() -> OAuth2Token {
        OAuth2Token::new(
            AccessToken::from_static("access-token"),
            "Bearer",
            UnixTime(0),
            DurationSecs(1),
        )
    }

    #[tokio::test]
    async fn logged_in_follows_the_store() {
        let store = TokenStore::open(Arc::new(MemoryStorage::new())).await;
        let watcher = LoggedInWatcher::spawn(&store);
        let mut rx = watcher.subscribe();

        assert!(!watcher.is_logged_in());

        store.set(Some(&valid_token())).await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        store.set(None).await.unwrap();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn an_expired_token_is_not_a_session() {
        let store = TokenStore::open(Arc::new(MemoryStorage::new())).await;
        store.set(Some(&expired_token())).await.unwrap();

        let watcher = LoggedInWatcher::spawn(&store);

        assert!(!watcher.is_logged_in());
    }

    #[tokio::test]
    async fn guards_evaluate_the_current_store_value() {
        let store = TokenStore::open(Arc::new(MemoryStorage::new())).await;
        assert!(!require_logged_in(&store));
        assert!(require_logged_out(&store));

        store.set(Some(&valid_token())).await.unwrap();
        assert!(require_logged_in(&store));
        assert!(!require_logged_out(&store));
    }
}
