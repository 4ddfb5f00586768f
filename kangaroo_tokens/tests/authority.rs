use std::{sync::Arc, time::Duration};

use kangaroo_tokens::{
    clock::{Clock, DurationSecs, System, UnixTime},
    storage::MemoryStorage,
    AccessToken, AuthorityClient, AuthorityConfig, AuthorityError, ClientId, OAuth2Token,
    Password, RefreshToken, TokenStore,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn open_store() -> TokenStore {
    TokenStore::open(Arc::new(MemoryStorage::new())).await
}

fn authority(server: &MockServer, store: TokenStore) -> AuthorityClient {
    AuthorityClient::new(
        reqwest::Client::new(),
        reqwest::Url::parse(&server.uri()).expect("mock server uri"),
        AuthorityConfig::new(ClientId::from_static("admin-ui"))
            .with_scopes(["openid", "profile"]),
        store,
    )
}

fn refreshable_token() -> OAuth2Token {
    OAuth2Token::new(
        AccessToken::from_static("old-access"),
        "Bearer",
        System.now(),
        DurationSecs(3600),
    )
    .with_refresh_token(RefreshToken::from_static("refresh-1"))
    .with_scope("openid profile")
}

fn token_body(access: &str, refresh: &str) -> serde_json::Value {
    json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 600,
        "refresh_token": refresh,
        "scope": "openid profile",
    })
}

#[tokio::test]
async fn login_posts_a_password_grant_and_stores_the_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("client_id=admin-ui"))
        .and(body_string_contains("username=admin"))
        .and(body_string_contains("password=hunter2"))
        .and(body_string_contains("scope=openid+profile"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Date", "Wed, 21 Oct 2015 07:28:00 GMT")
                .set_body_json(token_body("new-access", "refresh-1")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store.clone());

    let token = authority
        .login("admin", &Password::from_static("hunter2"))
        .await
        .expect("login should succeed");

    // the issue date comes from the response's Date header
    assert_eq!(token.issue_date(), UnixTime(1445412480));
    assert_eq!(token.access_token().as_str(), "new-access");

    let stored = store.current().expect("token should be in the store");
    assert_eq!(*stored, token);
}

#[tokio::test]
async fn login_with_empty_credentials_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store.clone());

    let no_user = authority.login("", &Password::from_static("hunter2")).await;
    let no_password = authority.login("admin", &Password::from_static("")).await;

    assert!(matches!(no_user, Err(AuthorityError::MissingCredentials)));
    assert!(matches!(
        no_password,
        Err(AuthorityError::MissingCredentials)
    ));
    assert!(store.current().is_none());
}

#[tokio::test]
async fn failed_login_leaves_the_store_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    store.set(Some(&refreshable_token())).await.unwrap();
    let authority = authority(&server, store.clone());

    let result = authority
        .login("admin", &Password::from_static("wrong"))
        .await;

    assert!(matches!(
        result,
        Err(AuthorityError::ErrorWithBody { ref body, .. }) if body == "bad credentials"
    ));
    assert!(store.current().is_some());
}

#[tokio::test]
async fn refresh_exchanges_the_refresh_credential() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("scope=openid+profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(
            "new-access",
            "refresh-2",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store.clone());
    let old = refreshable_token();

    let token = authority
        .refresh(Some(&old))
        .await
        .expect("refresh should succeed");

    assert_eq!(token.access_token().as_str(), "new-access");
    assert_eq!(
        token.refresh_token().map(|rt| rt.as_str()),
        Some("refresh-2")
    );
    assert_eq!(*store.current().unwrap(), *token);
}

#[tokio::test]
async fn refresh_without_a_credential_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);

    let absent = authority.refresh(None).await;
    assert!(matches!(absent, Err(AuthorityError::NoRefreshToken)));

    let bare = OAuth2Token::new(
        AccessToken::from_static("access"),
        "Bearer",
        System.now(),
        DurationSecs(600),
    );
    let no_credential = authority.refresh(Some(&bare)).await;
    assert!(matches!(no_credential, Err(AuthorityError::NoRefreshToken)));
}

#[tokio::test]
async fn concurrent_refreshes_share_one_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(100))
                .set_body_json(token_body("new-access", "refresh-2")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);
    let old = refreshable_token();

    let (a, b) = tokio::join!(authority.refresh(Some(&old)), authority.refresh(Some(&old)));

    let a = a.expect("first caller should succeed");
    let b = b.expect("second caller should succeed");
    assert_eq!(a.access_token().as_str(), "new-access");
    assert_eq!(a, b);
}

#[tokio::test]
async fn settled_refreshes_are_evicted_from_the_ledger() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(
            "new-access",
            "refresh-2",
        )))
        .expect(2)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);
    let old = refreshable_token();

    authority.refresh(Some(&old)).await.expect("first refresh");
    // same credential again after settlement starts a fresh exchange
    authority.refresh(Some(&old)).await.expect("second refresh");
}

#[tokio::test]
async fn failed_refresh_clears_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let old = refreshable_token();
    store.set(Some(&old)).await.unwrap();
    let authority = authority(&server, store.clone());

    let result = authority.refresh(Some(&old)).await;

    assert!(matches!(result, Err(AuthorityError::RefreshFailed(_))));
    assert!(store.current().is_none());
}

#[tokio::test]
async fn coalesced_callers_observe_the_same_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_delay(Duration::from_millis(100))
                .set_body_string("invalid_grant"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);
    let old = refreshable_token();

    let (a, b) = tokio::join!(authority.refresh(Some(&old)), authority.refresh(Some(&old)));

    assert!(matches!(a, Err(AuthorityError::RefreshFailed(_))));
    assert!(matches!(b, Err(AuthorityError::RefreshFailed(_))));
}

#[tokio::test]
async fn introspect_presents_the_token_for_inspection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .and(header("Authorization", "Bearer old-access"))
        .and(body_string_contains("token=old-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "sub": "user-1",
            "scope": "openid profile",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);

    let details = authority
        .introspect(Some(&refreshable_token()))
        .await
        .expect("introspection should succeed");

    assert!(details.active);
    assert_eq!(details.sub.as_deref(), Some("user-1"));
    assert_eq!(details.scope.as_deref(), Some("openid profile"));
}

#[tokio::test]
async fn introspect_requires_a_presentable_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = open_store().await;
    let authority = authority(&server, store);

    let result = authority.introspect(None).await;
    assert!(matches!(result, Err(AuthorityError::EmptyToken)));
}

#[tokio::test]
async fn revoke_clears_the_store_on_reset_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .and(header("Authorization", "Bearer old-access"))
        .and(body_string_contains("token=old-access"))
        .respond_with(ResponseTemplate::new(205))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let token = refreshable_token();
    store.set(Some(&token)).await.unwrap();
    let authority = authority(&server, store.clone());

    let revoked = authority
        .revoke(Some(&token))
        .await
        .expect("revocation should succeed");

    assert!(revoked);
    assert!(store.current().is_none());
}

#[tokio::test]
async fn failed_revocation_leaves_the_store_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let token = refreshable_token();
    store.set(Some(&token)).await.unwrap();
    let authority = authority(&server, store.clone());

    let result = authority.revoke(Some(&token)).await;

    assert!(matches!(
        result,
        Err(AuthorityError::ErrorWithBody { .. })
    ));
    assert!(store.current().is_some());
}

#[tokio::test]
async fn non_reset_success_does_not_end_the_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = open_store().await;
    let token = refreshable_token();
    store.set(Some(&token)).await.unwrap();
    let authority = authority(&server, store.clone());

    let revoked = authority.revoke(Some(&token)).await.unwrap();

    assert!(!revoked);
    assert!(store.current().is_some());
}
