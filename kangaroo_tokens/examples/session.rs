use std::sync::Arc;

use clap::Parser;
use kangaroo_tokens::{
    storage::FileStorage, AuthorityClient, AuthorityConfig, ClientId, LoggedInWatcher, Password,
    TokenStore,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The root URL of the authority's API
    #[arg(short, long, env)]
    api_root: reqwest::Url,

    /// The client ID presented to the authority
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The resource owner's username
    #[arg(short, long, env)]
    username: String,

    /// The resource owner's password
    #[arg(short, long, env, hide_env_values = true)]
    password: Password,

    /// The directory used to persist session tokens
    #[arg(short = 'd', long, env, default_value = ".kangaroo")]
    token_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let storage = Arc::new(FileStorage::new(opts.token_dir));
    let store = TokenStore::open(storage).await;
    let logged_in = LoggedInWatcher::spawn(&store);

    let client = reqwest::Client::builder().build()?;
    let authority = AuthorityClient::new(
        client,
        opts.api_root,
        AuthorityConfig::new(opts.client_id).with_scopes(["openid"]),
        store.clone(),
    );

    if !logged_in.is_logged_in() {
        let token = authority.login(&opts.username, &opts.password).await?;
        tracing::info!(
            token = format_args!("{:#?}", token.access_token()),
            expiry = token.expiry().0,
            "logged in"
        );
    } else {
        tracing::info!("resuming persisted session");
    }

    let details = authority.introspect(store.current().as_deref()).await?;
    tracing::info!(
        active = details.active,
        username = details.username.as_deref().unwrap_or("<unknown>"),
        scope = details.scope.as_deref().unwrap_or(""),
        "introspected session"
    );

    let refreshed = authority.refresh(store.current().as_deref()).await?;
    tracing::info!(
        token = format_args!("{:#?}", refreshed.access_token()),
        expiry = refreshed.expiry().0,
        "refreshed session"
    );

    let revoked = authority.revoke(store.current().as_deref()).await?;
    tracing::info!(revoked, logged_in = logged_in.is_logged_in(), "logged out");

    Ok(())
}
