use rust_sso_service::api::start_webserver;
use rust_sso_service::config::load_config_or_panic;
use rust_sso_service::oauth2::OAuth2State;
use rust_sso_service::store::MemoryStore;
use rust_sso_service::tokens::{TokenKeys, TokenService};
use sea_orm::Database;
use std::fs;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "rust_sso_service=info,tower_http=info,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    initialize_tracing();

    // .env is optional, config.yaml + environment is the source of truth
    dotenvy::dotenv().ok();
    let config = load_config_or_panic();

    let private_pem = fs::read(&config.jwt.private_key_path)?;
    let public_pem = fs::read(&config.jwt.public_key_path)?;
    let previous_pem = config
        .jwt
        .previous_public_key_path
        .as_ref()
        .map(fs::read)
        .transpose()?;
    let keys = TokenKeys::from_pem(&private_pem, &public_pem, previous_pem.as_deref())?;

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .expect("Failed to connect to database"),
    );

    let store = Arc::new(MemoryStore::new());
    let tokens = TokenService::new(keys, store.clone(), config.issuer_url.clone(), &config.jwt);
    let state = OAuth2State::new(db, store, tokens, &config);

    start_webserver(state, &config.bind_addr).await?;
    Ok(())
}
