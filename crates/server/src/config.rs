use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Signing key material and token lifetimes.
#[derive(Clone, Debug, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    /// Previous public key, kept valid during key rotation so in-flight
    /// tokens keep verifying.
    #[serde(default)]
    pub previous_public_key_path: Option<String>,
    #[serde(default = "default_access_token_ttl_secs")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_token_ttl_secs")]
    pub refresh_token_ttl_secs: u64,
    #[serde(default = "default_id_token_ttl_secs")]
    pub id_token_ttl_secs: u64,
}

/// Ceilings for the abuse guard. All counters share one window length.
#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_login_per_account")]
    pub login_per_account: u64,
    #[serde(default = "default_login_per_ip")]
    pub login_per_ip: u64,
    #[serde(default = "default_authorize_per_ip")]
    pub authorize_per_ip: u64,
    #[serde(default = "default_token_per_client")]
    pub token_per_client: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            login_per_account: default_login_per_account(),
            login_per_ip: default_login_per_ip(),
            authorize_per_ip: default_authorize_per_ip(),
            token_per_client: default_token_per_client(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Base URL of this server; used as `iss` in tokens and in the discovery
    /// document.
    pub issuer_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_authorization_code_ttl_secs")]
    pub authorization_code_ttl_secs: u64,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_authorization_code_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_access_token_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_refresh_token_ttl_secs() -> u64 {
    86400 * 7 // 7 days
}

fn default_id_token_ttl_secs() -> u64 {
    3600
}

fn default_rate_window_secs() -> u64 {
    300 // 5 minutes
}

fn default_login_per_account() -> u64 {
    5
}

fn default_login_per_ip() -> u64 {
    20
}

fn default_authorize_per_ip() -> u64 {
    30
}

fn default_token_per_client() -> u64 {
    60
}

fn validate(app: &AppConfig) -> Result<(), ConfigError> {
    if url::Url::parse(&app.issuer_url).is_err() {
        return Err(ConfigError::Validation(
            "issuer_url must be an absolute URL".into(),
        ));
    }
    if app.issuer_url.ends_with('/') {
        return Err(ConfigError::Validation(
            "issuer_url must not carry a trailing slash".into(),
        ));
    }
    if app.authorization_code_ttl_secs == 0 || app.session_ttl_secs == 0 {
        return Err(ConfigError::Validation("TTLs must be > 0".into()));
    }
    if app.jwt.access_token_ttl_secs == 0
        || app.jwt.refresh_token_ttl_secs == 0
        || app.jwt.id_token_ttl_secs == 0
    {
        return Err(ConfigError::Validation("token TTLs must be > 0".into()));
    }
    if app.jwt.access_token_ttl_secs >= app.jwt.refresh_token_ttl_secs {
        return Err(ConfigError::Validation(
            "refresh token lifetime must exceed the access token lifetime".into(),
        ));
    }
    let rl = &app.rate_limit;
    if rl.window_secs == 0
        || rl.login_per_account == 0
        || rl.login_per_ip == 0
        || rl.authorize_per_ip == 0
        || rl.token_per_client == 0
    {
        return Err(ConfigError::Validation(
            "rate-limit windows and ceilings must be > 0".into(),
        ));
    }
    Ok(())
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Environment variables matching the key path separated by double
/// underscores (e.g. `JWT__PRIVATE_KEY_PATH`) override the file value.
///
/// Returns a `ConfigError` instead of panicking so the caller can decide how
/// to fail.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    validate(&app)?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
