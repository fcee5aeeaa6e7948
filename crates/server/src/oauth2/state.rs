//! Shared state for the authorization-flow handlers.
//!
//! Bundles the stores and services the flow engine runs on, plus the two
//! accessors the handlers identify callers with:
//!
//! - `session_from_request` answers "who is browsing?" and returns
//!   `Option` inside `Ok`: an anonymous visitor is a normal outcome, not an
//!   error. Only store faults are `Err`.
//! - `require_bearer_user` answers "who is calling this protected API?" and
//!   returns `Result`: a missing or bad token is a protocol error the caller
//!   must see as 401.

use crate::config::AppConfig;
use crate::entity::user;
use crate::error::OAuthError;
use crate::rate_limit::RateLimiter;
use crate::registry::{ClientRegistry, UserRegistry};
use crate::session::{SESSION_COOKIE, SessionManager, SessionRecord};
use crate::store::{StateStore, StoreError};
use crate::tokens::{Claims, TokenService, TokenUse};
use crate::utils::random_token;
use axum::http::HeaderMap;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const AUTH_CODE_PREFIX: &str = "authcode:";

/// Everything a pending authorization code stands for. Stored server-side
/// under `authcode:{code}`; the code itself carries no information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeRecord {
    pub user_id: String,
    pub client_id: String,
    /// The exact redirect URI the code was issued against; redemption must
    /// present the same string.
    pub redirect_uri: String,
    pub scope: String,
    pub nonce: Option<String>,
    /// When the user authenticated, forwarded into the ID token.
    pub auth_time: i64,
    pub issued_at: i64,
}

#[derive(Clone)]
pub struct OAuth2State {
    pub db: Arc<DatabaseConnection>,
    pub store: Arc<dyn StateStore>,
    pub tokens: TokenService,
    pub sessions: SessionManager,
    pub guard: RateLimiter,
    pub users: UserRegistry,
    pub clients: ClientRegistry,
    /// Base URL for the server (used as issuer in tokens and discovery)
    pub issuer_url: String,
    /// Session cookies carry the `Secure` attribute when the server is
    /// reached over https; plain http (local development) leaves it off.
    pub cookie_secure: bool,
    code_ttl: Duration,
}

impl OAuth2State {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn StateStore>,
        tokens: TokenService,
        config: &AppConfig,
    ) -> Self {
        Self {
            tokens,
            sessions: SessionManager::new(
                store.clone(),
                Duration::from_secs(config.session_ttl_secs),
            ),
            guard: RateLimiter::new(store.clone(), &config.rate_limit),
            users: UserRegistry::new(db.clone()),
            clients: ClientRegistry::new(db.clone()),
            issuer_url: config.issuer_url.clone(),
            cookie_secure: config.issuer_url.starts_with("https://"),
            code_ttl: Duration::from_secs(config.authorization_code_ttl_secs),
            db,
            store,
        }
    }

    /// Mint a single-use authorization code for `record`.
    pub fn issue_code(&self, record: &AuthorizationCodeRecord) -> Result<String, OAuthError> {
        let code = random_token();
        let value = serde_json::to_string(record)
            .map_err(|e| OAuthError::Internal(e.to_string()))?;
        self.store
            .put(&code_key(&code), value, self.code_ttl)?;
        Ok(code)
    }

    /// Atomically consume an authorization code. Exactly one redemption of
    /// N concurrent ones observes the record; expired or unknown codes read
    /// as `None`.
    pub fn consume_code(
        &self,
        code: &str,
    ) -> Result<Option<AuthorizationCodeRecord>, OAuthError> {
        let Some(raw) = self.store.take(&code_key(code))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::error!(error = %e, "corrupt authorization-code record");
                Ok(None)
            }
        }
    }

    /// Resolve the browsing user's session from the request cookies, if any.
    pub fn session_from_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<(String, SessionRecord)>, StoreError> {
        let Some(session_id) = cookie_value(headers, SESSION_COOKIE) else {
            return Ok(None);
        };
        Ok(self
            .sessions
            .validate(&session_id)?
            .map(|record| (session_id, record)))
    }

    /// Resolve the bearer token on a protected endpoint to its claims and
    /// the (still active) user they belong to.
    pub async fn require_bearer_user(
        &self,
        headers: &HeaderMap,
    ) -> Result<(Claims, user::Model), OAuthError> {
        let token = bearer_token(headers).ok_or(OAuthError::Unauthorized)?;
        let claims = self
            .tokens
            .verify(token, TokenUse::Access)
            .map_err(|e| match e {
                crate::tokens::TokenError::Store(err) => OAuthError::StoreUnavailable(err),
                _ => OAuthError::Unauthorized,
            })?;
        let account = self
            .users
            .get_active_user(&claims.sub)
            .await?
            .ok_or(OAuthError::Unauthorized)?;
        Ok((claims, account))
    }

    pub fn auth_time_of(&self, session: &SessionRecord) -> i64 {
        session.created_at
    }

    pub fn now_unix(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }
}

fn code_key(code: &str) -> String {
    format!("{AUTH_CODE_PREFIX}{code}")
}

/// Pull a named cookie out of the `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=')
            && key == name
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Pull the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    value.strip_prefix("Bearer ").filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_parsing_picks_the_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; sso_session=abc123; theme=dark"),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        let mut basic = HeaderMap::new();
        basic.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
