//! OAuth2 / OpenID Connect authorization server module.
//!
//! Implements the authorization-code flow for confidential clients, with
//! rotating refresh tokens and server-side browser sessions.
//!
//! ## Endpoints
//!
//! - `GET /oauth2/authorize` - Authorization endpoint
//! - `GET/POST /oauth2/login` - Login page and credential submission
//! - `GET/POST /oauth2/consent` - Consent page and decision
//! - `POST /oauth2/token` - Token endpoint (authorization_code, refresh_token)
//! - `POST /oauth2/revoke` - Token revocation
//! - `GET /oauth2/userinfo` - OpenID Connect UserInfo
//! - `GET /.well-known/openid-configuration` - OpenID Connect Discovery

pub mod consent;
pub mod endpoints;
pub mod login;
pub mod password;
pub mod state;

pub use endpoints::{discovery_router, router};
pub use password::{hash_password, verify_password};
pub use state::OAuth2State;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";
