//! An OAuth 2.0 / OpenID Connect single sign-on authorization server.
//!
//! Implements the authorization-code flow for confidential clients with
//! server-side browser sessions, rotating RS256 refresh tokens and a
//! TTL-keyed state store backing all short-lived protocol state.

pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod oauth2;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod store;
pub mod tokens;
pub mod utils;
