//! SeaORM entities for the durable identity data: user accounts and
//! registered OAuth2 clients. Everything short-lived lives in the state
//! store instead.

pub mod oauth2_client;
pub mod user;
