//! OAuth2 Client entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Argon2id PHC string of the client secret
    pub secret_hash: String,
    /// Human-readable client name, shown on the consent page
    pub name: String,
    /// JSON array of allowed redirect URIs
    pub redirect_uris: String,
    /// Space-separated list of allowed scopes
    pub scopes: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URIs from JSON string
    pub fn redirect_uris_list(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    /// Parse scopes from space-separated string
    pub fn scopes_list(&self) -> Vec<String> {
        self.scopes.split_whitespace().map(String::from).collect()
    }

    /// Redirect URIs match by exact string comparison, no prefix or
    /// wildcard logic.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris_list()
            .iter()
            .any(|allowed| allowed == uri)
    }

    /// Check that every scope in a space-separated request is registered
    /// for this client.
    pub fn are_scopes_allowed(&self, requested: &str) -> bool {
        let allowed = self.scopes_list();
        requested
            .split_whitespace()
            .all(|scope| allowed.iter().any(|a| a == scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Model {
        Model {
            id: "client-1".into(),
            secret_hash: "$argon2id$stub".into(),
            name: "Test App".into(),
            redirect_uris: r#"["https://app.example.org/callback"]"#.into(),
            scopes: "openid profile email".into(),
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn redirect_uri_match_is_exact() {
        let c = client();
        assert!(c.is_redirect_uri_allowed("https://app.example.org/callback"));
        assert!(!c.is_redirect_uri_allowed("https://app.example.org/callback/"));
        assert!(!c.is_redirect_uri_allowed("https://app.example.org/callback?x=1"));
        assert!(!c.is_redirect_uri_allowed("https://evil.example.org/callback"));
    }

    #[test]
    fn scope_check_requires_every_scope() {
        let c = client();
        assert!(c.are_scopes_allowed("openid"));
        assert!(c.are_scopes_allowed("openid profile email"));
        assert!(!c.are_scopes_allowed("openid admin"));
    }
}
