//! Lookups against the durable identity data: user accounts and registered
//! OAuth2 clients.
//!
//! Credential verification keeps its failure modes indistinguishable to the
//! caller: unknown account, wrong password, missing password hash and
//! deactivated account all come back as `None`. The distinction is logged
//! where it is detected.

use crate::entity::{oauth2_client, user};
use crate::oauth2::password::verify_password;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct UserRegistry {
    db: Arc<DatabaseConnection>,
}

impl UserRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Verify an email/password pair. Any failure, including a deactivated
    /// account, yields `None`.
    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<user::Model>, sea_orm::DbErr> {
        let email = email.trim().to_lowercase();
        let Some(account) = user::Entity::find()
            .filter(user::Column::Email.eq(&email))
            .one(self.db.as_ref())
            .await?
        else {
            tracing::debug!("login attempt for unknown email");
            return Ok(None);
        };

        let Some(hash) = &account.password_hash else {
            tracing::debug!(user_id = %account.id, "account has no local password");
            return Ok(None);
        };
        if !verify_password(password, hash) {
            tracing::debug!(user_id = %account.id, "password mismatch");
            return Ok(None);
        }
        if !account.is_active {
            tracing::warn!(user_id = %account.id, "login attempt on deactivated account");
            return Ok(None);
        }
        Ok(Some(account))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<user::Model>, sea_orm::DbErr> {
        user::Entity::find_by_id(user_id).one(self.db.as_ref()).await
    }

    /// Like `get_user` but treats deactivated accounts as absent. Token and
    /// grant paths use this so a deactivation takes effect immediately.
    pub async fn get_active_user(
        &self,
        user_id: &str,
    ) -> Result<Option<user::Model>, sea_orm::DbErr> {
        Ok(self
            .get_user(user_id)
            .await?
            .filter(|account| account.is_active))
    }

    pub async fn touch_last_login(&self, user_id: &str) -> Result<(), sea_orm::DbErr> {
        if let Some(account) = self.get_user(user_id).await? {
            let mut active: user::ActiveModel = account.into();
            active.last_login_at = Set(Some(OffsetDateTime::now_utc()));
            active.update(self.db.as_ref()).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ClientRegistry {
    db: Arc<DatabaseConnection>,
}

impl ClientRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Look up a registered, active client.
    pub async fn get_active_client(
        &self,
        client_id: &str,
    ) -> Result<Option<oauth2_client::Model>, sea_orm::DbErr> {
        Ok(oauth2_client::Entity::find_by_id(client_id)
            .one(self.db.as_ref())
            .await?
            .filter(|client| client.is_active))
    }

    /// Authenticate a client by id and secret. Unknown id, deactivated
    /// client and wrong secret all come back as `None`.
    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Option<oauth2_client::Model>, sea_orm::DbErr> {
        let Some(client) = self.get_active_client(client_id).await? else {
            tracing::debug!(client_id = %client_id, "unknown or inactive client");
            return Ok(None);
        };
        if !verify_password(client_secret, &client.secret_hash) {
            tracing::warn!(client_id = %client_id, "client secret mismatch");
            return Ok(None);
        }
        Ok(Some(client))
    }
}
