//! Migration adding the durable identity tables.
//!
//! Creates tables for:
//! - user: User accounts with local password credentials
//! - oauth2_client: Registered OAuth2 clients
//!
//! Sessions, authorization codes, refresh-token records and rate-limit
//! counters live in the ephemeral state store, not the database.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(User::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(User::Email).string().not_null().unique_key())
                    .col(
                        ColumnDef::new(User::Username)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(User::DisplayName).string().null())
                    .col(ColumnDef::new(User::PasswordHash).string().null())
                    .col(
                        ColumnDef::new(User::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(User::EmailVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(User::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(User::LastLoginAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OAuth2Client::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuth2Client::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuth2Client::SecretHash).string().not_null())
                    .col(ColumnDef::new(OAuth2Client::Name).string().not_null())
                    .col(
                        ColumnDef::new(OAuth2Client::RedirectUris)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2Client::Scopes)
                            .text()
                            .not_null()
                            .default("openid profile email"),
                    )
                    .col(
                        ColumnDef::new(OAuth2Client::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(OAuth2Client::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2Client::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuth2Client::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum User {
    Table,
    Id,
    Email,
    Username,
    DisplayName,
    PasswordHash,
    IsActive,
    EmailVerified,
    CreatedAt,
    LastLoginAt,
}

#[derive(DeriveIden)]
enum OAuth2Client {
    Table,
    Id,
    SecretHash,
    Name,
    RedirectUris,
    Scopes,
    IsActive,
    CreatedAt,
    UpdatedAt,
}
