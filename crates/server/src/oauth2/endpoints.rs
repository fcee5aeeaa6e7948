//! OAuth2 HTTP endpoints.
//!
//! Implements the protocol surface of the authorization server:
//! - Authorization endpoint
//! - Token endpoint (authorization_code and refresh_token grants)
//! - Token revocation (RFC 7009)
//! - UserInfo (OpenID Connect)
//! - Discovery document
//!
//! Error routing follows RFC 6749 section 4.1.2.1: an unknown client or a
//! redirect URI that fails the exact-match check renders a local error page
//! and never redirects, since the URI cannot be trusted. Everything detected
//! after the redirect URI is validated goes back to the client as an error
//! redirect.

use crate::entity::oauth2_client;
use crate::error::OAuthError;
use crate::oauth2::{OAUTH2_TAG, state::OAuth2State};
use crate::rate_limit::{Decision, GuardedOp};
use crate::tokens::{TokenError, TokenUse};
use crate::utils::client_ip;
use askama::Template;
use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the OAuth2 router, mounted under `/oauth2`.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(token))
        .routes(routes!(revoke))
        .routes(routes!(userinfo))
        .merge(super::login::router())
        .merge(super::consent::router())
        .with_state(state)
}

/// Discovery and the key set live at the server root, not under `/oauth2`.
pub fn discovery_router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(openid_configuration))
        .routes(routes!(jwks))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// OAuth2 authorization request parameters.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Must be "code" for Authorization Code flow
    pub response_type: String,
    /// Client identifier issued during registration
    pub client_id: String,
    /// Redirect URI (must exactly match a registered URI)
    pub redirect_uri: String,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value for CSRF protection
    pub state: Option<String>,
    /// String for replay protection (included in ID token)
    pub nonce: Option<String>,
    /// Email hint to pre-fill the login form
    pub login_hint: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

/// Local error page, rendered when redirecting back to the client would be
/// unsafe (unknown client or unregistered redirect URI).
#[derive(Template)]
#[template(path = "error.html")]
struct ErrorPageTemplate {
    error: String,
    description: String,
}

// =============================================================================
// Endpoints
// =============================================================================

/// OAuth2 Authorization endpoint.
#[tracing::instrument(skip(state, headers, params), fields(client_id = %params.client_id))]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Initiate OAuth2 authorization flow",
    description = "Starts the OAuth2 Authorization Code flow. An unauthenticated user is sent to the \
                   login page; an authenticated user goes straight to the consent page. After consent, \
                   the user is redirected back to the client's redirect_uri with an authorization code.\n\n\
                   The redirect_uri must exactly match one registered for the client; on a mismatch an \
                   error page is rendered locally and no redirect happens.\n\n\
                   **Supported scopes:** `openid`, `profile`, `email`",
    params(
        ("response_type" = String, Query, description = "OAuth2 response type. Must be `code` for Authorization Code flow."),
        ("client_id" = String, Query, description = "The client identifier issued during client registration."),
        ("redirect_uri" = String, Query, description = "URI to redirect the user after authorization. Must exactly match a registered redirect URI."),
        ("scope" = Option<String>, Query, description = "Space-separated list of requested scopes (defaults to `openid`)."),
        ("state" = Option<String>, Query, description = "Opaque value for CSRF protection. Returned unchanged in the redirect."),
        ("nonce" = Option<String>, Query, description = "String value for replay protection. Included in the ID token if provided."),
        ("login_hint" = Option<String>, Query, description = "Email address hint to pre-fill the login form."),
    ),
    responses(
        (status = 303, description = "Redirect to login/consent page, or back to the client with an error"),
        (status = 400, description = "Unknown client or unregistered redirect_uri (rendered locally)"),
        (status = 429, description = "Too many authorization attempts from this address"),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeRequest>,
) -> Result<Response, OAuthError> {
    let ip = client_ip(&headers);
    if let Decision::Limited { .. } = state.guard.check(GuardedOp::AuthorizeByIp, &ip)? {
        return Err(OAuthError::RateLimited);
    }

    // Client and redirect URI are validated before anything is redirected:
    // until both check out, the redirect URI is attacker-controlled input.
    let Some(client) = state.clients.get_active_client(&params.client_id).await? else {
        tracing::warn!("authorization attempt for unknown client");
        return Ok(error_page("invalid_client", "Unknown client"));
    };
    if !client.is_redirect_uri_allowed(&params.redirect_uri) {
        tracing::warn!(redirect_uri = %params.redirect_uri, "unregistered redirect_uri");
        return Ok(error_page(
            "invalid_request",
            "The redirect URI is not registered for this client",
        ));
    }

    // From here on errors go back to the client as redirects.
    if params.response_type != "code" {
        return Ok(error_redirect(
            &params.redirect_uri,
            params.state.as_deref(),
            "unsupported_response_type",
            Some("Only 'code' response type is supported"),
        ));
    }

    let scope = params.scope.as_deref().unwrap_or("openid").to_string();
    if !client.are_scopes_allowed(&scope) {
        return Ok(error_redirect(
            &params.redirect_uri,
            params.state.as_deref(),
            "invalid_scope",
            Some("Requested scope is not allowed for this client"),
        ));
    }

    // An existing session skips re-authentication and goes straight to
    // consent; otherwise the login page carries the flow parameters along.
    let target = if state.session_from_request(&headers)?.is_some() {
        flow_url("/oauth2/consent", &params, &scope)
    } else {
        let mut url = flow_url("/oauth2/login", &params, &scope);
        if let Some(hint) = &params.login_hint {
            url.push_str(&format!("&login_hint={}", urlencoding::encode(hint)));
        }
        url
    };

    Ok(Redirect::to(&target).into_response())
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange authorization code or refresh token for tokens",
    description = "Exchanges an authorization code for tokens, or rotates a refresh token.\n\n\
                   **Supported grant types:**\n\
                   - `authorization_code`: Exchange a single-use authorization code for access, refresh \
                     and (with the `openid` scope) ID tokens\n\
                   - `refresh_token`: Rotate a refresh token; the presented token is invalidated and a \
                     new pair is issued\n\n\
                   **Client authentication:** HTTP Basic auth or `client_id`/`client_secret` in the body. \
                   All clients are confidential; the secret is always required.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued successfully", body = TokenResponse),
        (status = 400, description = "Invalid request or invalid/expired/consumed grant", body = crate::error::ErrorResponse),
        (status = 401, description = "Client authentication failed", body = crate::error::ErrorResponse),
        (status = 429, description = "Too many token requests for this client", body = crate::error::ErrorResponse),
        (status = 503, description = "State store unavailable", body = crate::error::ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, OAuthError> {
    let (client_id, client_secret) = extract_client_credentials(&headers, &params);
    let client_id =
        client_id.ok_or_else(|| OAuthError::InvalidRequest("client_id is required".into()))?;

    if let Decision::Limited { .. } = state.guard.check(GuardedOp::TokenByClient, &client_id)? {
        return Err(OAuthError::RateLimited);
    }

    let client_secret = client_secret.ok_or(OAuthError::InvalidClient)?;
    let client = state
        .clients
        .authenticate(&client_id, &client_secret)
        .await?
        .ok_or(OAuthError::InvalidClient)?;

    match params.grant_type.as_str() {
        "authorization_code" => handle_authorization_code_grant(state, client, params).await,
        "refresh_token" => handle_refresh_token_grant(state, client, params).await,
        _ => Err(OAuthError::UnsupportedGrantType),
    }
}

/// Token revocation endpoint (RFC 7009).
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/revoke",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke Token",
    summary = "Revoke an access or refresh token",
    description = "Revokes an access token or refresh token, preventing further use. \
                   Implements RFC 7009 (OAuth 2.0 Token Revocation).\n\n\
                   **Behavior:**\n\
                   - Returns 200 OK even if the token is unknown, expired or already revoked, so the \
                     endpoint never works as a token-validity oracle\n\
                   - A token belonging to a different client is not revoked but still answered with 200\n\
                   - Revoking a refresh token also removes its server-side record",
    request_body(
        content = RevokeRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token revocation request"
    ),
    responses(
        (status = 200, description = "Token revoked (or was already invalid)"),
        (status = 401, description = "Client authentication failed", body = crate::error::ErrorResponse),
        (status = 503, description = "State store unavailable", body = crate::error::ErrorResponse),
    )
)]
pub async fn revoke(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<RevokeRequest>,
) -> Result<StatusCode, OAuthError> {
    let (client_id, client_secret) = extract_basic_credentials(&headers)
        .or_else(|| params.client_id.clone().zip(params.client_secret.clone()))
        .ok_or(OAuthError::InvalidClient)?;
    let client = state
        .clients
        .authenticate(&client_id, &client_secret)
        .await?
        .ok_or(OAuthError::InvalidClient)?;

    // Unknown hints are ignored per RFC 7009 section 2.1; the token kind is
    // read from its own claims anyway.
    if let Some(hint) = params.token_type_hint.as_deref()
        && hint != "access_token"
        && hint != "refresh_token"
    {
        tracing::debug!(hint = hint, "unknown token_type_hint, ignoring");
    }

    // Tokens themselves never reach the logs, only a digest.
    let token_digest = format!("{:x}", Sha256::digest(params.token.as_bytes()));

    match state.tokens.peek_claims(&params.token) {
        Some(claims) if claims.aud == client.id => {
            state
                .tokens
                .revoke(&claims.jti, claims.exp)
                .map_err(|e| match e {
                    TokenError::Store(err) => OAuthError::StoreUnavailable(err),
                    other => OAuthError::Internal(other.to_string()),
                })?;
            tracing::info!(jti = %claims.jti, token_digest = %token_digest, "token revoked");
        }
        Some(claims) => {
            // Answered with 200 regardless, so the response does not reveal
            // which client a token belongs to.
            tracing::warn!(
                jti = %claims.jti,
                token_client = %claims.aud,
                "revocation attempt for a token of a different client"
            );
        }
        None => {
            tracing::debug!(token_digest = %token_digest, "revocation of unknown token");
        }
    }

    Ok(StatusCode::OK)
}

/// OpenID Connect UserInfo endpoint.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    get,
    path = "/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect UserInfo",
    summary = "Get authenticated user's profile information",
    description = "Returns claims about the authenticated user. Requires a valid access token with the `openid` scope.\n\n\
                   **Returned claims depend on granted scopes:**\n\
                   - `openid`: `sub` (subject identifier)\n\
                   - `email`: `email`, `email_verified`\n\
                   - `profile`: `name`, `preferred_username`\n\n\
                   **Authentication:** Include the access token as a Bearer token in the Authorization header.",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "User profile information", body = UserInfoResponse),
        (status = 401, description = "Missing, invalid, expired or revoked access token", body = crate::error::ErrorResponse),
        (status = 403, description = "Token does not carry the `openid` scope", body = crate::error::ErrorResponse),
    )
)]
pub async fn userinfo(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, OAuthError> {
    let (claims, account) = state.require_bearer_user(&headers).await?;

    let scopes: Vec<&str> = claims
        .scope
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .collect();
    if !scopes.contains(&"openid") {
        return Err(OAuthError::InsufficientScope);
    }

    let mut response = UserInfoResponse {
        sub: account.id,
        email: None,
        email_verified: None,
        name: None,
        preferred_username: None,
    };
    if scopes.contains(&"email") {
        response.email = Some(account.email);
        response.email_verified = Some(account.email_verified);
    }
    if scopes.contains(&"profile") {
        response.name = account.display_name;
        response.preferred_username = Some(account.username);
    }

    Ok(Json(response))
}

/// OpenID Connect Discovery document.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Connect Discovery",
    summary = "OpenID Connect Discovery document",
    description = "Returns the OpenID Connect Discovery document containing metadata about the provider: \
                   endpoint URLs, supported grant and response types, scopes and client authentication methods.",
    responses(
        (status = 200, description = "OpenID Connect configuration document", body = OpenIdConfiguration),
    )
)]
pub async fn openid_configuration(State(state): State<OAuth2State>) -> Json<OpenIdConfiguration> {
    Json(OpenIdConfiguration {
        issuer: state.issuer_url.clone(),
        authorization_endpoint: format!("{}/oauth2/authorize", state.issuer_url),
        token_endpoint: format!("{}/oauth2/token", state.issuer_url),
        userinfo_endpoint: format!("{}/oauth2/userinfo", state.issuer_url),
        revocation_endpoint: format!("{}/oauth2/revoke", state.issuer_url),
        jwks_uri: format!("{}/.well-known/jwks.json", state.issuer_url),
        response_types_supported: vec!["code".to_string()],
        grant_types_supported: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        subject_types_supported: vec!["public".to_string()],
        id_token_signing_alg_values_supported: vec!["RS256".to_string()],
        scopes_supported: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
        ],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic".to_string(),
            "client_secret_post".to_string(),
        ],
    })
}

/// JSON Web Key Set.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = OAUTH2_TAG,
    operation_id = "JSON Web Key Set",
    summary = "Public keys for token verification",
    description = "Returns the RSA public keys (RFC 7517 JWK Set) resource servers verify token \
                   signatures with. During key rotation the retiring key is published alongside the \
                   current one until in-flight tokens have expired.",
    responses(
        (status = 200, description = "JSON Web Key Set", body = crate::tokens::JwkSet),
    )
)]
pub async fn jwks(State(state): State<OAuth2State>) -> Json<crate::tokens::JwkSet> {
    Json(state.tokens.jwks())
}

// =============================================================================
// Grant handlers
// =============================================================================

async fn handle_authorization_code_grant(
    state: OAuth2State,
    client: oauth2_client::Model,
    params: TokenRequest,
) -> Result<Json<TokenResponse>, OAuthError> {
    let code = params
        .code
        .ok_or_else(|| OAuthError::InvalidRequest("code is required".into()))?;
    let redirect_uri = params
        .redirect_uri
        .ok_or_else(|| OAuthError::InvalidRequest("redirect_uri is required".into()))?;

    // Single-winner point: the code is gone after this regardless of whether
    // the remaining checks pass.
    let Some(grant) = state.consume_code(&code)? else {
        tracing::info!(client_id = %client.id, "unknown, expired or already used code");
        return Err(OAuthError::InvalidGrant);
    };

    if grant.client_id != client.id {
        tracing::warn!(
            client_id = %client.id,
            issued_to = %grant.client_id,
            "authorization code redeemed by a different client"
        );
        return Err(OAuthError::InvalidGrant);
    }
    if grant.redirect_uri != redirect_uri {
        tracing::warn!(client_id = %client.id, "redirect_uri mismatch on redemption");
        return Err(OAuthError::InvalidGrant);
    }

    let account = state.users.get_active_user(&grant.user_id).await?;
    if account.is_none() {
        tracing::warn!(user_id = %grant.user_id, "code redemption for deactivated user");
        return Err(OAuthError::InvalidGrant);
    }

    let access = state
        .tokens
        .mint_access_token(&grant.user_id, &client.id, &grant.scope)
        .map_err(token_minting_error)?;
    let refresh = state
        .tokens
        .mint_refresh_token(&grant.user_id, &client.id, &grant.scope, None)
        .map_err(token_minting_error)?;
    let id_token = if grant.scope.split_whitespace().any(|s| s == "openid") {
        let signed = state
            .tokens
            .mint_id_token(
                &grant.user_id,
                &client.id,
                grant.nonce.as_deref(),
                grant.auth_time,
            )
            .map_err(token_minting_error)?;
        Some(signed.token)
    } else {
        None
    };

    tracing::info!(
        user_id = %grant.user_id,
        client_id = %client.id,
        scope = %grant.scope,
        "authorization code redeemed"
    );

    Ok(Json(TokenResponse {
        access_token: access.token,
        token_type: "Bearer".to_string(),
        expires_in: state.tokens.access_token_lifetime().as_secs() as i64,
        refresh_token: Some(refresh.token),
        id_token,
        scope: grant.scope,
    }))
}

async fn handle_refresh_token_grant(
    state: OAuth2State,
    client: oauth2_client::Model,
    params: TokenRequest,
) -> Result<Json<TokenResponse>, OAuthError> {
    let refresh_token = params
        .refresh_token
        .ok_or_else(|| OAuthError::InvalidRequest("refresh_token is required".into()))?;

    let claims = state
        .tokens
        .verify(&refresh_token, TokenUse::Refresh)
        .map_err(|e| match e {
            TokenError::Store(err) => OAuthError::StoreUnavailable(err),
            _ => OAuthError::InvalidGrant,
        })?;

    if claims.aud != client.id {
        tracing::warn!(
            client_id = %client.id,
            issued_to = %claims.aud,
            "refresh token presented by a different client"
        );
        return Err(OAuthError::InvalidGrant);
    }

    // A valid signature with no server-side record means the token was
    // already rotated away: someone is replaying it.
    let Some(record) = state
        .tokens
        .take_refresh_record(&claims.jti)
        .map_err(|e| match e {
            TokenError::Store(err) => OAuthError::StoreUnavailable(err),
            other => OAuthError::Internal(other.to_string()),
        })?
    else {
        tracing::warn!(
            jti = %claims.jti,
            user_id = %claims.sub,
            client_id = %client.id,
            "refresh token reuse detected, possible token theft"
        );
        return Err(OAuthError::InvalidGrant);
    };

    if state.users.get_active_user(&record.user_id).await?.is_none() {
        tracing::warn!(user_id = %record.user_id, "refresh attempt for deactivated user");
        return Err(OAuthError::InvalidGrant);
    }

    // Invalidate the presented token before minting its successor, so a
    // crash in between fails towards revoked rather than duplicated.
    state
        .tokens
        .revoke(&claims.jti, claims.exp)
        .map_err(|e| match e {
            TokenError::Store(err) => OAuthError::StoreUnavailable(err),
            other => OAuthError::Internal(other.to_string()),
        })?;

    let access = state
        .tokens
        .mint_access_token(&record.user_id, &client.id, &record.scope)
        .map_err(token_minting_error)?;
    let refresh = state
        .tokens
        .mint_refresh_token(&record.user_id, &client.id, &record.scope, Some(&claims.jti))
        .map_err(token_minting_error)?;

    tracing::info!(
        user_id = %record.user_id,
        client_id = %client.id,
        old_jti = %claims.jti,
        new_jti = %refresh.jti,
        "refresh token rotated"
    );

    Ok(Json(TokenResponse {
        access_token: access.token,
        token_type: "Bearer".to_string(),
        expires_in: state.tokens.access_token_lifetime().as_secs() as i64,
        refresh_token: Some(refresh.token),
        id_token: None,
        scope: record.scope,
    }))
}

// =============================================================================
// Helper Functions
// =============================================================================

fn token_minting_error(e: TokenError) -> OAuthError {
    match e {
        TokenError::Store(err) => OAuthError::StoreUnavailable(err),
        other => OAuthError::Internal(other.to_string()),
    }
}

fn extract_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))?;
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, auth).ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let (id, secret) = creds.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

fn extract_client_credentials(
    headers: &HeaderMap,
    params: &TokenRequest,
) -> (Option<String>, Option<String>) {
    // Basic auth wins over the form body
    if let Some((id, secret)) = extract_basic_credentials(headers) {
        return (Some(id), Some(secret));
    }
    (params.client_id.clone(), params.client_secret.clone())
}

/// Redirect back to the client with an error, per RFC 6749 section 4.1.2.1.
/// Only safe once the redirect URI passed the exact-match check.
fn error_redirect(
    redirect_uri: &str,
    state: Option<&str>,
    error: &str,
    description: Option<&str>,
) -> Response {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}error={}",
        redirect_uri,
        separator,
        urlencoding::encode(error)
    );
    if let Some(desc) = description {
        url.push_str(&format!("&error_description={}", urlencoding::encode(desc)));
    }
    if let Some(s) = state {
        url.push_str(&format!("&state={}", urlencoding::encode(s)));
    }
    Redirect::to(&url).into_response()
}

pub(crate) fn error_page(error: &str, description: &str) -> Response {
    let template = ErrorPageTemplate {
        error: error.to_string(),
        description: description.to_string(),
    };
    match template.render() {
        Ok(html) => (StatusCode::BAD_REQUEST, Html(html)).into_response(),
        Err(e) => {
            tracing::error!("Failed to render error template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Carry the validated flow parameters into the login/consent page URL.
fn flow_url(path: &str, params: &AuthorizeRequest, scope: &str) -> String {
    let mut url = format!(
        "{}?client_id={}&redirect_uri={}&scope={}&state={}",
        path,
        urlencoding::encode(&params.client_id),
        urlencoding::encode(&params.redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(params.state.as_deref().unwrap_or("")),
    );
    if let Some(nonce) = &params.nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }
    url
}
