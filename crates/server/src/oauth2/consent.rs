//! OAuth2 Consent endpoints.
//!
//! Implements the user consent screen:
//! - Consent page (GET) - Shows what permissions the application is requesting
//! - Consent submission (POST) - Handles approve/deny
//!
//! The consent decision is bound to the server-side session: the user id
//! behind the eventual authorization code comes from the session record,
//! never from anything the browser submits. The flow parameters travel as
//! plain form fields and are re-validated against the client registration on
//! every request.

use crate::error::OAuthError;
use crate::oauth2::endpoints::error_page;
use crate::oauth2::login::{ScopeInfo, get_scope_info};
use crate::oauth2::state::{AuthorizationCodeRecord, OAuth2State};
use askama::Template;
use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Consent page template.
#[derive(Template)]
#[template(path = "consent.html")]
struct ConsentTemplate {
    user_email: String,
    client_name: String,
    scopes: Vec<ScopeInfo>,
    // Flow parameters carried through the form
    client_id: String,
    redirect_uri: String,
    scope: String,
    state: String,
    nonce: Option<String>,
}

/// Query parameters for the consent page.
#[derive(Debug, Deserialize)]
pub struct ConsentQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
}

/// Form data for consent submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentForm {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    /// "approve" or "deny"
    pub action: String,
}

/// Creates the consent router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(consent_page))
        .routes(routes!(consent_submit))
}

/// Display the consent page.
#[tracing::instrument(skip(state, headers, params), fields(client_id = %params.client_id))]
#[utoipa::path(
    get,
    path = "/consent",
    tag = super::OAUTH2_TAG,
    operation_id = "OAuth2 Consent Page",
    summary = "Display the OAuth2 consent page",
    description = "Renders the consent screen where users approve or deny an application's request to \
                   access their account. Requires an authenticated session; an anonymous visitor is sent \
                   back to the login page.",
    params(
        ("client_id" = String, Query, description = "The client identifier."),
        ("redirect_uri" = String, Query, description = "URI to redirect after authorization."),
        ("scope" = Option<String>, Query, description = "Space-separated list of requested scopes."),
        ("state" = Option<String>, Query, description = "Opaque value for CSRF protection."),
        ("nonce" = Option<String>, Query, description = "String value for replay protection."),
    ),
    responses(
        (status = 200, description = "Consent page HTML"),
        (status = 303, description = "Redirect to login when no session is present"),
        (status = 400, description = "Unknown client or unregistered redirect_uri"),
    )
)]
async fn consent_page(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Query(params): Query<ConsentQuery>,
) -> Result<Response, OAuthError> {
    let scope = params.scope.as_deref().unwrap_or("openid").to_string();

    let Some((_, session)) = state.session_from_request(&headers)? else {
        return Ok(redirect_to_login(
            &params.client_id,
            &params.redirect_uri,
            &scope,
            params.state.as_deref().unwrap_or(""),
            params.nonce.as_deref(),
        ));
    };

    // Query parameters are untrusted; the client and redirect URI are
    // validated again even though /authorize already did.
    let Some(client) = state.clients.get_active_client(&params.client_id).await? else {
        return Ok(error_page("invalid_client", "Unknown client"));
    };
    if !client.is_redirect_uri_allowed(&params.redirect_uri) {
        return Ok(error_page(
            "invalid_request",
            "The redirect URI is not registered for this client",
        ));
    }

    let Some(account) = state.users.get_active_user(&session.user_id).await? else {
        return Ok(error_page("access_denied", "Account is not available"));
    };

    let scopes: Vec<ScopeInfo> = scope.split_whitespace().map(get_scope_info).collect();
    let template = ConsentTemplate {
        user_email: account.email,
        client_name: client.name,
        scopes,
        client_id: params.client_id,
        redirect_uri: params.redirect_uri,
        scope,
        state: params.state.unwrap_or_default(),
        nonce: params.nonce,
    };

    match template.render() {
        Ok(html) => Ok(Html(html).into_response()),
        Err(e) => {
            tracing::error!("Failed to render consent template: {}", e);
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response())
        }
    }
}

/// Handle consent form submission.
#[tracing::instrument(skip(state, headers, form), fields(client_id = %form.client_id))]
#[utoipa::path(
    post,
    path = "/consent",
    tag = super::OAUTH2_TAG,
    operation_id = "OAuth2 Consent Submit",
    summary = "Submit OAuth2 consent decision",
    description = "Handles the user's consent decision. On approval, mints a single-use authorization \
                   code bound to the session's user and redirects back to the client. On denial, \
                   redirects with an `access_denied` error.",
    request_body(
        content = ConsentForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Consent decision and flow parameters"
    ),
    responses(
        (status = 303, description = "Redirect to client with authorization code or error"),
        (status = 400, description = "Unknown client or unregistered redirect_uri"),
        (status = 503, description = "State store unavailable", body = crate::error::ErrorResponse),
    )
)]
async fn consent_submit(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<ConsentForm>,
) -> Result<Response, OAuthError> {
    let Some((_, session)) = state.session_from_request(&headers)? else {
        return Ok(redirect_to_login(
            &form.client_id,
            &form.redirect_uri,
            &form.scope,
            &form.state,
            form.nonce.as_deref(),
        ));
    };

    // Form fields come from the browser and are re-validated like the page.
    let Some(client) = state.clients.get_active_client(&form.client_id).await? else {
        return Ok(error_page("invalid_client", "Unknown client"));
    };
    if !client.is_redirect_uri_allowed(&form.redirect_uri) {
        return Ok(error_page(
            "invalid_request",
            "The redirect URI is not registered for this client",
        ));
    }

    if form.action != "approve" {
        let mut url = form.redirect_uri.clone();
        url.push_str(if url.contains('?') { "&" } else { "?" });
        url.push_str("error=access_denied&error_description=User%20denied%20the%20request");
        if !form.state.is_empty() {
            url.push_str(&format!("&state={}", urlencoding::encode(&form.state)));
        }
        tracing::info!(user_id = %session.user_id, "User denied consent");
        return Ok(Redirect::to(&url).into_response());
    }

    if !client.are_scopes_allowed(&form.scope) {
        return Ok(error_page(
            "invalid_scope",
            "Requested scope is not allowed for this client",
        ));
    }
    if state.users.get_active_user(&session.user_id).await?.is_none() {
        return Ok(error_page("access_denied", "Account is not available"));
    }

    let code = state.issue_code(&AuthorizationCodeRecord {
        user_id: session.user_id.clone(),
        client_id: client.id.clone(),
        redirect_uri: form.redirect_uri.clone(),
        scope: form.scope.clone(),
        nonce: form.nonce.clone(),
        auth_time: state.auth_time_of(&session),
        issued_at: state.now_unix(),
    })?;

    let mut url = form.redirect_uri.clone();
    url.push_str(if url.contains('?') { "&" } else { "?" });
    url.push_str(&format!("code={}", urlencoding::encode(&code)));
    if !form.state.is_empty() {
        url.push_str(&format!("&state={}", urlencoding::encode(&form.state)));
    }

    tracing::info!(
        user_id = %session.user_id,
        client_id = %client.id,
        scope = %form.scope,
        "User granted consent"
    );

    Ok(Redirect::to(&url).into_response())
}

fn redirect_to_login(
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
    nonce: Option<&str>,
) -> Response {
    let mut url = format!(
        "/oauth2/login?client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(state),
    );
    if let Some(nonce) = nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }
    Redirect::to(&url).into_response()
}
