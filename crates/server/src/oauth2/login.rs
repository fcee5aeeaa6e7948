//! OAuth2 Login endpoints.
//!
//! Implements user authentication for the authorization flow:
//! - Login page (GET)
//! - Login submission (POST)
//!
//! The abuse guard runs before any credential is checked, per account and
//! per source address, so an attacker cannot burn attempts against either
//! bucket without being counted. A successful login regenerates the session
//! id and clears the per-account counter.

use crate::error::OAuthError;
use crate::oauth2::state::OAuth2State;
use crate::rate_limit::{Decision, GuardedOp};
use crate::session::SESSION_COOKIE;
use crate::utils::client_ip;
use askama::Template;
use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Scope information for display on the login page.
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub name: String,
    pub description: String,
}

/// Get human-readable scope information.
pub(crate) fn get_scope_info(scope: &str) -> ScopeInfo {
    match scope {
        "openid" => ScopeInfo {
            name: "OpenID".to_string(),
            description: "Verify your identity".to_string(),
        },
        "email" => ScopeInfo {
            name: "Email".to_string(),
            description: "Access your email address".to_string(),
        },
        "profile" => ScopeInfo {
            name: "Profile".to_string(),
            description: "Access your profile information".to_string(),
        },
        _ => ScopeInfo {
            name: scope.to_string(),
            description: format!("Access to {}", scope),
        },
    }
}

/// Login page template.
#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    // OAuth2 flow parameters carried through the form
    client_id: String,
    redirect_uri: String,
    scope: String,
    state: String,
    nonce: Option<String>,
    // Display information
    email: String,
    error: Option<String>,
    client_name: Option<String>,
    scopes: Vec<ScopeInfo>,
}

/// Query parameters for the login page.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub login_hint: Option<String>,
    pub error: Option<String>,
}

/// Form data for login submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginForm {
    // OAuth2 flow parameters
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    // Login credentials
    pub email: String,
    pub password: String,
}

/// Creates the login router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(login_page))
        .routes(routes!(login_submit))
}

/// Display the login page.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/login",
    tag = super::OAUTH2_TAG,
    operation_id = "OAuth2 Login Page",
    summary = "Display the OAuth2 login page",
    description = "Renders the login form for the OAuth2 authorization flow. The user authenticates with \
                   their email and password.\n\n\
                   This endpoint is typically redirected to from the `/authorize` endpoint.",
    params(
        ("client_id" = String, Query, description = "The client identifier."),
        ("redirect_uri" = String, Query, description = "URI to redirect after authorization."),
        ("scope" = Option<String>, Query, description = "Space-separated list of requested scopes."),
        ("state" = Option<String>, Query, description = "Opaque value for CSRF protection."),
        ("nonce" = Option<String>, Query, description = "String value for replay protection."),
        ("login_hint" = Option<String>, Query, description = "Email address to pre-fill."),
        ("error" = Option<String>, Query, description = "Error message to display."),
    ),
    responses(
        (status = 200, description = "Login page HTML"),
        (status = 500, description = "Internal server error"),
    )
)]
async fn login_page(
    State(state): State<OAuth2State>,
    Query(params): Query<LoginQuery>,
) -> Response {
    // Look up client for display name
    let client_name = match state.clients.get_active_client(&params.client_id).await {
        Ok(Some(c)) => Some(c.name),
        _ => None,
    };

    // Parse scopes for display
    let scope_str = params.scope.as_deref().unwrap_or("openid");
    let scopes: Vec<ScopeInfo> = scope_str.split_whitespace().map(get_scope_info).collect();

    let template = LoginTemplate {
        client_id: params.client_id,
        redirect_uri: params.redirect_uri,
        scope: scope_str.to_string(),
        state: params.state.unwrap_or_default(),
        nonce: params.nonce,
        email: params.login_hint.unwrap_or_default(),
        error: params.error,
        client_name,
        scopes,
    };

    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render login template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Handle login form submission.
#[tracing::instrument(skip(state, headers, form), fields(client_id = %form.client_id))]
#[utoipa::path(
    post,
    path = "/login",
    tag = super::OAUTH2_TAG,
    operation_id = "OAuth2 Login Submit",
    summary = "Submit OAuth2 login credentials",
    description = "Authenticates the user with email and password. On success, establishes a server-side \
                   session and redirects to the consent page.\n\n\
                   Failed attempts count against both a per-account and a per-address ceiling; once either \
                   is exceeded the endpoint answers 429 without checking credentials.",
    request_body(
        content = LoginForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Login credentials and OAuth2 flow parameters"
    ),
    responses(
        (status = 303, description = "Redirect to the consent page, or back to login with an error"),
        (status = 429, description = "Too many login attempts", body = crate::error::ErrorResponse),
        (status = 503, description = "State store unavailable", body = crate::error::ErrorResponse),
    )
)]
async fn login_submit(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Result<Response, OAuthError> {
    let email = form.email.trim().to_lowercase();
    let ip = client_ip(&headers);

    // Both guards run before any credential is looked at.
    if let Decision::Limited { .. } = state.guard.check(GuardedOp::LoginByIp, &ip)? {
        return Err(OAuthError::RateLimited);
    }
    if let Decision::Limited { .. } = state.guard.check(GuardedOp::LoginByAccount, &email)? {
        return Err(OAuthError::RateLimited);
    }

    if email.is_empty() || !email.contains('@') {
        return Ok(redirect_to_login_with_error(
            &form,
            "Please enter a valid email address",
        ));
    }

    // Unknown account, wrong password and deactivated account all produce
    // the same message.
    let Some(account) = state.users.verify_credentials(&email, &form.password).await? else {
        return Ok(redirect_to_login_with_error(&form, "Invalid email or password"));
    };

    // The authenticated session always gets a fresh id; any id the browser
    // already carried is invalidated (session fixation).
    let previous = state.session_from_request(&headers)?.map(|(id, _)| id);
    let session_id = state
        .sessions
        .regenerate(previous.as_deref(), &account.id)?;

    state.guard.reset(GuardedOp::LoginByAccount, &email)?;
    if let Err(e) = state.users.touch_last_login(&account.id).await {
        tracing::warn!("Failed to update last_login_at: {}", e);
    }

    tracing::info!(user_id = %account.id, client_id = %form.client_id, "User authenticated");

    let mut consent_url = format!(
        "/oauth2/consent?client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(&form.client_id),
        urlencoding::encode(&form.redirect_uri),
        urlencoding::encode(&form.scope),
        urlencoding::encode(&form.state),
    );
    if let Some(nonce) = &form.nonce {
        consent_url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }

    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        session_id,
        state.sessions.ttl_secs()
    );
    if state.cookie_secure {
        cookie.push_str("; Secure");
    }
    let mut response = Redirect::to(&consent_url).into_response();
    response.headers_mut().insert(
        SET_COOKIE,
        cookie
            .parse()
            .map_err(|_| OAuthError::Internal("invalid session cookie".into()))?,
    );
    Ok(response)
}

/// Redirect back to the login page with an error message.
fn redirect_to_login_with_error(form: &LoginForm, error: &str) -> Response {
    let mut url = format!(
        "/oauth2/login?client_id={}&redirect_uri={}&scope={}&state={}&error={}",
        urlencoding::encode(&form.client_id),
        urlencoding::encode(&form.redirect_uri),
        urlencoding::encode(&form.scope),
        urlencoding::encode(&form.state),
        urlencoding::encode(error),
    );

    // Preserve email for convenience
    if !form.email.is_empty() {
        url.push_str(&format!("&login_hint={}", urlencoding::encode(&form.email)));
    }
    if let Some(ref nonce) = form.nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }

    Redirect::to(&url).into_response()
}
