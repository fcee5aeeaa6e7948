//! OAuth2 endpoint tests.
//!
//! End-to-end tests for the authorization server: the full browser flow
//! (authorize -> login -> consent -> code -> tokens), grant redemption edge
//! cases, refresh rotation, revocation and rate limiting.

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use rust_sso_service::api::build_router;
use rust_sso_service::config::{AppConfig, JwtConfig, RateLimitConfig};
use rust_sso_service::oauth2::{OAuth2State, hash_password};
use rust_sso_service::store::{MemoryStore, StateStore, StoreError, Window};
use rust_sso_service::tokens::{TokenKeys, TokenService, TokenUse};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use std::sync::Arc;
use std::time::Duration;

const PRIVATE_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/test_rsa_private.pem"));
const PUBLIC_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/test_rsa_public.pem"));

const CLIENT_ID: &str = "web-app";
const CLIENT_SECRET: &str = "s3cret-value";
const OTHER_CLIENT_ID: &str = "other-app";
const CALLBACK: &str = "http://localhost:3000/callback";
const USER_EMAIL: &str = "alice@example.com";
const USER_PASSWORD: &str = "correct horse battery staple";

/// Create a test database with the identity tables and seed data.
async fn create_test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE user (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NULL,
            password_hash TEXT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            email_verified INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_login_at TEXT NULL
        );"#,
    ))
    .await
    .expect("create user table");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE oauth2_client (
            id TEXT PRIMARY KEY,
            secret_hash TEXT NOT NULL,
            name TEXT NOT NULL,
            redirect_uris TEXT NOT NULL,
            scopes TEXT NOT NULL DEFAULT 'openid profile email',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
    ))
    .await
    .expect("create oauth2_client table");

    let password_hash = hash_password(USER_PASSWORD).expect("hash password");
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        format!(
            r#"INSERT INTO user (id, email, username, display_name, password_hash, is_active, email_verified, created_at)
               VALUES ('user-123', '{USER_EMAIL}', 'alice', 'Alice', '{password_hash}', 1, 1, datetime('now'));"#
        ),
    ))
    .await
    .expect("insert test user");

    let secret_hash = hash_password(CLIENT_SECRET).expect("hash client secret");
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        format!(
            r#"INSERT INTO oauth2_client (id, secret_hash, name, redirect_uris, scopes, is_active, created_at, updated_at)
               VALUES ('{CLIENT_ID}', '{secret_hash}', 'Test Web App', '["{CALLBACK}"]', 'openid profile email', 1, datetime('now'), datetime('now'));"#
        ),
    ))
    .await
    .expect("insert test client");

    let other_secret_hash = hash_password("other-secret").expect("hash other secret");
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        format!(
            r#"INSERT INTO oauth2_client (id, secret_hash, name, redirect_uris, scopes, is_active, created_at, updated_at)
               VALUES ('{OTHER_CLIENT_ID}', '{other_secret_hash}', 'Other App', '["{CALLBACK}"]', 'openid', 1, datetime('now'), datetime('now'));"#
        ),
    ))
    .await
    .expect("insert other client");

    db
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        issuer_url: "http://localhost:8080".into(),
        bind_addr: "127.0.0.1:0".into(),
        session_ttl_secs: 3600,
        authorization_code_ttl_secs: 600,
        jwt: JwtConfig {
            private_key_path: String::new(),
            public_key_path: String::new(),
            previous_public_key_path: None,
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 86400,
            id_token_ttl_secs: 3600,
        },
        rate_limit: RateLimitConfig::default(),
    }
}

struct TestContext {
    server: TestServer,
    state: OAuth2State,
    db: Arc<DatabaseConnection>,
}

async fn setup_with(config: AppConfig) -> TestContext {
    let db = Arc::new(create_test_db().await);
    let store = Arc::new(MemoryStore::new());
    let keys =
        TokenKeys::from_pem(PRIVATE_PEM.as_bytes(), PUBLIC_PEM.as_bytes(), None).expect("keys");
    let tokens = TokenService::new(keys, store.clone(), config.issuer_url.clone(), &config.jwt);
    let state = OAuth2State::new(db.clone(), store, tokens, &config);
    let server = TestServer::new(build_router(state.clone())).expect("create test server");
    TestContext { server, state, db }
}

async fn setup() -> TestContext {
    setup_with(test_config()).await
}

fn location_of(response: &axum_test::TestResponse) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .expect("location utf-8")
        .to_string()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let absolute = url::Url::parse("http://localhost")
        .unwrap()
        .join(url)
        .expect("parse url");
    absolute
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Run the full browser flow for the seeded user and client, returning the
/// token-endpoint JSON response.
async fn obtain_tokens(ctx: &TestContext, scope: &str, nonce: Option<&str>) -> serde_json::Value {
    // Step 1: authorization request redirects to login.
    let mut authorize = ctx
        .server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .add_query_param("scope", scope)
        .add_query_param("state", "xyz-state");
    if let Some(n) = nonce {
        authorize = authorize.add_query_param("nonce", n);
    }
    let response = authorize.await;
    response.assert_status_see_other();
    assert!(location_of(&response).starts_with("/oauth2/login"));

    // Step 2: credentials establish a session and land on consent.
    let mut login_form = vec![
        ("client_id", CLIENT_ID.to_string()),
        ("redirect_uri", CALLBACK.to_string()),
        ("scope", scope.to_string()),
        ("state", "xyz-state".to_string()),
        ("email", USER_EMAIL.to_string()),
        ("password", USER_PASSWORD.to_string()),
    ];
    if let Some(n) = nonce {
        login_form.push(("nonce", n.to_string()));
    }
    let response = ctx.server.post("/oauth2/login").form(&login_form).await;
    response.assert_status_see_other();
    assert!(location_of(&response).starts_with("/oauth2/consent"));
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .expect("cookie utf-8")
        .split(';')
        .next()
        .expect("cookie pair")
        .to_string();
    assert!(cookie.starts_with("sso_session="));

    // Step 3: approve consent, harvest the code from the redirect.
    let mut consent_form = vec![
        ("client_id", CLIENT_ID.to_string()),
        ("redirect_uri", CALLBACK.to_string()),
        ("scope", scope.to_string()),
        ("state", "xyz-state".to_string()),
        ("action", "approve".to_string()),
    ];
    if let Some(n) = nonce {
        consent_form.push(("nonce", n.to_string()));
    }
    let response = ctx
        .server
        .post("/oauth2/consent")
        .add_header(header::COOKIE, HeaderValue::from_str(&cookie).unwrap())
        .form(&consent_form)
        .await;
    response.assert_status_see_other();
    let location = location_of(&response);
    assert!(location.starts_with(CALLBACK));
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz-state"));
    let code = query_param(&location, "code").expect("authorization code");

    // Step 4: redeem the code.
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", CALLBACK),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_ok();
    response.json::<serde_json::Value>()
}

// =============================================================================
// Full flow
// =============================================================================

#[tokio::test]
async fn full_authorization_code_flow_issues_tokens() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid profile email", Some("nonce-123")).await;

    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["scope"], "openid profile email");
    assert_eq!(tokens["expires_in"], 3600);
    assert!(tokens["access_token"].is_string());
    assert!(tokens["refresh_token"].is_string());

    // The ID token echoes the nonce and names the user and client.
    let id_token = tokens["id_token"].as_str().expect("id_token");
    let claims = ctx
        .state
        .tokens
        .verify(id_token, TokenUse::Id)
        .expect("valid id token");
    assert_eq!(claims.sub, "user-123");
    assert_eq!(claims.aud, CLIENT_ID);
    assert_eq!(claims.nonce.as_deref(), Some("nonce-123"));
    assert!(claims.auth_time.is_some());

    // The access token works against userinfo.
    let access_token = tokens["access_token"].as_str().unwrap();
    let response = ctx
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).unwrap(),
        )
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["sub"], "user-123");
    assert_eq!(body["email"], USER_EMAIL);
    assert_eq!(body["email_verified"], true);
    assert_eq!(body["name"], "Alice");
    assert_eq!(body["preferred_username"], "alice");
}

#[tokio::test]
async fn scope_without_openid_gets_no_id_token() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "profile", None).await;
    assert!(tokens.get("id_token").is_none());
    assert!(tokens["access_token"].is_string());
}

// =============================================================================
// Authorization endpoint
// =============================================================================

#[tokio::test]
async fn authorize_with_unknown_client_renders_error_page() {
    let ctx = setup().await;
    let response = ctx
        .server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "nonexistent")
        .add_query_param("redirect_uri", CALLBACK)
        .await;

    response.assert_status_bad_request();
    assert!(response.headers().get(header::LOCATION).is_none());
}

#[tokio::test]
async fn authorize_with_unregistered_redirect_uri_never_redirects() {
    let ctx = setup().await;
    let response = ctx
        .server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", "http://evil.example.org/callback")
        .add_query_param("state", "xyz")
        .await;

    response.assert_status_bad_request();
    assert!(response.headers().get(header::LOCATION).is_none());
}

#[tokio::test]
async fn authorize_with_wrong_response_type_redirects_with_error() {
    let ctx = setup().await;
    let response = ctx
        .server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "token")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .add_query_param("state", "xyz")
        .await;

    response.assert_status_see_other();
    let location = location_of(&response);
    assert!(location.starts_with(CALLBACK));
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("unsupported_response_type")
    );
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
}

#[tokio::test]
async fn authorize_with_disallowed_scope_redirects_with_error() {
    let ctx = setup().await;
    let response = ctx
        .server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .add_query_param("scope", "openid admin")
        .await;

    response.assert_status_see_other();
    let location = location_of(&response);
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("invalid_scope")
    );
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test]
async fn wrong_password_redirects_back_with_generic_error() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", USER_EMAIL),
            ("password", "not-the-password"),
        ])
        .await;

    response.assert_status_see_other();
    let location = location_of(&response);
    assert!(location.starts_with("/oauth2/login"));
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("Invalid email or password")
    );
    assert!(response.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn unknown_account_gets_the_same_error_as_wrong_password() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", "nobody@example.com"),
            ("password", "whatever"),
        ])
        .await;

    response.assert_status_see_other();
    assert_eq!(
        query_param(&location_of(&response), "error").as_deref(),
        Some("Invalid email or password")
    );
}

#[tokio::test]
async fn login_attempts_beyond_the_account_ceiling_answer_429() {
    let mut config = test_config();
    config.rate_limit.login_per_account = 2;
    config.rate_limit.login_per_ip = 100;
    let ctx = setup_with(config).await;

    for _ in 0..2 {
        let response = ctx
            .server
            .post("/oauth2/login")
            .form(&[
                ("client_id", CLIENT_ID),
                ("redirect_uri", CALLBACK),
                ("scope", "openid"),
                ("state", "xyz"),
                ("email", USER_EMAIL),
                ("password", "wrong"),
            ])
            .await;
        response.assert_status_see_other();
    }

    // Third attempt is throttled before credentials are even checked; the
    // correct password makes no difference.
    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "rate_limited");
}

// =============================================================================
// Consent
// =============================================================================

#[tokio::test]
async fn consent_without_session_redirects_to_login() {
    let ctx = setup().await;
    let response = ctx
        .server
        .get("/oauth2/consent")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .add_query_param("scope", "openid")
        .add_query_param("state", "xyz")
        .await;

    response.assert_status_see_other();
    assert!(location_of(&response).starts_with("/oauth2/login"));
}

#[tokio::test]
async fn denying_consent_redirects_with_access_denied() {
    let ctx = setup().await;

    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    response.assert_status_see_other();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let response = ctx
        .server
        .post("/oauth2/consent")
        .add_header(header::COOKIE, HeaderValue::from_str(&cookie).unwrap())
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("action", "deny"),
        ])
        .await;

    response.assert_status_see_other();
    let location = location_of(&response);
    assert!(location.starts_with(CALLBACK));
    assert_eq!(
        query_param(&location, "error").as_deref(),
        Some("access_denied")
    );
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
    assert!(query_param(&location, "code").is_none());
}

// =============================================================================
// Token endpoint
// =============================================================================

#[tokio::test]
async fn authorization_code_is_single_use() {
    let ctx = setup().await;

    // Drive the flow manually so the raw code is available.
    ctx.server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .add_query_param("scope", "openid")
        .add_query_param("state", "s")
        .await
        .assert_status_see_other();
    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "s"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let response = ctx
        .server
        .post("/oauth2/consent")
        .add_header(header::COOKIE, HeaderValue::from_str(&cookie).unwrap())
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "s"),
            ("action", "approve"),
        ])
        .await;
    let code = query_param(&location_of(&response), "code").expect("code");

    let redeem = |code: String| {
        ctx.server.post("/oauth2/token").form(&[
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", CALLBACK.to_string()),
            ("client_id", CLIENT_ID.to_string()),
            ("client_secret", CLIENT_SECRET.to_string()),
        ])
    };

    redeem(code.clone()).await.assert_status_ok();

    let response = redeem(code).await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn code_redeemed_by_a_different_client_is_rejected() {
    let ctx = setup().await;

    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "s"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let response = ctx
        .server
        .post("/oauth2/consent")
        .add_header(header::COOKIE, HeaderValue::from_str(&cookie).unwrap())
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "s"),
            ("action", "approve"),
        ])
        .await;
    let code = query_param(&location_of(&response), "code").expect("code");

    // The other client authenticates fine but does not own the grant.
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", CALLBACK),
            ("client_id", OTHER_CLIENT_ID),
            ("client_secret", "other-secret"),
        ])
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn wrong_client_secret_is_rejected() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", "anything"),
            ("redirect_uri", CALLBACK),
            ("client_id", CLIENT_ID),
            ("client_secret", "wrong-secret"),
        ])
        .await;
    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn unsupported_grant_type_is_rejected() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn client_can_authenticate_with_basic_auth() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    use base64::Engine;
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("{CLIENT_ID}:{CLIENT_SECRET}"));
    let response = ctx
        .server
        .post("/oauth2/token")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {basic}")).unwrap(),
        )
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await;
    response.assert_status_ok();
}

// =============================================================================
// Refresh rotation
// =============================================================================

#[tokio::test]
async fn refresh_rotation_invalidates_the_presented_token() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid profile", None).await;
    let old_refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &old_refresh),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_ok();
    let rotated: serde_json::Value = response.json();
    let new_refresh = rotated["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(old_refresh, new_refresh);
    // Scope carries over without being re-requested.
    assert_eq!(rotated["scope"], "openid profile");

    // Replaying the rotated-away token is reuse and fails.
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &old_refresh),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");

    // The replacement still works.
    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &new_refresh),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn refresh_token_of_another_client_is_rejected() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", OTHER_CLIENT_ID),
            ("client_secret", "other-secret"),
        ])
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn deactivated_user_cannot_refresh() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    ctx.db
        .execute(Statement::from_string(
            DbBackend::Sqlite,
            "UPDATE user SET is_active = 0 WHERE id = 'user-123';".to_string(),
        ))
        .await
        .expect("deactivate user");

    let response = ctx
        .server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

// =============================================================================
// Revocation
// =============================================================================

#[tokio::test]
async fn revoked_access_token_stops_working_immediately() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    let response = ctx
        .server
        .post("/oauth2/revoke")
        .form(&[
            ("token", access_token),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_ok();

    let response = ctx
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).unwrap(),
        )
        .await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn revoking_an_unknown_token_still_returns_200() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/revoke")
        .form(&[
            ("token", "not-a-real-token"),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn revocation_by_a_different_client_does_not_revoke() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    // Other client asks to revoke a token it does not own: 200, no effect.
    let response = ctx
        .server
        .post("/oauth2/revoke")
        .form(&[
            ("token", access_token),
            ("client_id", OTHER_CLIENT_ID),
            ("client_secret", "other-secret"),
        ])
        .await;
    response.assert_status_ok();

    let response = ctx
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).unwrap(),
        )
        .await;
    response.assert_status_ok();
}

// =============================================================================
// UserInfo and discovery
// =============================================================================

#[tokio::test]
async fn userinfo_without_token_is_unauthorized() {
    let ctx = setup().await;
    let response = ctx.server.get("/oauth2/userinfo").await;
    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn userinfo_filters_claims_by_scope() {
    let ctx = setup().await;
    let tokens = obtain_tokens(&ctx, "openid profile", None).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    let response = ctx
        .server
        .get("/oauth2/userinfo")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).unwrap(),
        )
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["sub"], "user-123");
    assert_eq!(body["name"], "Alice");
    // No email scope, no email claims.
    assert!(body.get("email").is_none());
    assert!(body.get("email_verified").is_none());
}

#[tokio::test]
async fn discovery_document_names_the_endpoints() {
    let ctx = setup().await;
    let response = ctx.server.get("/.well-known/openid-configuration").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["issuer"], "http://localhost:8080");
    assert_eq!(
        body["token_endpoint"],
        "http://localhost:8080/oauth2/token"
    );
    assert_eq!(
        body["jwks_uri"],
        "http://localhost:8080/.well-known/jwks.json"
    );
    assert_eq!(
        body["id_token_signing_alg_values_supported"],
        serde_json::json!(["RS256"])
    );
}

#[tokio::test]
async fn jwks_publishes_the_signing_key() {
    let ctx = setup().await;
    let response = ctx.server.get("/.well-known/jwks.json").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let keys = body["keys"].as_array().expect("keys array");
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["use"], "sig");
    assert_eq!(keys[0]["alg"], "RS256");
    assert!(keys[0]["n"].as_str().is_some_and(|n| !n.is_empty()));

    // Issued tokens name the published key in their header.
    let tokens = obtain_tokens(&ctx, "openid", None).await;
    let header =
        jsonwebtoken::decode_header(tokens["access_token"].as_str().unwrap()).expect("jwt header");
    assert_eq!(header.kid.as_deref(), keys[0]["kid"].as_str());
}

#[tokio::test]
async fn session_cookie_is_secure_behind_https() {
    let mut config = test_config();
    config.issuer_url = "https://sso.example.org".into();
    let ctx = setup_with(config).await;

    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    response.assert_status_see_other();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.contains("; Secure"));
    assert!(cookie.contains("HttpOnly"));

    // Plain-http issuers (local development) leave the attribute off.
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/oauth2/login")
        .form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", CALLBACK),
            ("scope", "openid"),
            ("state", "xyz"),
            ("email", USER_EMAIL),
            ("password", USER_PASSWORD),
        ])
        .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!cookie.contains("Secure"));
}

// =============================================================================
// Store faults
// =============================================================================

/// A state store whose every operation fails, standing in for an
/// unreachable backend.
struct DownStore;

impl StateStore for DownStore {
    fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn take(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn increment_with_window(
        &self,
        _key: &str,
        _window: Duration,
        _ceiling: u64,
    ) -> Result<Window, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn reset_window(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }
}

#[tokio::test]
async fn endpoints_fail_closed_when_the_store_is_down() {
    let db = Arc::new(create_test_db().await);
    let config = test_config();
    let store = Arc::new(DownStore);
    let keys =
        TokenKeys::from_pem(PRIVATE_PEM.as_bytes(), PUBLIC_PEM.as_bytes(), None).expect("keys");
    let tokens = TokenService::new(keys, store.clone(), config.issuer_url.clone(), &config.jwt);
    let state = OAuth2State::new(db, store, tokens, &config);
    let server = TestServer::new(build_router(state)).expect("create test server");

    // A grant must never read as invalid_grant when the store is the
    // problem, and a down store must never read as "not rate limited".
    let response = server
        .post("/oauth2/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", "anything"),
            ("redirect_uri", CALLBACK),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ])
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "temporarily_unavailable");
    // Backend details stay out of the response.
    assert!(body.get("error_description").is_none());

    let response = server
        .get("/oauth2/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", CLIENT_ID)
        .add_query_param("redirect_uri", CALLBACK)
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "temporarily_unavailable");
}

#[tokio::test]
async fn healthz_answers_ok() {
    let ctx = setup().await;
    let response = ctx.server.get("/healthz").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "ok");
}
