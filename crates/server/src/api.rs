use crate::oauth2::{self, OAUTH2_TAG, OAuth2State};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

const MISC_TAG: &str = "Miscellaneous";

#[utoipa::path(
    method(get, head),
    path = "/healthz",
    tag = MISC_TAG,
    operation_id = "Health Check",
    responses(
        (status = OK, description = "Ok", body = str, content_type = "text/plain", example = "ok")
    )
)]
async fn health() -> &'static str {
    "ok"
}

/// Assemble the full application router: the OAuth2 endpoints under
/// `/oauth2`, the discovery document at the root, the health check, and the
/// rendered API docs.
pub fn build_router(state: OAuth2State) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/oauth2", oauth2::router(state.clone()))
        .merge(oauth2::discovery_router(state))
        .routes(routes!(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

pub async fn start_webserver(state: OAuth2State, bind_addr: &str) -> color_eyre::Result<()> {
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Server running on http://{bind_addr}");
    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let bearer = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .description(Some(
                    "Use an access token obtained from the `/oauth2/token` endpoint.",
                ))
                .build();
            components.add_security_scheme("bearer_auth", SecurityScheme::Http(bearer));
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "SSO Authorization Server API",
        version = "1.0.0",
        description = "OAuth 2.0 / OpenID Connect single sign-on authorization server."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = OAUTH2_TAG, description = "OAuth2 / OpenID Connect endpoints")
    )
)]
struct ApiDoc;
