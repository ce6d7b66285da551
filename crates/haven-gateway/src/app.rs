use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use haven_auth::{PrincipalStore, TokenVerifier};
use haven_core::config::HavenConfig;
use haven_llm::{ContextGuard, ModelRegistry};
use haven_store::ConversationStore;
use haven_stream::StreamCoordinator;
use haven_worker::JobQueue;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: HavenConfig,
    pub verifier: TokenVerifier,
    pub principals: PrincipalStore,
    pub store: Arc<ConversationStore>,
    pub registry: Arc<ModelRegistry>,
    pub guard: ContextGuard,
    pub coordinator: StreamCoordinator,
    pub queue: JobQueue,
    /// Client for the identity provider's token endpoint.
    pub idp_client: reqwest::Client,
}

/// An authenticated principal attached to the request by the auth layer.
#[derive(Clone)]
pub struct CurrentPrincipal(pub Arc<haven_auth::Principal>);

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/health/{service}",
            get(crate::http::health::service_health_handler),
        )
        .route("/api/auth/login", post(crate::http::auth::login_handler))
        .route("/api/auth/verify", post(crate::http::auth::verify_handler))
        .route(
            "/api/users/me",
            get(crate::http::users::me_handler).put(crate::http::users::update_me_handler),
        )
        .route("/api/users", get(crate::http::users::list_handler))
        .route(
            "/api/users/{id}",
            get(crate::http::users::get_handler).delete(crate::http::users::deactivate_handler),
        )
        .route(
            "/api/chat/conversations",
            get(crate::http::conversations::list_handler)
                .post(crate::http::conversations::create_handler),
        )
        .route(
            "/api/chat/conversations/{id}",
            get(crate::http::conversations::get_handler)
                .patch(crate::http::conversations::update_handler)
                .delete(crate::http::conversations::delete_handler),
        )
        .route(
            "/api/chat/conversations/{id}/messages",
            get(crate::http::conversations::messages_handler),
        )
        .route(
            "/api/chat/conversations/{id}/chat",
            post(crate::http::chat::chat_handler),
        )
        .route(
            "/api/chat/conversations/{id}/prepare-stream",
            post(crate::http::stream::prepare_handler),
        )
        .route("/stream/{token}", get(crate::http::stream::stream_handler))
        .route("/api/llm/models", get(crate::http::models::models_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth_layer,
        ))
        .layer(middleware::from_fn(crate::middleware::request_id_layer))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
