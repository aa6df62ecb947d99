use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use octolab_config::OctolabConfig;
use octolab_core::{DedupCache, Provisioner, RateLimiter, SystemClock};
use octolab_runtime::RuntimeRegistry;
use octolab_store::StateStore;
use tower_http::trace::TraceLayer;

use crate::auth::require_internal_token;
use crate::handlers;
use crate::state::AppState;

/// Builds the internal operational router: provision/terminate/port
/// allocation, status/evidence reads, and evidence event ingest. Every
/// route is guarded by `require_internal_token` — there are no public
/// endpoints here.
pub fn build_app(
    store: Arc<dyn StateStore>,
    registry: Arc<RuntimeRegistry>,
    provisioner: Arc<Provisioner>,
    config: OctolabConfig,
) -> Router {
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_lab_per_minute,
        Box::new(SystemClock),
    ));
    let dedup = Arc::new(DedupCache::new(config.dedup_ttl_seconds, Box::new(SystemClock)));

    let state = AppState {
        store,
        registry,
        provisioner,
        rate_limiter,
        dedup,
        config: Arc::new(config),
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/labs/:id", get(handlers::get_lab))
        .route("/labs/:id/provision", post(handlers::post_provision))
        .route("/labs/:id/terminate", post(handlers::post_terminate))
        .route("/labs/:id/port/allocate", post(handlers::post_allocate_port))
        .route("/labs/:id/port/release", post(handlers::post_release_port))
        .route("/labs/:id/events", post(handlers::post_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_internal_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use octolab_domain::{Lab, OwnerId, RecipeId, RuntimeKind};
    use octolab_runtime::{NoopRuntime, PortAllocator};
    use octolab_store::InMemoryStore;
    use serde_json::Value;
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    fn test_config() -> OctolabConfig {
        std::env::set_var("OCTOLAB_RUNTIME", "noop");
        std::env::set_var("OCTOLAB_PORT_MIN", "20000");
        std::env::set_var("OCTOLAB_PORT_MAX", "21000");
        std::env::set_var("OCTOLAB_STARTUP_TIMEOUT_SECONDS", "60");
        std::env::set_var("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", "30");
        std::env::set_var("OCTOLAB_STATE_ROOT", "/var/lib/octolab");
        std::env::set_var("OCTOLAB_INTERNAL_TOKEN", TEST_TOKEN);
        std::env::set_var("OCTOLAB_READINESS_GATING_ENABLED", "false");
        OctolabConfig::from_env().unwrap()
    }

    struct NullRecipes;

    #[async_trait::async_trait]
    impl octolab_core::RecipeSource for NullRecipes {
        async fn load_recipe(
            &self,
            _recipe_id: RecipeId,
        ) -> Result<Option<Value>, octolab_core::CoreError> {
            Ok(Some(Value::Null))
        }
    }

    fn test_app(store: Arc<dyn StateStore>) -> Router {
        let config = test_config();
        let noop: Arc<dyn octolab_runtime::LabRuntime> = Arc::new(NoopRuntime::new());
        let registry = Arc::new(
            RuntimeRegistry::new(config.clone(), noop.clone(), noop.clone(), noop).unwrap(),
        );
        let ports = PortAllocator::new(store.clone(), config.port_min, config.port_max);
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            ports,
            registry.clone(),
            Arc::new(NullRecipes),
            config.clone(),
        ));
        build_app(store, registry, provisioner, config)
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {TEST_TOKEN}"))
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let app = test_app(Arc::new(InMemoryStore::new()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app(Arc::new(InMemoryStore::new()));
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn lab_not_found_returns_404() {
        let app = test_app(Arc::new(InMemoryStore::new()));
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!(
                    "/labs/{}?owner_id={}",
                    uuid::Uuid::new_v4(),
                    uuid::Uuid::new_v4()
                )))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_lab_rejects_foreign_owner() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let stranger = uuid::Uuid::new_v4();
        let lab = Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            chrono::Utc::now(),
        );
        store.insert_lab(&lab).await.unwrap();

        let app = test_app(store);
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!(
                    "/labs/{}?owner_id={}",
                    lab.id.as_uuid(),
                    stranger
                )))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_lab_returns_owned_lab() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab = Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            chrono::Utc::now(),
        );
        store.insert_lab(&lab).await.unwrap();

        let app = test_app(store);
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!(
                    "/labs/{}?owner_id={}",
                    lab.id.as_uuid(),
                    owner.0
                )))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn provision_requested_lab_returns_202() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let owner = OwnerId(uuid::Uuid::new_v4());
        let lab = Lab::new_requested(
            owner,
            RecipeId(uuid::Uuid::new_v4()),
            RuntimeKind::Compose,
            Value::Null,
            chrono::Utc::now(),
        );
        store.insert_lab(&lab).await.unwrap();

        let app = test_app(store);
        let body = serde_json::json!({ "owner_id": owner.0 }).to_string();
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/labs/{}/provision", lab.id.as_uuid()))
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
