use std::future::ready;
use std::sync::Arc;

use axum::{
    extract::State as AxumState,
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::api::{admin, client, frontend};
use crate::config::Config;
use crate::metrics::aggregator::MetricsAggregator;
use crate::metrics::registry::ApplicationRegistry;
use crate::metrics_utils::{setup_metrics_recorder, track_metrics};
use crate::store::Stores;
use crate::time::TimeSource;
use crate::tokens::token_resolver::TokenResolver;
use crate::toggles::toggle_filter::ToggleFilter;

#[derive(Clone)]
pub struct State {
    pub token_resolver: Arc<TokenResolver>,
    pub toggle_filter: Arc<ToggleFilter>,
    pub metrics_aggregator: Arc<MetricsAggregator>,
    pub application_registry: Arc<ApplicationRegistry>,
    pub stores: Stores,
    pub clock: Arc<dyn TimeSource + Send + Sync>,
}

impl State {
    pub fn new<T>(stores: Stores, clock: T) -> State
    where
        T: TimeSource + Send + Sync + 'static,
    {
        let clock: Arc<dyn TimeSource + Send + Sync> = Arc::new(clock);
        State {
            token_resolver: Arc::new(TokenResolver::new(stores.tokens.clone())),
            toggle_filter: Arc::new(ToggleFilter::new(stores.toggles.clone())),
            metrics_aggregator: Arc::new(MetricsAggregator::new(
                stores.metrics.clone(),
                clock.clone(),
            )),
            application_registry: Arc::new(ApplicationRegistry::new(
                stores.applications.clone(),
            )),
            stores,
            clock,
        }
    }
}

pub fn router<T>(stores: Stores, clock: T, config: &Config) -> Router
where
    T: TimeSource + Send + Sync + 'static,
{
    let state = State::new(stores, clock);

    // SDKs run in browsers behind arbitrary origins.
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let status_router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/_readiness", get(readiness));

    let frontend_router = Router::new()
        .route("/api/frontend", get(frontend::features))
        .route("/api/frontend/client/register", post(frontend::register))
        .route("/api/frontend/client/metrics", post(frontend::metrics));

    let client_router = Router::new()
        .route("/api/client/features", get(client::features))
        .route("/api/client/register", post(client::register))
        .route("/api/client/metrics", post(client::metrics));

    let feature_path = "/api/admin/projects/:project_id/features/:feature_name";
    let admin_router = Router::new()
        .route(
            "/api/admin/api-tokens",
            get(admin::list_tokens).post(admin::create_token),
        )
        .route("/api/admin/api-tokens/:secret", delete(admin::delete_token))
        .route(
            "/api/admin/projects/:project_id/features",
            get(admin::list_features).post(admin::create_feature),
        )
        .route(feature_path, delete(admin::archive_feature))
        .route(
            &format!("{feature_path}/environments/:environment/on"),
            post(admin::enable_environment),
        )
        .route(
            &format!("{feature_path}/environments/:environment/off"),
            post(admin::disable_environment),
        )
        .route(
            &format!("{feature_path}/environments/:environment/strategies"),
            post(admin::add_strategy),
        )
        .route(
            &format!("{feature_path}/environments/:environment/strategies/:strategy_id"),
            delete(admin::remove_strategy),
        )
        .route(
            "/api/admin/client-metrics/features/:feature_name",
            get(admin::feature_usage),
        )
        .route(
            "/api/admin/metrics/applications",
            get(admin::list_applications),
        );

    let api_router = Router::new()
        .merge(frontend_router)
        .merge(client_router)
        .merge(admin_router)
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let router = Router::new()
        .merge(status_router)
        .merge(api_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Global metrics recorders can play poorly with e.g. tests,
    // so only install one when asked to.
    if *config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::error!("failed to install metrics recorder: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn index() -> &'static str {
    "feature toggles"
}

pub async fn readiness(
    state: AxumState<State>,
) -> Result<&'static str, (StatusCode, String)> {
    state.stores.health.ping().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("store unavailable: {e}"),
        )
    })?;
    Ok("ready")
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request},
    };
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::test_utils::{insert_toggle, insert_token, memory_stores};
    use crate::time::FixedTime;
    use crate::tokens::token_models::TokenType;

    const ADMIN: &str = "*:*.admin-secret";
    const FRONTEND: &str = "default:development.frontend-secret";
    const CLIENT: &str = "default:development.client-secret";

    async fn app_with(stores: Stores) -> Router {
        for (secret, token_type) in [
            (ADMIN, TokenType::Admin),
            (FRONTEND, TokenType::Frontend),
            (CLIENT, TokenType::Client),
        ] {
            insert_token(&stores, secret, token_type).await.unwrap();
        }
        let clock = FixedTime {
            time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap(),
        };
        router(stores, clock, &Config::default_test_config())
    }

    async fn app() -> Router {
        app_with(memory_stores()).await
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, token);
        }
        match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_status_routes() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"feature toggles");

        for path in ["/_liveness", "/_readiness"] {
            let (status, _) = send(&app, request(Method::GET, path, None, None)).await;
            assert_eq!(status, StatusCode::OK, "{path}");
        }

        let (status, _) = send(&app, request(Method::GET, "/metrics", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_frontend_token_types() {
        let app = app().await;

        let (status, body) = send(&app, request(Method::GET, "/api/frontend", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "missing_token");

        let (status, body) =
            send(&app, request(Method::GET, "/api/frontend", Some(CLIENT), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["type"], "authentication_error");

        for token in [FRONTEND, ADMIN] {
            let (status, body) =
                send(&app, request(Method::GET, "/api/frontend", Some(token), None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"toggles": []}));
        }
    }

    #[tokio::test]
    async fn test_frontend_filters_by_app_name() {
        let stores = memory_stores();
        for (name, apps) in [("only-a", json!(["a"])), ("a-or-b", json!(["a", "b"]))] {
            insert_toggle(
                &stores,
                "default",
                name,
                "development",
                json!([{
                    "name": "default",
                    "constraints": [{"contextName": "appName", "operator": "IN", "values": apps}]
                }]),
            )
            .await
            .unwrap();
        }
        let app = app_with(stores).await;

        for (app_name, expected) in [("a", 2), ("b", 1), ("c", 0)] {
            let (status, body) = send(
                &app,
                request(
                    Method::GET,
                    &format!("/api/frontend?appName={app_name}"),
                    Some(FRONTEND),
                    None,
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                body["toggles"].as_array().unwrap().len(),
                expected,
                "appName={app_name}"
            );
        }
    }

    #[tokio::test]
    async fn test_unsupported_methods() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(request(Method::DELETE, "/api/frontend", Some(FRONTEND), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app
            .oneshot(request(
                Method::GET,
                "/api/frontend/client/metrics",
                Some(FRONTEND),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_admin_feature_lifecycle() {
        let app = app().await;
        let features = "/api/admin/projects/default/features";

        let (status, _) = send(
            &app,
            request(Method::POST, features, Some(ADMIN), Some(json!({"name": "checkout"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            request(Method::POST, features, Some(ADMIN), Some(json!({"name": "checkout"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, strategy) = send(
            &app,
            request(
                Method::POST,
                &format!("{features}/checkout/environments/development/strategies"),
                Some(ADMIN),
                Some(json!({"name": "default"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(strategy["name"], "default");

        let (status, _) = send(
            &app,
            request(
                Method::POST,
                &format!("{features}/checkout/environments/development/on"),
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, request(Method::GET, "/api/frontend", Some(FRONTEND), None)).await;
        assert_eq!(body["toggles"][0]["name"], "checkout");
        assert_eq!(body["toggles"][0]["variant"]["name"], "disabled");

        let strategy_id = strategy["id"].as_str().unwrap();
        let (status, _) = send(
            &app,
            request(
                Method::DELETE,
                &format!("{features}/checkout/environments/development/strategies/{strategy_id}"),
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, request(Method::GET, "/api/frontend", Some(FRONTEND), None)).await;
        assert_eq!(body, json!({"toggles": []}));

        let (status, _) = send(
            &app,
            request(Method::DELETE, &format!("{features}/checkout"), Some(ADMIN), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            request(Method::DELETE, &format!("{features}/checkout"), Some(ADMIN), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_strategy_is_bad_request() {
        let app = app().await;
        let features = "/api/admin/projects/default/features";
        send(
            &app,
            request(Method::POST, features, Some(ADMIN), Some(json!({"name": "checkout"}))),
        )
        .await;

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                &format!("{features}/checkout/environments/development/strategies"),
                Some(ADMIN),
                Some(json!({
                    "name": "default",
                    "constraints": [{"contextName": "appName", "operator": "MATCHES", "values": ["a"]}]
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_definition");

        let (status, _) = send(
            &app,
            request(
                Method::POST,
                &format!("{features}/missing/environments/development/strategies"),
                Some(ADMIN),
                Some(json!({"name": "default"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_sdk_tokens() {
        let app = app().await;
        for token in [FRONTEND, CLIENT] {
            let (status, _) =
                send(&app, request(Method::GET, "/api/admin/api-tokens", Some(token), None)).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test]
    async fn test_usage_reads_back_posted_metrics() {
        let app = app().await;
        let bucket = json!({
            "appName": "web",
            "instanceId": "i-1",
            "bucket": {
                "start": "2024-06-01T12:05:00Z",
                "stop": "2024-06-01T12:06:00Z",
                "toggles": {"checkout": {"yes": 1, "no": 10}}
            }
        });
        for _ in 0..2 {
            let (status, _) = send(
                &app,
                request(
                    Method::POST,
                    "/api/client/metrics",
                    Some(CLIENT),
                    Some(bucket.clone()),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = send(
            &app,
            request(
                Method::GET,
                "/api/admin/client-metrics/features/checkout",
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["featureName"], "checkout");
        assert_eq!(body["lastHourUsage"][0]["yes"], 2);
        assert_eq!(body["lastHourUsage"][0]["no"], 20);
        assert_eq!(body["lastHourUsage"][0]["environment"], "development");
        assert_eq!(body["seenApplications"], json!(["web"]));

        let (status, body) = send(
            &app,
            request(
                Method::GET,
                "/api/admin/client-metrics/features/checkout?hoursBack=abc",
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");

        let (status, body) = send(
            &app,
            request(
                Method::GET,
                "/api/admin/client-metrics/features/checkout?hoursBack=4294967295",
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_usage_counts_never_wrap() {
        let app = app().await;
        for yes in [u64::MAX, 1] {
            let bucket = json!({
                "appName": "web",
                "bucket": {
                    "start": "2024-06-01T12:05:00Z",
                    "stop": "2024-06-01T12:06:00Z",
                    "toggles": {"checkout": {"yes": yes, "no": 1}}
                }
            });
            let (status, _) = send(
                &app,
                request(Method::POST, "/api/client/metrics", Some(CLIENT), Some(bucket)),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = send(
            &app,
            request(
                Method::GET,
                "/api/admin/client-metrics/features/checkout",
                Some(ADMIN),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastHourUsage"][0]["yes"], json!(u64::MAX));
        assert_eq!(body["lastHourUsage"][0]["no"], 2);
    }
}
