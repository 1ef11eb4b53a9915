// Reverse proxy mounts against real upstream servers
#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc};

    use axum::{
        Json, Router,
        body::Body,
        http::{HeaderMap, Request, Uri},
    };
    use base64::{Engine, engine::general_purpose::STANDARD};
    use gatehouse::{
        GatewayService,
        adapters::{FileSystemAdapter, HttpClientAdapter, HttpHandler, PoolSettings, build_plugins},
        config::{AccountStoreConfig, AuthenticatorConfig, GatewayConfig, MountConfig, PluginConfig, ProxyOptions},
        core::gateway::HttpClientFactory,
        ports::http_client::HttpClient,
        utils::InFlightTracker,
    };
    use http_body_util::BodyExt;
    use hyper::{Method, StatusCode, header};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    /// Upstream answering with what it received.
    async fn spawn_upstream(name: &'static str) -> SocketAddr {
        let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap| async move {
            let seen: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().into()))
                .collect();
            Json(serde_json::json!({
                "upstream": name,
                "uri": uri.to_string(),
                "headers": seen,
            }))
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn router(config: &GatewayConfig) -> Router {
        let plugins = build_plugins(config).unwrap_or_else(|e| panic!("plugins failed: {e}"));
        let clients: HttpClientFactory = Arc::new(|options: &ProxyOptions| {
            let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new(PoolSettings::from(options))?);
            Ok(client)
        });
        let gateway = GatewayService::bootstrap(
            config,
            plugins.registry.clone(),
            Arc::new(FileSystemAdapter::new()),
            clients,
        )
        .unwrap_or_else(|e| panic!("bootstrap failed: {e}"));
        HttpHandler::new(
            Arc::new(gateway),
            config.requests_limit,
            Arc::new(InFlightTracker::new()),
            Arc::default(),
        )
        .into_router()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_over_healthy_upstreams() {
        let a = spawn_upstream("a").await;
        let b = spawn_upstream("b").await;
        let config = GatewayConfig::builder()
            .mount(MountConfig::proxy("/api", vec![format!("http://{a}/v1"), format!("http://{b}/v1")]).secured(false))
            .build()
            .unwrap();
        let router = router(&config);

        let mut served = Vec::new();
        for _ in 0..4 {
            let (status, body) = send(&router, get("/api/items?page=2")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["uri"], "/v1/items?page=2");
            served.push(body["upstream"].as_str().unwrap().to_string());
        }
        assert_eq!(served.iter().filter(|u| *u == "a").count(), 2);
        assert_eq!(served.iter().filter(|u| *u == "b").count(), 2);
        assert_ne!(served[0], served[1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_upstream_is_quarantined() {
        let dead = closed_port().await;
        let live = spawn_upstream("live").await;
        let config = GatewayConfig::builder()
            .mount(
                MountConfig::proxy("/api", vec![format!("http://{dead}"), format!("http://{live}")])
                    .secured(false)
                    .with_args(serde_json::json!({"problem_server_retry_secs": 600})),
            )
            .build()
            .unwrap();
        let router = router(&config);

        let mut statuses = Vec::new();
        for _ in 0..10 {
            statuses.push(send(&router, get("/api/ping")).await.0);
        }

        // Three connect failures put the dead host aside
        let failures = statuses.iter().filter(|s| **s == StatusCode::BAD_GATEWAY).count();
        assert_eq!(failures, 3);
        assert!(statuses[6..].iter().all(|s| *s == StatusCode::OK));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trailing_slash_mount_forwards_relative_path() {
        let upstream = spawn_upstream("base").await;
        let config = GatewayConfig::builder()
            .mount(MountConfig::proxy("/api/", vec![format!("http://{upstream}/base")]).secured(false))
            .build()
            .unwrap();
        let router = router(&config);

        let mut forwarded = Vec::new();
        for path in ["/api", "/api/", "/api/x"] {
            let (status, body) = send(&router, get(path)).await;
            assert_eq!(status, StatusCode::OK);
            forwarded.push(body["uri"].as_str().unwrap().to_string());
        }
        assert_eq!(forwarded, ["/base", "/base", "/base/x"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_upstream_is_skipped() {
        let live = spawn_upstream("live").await;
        let config = GatewayConfig::builder()
            .mount(MountConfig::proxy("/api", vec!["::not a url::".to_string(), format!("http://{live}")]).secured(false))
            .build()
            .unwrap();
        let router = router(&config);

        for _ in 0..3 {
            let (status, body) = send(&router, get("/api")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["upstream"], "live");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_secured_proxy_forwards_identity_not_credentials() {
        let upstream = spawn_upstream("secured").await;
        let config = GatewayConfig::builder()
            .mount(MountConfig::proxy("/api", vec![format!("http://{upstream}")]))
            .authenticator(AuthenticatorConfig {
                store: AccountStoreConfig::Memory {
                    accounts: vec![serde_json::json!({"_id": "carol", "password": "pw", "roles": ["reader", "auditor"]})],
                },
                ..Default::default()
            })
            .mechanism(PluginConfig::new("basicAuthMechanism", "basic"))
            .authorizer(PluginConfig::new("fullAuthorizer", "full"))
            .token_manager(PluginConfig::new("tokenManager", "random"))
            .build()
            .unwrap();
        let router = router(&config);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/reports")
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("carol:pw")))
            .header("x-forwarded-account-id", "mallory")
            .header("auth-token", "forged")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);

        let seen = &body["headers"];
        assert!(seen.get("authorization").is_none());
        assert!(seen.get("auth-token").is_none());
        assert_eq!(seen["x-forwarded-account-id"], "carol");
        assert_eq!(seen["x-forwarded-roles"], "auditor,reader");
        assert_eq!(body["uri"], "/reports");

        // Without credentials nothing reaches the upstream
        let (status, _) = send(&router, get("/api/reports")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
