use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use feature_toggles::config::{Config, SecretList};
use feature_toggles::server::serve;

pub const ADMIN_TOKEN: &str = "*:*.integration-admin";
pub const CLIENT_TOKEN: &str = "default:development.integration-client";
pub const FRONTEND_TOKEN: &str = "default:development.integration-frontend";
pub const PROJECT_A_FRONTEND_TOKEN: &str = "project-a:development.integration-frontend-a";

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| Config {
    address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
    init_admin_api_tokens: SecretList(vec![ADMIN_TOKEN.to_string()]),
    init_client_api_tokens: SecretList(vec![CLIENT_TOKEN.to_string()]),
    init_frontend_api_tokens: SecretList(vec![
        FRONTEND_TOKEN.to_string(),
        PROJECT_A_FRONTEND_TOKEN.to_string(),
    ]),
    ..Config::default_test_config()
});

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(token) => builder.header(AUTHORIZATION, token),
            None => builder,
        }
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        self.authorized(self.client.get(self.url(path)), token)
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_json(&self, path: &str, token: Option<&str>, body: &Value) -> reqwest::Response {
        self.authorized(self.client.post(self.url(path)), token)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_raw(&self, path: &str, token: Option<&str>, body: &'static str) -> reqwest::Response {
        self.authorized(self.client.post(self.url(path)), token)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        self.authorized(self.client.delete(self.url(path)), token)
            .send()
            .await
            .expect("failed to send request")
    }

    /// Creates a toggle through the admin API, enabled in `development` with the given strategies.
    pub async fn create_enabled_toggle(&self, project: &str, name: &str, strategies: &[Value]) {
        let features = format!("/api/admin/projects/{project}/features");
        let res = self
            .post_json(&features, Some(ADMIN_TOKEN), &serde_json::json!({"name": name}))
            .await;
        assert_eq!(res.status(), reqwest::StatusCode::CREATED);

        let environment = format!("{features}/{name}/environments/development");
        for strategy in strategies {
            let res = self
                .post_json(&format!("{environment}/strategies"), Some(ADMIN_TOKEN), strategy)
                .await;
            assert_eq!(res.status(), reqwest::StatusCode::OK);
        }
        let res = self
            .post_json(&format!("{environment}/on"), Some(ADMIN_TOKEN), &Value::Null)
            .await;
        assert_eq!(res.status(), reqwest::StatusCode::OK);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
