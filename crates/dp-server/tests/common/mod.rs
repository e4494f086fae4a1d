// Shared harness for the HTTP tests. Not every test file uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use dp_core::models::{Caller, HostTarget, PlatformSettings, Role};
use dp_core::services::platform::Platform;
use dp_core::testing::{FakeDatabaseAdmin, FakeExecutor, FakeSource};
use dp_server::auth::JwtKeys;
use dp_server::state::AppState;

pub const SECRET: &str = "test-secret";
pub const DEFAULT_HOST: &str = "docker.local";

pub struct Harness {
    pub app: Router,
    pub platform: Arc<Platform>,
    pub executor: Arc<FakeExecutor>,
    pub source: Arc<FakeSource>,
    pub admin: Arc<FakeDatabaseAdmin>,
    keys: JwtKeys,
    _work_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FakeExecutor::new());
        let source = Arc::new(FakeSource::new());
        let admin = Arc::new(FakeDatabaseAdmin::new());
        let platform = Arc::new(Platform::new(
            Arc::new(dp_core::services::state::Store::in_memory()),
            executor.clone(),
            source.clone(),
            admin.clone(),
            Some(HostTarget::new(DEFAULT_HOST, "root", None)),
            PlatformSettings {
                work_dir: work_dir.path().to_path_buf(),
                ..PlatformSettings::default()
            },
        ));
        let app = dp_server::router(AppState::new(Arc::clone(&platform), SECRET));
        Self {
            app,
            platform,
            executor,
            source,
            admin,
            keys: JwtKeys::new(SECRET.as_bytes()),
            _work_dir: work_dir,
        }
    }

    pub fn token(&self, caller: &Caller) -> String {
        self.keys.issue(caller, 3600).unwrap()
    }

    /// Send a request as `caller` (or anonymously) and decode the JSON body.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        caller: Option<&Caller>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            builder = builder.header("authorization", format!("Bearer {}", self.token(caller)));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

pub fn user(name: &str) -> Caller {
    Caller {
        user_id: format!("u-{name}"),
        username: name.to_string(),
        role: Role::User,
    }
}

pub fn admin() -> Caller {
    Caller {
        user_id: "u-root".into(),
        username: "root".into(),
        role: Role::Admin,
    }
}
