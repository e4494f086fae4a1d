use std::sync::Arc;

use dp_core::services::platform::Platform;

use crate::auth::JwtKeys;

#[derive(Clone)]
pub struct AppState {
    pub platform: Arc<Platform>,
    pub keys: Arc<JwtKeys>,
}

impl AppState {
    pub fn new(platform: Arc<Platform>, jwt_secret: &str) -> Self {
        Self {
            platform,
            keys: Arc::new(JwtKeys::new(jwt_secret.as_bytes())),
        }
    }
}
