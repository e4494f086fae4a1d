//! Bearer-token sessions. Tokens are issued elsewhere; this server only
//! verifies them and turns the claims into a [`Caller`].

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use dp_core::error::PlatformError;
use dp_core::models::{Caller, Role};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub exp: usize,
}

fn default_role() -> Role {
    Role::User
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Sign a token for `caller`, valid for `ttl_secs`.
    pub fn issue(&self, caller: &Caller, ttl_secs: i64) -> jsonwebtoken::errors::Result<String> {
        let exp = chrono::Utc::now().timestamp() + ttl_secs;
        let claims = Claims {
            sub: caller.user_id.clone(),
            username: caller.username.clone(),
            role: caller.role,
            exp: exp.max(0) as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Caller, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| ApiError::Unauthorized(format!("Invalid token: {e}")))?;
        Ok(Caller {
            user_id: data.claims.sub,
            username: data.claims.username,
            role: data.claims.role,
        })
    }
}

/// Resolve the bearer token into a [`Caller`] request extension.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    let caller = state.keys.verify(token.trim())?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// Runs after [`require_session`]; rejects non-admin callers.
pub async fn require_admin(
    Extension(caller): Extension<Caller>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !caller.is_admin() {
        return Err(PlatformError::Forbidden("Admin access required".into()).into());
    }
    Ok(next.run(req).await)
}
