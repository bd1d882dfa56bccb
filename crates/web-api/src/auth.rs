//! 会话凭据提取与 JWT 会话解析
//!
//! 凭据来源依次为 `?token=` 查询参数、`Authorization: Bearer` 头、`session_id` Cookie。

use axum::http::{header, HeaderMap};
use domain::{RepositoryError, RepositoryFuture, Session, SessionRepository, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// 会话 Cookie 名称
pub const SESSION_COOKIE: &str = "session_id";

/// 按约定顺序从请求中取出凭据
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_owned());
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_owned());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_owned())
}

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// HS256 签名的 JWT 会话
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration: chrono::Duration,
}

impl JwtService {
    pub fn new(secret: &str, expiration: chrono::Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, session: &Session) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + self.expiration;
        let claims = Claims {
            sub: session.user_id.into(),
            username: session.username.clone(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {}", err)))
    }
}

impl SessionRepository for JwtService {
    /// 无效或过期的令牌解析为 `None`，不是错误
    fn resolve(&self, token: &str) -> RepositoryFuture<Option<Session>> {
        let session = match self.verify_token(token) {
            Ok(claims) => Some(Session::new(UserId::from(claims.sub), claims.username)),
            Err(err) => {
                tracing::debug!(error = ?err, "JWT 校验失败");
                None
            }
        };
        Box::pin(async move { Ok::<_, RepositoryError>(session) })
    }
}
