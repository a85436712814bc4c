use axum::Json;
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;

/// 通用的API响应结构
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 错误码，0表示成功，非0表示失败
    pub code: i32,
    /// 错误消息，成功时为"success"
    pub msg: String,
    /// 响应数据，错误时为None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<T>,
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    hash(password.as_bytes(), DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    verify(password.as_bytes(), hash)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,   // 用户ID
    pub email: String, // 登录邮箱
    pub exp: i64,      // 过期时间
    pub iat: i64,      // 签发时间
}

/// Telegram 绑定验证令牌的声明，仅用于 /start 深链验证，
/// 不含 email 字段，因此无法通过会话令牌校验
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyClaims {
    pub sub: String, // 用户ID
    pub v: i32,      // 签发时的认证纪元
    pub exp: i64,
    pub iat: i64,
}

pub fn generate_token(
    user_id: &str,
    email: &str,
    config: &Config,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::seconds(config.jwt_expiration().as_secs() as i64))
        .expect("valid timestamp")
        .timestamp();

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        exp: expiration,
        iat: Utc::now().timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, config: &Config) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

/// 签发 Telegram 绑定验证令牌。调用方必须传入用户当前的
/// auth_version，纪元不匹配的令牌在兑换时会被拒绝
pub fn generate_verify_token(
    user_id: &str,
    auth_version: i32,
    config: &Config,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::seconds(
            config.verify_token_expiration().as_secs() as i64,
        ))
        .expect("valid timestamp")
        .timestamp();

    let claims = VerifyClaims {
        sub: user_id.to_string(),
        v: auth_version,
        exp: expiration,
        iat: Utc::now().timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
}

pub fn decode_verify_token(
    token: &str,
    config: &Config,
) -> Result<VerifyClaims, jsonwebtoken::errors::Error> {
    let token_data = decode::<VerifyClaims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

pub fn generate_recovery_code(user_id: &str, password: &str) -> String {
    let uuid = Uuid::new_v4();
    let recovery_string = format!("{}:{}:{}", user_id, password, uuid);
    hash_password(&recovery_string).unwrap_or_else(|_| String::new())
}

pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 0,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

pub fn error_to_api_response<T>(code: i32, msg: String) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code,
        msg,
        resp_data: None,
    })
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION_ERROR: i32 = 1000;
    pub const USER_EXISTS: i32 = 1001;
    pub const AUTH_FAILED: i32 = 1002;
    pub const PERMISSION_DENIED: i32 = 1003;
    pub const NOT_FOUND: i32 = 1004;
    pub const RATE_LIMIT: i32 = 1005;
    pub const TELEGRAM_DISABLED: i32 = 1006;
    pub const INTERNAL_ERROR: i32 = 5000;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://localhost".into(),
            jwt_secret: "test-secret-used-only-in-unit-tests".into(),
            jwt_expiration_secs: 24 * 3600,
            verify_token_expiration_secs: 15 * 60,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            server_host: "127.0.0.1".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            telegram_bot_token: None,
            telegram_bot_username: None,
            telegram_channel_id: None,
            telegram_channel_handle: None,
            telegram_membership_fail_open: true,
        }
    }

    #[test]
    fn verify_token_round_trip_returns_original_claims() {
        let config = test_config();
        let token = generate_verify_token("user-1", 1, &config).unwrap();
        let claims = decode_verify_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.v, 1);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let config = test_config();
        let token = generate_verify_token("user-1", 1, &config).unwrap();
        // 翻转签名部分的最后一个字符
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert!(decode_verify_token(&tampered, &config).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let config = test_config();
        let token = generate_verify_token("user-1", 1, &config).unwrap();
        let mut other = test_config();
        other.jwt_secret = "a-completely-different-secret".into();
        assert!(decode_verify_token(&token, &other).is_err());
    }

    #[test]
    fn session_middleware_does_not_accept_verify_tokens() {
        let config = test_config();
        let token = generate_verify_token("user-1", 1, &config).unwrap();
        // 验证令牌没有 email 声明，会话解码必须失败
        assert!(verify_token(&token, &config).is_err());
    }

    #[test]
    fn verify_decode_does_not_accept_session_tokens() {
        let config = test_config();
        let token = generate_token("user-1", "a@b.c", &config).unwrap();
        assert!(decode_verify_token(&token, &config).is_err());
    }

    #[test]
    fn expired_verify_token_is_rejected() {
        let config = test_config();
        // 直接构造一小时前就过期的令牌
        let claims = VerifyClaims {
            sub: "user-1".into(),
            v: 1,
            exp: Utc::now().timestamp() - 3600,
            iat: Utc::now().timestamp() - 7200,
        };
        let expired = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(decode_verify_token(&expired, &config).is_err());
    }
}
