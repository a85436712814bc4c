use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::utils::{generate_recovery_code, hash_password, verify_password};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub nickname: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub recovery_code: Option<String>,
    // 认证纪元，密码变更时递增，旧的验证令牌随之整体作废
    pub auth_version: i32,
    pub telegram_user_id: Option<i64>,
    pub telegram_username: Option<String>,
    pub telegram_joined_ok: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 验证成功后落到用户记录上的绑定信息，单行原子更新
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramLink {
    pub telegram_user_id: i64,
    pub telegram_username: Option<String>,
    pub joined_ok: bool,
    pub verified_at: DateTime<Utc>,
}

/// 验证流程对用户存储的全部依赖，测试用内存实现替换
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, sqlx::Error>;
    async fn apply_telegram_link(
        &self,
        user_id: &str,
        link: &TelegramLink,
    ) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub nickname: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub user_id: String,
    pub nickname: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub recovery_code: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshTokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CheckTokenResponse {
    pub user_id: String,
    pub email: String,
}

const USER_COLUMNS: &str = "user_id, email, nickname, password_hash, recovery_code, \
     auth_version, telegram_user_id, telegram_username, telegram_joined_ok, \
     verified_at, created_at";

impl User {
    pub fn is_verified(&self) -> bool {
        self.telegram_user_id.is_some() && self.verified_at.is_some()
    }

    pub async fn create(pool: &PgPool, req: RegisterRequest) -> Result<Self, sqlx::Error> {
        let password_hash = hash_password(&req.password)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to hash password: {}", e)))?;

        let user_id = uuid::Uuid::new_v4().to_string();
        let recovery_code = generate_recovery_code(&user_id, &req.password);

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (user_id, email, nickname, password_hash, recovery_code)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(&user_id)
        .bind(&req.email)
        .bind(&req.nickname)
        .bind(&password_hash)
        .bind(&recovery_code)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }

    pub async fn find_by_id(pool: &PgPool, user_id: &str) -> Result<Option<Self>, sqlx::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE user_id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<Self>, sqlx::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    pub async fn verify_login(&self, password: &str) -> Result<bool, bcrypt::BcryptError> {
        match &self.password_hash {
            Some(hash) => verify_password(password, hash),
            None => Ok(false),
        }
    }

    /// 通过恢复码重置密码。auth_version 递增，
    /// 重置前签发的所有验证链接立即失效
    pub async fn reset_password(
        pool: &PgPool,
        req: ResetPasswordRequest,
    ) -> Result<Self, sqlx::Error> {
        let user = Self::find_by_email(pool, &req.email)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        if user.recovery_code.as_deref() != Some(&req.recovery_code) {
            return Err(sqlx::Error::Protocol("Invalid recovery code".into()));
        }

        let password_hash = hash_password(&req.new_password)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to hash password: {}", e)))?;
        let new_recovery_code = generate_recovery_code(&user.user_id, &req.new_password);

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET password_hash = $1, recovery_code = $2, auth_version = auth_version + 1
            WHERE user_id = $3
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(&password_hash)
        .bind(&new_recovery_code)
        .bind(&user.user_id)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }

    pub async fn update_password(
        pool: &PgPool,
        user_id: &str,
        password: String,
    ) -> Result<Self, sqlx::Error> {
        let password_hash = hash_password(&password)
            .map_err(|e| sqlx::Error::Protocol(format!("Failed to hash password: {}", e)))?;
        let recovery_code = generate_recovery_code(user_id, &password);

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET password_hash = $1, recovery_code = $2, auth_version = auth_version + 1
            WHERE user_id = $3
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(&password_hash)
        .bind(&recovery_code)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl UserStore for PgPool {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, sqlx::Error> {
        User::find_by_id(self, user_id).await
    }

    async fn apply_telegram_link(
        &self,
        user_id: &str,
        link: &TelegramLink,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET telegram_user_id = $1, telegram_username = $2,
                telegram_joined_ok = $3, verified_at = $4
            WHERE user_id = $5
            "#,
        )
        .bind(link.telegram_user_id)
        .bind(&link.telegram_username)
        .bind(link.joined_ok)
        .bind(link.verified_at)
        .bind(user_id)
        .execute(self)
        .await?;

        Ok(())
    }
}
