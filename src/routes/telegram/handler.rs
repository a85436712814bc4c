use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Extension, Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::{
    AppState,
    routes::user::{User, UserStore},
    telegram::{WebhookEvent, build_deep_link, classify_update},
    utils::{
        Claims, error_codes, error_to_api_response, generate_verify_token,
        success_to_api_response,
    },
};

use super::model::{
    DeeplinkResponse, ManualVerifyRequest, ManualVerifyResponse, TelegramIdentity,
    VerifyStatusResponse, VerifyWaitParams, apply_verification, membership_satisfied,
    process_callback_query, process_start_command, wait_for_verification,
};

/// 平台对非2xx响应会重投，所以 webhook 对一切内部错误都确认收到，
/// 错误只进日志
#[axum::debug_handler]
pub async fn webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let Some(bot) = state.telegram.clone() else {
        tracing::error!("Telegram bot not configured, dropping webhook update");
        return StatusCode::OK;
    };

    match classify_update(&body) {
        WebhookEvent::StartCommand {
            token,
            from_id,
            from_username,
        } => {
            tracing::info!("Processing /start command from telegram user {}", from_id);
            let outcome = process_start_command(
                &state.pool,
                bot.as_ref(),
                &state.config,
                &token,
                from_id,
                from_username.as_deref(),
            )
            .await;
            tracing::info!(
                "Verification outcome for telegram user {}: {:?}",
                from_id,
                outcome
            );
        }
        WebhookEvent::CallbackQuery { id, from_id, data } => {
            process_callback_query(bot.as_ref(), &id, from_id, data.as_deref()).await;
        }
        WebhookEvent::Ignored => {}
    }

    StatusCode::OK
}

#[axum::debug_handler]
pub async fn webhook_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.telegram.is_some() { "active" } else { "disabled" },
        "endpoint": format!("{}/telegram/webhook", state.config.api_base_uri),
        "description": "Telegram bot webhook for automatic verification",
    }))
}

#[axum::debug_handler]
pub async fn deeplink(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(bot_username) = state.config.telegram_bot_username.as_deref() else {
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::TELEGRAM_DISABLED,
                "Telegram verification is not enabled".to_string(),
            ),
        );
    };

    // 深链必须绑定用户当前纪元，从存储读取而不是复用缓存值
    let user = match User::find_by_id(&state.pool, &claims.sub).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::NOT_FOUND, "Account not found".to_string()),
            );
        }
        Err(e) => {
            tracing::error!("Failed to load user {} for deeplink: {}", claims.sub, e);
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            );
        }
    };

    let token = match generate_verify_token(&user.user_id, user.auth_version, &state.config) {
        Ok(token) => token,
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(
                    error_codes::INTERNAL_ERROR,
                    "Failed to generate verification token".to_string(),
                ),
            );
        }
    };

    match build_deep_link(bot_username, &token) {
        Some(link) => (
            StatusCode::OK,
            success_to_api_response(DeeplinkResponse {
                link,
                expires_in_secs: state.config.verify_token_expiration().as_secs(),
            }),
        ),
        None => (
            StatusCode::OK,
            error_to_api_response(
                error_codes::INTERNAL_ERROR,
                "Failed to build deep link".to_string(),
            ),
        ),
    }
}

#[axum::debug_handler]
pub async fn verify_status(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match User::find_by_id(&state.pool, &claims.sub).await {
        Ok(Some(user)) => (
            StatusCode::OK,
            success_to_api_response(VerifyStatusResponse {
                verified: user.is_verified(),
                telegram_username: user.telegram_username,
                joined_ok: user.telegram_joined_ok,
            }),
        ),
        Ok(None) => (
            StatusCode::OK,
            error_to_api_response(error_codes::NOT_FOUND, "Account not found".to_string()),
        ),
        Err(e) => {
            tracing::error!("Failed to load user {} for status: {}", claims.sub, e);
            (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            )
        }
    }
}

/// 长轮询版状态查询：挂住请求直到验证完成或超时，
/// 前端可以用它替代每2秒一次的普通轮询
#[axum::debug_handler]
pub async fn verify_wait(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
    Query(params): Query<VerifyWaitParams>,
) -> impl IntoResponse {
    let timeout_secs = params.timeout_secs.unwrap_or(60).clamp(1, 60);

    match wait_for_verification(
        &state.pool,
        &claims.sub,
        Duration::from_secs(2),
        Duration::from_secs(timeout_secs),
    )
    .await
    {
        Ok(verified) => (
            StatusCode::OK,
            success_to_api_response(serde_json::json!({ "verified": verified })),
        ),
        Err(e) => {
            tracing::error!("Failed to poll verification for {}: {}", claims.sub, e);
            (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            )
        }
    }
}

/// 手动验证兜底：webhook 丢失时由前端携带 Telegram 账号ID补验，
/// 走与 /start 相同的成员资格门槛和状态迁移
#[axum::debug_handler]
pub async fn manual_verify(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
    Json(req): Json<ManualVerifyRequest>,
) -> impl IntoResponse {
    let Some(bot) = state.telegram.clone() else {
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::TELEGRAM_DISABLED,
                "Telegram verification is not enabled".to_string(),
            ),
        );
    };

    let user = match User::find_by_id(&state.pool, &claims.sub).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::NOT_FOUND, "Account not found".to_string()),
            );
        }
        Err(e) => {
            tracing::error!("Failed to load user {} for manual verify: {}", claims.sub, e);
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            );
        }
    };

    if !membership_satisfied(bot.as_ref(), &state.config, req.telegram_user_id).await {
        let handle = state
            .config
            .telegram_channel_handle
            .as_deref()
            .unwrap_or("our channel");
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::PERMISSION_DENIED,
                format!("Please join {} first", handle),
            ),
        );
    }

    let identity = TelegramIdentity {
        telegram_user_id: req.telegram_user_id,
        telegram_username: req.telegram_username,
    };
    if let Some(link) = apply_verification(&user, &identity, true, Utc::now()) {
        if let Err(e) = state.pool.apply_telegram_link(&user.user_id, &link).await {
            tracing::error!("Failed to persist telegram link for {}: {}", user.user_id, e);
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            );
        }
    }

    tracing::info!(
        "User {} manually verified with telegram user {}",
        user.user_id,
        req.telegram_user_id
    );
    (
        StatusCode::OK,
        success_to_api_response(ManualVerifyResponse { verified: true }),
    )
}
