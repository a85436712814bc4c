use axum::{
    extract::{Extension, Json, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{
    AppState,
    utils::{
        Claims, error_codes, error_to_api_response, generate_token, success_to_api_response,
    },
};

use super::model::{
    CheckTokenResponse, CreateUserResponse, LoginRequest, LoginResponse, RefreshTokenResponse,
    RegisterRequest, ResetPasswordRequest, ResetPasswordResponse, UpdatePasswordRequest, User,
};

#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    // 邮箱格式只做最基本的检查，真实性由后续邮件验证保证
    if !req.email.contains('@') || req.email.len() > 254 {
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "Invalid email address".to_string(),
            ),
        );
    }
    if req.password.len() < 6 || req.password.len() > 72 {
        return (
            StatusCode::OK,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "Password must be between 6 and 72 characters".to_string(),
            ),
        );
    }

    match User::create(&state.pool, req).await {
        Ok(user) => {
            // 生成会话 token
            match generate_token(&user.user_id, &user.email, &state.config) {
                Ok(token) => (
                    StatusCode::OK,
                    success_to_api_response(CreateUserResponse {
                        user_id: user.user_id,
                        nickname: user.nickname,
                        token,
                    }),
                ),
                Err(_) => (
                    StatusCode::OK,
                    error_to_api_response(
                        error_codes::INTERNAL_ERROR,
                        "Failed to generate token".to_string(),
                    ),
                ),
            }
        }
        Err(e) => {
            if e.to_string().contains("unique constraint") {
                (
                    StatusCode::OK,
                    error_to_api_response(
                        error_codes::USER_EXISTS,
                        "Account already exists".to_string(),
                    ),
                )
            } else {
                (
                    StatusCode::OK,
                    error_to_api_response(
                        error_codes::INTERNAL_ERROR,
                        "Failed to create account".to_string(),
                    ),
                )
            }
        }
    }
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let user = match User::find_by_email(&state.pool, &req.email).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::NOT_FOUND, "Account not found".to_string()),
            );
        }
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            );
        }
    };

    // 验证密码
    match user.verify_login(&req.password).await {
        Ok(true) => (),
        Ok(false) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::AUTH_FAILED, "Invalid password".to_string()),
            );
        }
        Err(_) => {
            return (
                StatusCode::OK,
                error_to_api_response(error_codes::INTERNAL_ERROR, "Database error".to_string()),
            );
        }
    }

    match generate_token(&user.user_id, &user.email, &state.config) {
        Ok(token) => (
            StatusCode::OK,
            success_to_api_response(LoginResponse {
                user_id: user.user_id,
                token,
            }),
        ),
        Err(_) => (
            StatusCode::OK,
            error_to_api_response(
                error_codes::INTERNAL_ERROR,
                "Failed to generate token".to_string(),
            ),
        ),
    }
}

#[axum::debug_handler]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> impl IntoResponse {
    match User::reset_password(&state.pool, req).await {
        Ok(_) => (
            StatusCode::OK,
            success_to_api_response(ResetPasswordResponse {}),
        ),
        Err(e) => {
            let (status, code) = if e.to_string().contains("Invalid recovery code") {
                (StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED)
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
            };
            (
                status,
                error_to_api_response(code, "Failed to reset password".to_string()),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn update_password(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
    Json(req): Json<UpdatePasswordRequest>,
) -> impl IntoResponse {
    if req.password.len() < 6 || req.password.len() > 72 {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response(
                error_codes::VALIDATION_ERROR,
                "Password must be between 6 and 72 characters".to_string(),
            ),
        );
    }

    match User::update_password(&state.pool, &claims.sub, req.password).await {
        Ok(user) => (StatusCode::OK, success_to_api_response(user)),
        Err(e) => {
            tracing::error!("Failed to update password for {}: {}", claims.sub, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_to_api_response(
                    error_codes::INTERNAL_ERROR,
                    "Failed to update password".to_string(),
                ),
            )
        }
    }
}

#[axum::debug_handler]
pub async fn refresh_token(
    Extension(claims): Extension<Claims>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match generate_token(&claims.sub, &claims.email, &state.config) {
        Ok(token) => (
            StatusCode::OK,
            success_to_api_response(RefreshTokenResponse { token }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_to_api_response(
                error_codes::INTERNAL_ERROR,
                "Failed to refresh token".to_string(),
            ),
        ),
    }
}

/// 检查token是否有效，中间件已完成校验，直接返回声明内容
#[axum::debug_handler]
pub async fn check_token(Extension(claims): Extension<Claims>) -> impl IntoResponse {
    (
        StatusCode::OK,
        success_to_api_response(CheckTokenResponse {
            user_id: claims.sub,
            email: claims.email,
        }),
    )
}
