use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};

use crate::{
    AppState,
    utils::{error_codes, error_to_api_response, verify_token},
};

/// 校验 Bearer 会话令牌并把声明注入请求扩展，
/// 受保护路由通过 Extension<Claims> 取用
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let claims = bearer
        .as_ref()
        .and_then(|TypedHeader(auth)| verify_token(auth.token(), &state.config).ok());

    match claims {
        Some(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            error_to_api_response::<()>(
                error_codes::AUTH_FAILED,
                "Invalid or missing credentials".to_string(),
            ),
        )
            .into_response(),
    }
}
