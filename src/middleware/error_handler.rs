use axum::{
    body::{Body, to_bytes},
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::error;

const LOGGED_BODY_LIMIT: usize = 4096;

/// 把5xx响应连同响应体记入日志后原样放行
pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;

    if response.status().is_server_error() {
        let (mut parts, body) = response.into_parts();
        let bytes = match to_bytes(body, LOGGED_BODY_LIMIT).await {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to read error response body: {}", e);
                return Response::from_parts(parts, Body::empty());
            }
        };

        error!(
            "Server error - {} {} responded {}: {}",
            method,
            uri,
            parts.status,
            String::from_utf8_lossy(&bytes)
        );

        // 读过的body要重建，长度头也随之失效
        parts.headers.remove(axum::http::header::CONTENT_LENGTH);
        Response::from_parts(parts, Body::from(bytes))
    } else {
        response
    }
}
