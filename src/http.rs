//! HTTP 辅助工具：路由、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::routing::{get, post};
use axum::{Router, middleware, response::Response};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::DOWNLOAD_ROUTE_PREFIX;
use crate::engine::UploadEngine;
use crate::{files, upload};

/// 构建上传服务路由；分片上传路由使用 `body_limit` 作为请求体上限。
pub fn build_router(engine: Arc<UploadEngine>, body_limit: usize) -> Router {
    Router::new()
        .route("/check_chunks", post(upload::check_chunks))
        .route(
            "/upload_chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/finalize_upload", post(upload::finalize_upload))
        .route(
            &format!("{DOWNLOAD_ROUTE_PREFIX}/{{filename}}"),
            get(files::download_file),
        )
        .route("/files", get(files::list_files))
        .route("/admin/cleanup", get(upload::admin_cleanup))
        .layer(middleware::from_fn(add_security_headers))
        .layer(Extension(engine))
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::make_engine;
    use tower::ServiceExt;

    #[test]
    fn cors_layer_requires_valid_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("https://a.example, https://b.example")).is_some());
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let (_temp, engine) = make_engine();
        let response = build_router(engine, 1024)
            .oneshot(
                Request::builder()
                    .uri("/files")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(
            response.headers().get(axum::http::header::X_CONTENT_TYPE_OPTIONS),
            Some(&HeaderValue::from_static("nosniff"))
        );
        assert_eq!(
            response.headers().get(axum::http::header::X_FRAME_OPTIONS),
            Some(&HeaderValue::from_static("DENY"))
        );
    }
}
