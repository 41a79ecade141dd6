//! 分片上传相关的 HTTP 处理器。

use axum::extract::multipart::Field;
use axum::extract::{Extension, Multipart};
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{
    ChunkOutcome, ChunkUpload, FinalizeRequest, Finalized, UploadEngine, UploadError,
};
use crate::error::ApiError;
use crate::reaper::ReapReport;
use crate::validate::UploadId;

const FILE_FIELD: &str = "file";

/// 表单中的文本字段；`file` 字段不会被读入内存。
#[derive(Default)]
pub(crate) struct UploadForm {
    fields: HashMap<String, String>,
}

impl UploadForm {
    pub(crate) async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            form.insert(field).await?;
        }
        Ok(form)
    }

    async fn insert(&mut self, field: Field<'_>) -> Result<(), ApiError> {
        let Some(name) = field.name().map(str::to_string) else {
            return Ok(());
        };
        if name != FILE_FIELD {
            let value = field.text().await?;
            self.fields.insert(name, value);
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn chunk(&self) -> Result<ChunkUpload, UploadError> {
        ChunkUpload::parse(
            self.get("upload_id"),
            self.get("chunk_index"),
            self.get("total_chunks"),
            self.get("filename"),
        )
    }
}

#[derive(Serialize)]
pub(crate) struct CheckChunksResponse {
    uploaded: Vec<u64>,
}

#[derive(Serialize)]
pub(crate) struct FinalizeResponse {
    status: &'static str,
    #[serde(flatten)]
    file: Finalized,
}

#[derive(Serialize)]
pub(crate) struct CleanupResponse {
    status: &'static str,
    message: &'static str,
    removed: usize,
    failed: usize,
    skipped: usize,
}

impl From<ReapReport> for CleanupResponse {
    fn from(report: ReapReport) -> Self {
        Self {
            status: "success",
            message: "Cleanup completed",
            removed: report.removed.len(),
            failed: report.failed,
            skipped: report.skipped,
        }
    }
}

/// 查询已上传的分片序号，用于客户端断点续传。
pub async fn check_chunks(
    Extension(engine): Extension<Arc<UploadEngine>>,
    multipart: Multipart,
) -> Result<JsonResponse<CheckChunksResponse>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let upload_id = UploadId::parse(form.get("upload_id"))?;
    let uploaded = engine.check_chunks(&upload_id).await?;
    Ok(JsonResponse(CheckChunksResponse { uploaded }))
}

/// 上传单个分片，分片齐全时同步合并。
///
/// 文本字段必须位于 `file` 之前（浏览器客户端的 FormData 即如此），
/// 校验通过后 `file` 直接流式写入分片文件。
pub async fn upload_chunk(
    Extension(engine): Extension<Arc<UploadEngine>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<ChunkOutcome>, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            form.insert(field).await?;
            continue;
        }
        let chunk = form.chunk()?;
        debug!(
            upload_id = %chunk.upload_id,
            index = chunk.index,
            "upload chunk request"
        );
        let outcome = engine.upload_chunk(chunk, field).await?;
        return Ok(JsonResponse(outcome));
    }
    form.chunk()?;
    Err(ApiError::BadRequest("No file part".into()))
}

/// 确认上传结果，必要时补做合并。
pub async fn finalize_upload(
    Extension(engine): Extension<Arc<UploadEngine>>,
    multipart: Multipart,
) -> Result<JsonResponse<FinalizeResponse>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let request = FinalizeRequest::parse(
        form.get("upload_id"),
        form.get("filename"),
        form.get("total_chunks"),
    )?;
    let file = engine.finalize(request).await?;
    Ok(JsonResponse(FinalizeResponse {
        status: "success",
        file,
    }))
}

/// 手动触发过期分片清理。
pub async fn admin_cleanup(
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> JsonResponse<CleanupResponse> {
    let report = engine.reap().await;
    info!(
        removed = report.removed.len(),
        failed = report.failed,
        skipped = report.skipped,
        "manual cleanup"
    );
    JsonResponse(report.into())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::engine::tests::{RejectAll, make_engine, make_engine_with};
    use crate::http::build_router;

    const BOUNDARY: &str = "chunkdock-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], file: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(bytes) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn post(
        app: &Router,
        uri: &str,
        fields: &[(&str, &str)],
        file: Option<&[u8]>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(fields, file)))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send_chunk(
        app: &Router,
        upload_id: &str,
        index: u64,
        total: u64,
        data: &[u8],
    ) -> (StatusCode, Value) {
        let index = index.to_string();
        let total = total.to_string();
        post(
            app,
            "/upload_chunk",
            &[
                ("upload_id", upload_id),
                ("chunk_index", &index),
                ("total_chunks", &total),
                ("filename", "movie clip.mp4"),
            ],
            Some(data),
        )
        .await
    }

    #[tokio::test]
    async fn out_of_order_upload_completes_on_last_chunk() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine.clone(), 1024 * 1024);

        let (status, body) = send_chunk(&app, "up-1", 2, 3, b"EF").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "partial");
        assert_eq!(body["received_chunk"], 2);

        let (_, body) = post(&app, "/check_chunks", &[("upload_id", "up-1")], None).await;
        assert_eq!(body["uploaded"], serde_json::json!([2]));

        send_chunk(&app, "up-1", 0, 3, b"AB").await;
        let (status, body) = send_chunk(&app, "up-1", 1, 3, b"CD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["filename"], "movie_clip.mp4");

        let bytes =
            std::fs::read(engine.artifacts().path_for("movie_clip.mp4")).expect("artifact");
        assert_eq!(bytes, b"ABCDEF");
    }

    #[tokio::test]
    async fn check_chunks_for_unknown_upload_is_empty() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine, 1024);
        let (status, body) = post(&app, "/check_chunks", &[("upload_id", "nobody")], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploaded"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn invalid_upload_id_creates_nothing() {
        let (temp, engine) = make_engine();
        let app = build_router(engine, 1024);
        let (status, body) = send_chunk(&app, "../escape", 0, 1, b"x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid upload ID format");
        assert!(!temp.path().join("chunked").exists());
        assert!(!temp.path().join("escape").exists());
        assert!(!temp.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let (temp, engine) = make_engine();
        let app = build_router(engine, 1024);
        let (status, _) = send_chunk(&app, "range", 5, 3, b"x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!temp.path().join("chunked").join("range").exists());
    }

    #[tokio::test]
    async fn missing_file_part_is_rejected() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine, 1024);
        let (status, body) = post(
            &app,
            "/upload_chunk",
            &[
                ("upload_id", "nofile"),
                ("chunk_index", "0"),
                ("total_chunks", "1"),
                ("filename", "a.bin"),
            ],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file part");
    }

    #[tokio::test]
    async fn finalize_reports_incomplete_then_success() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine, 1024 * 1024);
        let fields = [
            ("upload_id", "fin-1"),
            ("filename", "movie clip.mp4"),
            ("total_chunks", "3"),
        ];

        let (status, body) = post(&app, "/finalize_upload", &fields, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No file or chunks found");

        send_chunk(&app, "fin-1", 0, 3, b"AB").await;
        send_chunk(&app, "fin-1", 1, 3, b"CD").await;
        let (status, body) = post(&app, "/finalize_upload", &fields, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Incomplete upload: 2/3 chunks uploaded");

        send_chunk(&app, "fin-1", 2, 3, b"EF").await;
        let (status, first) = post(&app, "/finalize_upload", &fields, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "success");
        assert_eq!(first["filename"], "movie_clip.mp4");
        assert_eq!(first["file_path"], "/uploads/movie_clip.mp4");
        assert_eq!(first["file_size"], 6);

        let (_, second) = post(&app, "/finalize_upload", &fields, None).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejected_upload_returns_error_and_no_file() {
        let (_temp, engine) = make_engine_with(Arc::new(RejectAll));
        let app = build_router(engine.clone(), 1024);
        let (status, body) = send_chunk(&app, "bad", 0, 1, b"evil").await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());
        assert!(!engine.artifacts().path_for("movie_clip.mp4").exists());
    }

    #[tokio::test]
    async fn admin_cleanup_reports_counts() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine, 1024);
        let request = Request::builder()
            .uri("/admin/cleanup")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["status"], "success");
        assert_eq!(body["removed"], 0);
    }

    #[tokio::test]
    async fn file_before_fields_is_rejected_without_writes() {
        let (temp, engine) = make_engine();
        let app = build_router(engine, 1024 * 1024);
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\r\nAB\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&multipart_body(
            &[
                ("upload_id", "early"),
                ("chunk_index", "0"),
                ("total_chunks", "1"),
                ("filename", "a.bin"),
            ],
            None,
        ));
        let request = Request::builder()
            .method("POST")
            .uri("/upload_chunk")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request");

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!temp.path().join("chunked").exists());
        assert!(!temp.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn oversized_chunk_is_payload_too_large() {
        let (_temp, engine) = make_engine();
        let app = build_router(engine.clone(), 512);
        let data = vec![b'x'; 4096];

        let (status, body) = send_chunk(&app, "big", 0, 1, &data).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large");
        assert!(!engine.artifacts().path_for("movie_clip.mp4").exists());
    }
}
