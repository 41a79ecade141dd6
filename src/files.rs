//! 已完成文件的下载与列表处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::artifacts::FileEntry;
use crate::config::FILENAME_MAX_LEN;
use crate::engine::UploadEngine;
use crate::error::ApiError;
use crate::validate::{sanitize_filename, validate};

/// 列出所有已完成的文件。
pub async fn list_files(
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let entries = engine
        .artifacts()
        .list()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    debug!(count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 按清洗后的文件名下载，支持单个 Range 请求。
pub async fn download_file(
    Path(filename): Path<String>,
    request_headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<Response, ApiError> {
    if !validate(Some(&filename), None, FILENAME_MAX_LEN) {
        return Err(ApiError::NotFound("not found".into()));
    }
    let name = sanitize_filename(&filename);
    if name.is_empty() {
        return Err(ApiError::NotFound("not found".into()));
    }
    let artifacts = engine.artifacts();
    let metadata = artifacts
        .metadata(&name)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = metadata.modified().ok().map(fmt_http_date) {
        response_headers.insert(header::LAST_MODIFIED, header_value(&value)?);
    }
    response_headers.insert(header::ETAG, header_value(&etag_from_metadata(&metadata))?);

    let range = parse_range(request_headers.get(header::RANGE), file_size)?;
    let file = File::open(artifacts.path_for(&name))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(name, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        let stream = ReaderStream::new(file.take(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(name, size = file_size, "download file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// 根据文件元数据生成弱 ETag。
fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    match metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
    {
        Some(duration) => format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        ),
        None => format!("W/\"{size}\""),
    }
}

/// 解析 Range 头（仅支持单个区间），返回闭区间。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = || ApiError::BadRequest("invalid Range header".into());
    let range = value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("bytes="))
        .ok_or_else(invalid)?;
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    let (start_part, end_part) = range.split_once('-').ok_or_else(invalid)?;
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part
                .parse::<u64>()
                .map_err(|_| invalid())?
                .min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
