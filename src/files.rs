//! 只读仓库接口：目录列表、文件树、元数据与文件流。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::parse_http_date;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::cache::{CacheDecision, CacheProfile, Validators, decide};
use crate::error::ApiError;
use crate::listing::{Storage, StorageError, format_timestamp};
use crate::sandbox::ResolvedPath;
use crate::visibility::VisibilityOptions;

#[derive(Deserialize)]
pub(crate) struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: Option<String>,
}

impl RequiredPathQuery {
    fn required(self) -> Result<String, ApiError> {
        self.path
            .filter(|path| !path.is_empty())
            .ok_or_else(|| ApiError::BadRequest("path is required".into()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileMeta {
    path: String,
    name: String,
    size: u64,
    modified_at: Option<String>,
    mime: String,
}

/// 使用元数据缓存策略的 JSON 响应。
pub(crate) fn json_response<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(value).map_err(|err| ApiError::Internal(err.to_string()))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CacheProfile::Metadata.cache_control()),
    );
    Ok((StatusCode::OK, headers, body).into_response())
}

fn not_modified(validators: &Validators, profile: CacheProfile) -> Response {
    let mut headers = HeaderMap::new();
    validators.apply(&mut headers, profile);
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

/// 列出目录内容。
pub async fn list_files(
    Query(query): Query<OptionalPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let path = query.path.unwrap_or_default();
    let listing = storage
        .list_dir(&path, VisibilityOptions::strict())
        .await?;
    info!(
        path,
        count = listing.entries.len(),
        skipped_hidden = listing.skipped_hidden,
        skipped_ignored = listing.skipped_ignored,
        "list files"
    );
    json_response(&listing)
}

/// 递归列出文件，供前端过滤使用。
pub async fn file_tree(
    Query(query): Query<OptionalPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let path = query.path.unwrap_or_default();
    let tree = storage.tree(&path).await?;
    info!(
        path,
        count = tree.files.len(),
        truncated = tree.truncated,
        "file tree"
    );
    json_response(&tree)
}

/// 返回单个文件的元数据，附带缓存校验值。
pub async fn file_meta(
    Query(query): Query<RequiredPathQuery>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let path = query.required()?;
    let (target, metadata) = storage.locate(&path, VisibilityOptions::strict()).await?;
    if !metadata.is_file() {
        return Err(StorageError::NotAFile.into());
    }
    let validators = Validators::from_metadata(&metadata);
    if decide(&request_headers, &validators) == CacheDecision::NotModified {
        return Ok(not_modified(&validators, CacheProfile::Metadata));
    }

    let meta = FileMeta {
        path: target.relative().to_string(),
        name: target.file_name().to_string(),
        size: metadata.len(),
        modified_at: metadata.modified().ok().map(format_timestamp),
        mime: mime_guess::from_path(target.relative())
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };
    let mut response = json_response(&meta)?;
    validators.apply(response.headers_mut(), CacheProfile::Metadata);
    Ok(response)
}

/// 下载仓库文件。
pub async fn download_file(
    Query(query): Query<RequiredPathQuery>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let path = query.required()?;
    let (target, metadata) = storage.locate(&path, VisibilityOptions::strict()).await?;
    stream_file(&target, &metadata, &request_headers, CacheProfile::Image).await
}

/// 流式返回文件，支持条件请求与单段 Range。
pub(crate) async fn stream_file(
    target: &ResolvedPath,
    metadata: &Metadata,
    request_headers: &HeaderMap,
    profile: CacheProfile,
) -> Result<Response, ApiError> {
    if !metadata.is_file() {
        return Err(StorageError::NotAFile.into());
    }
    let validators = Validators::from_metadata(metadata);
    if decide(request_headers, &validators) == CacheDecision::NotModified {
        debug!(path = target.relative(), "not modified");
        return Ok(not_modified(&validators, profile));
    }

    let file_size = metadata.len();
    let mime = mime_guess::from_path(target.relative()).first_or_octet_stream();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    validators.apply(&mut response_headers, profile);

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => validators.last_modified <= date,
            // 弱 ETag 不能满足 If-Range。
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(target.path()).await?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = target.relative(), start, end, length, "range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start)).await?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| ApiError::Internal("failed to build header".into()))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(path = target.relative(), size = file_size, "stream file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let invalid = || ApiError::BadRequest("invalid Range header".into());

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Ok(None);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse::<u64>().map_err(|_| invalid())?.min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
