//! 图片目录：上传写入以及图片的列表、读取与删除。
//!
//! 上传目录是网关唯一写入的位置。文件名在任何文件系统调用前完成清洗与校验，
//! 已存在的文件不会被覆盖。

use axum::extract::{Extension, Multipart, Path as UrlPath, Query, multipart::Field};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::atomic::{AtomicFile, PublishError};
use crate::cache::CacheProfile;
use crate::config::MAX_FILENAME_LEN;
use crate::error::ApiError;
use crate::files::{json_response, stream_file};
use crate::listing::{Listing, Storage, StorageError};
use crate::visibility::VisibilityOptions;

/// 允许上传的图片扩展名（不含 svg）。
pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "avif", "heic", "heif", "bmp",
];

/// 文件名校验失败及原因。
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilenameError {
    #[error("{0}")]
    InvalidFilename(&'static str),
}

/// 将客户端提供的名称清洗为单个候选文件名。
pub fn sanitize(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return format!("upload-{}", Utc::now().timestamp_millis());
    }
    trimmed.to_string()
}

/// 文件名缺少扩展名时，按声明的内容类型补全。
pub fn with_content_type_extension(candidate: String, content_type: Option<&str>) -> String {
    if Path::new(&candidate).extension().is_some() {
        return candidate;
    }
    let extension = content_type
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|extensions| {
            extensions
                .iter()
                .copied()
                .find(|ext| ALLOWED_IMAGE_EXTENSIONS.contains(ext))
        });
    match extension {
        Some(ext) => format!("{candidate}.{ext}"),
        None => candidate,
    }
}

/// 校验候选文件名：字符集、前导点、长度与扩展名。
pub fn validate(candidate: &str) -> Result<(), FilenameError> {
    let invalid = |reason| Err(FilenameError::InvalidFilename(reason));
    if candidate.is_empty() {
        return invalid("filename is required");
    }
    if candidate.len() > MAX_FILENAME_LEN {
        return invalid("filename is too long");
    }
    if candidate.chars().any(char::is_whitespace) {
        return invalid("filename cannot contain spaces");
    }
    if candidate.starts_with('.') {
        return invalid("filename cannot start with a dot");
    }
    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("filename contains invalid characters");
    }
    let allowed = Path::new(candidate)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ALLOWED_IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        });
    if !allowed {
        return invalid("file extension is not allowed");
    }
    Ok(())
}

/// 网关自有的图片目录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageDir {
    Uploads,
    Screenshots,
}

/// 图片目录与上传大小配置。
#[derive(Debug)]
pub struct UploadConfig {
    pub upload_dir: String,
    pub screenshot_dir: String,
    pub max_size: u64,
}

impl UploadConfig {
    /// 指定图片目录的相对路径。
    pub fn dir(&self, kind: ImageDir) -> &str {
        match kind {
            ImageDir::Uploads => &self.upload_dir,
            ImageDir::Screenshots => &self.screenshot_dir,
        }
    }
}

/// 上传文件可用的 multipart 字段名。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadField {
    File,
    /// 旧客户端使用 `image` 字段。
    LegacyImage,
}

impl UploadField {
    /// 将字段名规范化为上传字段，未识别的字段返回 `None`。
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(UploadField::File),
            "image" => Some(UploadField::LegacyImage),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    name: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    name: String,
    path: String,
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(err.body_text())
}

/// 上传一张图片到上传目录。
pub async fn upload_image(
    Query(query): Query<UploadQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let raw_name = query
        .name
        .ok_or_else(|| ApiError::BadRequest("name is required".into()))?;
    let candidate = sanitize(&raw_name);

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(kind) = field.name().and_then(UploadField::from_name) else {
            continue;
        };
        debug!(?kind, "upload field accepted");
        let name = with_content_type_extension(candidate.clone(), field.content_type());
        validate(&name)?;
        let stored = store_upload(&storage, &upload, &name, field).await?;
        info!(name = stored.name, path = stored.path, "image uploaded");
        return Ok((StatusCode::CREATED, json_response(&stored)?).into_response());
    }

    Err(ApiError::BadRequest("missing file field".into()))
}

async fn store_upload(
    storage: &Storage,
    upload: &UploadConfig,
    name: &str,
    mut field: Field<'_>,
) -> Result<UploadResponse, ApiError> {
    let root = storage.root();
    let dir = root.resolve(&upload.upload_dir).await?;
    fs::create_dir_all(dir.path()).await?;
    // 创建目录后重新解析，防止被替换为符号链接。
    let target = root.resolve_in(&upload.upload_dir, name).await?;
    if fs::symlink_metadata(target.path()).await.is_ok() {
        return Err(ApiError::Conflict("file already exists".into()));
    }

    let mut atomic = AtomicFile::new(target.path()).await?;
    let write_result: Result<(), ApiError> = async {
        let mut written: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            written += chunk.len() as u64;
            if written > upload.max_size {
                return Err(ApiError::BadRequest("upload exceeds size limit".into()));
            }
            atomic
                .file_mut()
                .write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = write_result {
        atomic.cleanup().await;
        return Err(err);
    }

    match atomic.publish_new().await {
        Ok(()) => Ok(UploadResponse {
            name: name.to_string(),
            path: target.relative().to_string(),
        }),
        Err(PublishError::Exists) => Err(ApiError::Conflict("file already exists".into())),
        Err(PublishError::Io(err)) => Err(ApiError::Internal(err.to_string())),
    }
}

/// 列出图片目录，目录尚不存在时返回空列表。
pub async fn list_images(
    Extension(kind): Extension<ImageDir>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<Response, ApiError> {
    let dir = upload.dir(kind);
    let listing = match storage
        .list_dir(dir, VisibilityOptions::owned_dir())
        .await
    {
        Ok(mut listing) => {
            // 过滤上传中的临时文件与非图片条目。
            listing
                .entries
                .retain(|entry| !entry.is_dir && validate(&entry.name).is_ok());
            listing
        }
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => Listing {
            path: storage.root().resolve(dir).await?.relative().to_string(),
            entries: Vec::new(),
            skipped_symlinks: 0,
            skipped_hidden: 0,
            skipped_ignored: 0,
        },
        Err(err) => return Err(err.into()),
    };
    json_response(&listing)
}

/// 读取图片目录中的单个图片。
pub async fn serve_image(
    UrlPath(name): UrlPath<String>,
    request_headers: HeaderMap,
    Extension(kind): Extension<ImageDir>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<Response, ApiError> {
    validate(&name)?;
    let (target, metadata) = storage
        .locate_in(upload.dir(kind), &name, VisibilityOptions::owned_dir())
        .await?;
    stream_file(&target, &metadata, &request_headers, CacheProfile::Image).await
}

/// 删除单个图片，不存在时始终返回 404。
pub async fn delete_image(
    UrlPath(name): UrlPath<String>,
    Extension(kind): Extension<ImageDir>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<StatusCode, ApiError> {
    validate(&name)?;
    let (target, metadata) = storage
        .locate_in(upload.dir(kind), &name, VisibilityOptions::owned_dir())
        .await?;
    if !metadata.is_file() {
        return Err(StorageError::NotAFile.into());
    }
    fs::remove_file(target.path()).await?;
    info!(path = target.relative(), "image deleted");
    Ok(StatusCode::NO_CONTENT)
}
