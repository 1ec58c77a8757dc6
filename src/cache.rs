//! 缓存校验值与条件 GET 处理。

use axum::http::{HeaderMap, HeaderValue, header};
use httpdate::{fmt_http_date, parse_http_date};
use std::fs::Metadata;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 按接口选择的 Cache-Control 策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheProfile {
    /// 二进制与图片响应。
    Image,
    /// JSON 元数据与目录列表。
    Metadata,
}

impl CacheProfile {
    /// 对应的 `Cache-Control` 值。
    pub fn cache_control(self) -> &'static str {
        match self {
            CacheProfile::Image => "private, max-age=60, stale-while-revalidate=600",
            CacheProfile::Metadata => "private, max-age=5",
        }
    }
}

/// 由当次 stat 结果计算的校验值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validators {
    pub etag: String,
    pub last_modified: SystemTime,
}

impl Validators {
    /// 由文件大小与修改时间生成弱 ETag 和秒级 `Last-Modified`。
    pub fn from_stat(byte_size: u64, modified: Option<SystemTime>) -> Self {
        let since_epoch = modified
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            etag: format!("W/\"{}-{}\"", byte_size, since_epoch.as_millis()),
            last_modified: UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs()),
        }
    }

    /// 根据文件元数据生成校验值。
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self::from_stat(metadata.len(), metadata.modified().ok())
    }

    /// 写入 `ETag`、`Last-Modified` 与 `Cache-Control`。
    pub fn apply(&self, headers: &mut HeaderMap, profile: CacheProfile) {
        if let Ok(value) = HeaderValue::from_str(&self.etag) {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&fmt_http_date(self.last_modified)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(profile.cache_control()),
        );
    }
}

/// 条件请求的判断结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheDecision {
    NotModified,
    Serve,
}

/// 判断返回 `304 Not Modified` 还是完整响应。
///
/// `If-None-Match` 命中直接返回 304；未命中时仍按 `If-Modified-Since` 判断。
pub fn decide(request: &HeaderMap, validators: &Validators) -> CacheDecision {
    let tag_matches = request
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| etag_matches(value, &validators.etag));
    if tag_matches {
        return CacheDecision::NotModified;
    }

    let modified_since = request
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok());
    match modified_since {
        Some(since) if since >= validators.last_modified => CacheDecision::NotModified,
        _ => CacheDecision::Serve,
    }
}

// 弱比较：忽略两侧的 `W/` 前缀。
fn etag_matches(header_value: &str, current: &str) -> bool {
    let current = strip_weak(current);
    header_value
        .split(',')
        .map(str::trim)
        .any(|item| item == "*" || strip_weak(item) == current)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
