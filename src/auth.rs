//! 共享密钥认证、按 IP 的失败限流与同源校验。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, Method, Request, header};
use axum::{middleware, response::Response};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::AUTH_REALM;
use crate::error::ApiError;
use crate::http::{RequestScheme, is_same_origin, resolve_client_ip};

/// 失败限流策略。
#[derive(Clone, Copy, Debug)]
pub struct FailurePolicy {
    /// 单个窗口内触发封禁的失败次数，0 表示关闭限流。
    pub max_failures: u32,
    pub window: Duration,
    pub block: Duration,
    /// 最多跟踪的 IP 数量。
    pub max_tracked: usize,
}

#[derive(Clone, Copy, Debug)]
struct FailureRecord {
    window_start: Instant,
    failures: u32,
    blocked_until: Option<Instant>,
}

/// 以客户端 IP 为键的内存失败记录。
///
/// 所有读改写都在同一把锁内完成，同一 IP 的并发失败会被精确计数。
/// 记录数受 `max_tracked` 限制，并由后台任务定期清理。
#[derive(Debug)]
pub struct FailureStore {
    records: Mutex<HashMap<IpAddr, FailureRecord>>,
    policy: FailurePolicy,
}

impl FailureStore {
    /// 按策略创建空的失败记录表。
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// `ip` 处于封禁期时返回需等待的秒数。
    pub async fn check(&self, ip: IpAddr, now: Instant) -> Option<u64> {
        if self.policy.max_failures == 0 {
            return None;
        }
        let mut records = self.records.lock().await;
        let record = records.get(&ip)?;
        if let Some(until) = record.blocked_until {
            if now < until {
                return Some(ceil_secs(until - now));
            }
            records.remove(&ip);
            return None;
        }
        if now.duration_since(record.window_start) > self.policy.window {
            records.remove(&ip);
        }
        None
    }

    /// 记录一次失败，本次失败触发封禁时返回 true。
    pub async fn register_failure(&self, ip: IpAddr, now: Instant) -> bool {
        if self.policy.max_failures == 0 {
            return false;
        }
        let mut records = self.records.lock().await;
        if !records.contains_key(&ip) && records.len() >= self.policy.max_tracked {
            self.make_room(&mut records, now);
        }

        let fresh = FailureRecord {
            window_start: now,
            failures: 0,
            blocked_until: None,
        };
        let record = records.entry(ip).or_insert(fresh);
        let window_expired = now.duration_since(record.window_start) > self.policy.window;
        let block_elapsed = record.blocked_until.is_some_and(|until| now >= until);
        if window_expired || block_elapsed {
            *record = fresh;
        }

        record.failures = record.failures.saturating_add(1);
        if record.failures >= self.policy.max_failures {
            record.blocked_until = Some(now + self.policy.block);
            record.failures = 0;
            record.window_start = now;
            return true;
        }
        false
    }

    /// 认证成功后清除该 IP 的记录。
    pub async fn clear(&self, ip: IpAddr) {
        self.records.lock().await.remove(&ip);
    }

    /// 清理窗口已过期或封禁已结束的记录。
    pub async fn prune(&self, now: Instant) {
        let mut records = self.records.lock().await;
        Self::retain_live(&mut records, &self.policy, now);
    }

    /// 当前跟踪的 IP 数量。
    pub async fn tracked(&self) -> usize {
        self.records.lock().await.len()
    }

    fn retain_live(
        records: &mut HashMap<IpAddr, FailureRecord>,
        policy: &FailurePolicy,
        now: Instant,
    ) {
        records.retain(|_, record| match record.blocked_until {
            Some(until) => until > now,
            None => now.duration_since(record.window_start) <= policy.window,
        });
    }

    fn make_room(&self, records: &mut HashMap<IpAddr, FailureRecord>, now: Instant) {
        Self::retain_live(records, &self.policy, now);
        while records.len() >= self.policy.max_tracked.max(1) {
            // 优先淘汰未封禁的记录，窗口最早的先淘汰。
            let victim = records
                .iter()
                .min_by_key(|(_, record)| (record.blocked_until.is_some(), record.window_start))
                .map(|(ip, _)| *ip);
            match victim {
                Some(ip) => {
                    records.remove(&ip);
                }
                None => break,
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// 网关配置与失败记录。
#[derive(Debug)]
pub struct AuthGateway {
    /// 为 `None` 时进入开放访问模式。
    pub secret: Option<String>,
    pub failures: FailureStore,
    pub trust_forwarded_for: bool,
}

impl AuthGateway {
    /// 未配置密码时为开放访问模式。
    pub fn is_open_access(&self) -> bool {
        self.secret.is_none()
    }
}

/// 提取 Basic `Authorization` 中的密码，格式错误视为未提供。
pub fn supplied_password(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Basic>>()
        .map(|auth| auth.password().to_string())
}

/// 先比较长度再做常量时间比较，长度不同直接返回。
pub fn secrets_match(supplied: &str, expected: &str) -> bool {
    let supplied = supplied.as_bytes();
    let expected = expected.as_bytes();
    if supplied.len() != expected.len() {
        return false;
    }
    bool::from(supplied.ct_eq(expected))
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// 包裹所有路由的网关中间件：限流、认证与同源校验。
pub async fn gateway_middleware(
    Extension(gateway): Extension<Arc<AuthGateway>>,
    Extension(scheme): Extension<RequestScheme>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let Some(secret) = gateway.secret.as_deref() else {
        return Ok(next.run(req).await);
    };

    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = resolve_client_ip(req.headers(), connect_ip, gateway.trust_forwarded_for)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let now = Instant::now();

    if let Some(retry_after) = gateway.failures.check(client_ip, now).await {
        debug!(client_ip = %client_ip, retry_after, "request from blocked client");
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let authenticated = supplied_password(req.headers())
        .is_some_and(|password| secrets_match(&password, secret));
    if !authenticated {
        if gateway.failures.register_failure(client_ip, now).await {
            warn!(client_ip = %client_ip, "client blocked after repeated auth failures");
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(AUTH_REALM),
        );
        return Err(ApiError::Unauthorized(headers));
    }
    gateway.failures.clear(client_ip).await;

    if is_mutating(req.method()) && !is_same_origin(req.headers(), req.uri(), scheme) {
        warn!(
            client_ip = %client_ip,
            method = %req.method(),
            path = req.uri().path(),
            "cross-origin mutation rejected"
        );
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(req).await)
}
