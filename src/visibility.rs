//! 可见性规则：隐藏路径与版本控制忽略规则。

use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::sandbox::ResolvedPath;

/// 忽略规则查询错误。
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("failed to run ignore oracle: {0}")]
    Spawn(#[from] io::Error),
    #[error("ignore oracle exited with status {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("ignore oracle produced non-utf8 output")]
    Output,
}

pub type OracleFuture<'a> = BoxFuture<'a, Result<HashSet<String>, OracleError>>;

/// 判断仓库相对路径是否被版本控制忽略。
///
/// 目录查询带结尾的 `/`，实现需按传入的写法返回被忽略的子集。
pub trait IgnoreOracle: Send + Sync {
    fn ignored<'a>(&'a self, queries: &'a [String]) -> OracleFuture<'a>;
}

/// 基于 `git check-ignore --stdin -z` 的实现。
#[derive(Debug)]
pub struct GitIgnoreOracle {
    git_bin: String,
    root: PathBuf,
}

impl GitIgnoreOracle {
    /// 在 `root` 下运行 `git_bin`。
    pub fn new(git_bin: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            git_bin: git_bin.into(),
            root: root.into(),
        }
    }
}

impl IgnoreOracle for GitIgnoreOracle {
    fn ignored<'a>(&'a self, queries: &'a [String]) -> OracleFuture<'a> {
        Box::pin(async move {
            let mut child = Command::new(&self.git_bin)
                .arg("-C")
                .arg(&self.root)
                .args(["check-ignore", "--stdin", "-z"])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let mut input = Vec::new();
            for query in queries {
                input.extend_from_slice(query.as_bytes());
                input.push(0);
            }
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("ignore oracle stdin unavailable"))?;
            // 写入 stdin 的同时读取 stdout，避免大批量时管道阻塞。
            let writer = async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            };
            let (written, output) = tokio::join!(writer, child.wait_with_output());
            let output = output?;

            // 退出码 1 表示没有被忽略的路径，0 和 1 以外均为错误。
            match output.status.code() {
                Some(0) | Some(1) => {}
                _ => {
                    return Err(OracleError::Failed {
                        status: output.status.to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
            }
            written?;

            let stdout = String::from_utf8(output.stdout).map_err(|_| OracleError::Output)?;
            Ok(stdout
                .split('\0')
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect())
        })
    }
}

/// 忽略规则查询失败或超时时的处理策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPolicy {
    /// 视为没有被忽略的路径。
    Open,
    /// 视为整批路径都被忽略。
    Closed,
}

/// 单个路径的可见性判断结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisibilityDecision {
    Visible,
    HiddenBlocked,
    GitignoredBlocked,
}

/// 调用方放宽的规则。
#[derive(Clone, Copy, Debug, Default)]
pub struct VisibilityOptions {
    pub allow_hidden: bool,
    pub allow_gitignored: bool,
}

impl VisibilityOptions {
    /// 隐藏与忽略规则都生效。
    pub fn strict() -> Self {
        Self::default()
    }

    /// 网关自有的图片目录（上传、截图）：跳过隐藏规则，也不查询忽略规则。
    pub fn owned_dir() -> Self {
        Self {
            allow_hidden: true,
            allow_gitignored: true,
        }
    }
}

/// 待判断的条目及调用方附带的数据。
#[derive(Debug)]
pub struct Candidate<T> {
    pub relative: String,
    pub is_dir: bool,
    pub item: T,
}

/// 批量过滤结果与被跳过的计数。
#[derive(Debug)]
pub struct FilteredBatch<T> {
    pub visible: Vec<T>,
    pub skipped_hidden: usize,
    pub skipped_ignored: usize,
}

/// 隐藏规则与忽略规则查询的组合，带超时与失败策略。
pub struct VisibilityFilter {
    oracle: Arc<dyn IgnoreOracle>,
    timeout: Duration,
    policy: FailPolicy,
}

impl VisibilityFilter {
    /// 创建过滤器。
    pub fn new(oracle: Arc<dyn IgnoreOracle>, timeout: Duration, policy: FailPolicy) -> Self {
        Self {
            oracle,
            timeout,
            policy,
        }
    }

    /// 单路径判断：请求路径与解析符号链接后的路径都必须可见，
    /// 两者在同一批次中查询。
    pub async fn classify(
        &self,
        target: &ResolvedPath,
        is_dir: bool,
        options: VisibilityOptions,
    ) -> VisibilityDecision {
        let mut candidates = Vec::with_capacity(2);
        for relative in [target.relative(), target.real_relative()] {
            let seen = candidates
                .iter()
                .any(|c: &Candidate<()>| c.relative == relative);
            if !relative.is_empty() && !seen {
                candidates.push(Candidate {
                    relative: relative.to_string(),
                    is_dir,
                    item: (),
                });
            }
        }
        let expected = candidates.len();
        if expected == 0 {
            return VisibilityDecision::Visible;
        }
        let batch = self.filter_batch(candidates, options).await;
        if batch.visible.len() == expected {
            VisibilityDecision::Visible
        } else if batch.skipped_hidden > 0 {
            VisibilityDecision::HiddenBlocked
        } else {
            VisibilityDecision::GitignoredBlocked
        }
    }

    /// 批量过滤，最多调用一次忽略规则查询。
    pub async fn filter_batch<T>(
        &self,
        candidates: Vec<Candidate<T>>,
        options: VisibilityOptions,
    ) -> FilteredBatch<T> {
        let mut skipped_hidden = 0;
        let mut remaining = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !options.allow_hidden && is_hidden(&candidate.relative) {
                skipped_hidden += 1;
            } else {
                remaining.push(candidate);
            }
        }

        if options.allow_gitignored || remaining.is_empty() {
            return FilteredBatch {
                visible: remaining.into_iter().map(|c| c.item).collect(),
                skipped_hidden,
                skipped_ignored: 0,
            };
        }

        let queries: Vec<String> = remaining.iter().map(oracle_query).collect();
        let ignored = self.ignored_subset(&queries).await;
        let mut visible = Vec::with_capacity(remaining.len());
        let mut skipped_ignored = 0;
        for (candidate, query) in remaining.into_iter().zip(&queries) {
            let blocked = match &ignored {
                IgnoredSubset::All => true,
                IgnoredSubset::Only(set) => set.contains(query),
            };
            if blocked {
                skipped_ignored += 1;
            } else {
                visible.push(candidate.item);
            }
        }

        FilteredBatch {
            visible,
            skipped_hidden,
            skipped_ignored,
        }
    }

    async fn ignored_subset(&self, queries: &[String]) -> IgnoredSubset {
        let failure = match tokio::time::timeout(self.timeout, self.oracle.ignored(queries)).await
        {
            Ok(Ok(set)) => {
                return IgnoredSubset::Only(
                    set.into_iter()
                        .map(|entry| normalize_answer(&entry, queries))
                        .collect(),
                );
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };
        match self.policy {
            FailPolicy::Open => {
                warn!(error = %failure, count = queries.len(), "ignore oracle failed, failing open");
                IgnoredSubset::Only(HashSet::new())
            }
            FailPolicy::Closed => {
                warn!(error = %failure, count = queries.len(), "ignore oracle failed, failing closed");
                IgnoredSubset::All
            }
        }
    }
}

enum IgnoredSubset {
    Only(HashSet<String>),
    All,
}

/// 路径中任意一段以 `.` 开头即为隐藏路径。
pub fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|segment| segment.starts_with('.') && !segment.is_empty())
}

fn oracle_query<T>(candidate: &Candidate<T>) -> String {
    if candidate.is_dir {
        format!("{}/", candidate.relative.trim_end_matches('/'))
    } else {
        candidate.relative.clone()
    }
}

// 查询结果中的目录可能带或不带结尾的 `/`。
fn normalize_answer(entry: &str, queries: &[String]) -> String {
    if queries.iter().any(|query| query == entry) {
        return entry.to_string();
    }
    let with_slash = format!("{}/", entry.trim_end_matches('/'));
    if queries.iter().any(|query| *query == with_slash) {
        return with_slash;
    }
    entry.trim_end_matches('/').to_string()
}
