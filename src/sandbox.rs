//! 路径沙箱：把不可信的客户端路径解析为仓库根目录内的位置。
//!
//! 解析分两步：先做词法规范化（去掉 `.`，回退 `..`），越界即拒绝；
//! 目标（或最近的已存在祖先）存在时，再计算真实路径并二次检查，
//! 以拦截根目录内指向外部的符号链接。

use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// 路径解析错误。
#[derive(Error, Debug)]
pub enum PathError {
    #[error("path escapes the repository root")]
    PathEscape,
    #[error("path contains control characters")]
    NullByte,
    #[error("path is not valid unicode")]
    NotUnicode,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 规范化后的仓库根目录，是路径约束的唯一依据。
#[derive(Clone, Debug)]
pub struct RepoRoot {
    root: PathBuf,
}

impl RepoRoot {
    /// 规范化 `root`，不是已存在的目录时返回错误。
    pub async fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref()).await?;
        let metadata = fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// 根目录的绝对路径。
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// 基于根目录解析 `raw`，两步校验见模块文档。
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedPath, PathError> {
        let relative = normalize_relative(raw)?;
        let lexical = self.root.join(&relative);
        let real = self.real_location(&lexical).await?;
        let real_relative = self.relative_of(&real).ok_or(PathError::PathEscape)?;
        Ok(ResolvedPath {
            relative: to_repo_relative(&relative)?,
            real_relative,
            path: real,
        })
    }

    /// 在固定目录 `dir` 下解析单个文件名 `name`。
    pub async fn resolve_in(&self, dir: &str, name: &str) -> Result<ResolvedPath, PathError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(PathError::PathEscape);
        }
        self.resolve(&format!("{}/{}", dir.trim_end_matches('/'), name))
            .await
    }

    async fn real_location(&self, lexical: &Path) -> Result<PathBuf, PathError> {
        match fs::symlink_metadata(lexical).await {
            Ok(_) => {
                let real = fs::canonicalize(lexical).await?;
                self.ensure_contained(lexical, &real)?;
                Ok(real)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut missing = Vec::new();
                let mut ancestor = lexical;
                loop {
                    let Some(parent) = ancestor.parent() else {
                        return Err(PathError::PathEscape);
                    };
                    if let Some(name) = ancestor.file_name() {
                        missing.push(name.to_owned());
                    }
                    ancestor = parent;
                    match fs::canonicalize(ancestor).await {
                        Ok(real) => {
                            self.ensure_contained(lexical, &real)?;
                            let mut resolved = real;
                            for name in missing.iter().rev() {
                                resolved.push(name);
                            }
                            return Ok(resolved);
                        }
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => return Err(PathError::Io(err)),
                    }
                }
            }
            Err(err) => Err(PathError::Io(err)),
        }
    }

    fn ensure_contained(&self, lexical: &Path, real: &Path) -> Result<(), PathError> {
        if real.starts_with(&self.root) {
            return Ok(());
        }
        warn!(path = ?lexical, target = ?real, "symlink escapes repository root");
        Err(PathError::PathEscape)
    }

    /// 根目录内绝对路径对应的相对路径。
    pub fn relative_of(&self, absolute: &Path) -> Option<String> {
        let relative = absolute.strip_prefix(&self.root).ok()?;
        to_repo_relative(relative).ok()
    }
}

/// 词法与符号链接解析后均位于根目录内的位置。
#[derive(Clone, Debug)]
pub struct ResolvedPath {
    relative: String,
    real_relative: String,
    path: PathBuf,
}

impl ResolvedPath {
    /// 相对根目录的正斜杠路径，根目录本身为空串。
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// 解析符号链接后的相对路径。
    pub fn real_relative(&self) -> &str {
        &self.real_relative
    }

    /// 交给文件系统调用的真实绝对路径。
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 请求路径的最后一段。
    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or_default()
    }
}

fn normalize_relative(raw: &str) -> Result<PathBuf, PathError> {
    if raw.chars().any(char::is_control) {
        return Err(PathError::NullByte);
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(PathError::PathEscape);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(PathError::PathEscape),
        }
    }
    Ok(normalized)
}

fn to_repo_relative(relative: &Path) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => {
                parts.push(segment.to_str().ok_or(PathError::NotUnicode)?);
            }
            Component::CurDir => {}
            _ => return Err(PathError::PathEscape),
        }
    }
    Ok(parts.join("/"))
}
