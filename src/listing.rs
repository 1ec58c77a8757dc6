//! 仓库浏览：路径定位、目录列表与递归文件树。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

use crate::error::ApiError;
use crate::sandbox::{PathError, RepoRoot, ResolvedPath};
use crate::visibility::{Candidate, VisibilityDecision, VisibilityFilter, VisibilityOptions};

/// 仓库视图：路径约束、可见性规则与目录遍历。
pub struct Storage {
    root: RepoRoot,
    visibility: VisibilityFilter,
    tree_max_entries: usize,
}

impl Storage {
    /// 组合仓库根目录、可见性过滤器与文件树上限。
    pub fn new(root: RepoRoot, visibility: VisibilityFilter, tree_max_entries: usize) -> Self {
        Self {
            root,
            visibility,
            tree_max_entries,
        }
    }

    /// 仓库根目录。
    pub fn root(&self) -> &RepoRoot {
        &self.root
    }

    /// 解析并 stat 路径，再检查是否允许公开。
    pub async fn locate(
        &self,
        raw: &str,
        options: VisibilityOptions,
    ) -> Result<(ResolvedPath, Metadata), StorageError> {
        let target = self.root.resolve(raw).await?;
        self.authorize(target, options).await
    }

    /// 与 [`Storage::locate`] 相同，用于固定目录下的文件名。
    pub async fn locate_in(
        &self,
        dir: &str,
        name: &str,
        options: VisibilityOptions,
    ) -> Result<(ResolvedPath, Metadata), StorageError> {
        let target = self.root.resolve_in(dir, name).await?;
        self.authorize(target, options).await
    }

    async fn authorize(
        &self,
        target: ResolvedPath,
        options: VisibilityOptions,
    ) -> Result<(ResolvedPath, Metadata), StorageError> {
        let metadata = fs::metadata(target.path()).await?;
        match self
            .visibility
            .classify(&target, metadata.is_dir(), options)
            .await
        {
            VisibilityDecision::Visible => Ok((target, metadata)),
            decision => {
                debug!(path = target.relative(), ?decision, "access to undisclosed path");
                Err(StorageError::Undisclosed)
            }
        }
    }

    /// 列出目录的直接子项。
    pub async fn list_dir(
        &self,
        raw: &str,
        options: VisibilityOptions,
    ) -> Result<Listing, StorageError> {
        let (dir, metadata) = self.locate(raw, options).await?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory);
        }

        let scan = scan_dir(dir.path(), dir.relative()).await?;
        let batch = self.visibility.filter_batch(scan.candidates, options).await;

        let mut entries = Vec::with_capacity(batch.visible.len());
        for child in batch.visible {
            // 枚举后被删除的条目直接跳过。
            let metadata = match fs::symlink_metadata(&child.absolute).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = child.relative, error = %err, "entry vanished during listing");
                    continue;
                }
            };
            entries.push(FileEntry {
                name: child.name,
                path: child.relative,
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_at: metadata.modified().ok().map(format_timestamp),
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(Listing {
            path: dir.relative().to_string(),
            entries,
            skipped_symlinks: scan.skipped_symlinks,
            skipped_hidden: batch.skipped_hidden,
            skipped_ignored: batch.skipped_ignored,
        })
    }

    /// 广度优先遍历目录，返回可见文件路径。
    ///
    /// 不跟随符号链接，每个目录只调用一次忽略规则查询。
    pub async fn tree(&self, raw: &str) -> Result<Tree, StorageError> {
        let options = VisibilityOptions::strict();
        let (dir, metadata) = self.locate(raw, options).await?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory);
        }

        let mut files = Vec::new();
        let mut truncated = false;
        let mut queue = VecDeque::from([(dir.path().to_path_buf(), dir.relative().to_string())]);

        'walk: while let Some((absolute, relative)) = queue.pop_front() {
            let scan = match scan_dir(&absolute, &relative).await {
                Ok(scan) => scan,
                Err(err) => {
                    debug!(path = relative, error = %err, "skipping unreadable directory");
                    continue;
                }
            };
            let batch = self.visibility.filter_batch(scan.candidates, options).await;
            let mut children = batch.visible;
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for child in children {
                if child.is_dir {
                    queue.push_back((child.absolute, child.relative));
                    continue;
                }
                if files.len() >= self.tree_max_entries {
                    truncated = true;
                    break 'walk;
                }
                files.push(child.relative);
            }
        }

        Ok(Tree {
            root: dir.relative().to_string(),
            files,
            truncated,
        })
    }
}

struct Child {
    name: String,
    relative: String,
    absolute: PathBuf,
    is_dir: bool,
}

struct DirScan {
    candidates: Vec<Candidate<Child>>,
    skipped_symlinks: usize,
}

async fn scan_dir(absolute: &Path, relative: &str) -> io::Result<DirScan> {
    let mut dir = fs::read_dir(absolute).await?;
    let mut candidates = Vec::new();
    let mut skipped_symlinks = 0;

    while let Some(entry) = dir.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.chars().any(char::is_control) {
            continue;
        }
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if file_type.is_symlink() {
            skipped_symlinks += 1;
            continue;
        }
        let child_relative = if relative.is_empty() {
            name.clone()
        } else {
            format!("{relative}/{name}")
        };
        candidates.push(Candidate {
            relative: child_relative.clone(),
            is_dir: file_type.is_dir(),
            item: Child {
                absolute: entry.path(),
                relative: child_relative,
                is_dir: file_type.is_dir(),
                name,
            },
        });
    }

    Ok(DirScan {
        candidates,
        skipped_symlinks,
    })
}

/// 格式化为带毫秒的 RFC3339 时间。
pub fn format_timestamp(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 仓库访问错误。
#[derive(Debug)]
pub enum StorageError {
    Path(PathError),
    Io(io::Error),
    /// 存在但被隐藏或忽略，按不存在处理。
    Undisclosed,
    NotADirectory,
    NotAFile,
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<PathError> for StorageError {
    fn from(err: PathError) -> Self {
        StorageError::Path(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Path(err) => err.into(),
            StorageError::Io(err) => err.into(),
            StorageError::Undisclosed => ApiError::not_found(),
            StorageError::NotADirectory => ApiError::BadRequest("path is not a directory".into()),
            StorageError::NotAFile => ApiError::BadRequest("path is not a file".into()),
        }
    }
}

/// 目录列表中的单个条目。
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: Option<String>,
}

/// 目录列表及被跳过条目的计数。
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub path: String,
    pub entries: Vec<FileEntry>,
    pub skipped_symlinks: usize,
    pub skipped_hidden: usize,
    pub skipped_ignored: usize,
}

/// 递归文件列表，超过上限时 `truncated` 为 true。
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    pub root: String,
    pub files: Vec<String>,
    pub truncated: bool,
}
