//! 临时文件写入，以不覆盖已有目标的方式发布。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;

/// 发布临时文件的失败原因。
#[derive(Debug)]
pub enum PublishError {
    /// 写入临时文件期间目标已被创建。
    Exists,
    Io(io::Error),
}

/// 位于目标同目录的临时文件，通过 [`AtomicFile::publish_new`] 发布。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> Result<Self, ApiError> {
        let parent = target
            .parent()
            .ok_or_else(|| ApiError::BadRequest("invalid target path".into()))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "upload".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步临时文件并硬链接到目标路径，先写入者获胜。
    pub async fn publish_new(self) -> Result<(), PublishError> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(PublishError::Io(err));
        }
        drop(self.file);

        let result = match fs::hard_link(&self.temp_path, &self.target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(PublishError::Exists),
            Err(err) => {
                // 不支持硬链接的文件系统：先检查是否存在再重命名。
                warn!(error = %err, "hard link unavailable, falling back to rename");
                match fs::symlink_metadata(&self.target).await {
                    Ok(_) => Err(PublishError::Exists),
                    Err(_) => fs::rename(&self.temp_path, &self.target)
                        .await
                        .map_err(PublishError::Io),
                }
            }
        };
        let _ = fs::remove_file(&self.temp_path).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn publish_creates_target_and_removes_temp() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("a.png");
        let mut atomic = AtomicFile::new(&target).await.expect("create temp");
        atomic.file_mut().write_all(b"png").await.expect("write");
        atomic.publish_new().await.expect("publish");

        assert_eq!(std::fs::read(&target).expect("read"), b"png");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn publish_never_overwrites() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("a.png");
        std::fs::write(&target, b"first").expect("write first");

        let mut atomic = AtomicFile::new(&target).await.expect("create temp");
        atomic.file_mut().write_all(b"second").await.expect("write");
        let result = atomic.publish_new().await;

        assert!(matches!(result, Err(PublishError::Exists)));
        assert_eq!(std::fs::read(&target).expect("read"), b"first");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }
}
