//! 源文件归档 - 传输成功后把源文件移入备份目录

use super::collision::unique_name;
use crate::config::ArchiveConfig;
use crate::connection::{join_path, ServerConnection};
use crate::error::{Result, TransferError};
use chrono::NaiveDateTime;
use futures::StreamExt;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// 归档结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveResult {
    /// 未启用归档
    Disabled,
    /// 已移动到该路径
    Archived(String),
}

pub struct ArchiveManager {
    config: ArchiveConfig,
    reserved: HashSet<String>,
}

impl ArchiveManager {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            reserved: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// 创建备份目录（目录已存在时服务器可能报错，忽略）
    pub async fn prepare(&self, source: &dyn ServerConnection) {
        if !self.enabled() {
            return;
        }
        if let Err(e) = source.create_dir(&self.config.backup_directory).await {
            debug!("创建备份目录 {} 失败: {}", self.config.backup_directory, e);
        }
    }

    /// 归档单个源文件
    ///
    /// 连接级错误原样返回，其余错误统一为 `TransferError::Archive`。
    pub async fn archive(
        &mut self,
        source: &dyn ServerConnection,
        source_path: &str,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<ArchiveResult> {
        if !self.enabled() {
            return Ok(ArchiveResult::Disabled);
        }

        let result = self.archive_inner(source, source_path, name, now).await;
        match result {
            Ok(target) => {
                info!("已归档: {} -> {}", source_path, target);
                Ok(ArchiveResult::Archived(target))
            }
            Err(e) if e.is_connection() => Err(e),
            Err(TransferError::Archive { path, reason }) => Err(TransferError::Archive { path, reason }),
            Err(e) => Err(TransferError::archive(source_path, e)),
        }
    }

    async fn archive_inner(
        &mut self,
        source: &dyn ServerConnection,
        source_path: &str,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<String> {
        let mut target = join_path(&self.config.backup_directory, name);
        if self.reserved.contains(&target) || source.exists(&target).await? {
            target = unique_name(source, &target, now, &mut self.reserved).await?;
        } else {
            self.reserved.insert(target.clone());
        }

        match source.rename(source_path, &target).await {
            Ok(()) => return Ok(target),
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => warn!("服务器端移动失败，改为复制后删除: {}", e),
        }

        if let Err(e) = copy_verify_delete(source, source_path, &target).await {
            self.reserved.remove(&target);
            return Err(e);
        }
        Ok(target)
    }
}

/// 复制 → 回读校验 → 删除源文件，复制或校验失败时删除备份副本
async fn copy_verify_delete(source: &dyn ServerConnection, source_path: &str, target: &str) -> Result<()> {
    let data = source.read(source_path).await?;
    let expected = blake3::hash(&data);

    let verified = match source.write(target, data).await {
        Ok(_) => match digest(source, target).await {
            Ok(actual) if actual == expected => Ok(()),
            Ok(_) => Err(TransferError::archive(source_path, "归档副本校验失败")),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    if let Err(e) = verified {
        discard_copy(source, target).await;
        return Err(e);
    }

    source.delete(source_path).await
}

async fn discard_copy(source: &dyn ServerConnection, target: &str) {
    if let Err(e) = source.delete(target).await {
        warn!("删除不完整的归档副本 {} 失败: {}", target, e);
    }
}

async fn digest(conn: &dyn ServerConnection, path: &str) -> Result<blake3::Hash> {
    let mut stream = conn.open_read(path).await?;
    let mut hasher = blake3::Hasher::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ByteStream, FileEntry, LocalConnection};
    use crate::core::time_expr::ABSOLUTE_FORMAT;
    use async_trait::async_trait;
    use bytes::Bytes;

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2023-01-02 15:30:00", ABSOLUTE_FORMAT).unwrap()
    }

    fn manager() -> ArchiveManager {
        ArchiveManager::new(ArchiveConfig {
            enabled: true,
            backup_directory: "/backup".to_string(),
        })
    }

    async fn source() -> (tempfile::TempDir, LocalConnection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path().to_str().unwrap());
        conn.connect().await.unwrap();
        conn.write("/in/a.csv", Bytes::from_static(b"payload")).await.unwrap();
        (dir, conn)
    }

    /// rename 总是失败的本地连接，用于走复制回退路径
    struct NoRename {
        inner: LocalConnection,
        corrupt_copy: bool,
        /// 写入一部分后失败，并把这部分留在目标路径
        break_copy: bool,
    }

    #[async_trait]
    impl ServerConnection for NoRename {
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }
        async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
            self.inner.list(directory).await
        }
        async fn open_read(&self, path: &str) -> Result<ByteStream> {
            self.inner.open_read(path).await
        }
        async fn write_stream(&self, path: &str, stream: ByteStream) -> Result<u64> {
            if self.corrupt_copy {
                return self.inner.write(path, Bytes::from_static(b"garbage")).await;
            }
            if self.break_copy {
                self.inner.write(path, Bytes::from_static(b"pay")).await?;
                return Err(TransferError::remote_io("write", path, "426 connection closed; transfer aborted"));
            }
            self.inner.write_stream(path, stream).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn rename(&self, from: &str, _to: &str) -> Result<()> {
            Err(TransferError::remote_io("rename", from, "550 not permitted"))
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn create_dir(&self, path: &str) -> Result<()> {
            self.inner.create_dir(path).await
        }
        async fn close(&self) {
            self.inner.close().await
        }
        fn name(&self) -> &str {
            self.inner.name()
        }
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let (_dir, conn) = source().await;
        let mut mgr = ArchiveManager::new(ArchiveConfig::default());
        assert_eq!(
            mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap(),
            ArchiveResult::Disabled
        );
        assert!(conn.exists("/in/a.csv").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_into_backup() {
        let (_dir, conn) = source().await;
        let mut mgr = manager();
        mgr.prepare(&conn).await;

        let result = mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap();
        assert_eq!(result, ArchiveResult::Archived("/backup/a.csv".to_string()));
        assert!(!conn.exists("/in/a.csv").await.unwrap());
        assert_eq!(conn.read("/backup/a.csv").await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_existing_backup_gets_timestamp() {
        let (_dir, conn) = source().await;
        conn.write("/backup/a.csv", Bytes::from_static(b"older")).await.unwrap();

        let mut mgr = manager();
        let result = mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap();
        assert_eq!(
            result,
            ArchiveResult::Archived("/backup/a_20230102-153000.csv".to_string())
        );
        assert_eq!(conn.read("/backup/a.csv").await.unwrap(), Bytes::from_static(b"older"));
    }

    #[tokio::test]
    async fn test_copy_fallback() {
        let (_dir, inner) = source().await;
        let conn = NoRename {
            inner,
            corrupt_copy: false,
            break_copy: false,
        };
        let mut mgr = manager();
        mgr.prepare(&conn).await;

        let result = mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap();
        assert_eq!(result, ArchiveResult::Archived("/backup/a.csv".to_string()));
        assert!(!conn.exists("/in/a.csv").await.unwrap());
        assert_eq!(conn.read("/backup/a.csv").await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_verification_failure_keeps_source() {
        let (_dir, inner) = source().await;
        let conn = NoRename {
            inner,
            corrupt_copy: true,
            break_copy: false,
        };
        let mut mgr = manager();
        mgr.prepare(&conn).await;

        let err = mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap_err();
        assert!(matches!(err, TransferError::Archive { .. }));
        assert!(conn.exists("/in/a.csv").await.unwrap());
        assert!(!conn.exists("/backup/a.csv").await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_copy_is_removed() {
        let (_dir, inner) = source().await;
        let conn = NoRename {
            inner,
            corrupt_copy: false,
            break_copy: true,
        };
        let mut mgr = manager();
        mgr.prepare(&conn).await;

        let err = mgr.archive(&conn, "/in/a.csv", "a.csv", now()).await.unwrap_err();
        assert!(matches!(err, TransferError::Archive { .. }));
        assert!(conn.exists("/in/a.csv").await.unwrap());
        assert!(!conn.exists("/backup/a.csv").await.unwrap());
        assert!(mgr.reserved.is_empty());
    }
}
