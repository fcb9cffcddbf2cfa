use super::{ByteStream, FileEntry, ServerConnection};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;
use walkdir::WalkDir;

/// 本地目录作为"服务器"：远程路径解析到 root 之下
pub struct LocalConnection {
    base_path: PathBuf,
    name: String,
    connected: AtomicBool,
}

impl LocalConnection {
    pub fn new(root: &str) -> Self {
        Self {
            base_path: PathBuf::from(root),
            name: format!("local:{}", root),
            connected: AtomicBool::new(false),
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransferError::connection(&self.name, "未连接"))
        }
    }

    fn modified_of(metadata: &std::fs::Metadata) -> Option<NaiveDateTime> {
        let modified = metadata.modified().ok()?;
        Some(DateTime::<Local>::from(modified).naive_local())
    }

    /// 写入时使用的临时文件
    fn part_path(full_path: &Path) -> PathBuf {
        let mut name = full_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        full_path.with_file_name(name)
    }
}

#[async_trait]
impl ServerConnection for LocalConnection {
    async fn connect(&self) -> Result<()> {
        match fs::metadata(&self.base_path).await {
            Ok(meta) if meta.is_dir() => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(_) => Err(TransferError::connection(&self.name, "根路径不是目录")),
            Err(e) => Err(TransferError::connection(&self.name, e)),
        }
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
        self.ensure_connected()?;
        let base = self.resolve_path(directory);
        if !base.is_dir() {
            return Err(TransferError::remote_io("list", directory, "目录不存在"));
        }

        let dir = directory.to_string();
        // 使用 spawn_blocking 避免阻塞 async runtime
        let mut entries: Vec<FileEntry> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    let metadata = entry.metadata().ok()?;
                    if !metadata.is_file() {
                        return None;
                    }
                    let name = entry.file_name().to_str()?.to_string();
                    // 跳过未完成的写入
                    if name.ends_with(".part") {
                        return None;
                    }
                    Some(FileEntry {
                        path: super::join_path(&dir, &name),
                        name,
                        size: metadata.len(),
                        modified: Self::modified_of(&metadata)?,
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| super::blocking::join_error("list", directory, e))?;

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        self.ensure_connected()?;
        let file = fs::File::open(self.resolve_path(path))
            .await
            .map_err(|e| TransferError::remote_io("read", path, e))?;
        let path = path.to_string();
        Ok(Box::pin(
            ReaderStream::new(file).map(move |r| r.map_err(|e| TransferError::remote_io("read", &path, e))),
        ))
    }

    async fn write_stream(&self, path: &str, stream: ByteStream) -> Result<u64> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::remote_io("write", path, e))?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::part_path(&full_path);
        let mut reader = StreamReader::new(stream.map(|r| r.map_err(std::io::Error::other)));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &full_path).await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(rm) = fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("清理临时文件 {} 失败: {}", temp_path.display(), rm);
                    }
                }
                Err(super::source_error(e).unwrap_or_else(|e| TransferError::remote_io("write", path, e)))
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ensure_connected()?;
        match fs::metadata(self.resolve_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransferError::remote_io("exists", path, e)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_connected()?;
        fs::rename(self.resolve_path(from), self.resolve_path(to))
            .await
            .map_err(|e| TransferError::remote_io("rename", from, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::remote_io("delete", path, e)),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        fs::create_dir_all(self.resolve_path(path))
            .await
            .map_err(|e| TransferError::remote_io("mkdir", path, e))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_requires_connect() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path().to_str().unwrap());
        assert!(conn.list("/").await.unwrap_err().is_connection());
        conn.connect().await.unwrap();
        assert!(conn.list("/").await.unwrap().is_empty());
        conn.close().await;
        conn.close().await;
        assert!(conn.exists("/a").await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_connect_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let conn = LocalConnection::new(missing.to_str().unwrap());
        assert!(conn.connect().await.unwrap_err().is_connection());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_write_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path().to_str().unwrap());
        conn.connect().await.unwrap();

        conn.write("/in/b.txt", Bytes::from_static(b"bbb")).await.unwrap();
        conn.write("/in/a.txt", Bytes::from_static(b"a")).await.unwrap();
        conn.create_dir("/in/sub").await.unwrap();

        let entries = conn.list("/in").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(entries[1].path, "/in/b.txt");
        assert_eq!(entries[1].size, 3);

        assert_eq!(conn.read("/in/b.txt").await.unwrap(), Bytes::from_static(b"bbb"));
        assert!(conn.exists("/in/a.txt").await.unwrap());
        assert!(!conn.exists("/in/c.txt").await.unwrap());
        assert!(!dir.path().join("in/a.txt.part").exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path().to_str().unwrap());
        conn.connect().await.unwrap();

        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(TransferError::remote_io("read", "/src", "reset")),
        ]));
        assert!(conn.write_stream("/out/x.bin", stream).await.is_err());
        assert!(!conn.exists("/out/x.bin").await.unwrap());
        assert!(!dir.path().join("out/x.bin.part").exists());
    }

    #[tokio::test]
    async fn test_source_drop_keeps_existing_and_class() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new(dir.path().to_str().unwrap());
        conn.connect().await.unwrap();
        conn.write("/out/x.bin", Bytes::from_static(b"old")).await.unwrap();

        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"par")),
            Err(TransferError::connection("ftp://src", "control channel dropped")),
        ]));
        let err = conn.write_stream("/out/x.bin", stream).await.unwrap_err();
        assert!(err.is_connection(), "unexpected {:?}", err);
        assert_eq!(conn.read("/out/x.bin").await.unwrap(), Bytes::from_static(b"old"));
    }
}
