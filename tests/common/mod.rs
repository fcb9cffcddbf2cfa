#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ftp_transfer_lib::config::{Protocol, RetryConfig, ServerConfig, TransferConfig};
use ftp_transfer_lib::connection::{ByteStream, FileEntry, LocalConnection, ServerConnection};
use ftp_transfer_lib::{Result, TransferError};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// 源目录 `in/`、目标目录 `out/` 的一对临时根目录
pub struct Fixture {
    pub src: tempfile::TempDir,
    pub dst: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("in")).unwrap();
        std::fs::create_dir_all(dst.path().join("out")).unwrap();
        Self { src, dst }
    }

    pub fn put_source(&self, name: &str, content: &[u8]) {
        std::fs::write(self.src.path().join("in").join(name), content).unwrap();
    }

    pub fn put_dest(&self, name: &str, content: &[u8]) {
        std::fs::write(self.dst.path().join("out").join(name), content).unwrap();
    }

    pub fn read_dest(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.dst.path().join("out").join(name)).unwrap()
    }

    pub fn dest_files(&self) -> Vec<String> {
        list_names(&self.dst.path().join("out"))
    }

    pub fn source_files(&self) -> Vec<String> {
        list_names(&self.src.path().join("in"))
    }

    pub fn backup_files(&self) -> Vec<String> {
        list_names(&self.src.path().join("backup"))
    }

    pub fn source_conn(&self) -> LocalConnection {
        LocalConnection::new(self.src.path().to_str().unwrap())
    }

    pub fn dest_conn(&self) -> LocalConnection {
        LocalConnection::new(self.dst.path().to_str().unwrap())
    }

    pub fn config(&self) -> TransferConfig {
        TransferConfig {
            source: local_server(self.src.path(), "/in"),
            destination: local_server(self.dst.path(), "/out"),
            filter: Default::default(),
            collision: Default::default(),
            archive: Default::default(),
            retry: RetryConfig {
                max_retries: 3,
                delay_ms: 1,
                ..RetryConfig::default()
            },
            failure_threshold: 3,
            timeout_secs: 5,
            clock: Default::default(),
            log: Default::default(),
        }
    }
}

fn local_server(root: &Path, directory: &str) -> ServerConfig {
    ServerConfig {
        protocol: Protocol::Local,
        root: Some(root.to_str().unwrap().to_string()),
        directory: directory.to_string(),
        ..ServerConfig::default()
    }
}

fn list_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// 故障注入包装：按路径让读取失败、读到一半中断，或在若干次操作后模拟断线
pub struct FlakyConnection {
    inner: Arc<dyn ServerConnection>,
    /// path -> 剩余需要失败的读取次数
    read_failures: Mutex<HashMap<String, usize>>,
    /// path -> 读出第一块数据后返回的错误
    broken_reads: Mutex<HashMap<String, TransferError>>,
    /// path -> open_read 调用次数
    reads: Mutex<HashMap<String, usize>>,
    /// 连接后还能成功执行的操作数，`None` 表示不断线
    ops_left: Mutex<Option<usize>>,
    /// 像直接写目标路径的服务器那样，出错时留下已收到的部分
    write_in_place: AtomicBool,
    connected: AtomicBool,
}

impl FlakyConnection {
    pub fn new(inner: impl ServerConnection + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            read_failures: Mutex::new(HashMap::new()),
            broken_reads: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            ops_left: Mutex::new(None),
            write_in_place: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    /// 对 `path` 的前 `times` 次读取返回 RemoteIo 错误
    pub fn fail_reads(self, path: &str, times: usize) -> Self {
        self.read_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
        self
    }

    /// 对 `path` 的每次读取都先给出 `par`，再返回 `error`
    pub fn break_reads(self, path: &str, error: TransferError) -> Self {
        self.broken_reads
            .lock()
            .unwrap()
            .insert(path.to_string(), error);
        self
    }

    /// connect 成功，之后的所有操作都返回连接错误
    pub fn drop_after_connect(self) -> Self {
        self.drop_after(0)
    }

    /// connect 之后前 `ops` 次操作正常，之后全部返回连接错误
    pub fn drop_after(self, ops: usize) -> Self {
        *self.ops_left.lock().unwrap() = Some(ops);
        self
    }

    pub fn write_in_place(self) -> Self {
        self.write_in_place.store(true, Ordering::SeqCst);
        self
    }

    pub fn read_count(&self, path: &str) -> usize {
        self.reads.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn check_link(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.ops_left.lock().unwrap().as_mut() {
            Some(0) => Err(TransferError::connection(self.inner.name(), "connection reset by peer")),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServerConnection for FlakyConnection {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
        self.check_link()?;
        self.inner.list(directory).await
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        self.check_link()?;
        *self.reads.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;

        let inject = {
            let mut failures = self.read_failures.lock().unwrap();
            match failures.get_mut(path) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if inject {
            return Err(TransferError::remote_io("read", path, "injected read failure"));
        }
        let broken = self.broken_reads.lock().unwrap().get(path).cloned();
        if let Some(error) = broken {
            return Ok(Box::pin(futures::stream::iter(vec![
                Ok(Bytes::from_static(b"par")),
                Err(error),
            ])));
        }
        self.inner.open_read(path).await
    }

    async fn write_stream(&self, path: &str, mut stream: ByteStream) -> Result<u64> {
        self.check_link()?;
        if !self.write_in_place.load(Ordering::SeqCst) {
            return self.inner.write_stream(path, stream).await;
        }
        let mut received = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => received.extend_from_slice(&bytes),
                Err(e) => {
                    self.inner.write(path, received.freeze()).await?;
                    return Err(e);
                }
            }
        }
        self.inner.write(path, received.freeze()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_link()?;
        self.inner.exists(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_link()?;
        self.inner.rename(from, to).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_link()?;
        self.inner.delete(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.check_link()?;
        self.inner.create_dir(path).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inner.close().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
