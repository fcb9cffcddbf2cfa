pub mod blocking;
pub mod ftp;
pub mod local;
pub mod sftp;

use crate::config::{Protocol, ServerConfig};
use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use futures::Stream;
use serde::{Deserialize, Serialize};
use crate::error::TransferError;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;

pub use ftp::FtpConnection;
pub use local::LocalConnection;
pub use sftp::SftpConnection;

// ============ 公共常量 ============

/// 默认网络超时（秒）- connect, list, read, write
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 字节流（读取端）
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 目录列表中的文件条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// 完整远程路径
    pub path: String,
    pub size: u64,
    /// 服务器报告的修改时间，不做时区转换
    pub modified: NaiveDateTime,
}

/// 服务器连接抽象接口
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// 建立连接并完成认证
    async fn connect(&self) -> Result<()>;

    /// 列出目录中的普通文件（不递归，不含子目录）
    async fn list(&self, directory: &str) -> Result<Vec<FileEntry>>;

    /// 打开读取流
    async fn open_read(&self, path: &str) -> Result<ByteStream>;

    /// 将字节流写入目标路径，返回写入字节数
    async fn write_stream(&self, path: &str, stream: ByteStream) -> Result<u64>;

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool>;

    /// 服务器端移动/重命名
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 删除文件
    async fn delete(&self, path: &str) -> Result<()>;

    /// 创建目录
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 关闭连接（可重复调用，连接失败后调用也安全）
    async fn close(&self);

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Bytes> {
        use futures::StreamExt;
        let mut stream = self.open_read(path).await?;
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data.freeze())
    }

    /// 写入整个文件
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
        self.write_stream(path, stream).await
    }

    /// 获取连接名称（用于日志）
    fn name(&self) -> &str;
}

/// 拼接远程目录与文件名
pub fn join_path(directory: &str, name: &str) -> String {
    let dir = directory.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir, name.trim_start_matches('/'))
    }
}

/// 取路径中的文件名部分
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 上传时使用的临时文件名，写完后再改名为目标
pub fn part_path(path: &str) -> String {
    format!("{}.part", path)
}

/// 取回经 `io::Error` 包装后穿过写入管道的源端错误
///
/// 源端断线必须保持连接级分类，不能被折算成目标端的写入失败。
pub(crate) fn source_error(e: io::Error) -> std::result::Result<TransferError, io::Error> {
    if !e.get_ref().is_some_and(|inner| inner.is::<TransferError>()) {
        return Err(e);
    }
    match e.into_inner().map(|inner| inner.downcast::<TransferError>()) {
        Some(Ok(err)) => Ok(*err),
        Some(Err(other)) => Err(io::Error::other(other)),
        None => Err(io::Error::other("源端错误")),
    }
}

/// 解析主机地址（阻塞 DNS，需在 blocking 线程中调用）
pub(crate) fn resolve_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("无法解析主机地址: {}", host),
        )
    })
}

/// 根据配置创建连接实例（尚未连接）
pub fn create_connection(config: &ServerConfig, timeout_secs: u64) -> Arc<dyn ServerConnection> {
    match config.protocol {
        Protocol::Ftp | Protocol::FtpsExplicit | Protocol::FtpsImplicit => {
            tracing::info!(
                "创建FTP连接: {}:{} ({:?})",
                config.host,
                config.effective_port(),
                config.protocol
            );
            Arc::new(FtpConnection::new(config.clone(), timeout_secs))
        }
        Protocol::Sftp => {
            tracing::info!("创建SFTP连接: {}:{}", config.host, config.effective_port());
            Arc::new(SftpConnection::new(config.clone(), timeout_secs))
        }
        Protocol::Local => {
            tracing::info!("创建本地连接: root={:?}", config.root);
            Arc::new(LocalConnection::new(config.root.as_deref().unwrap_or("/")))
        }
    }
}
