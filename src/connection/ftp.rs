use super::blocking::{self, ChannelReader};
use super::{file_name, join_path, part_path, resolve_addr, ByteStream, FileEntry, ServerConnection};
use crate::config::{Protocol, ServerConfig};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, Mode, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, info, warn};

type SharedStream = Arc<Mutex<Option<NativeTlsFtpStream>>>;

/// FTP / FTPS（显式、隐式 TLS）连接
///
/// suppaftp 是同步库，所有命令都在 blocking 线程中执行，控制连接由互斥锁保护。
pub struct FtpConnection {
    config: ServerConfig,
    timeout: Duration,
    name: String,
    inner: SharedStream,
}

impl FtpConnection {
    pub fn new(config: ServerConfig, timeout_secs: u64) -> Self {
        let scheme = match config.protocol {
            Protocol::Ftp => "ftp",
            _ => "ftps",
        };
        let name = format!("{}://{}:{}", scheme, config.host, config.effective_port());
        if !config.is_utf8() {
            warn!("{} 配置的编码 {} 非 UTF-8，文件名将按 UTF-8 处理", name, config.encoding);
        }
        Self {
            config,
            timeout: Duration::from_secs(timeout_secs),
            name,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    fn tls_connector(config: &ServerConfig) -> FtpResult<NativeTlsConnector> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .danger_accept_invalid_hostnames(!config.tls_verify)
            .build()
            .map_err(|e| FtpError::SecureError(e.to_string()))?;
        Ok(NativeTlsConnector::from(connector))
    }

    /// 建立控制连接、协商 TLS 并登录
    fn open(config: &ServerConfig, timeout: Duration) -> FtpResult<NativeTlsFtpStream> {
        let addr = resolve_addr(&config.host, config.effective_port()).map_err(FtpError::ConnectionError)?;

        let mut ftp = match config.protocol {
            // 隐式 TLS：从第一个字节开始加密
            Protocol::FtpsImplicit => NativeTlsFtpStream::connect_secure_implicit(
                addr,
                Self::tls_connector(config)?,
                &config.host,
            )?,
            // 显式 TLS：明文连接后 AUTH TLS 升级，再登录
            Protocol::FtpsExplicit => NativeTlsFtpStream::connect_timeout(addr, timeout)?
                .into_secure(Self::tls_connector(config)?, &config.host)?,
            _ => NativeTlsFtpStream::connect_timeout(addr, timeout)?,
        };

        ftp.get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(FtpError::ConnectionError)?;
        ftp.get_ref()
            .set_write_timeout(Some(timeout))
            .map_err(FtpError::ConnectionError)?;

        ftp.login(config.user.as_str(), config.password.as_deref().unwrap_or(""))?;
        ftp.set_mode(if config.passive {
            Mode::Passive
        } else {
            Mode::Active
        });
        ftp.transfer_type(FileType::Binary)?;
        Ok(ftp)
    }

    /// 在 blocking 线程中使用控制连接执行命令
    async fn run<T, F>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> FtpResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let p = path.to_string();
        tokio::task::spawn_blocking(move || {
            with_stream(&inner, &name, |ftp| {
                f(ftp).map_err(|e| classify(&name, op, &p, e))
            })
        })
        .await
        .map_err(|e| blocking::join_error(op, path, e))?
    }
}

fn with_stream<T>(
    inner: &SharedStream,
    name: &str,
    f: impl FnOnce(&mut NativeTlsFtpStream) -> Result<T>,
) -> Result<T> {
    let mut guard = inner
        .lock()
        .map_err(|_| TransferError::connection(name, "连接状态锁已损坏"))?;
    let ftp = guard
        .as_mut()
        .ok_or_else(|| TransferError::connection(name, "未连接"))?;
    f(ftp)
}

/// 控制连接断开属于连接级错误，其余属于单次操作错误
fn classify(name: &str, op: &'static str, path: &str, e: FtpError) -> TransferError {
    match &e {
        FtpError::ConnectionError(io) if is_disconnect(io.kind()) => TransferError::connection(name, e),
        FtpError::UnexpectedResponse(resp) if resp.status == Status::NotAvailable => {
            TransferError::connection(name, e)
        }
        _ => TransferError::remote_io(op, path, e),
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_file_unavailable(e: &FtpError) -> bool {
    matches!(e, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

/// STOR 到指定路径
fn store(ftp: &mut NativeTlsFtpStream, path: &str, reader: &mut ChannelReader) -> FtpResult<u64> {
    let mut data = ftp.put_with_stream(path)?;
    match io::copy(reader, &mut data) {
        Ok(written) => {
            ftp.finalize_put_stream(data)?;
            Ok(written)
        }
        Err(e) => {
            // 保持控制连接同步：读掉 STOR 的结束应答
            let _ = ftp.finalize_put_stream(data);
            Err(data_error(e))
        }
    }
}

/// 临时文件改名为目标；部分服务器不允许 RNTO 覆盖，先删除旧目标再改名
fn replace(ftp: &mut NativeTlsFtpStream, from: &str, to: &str) -> FtpResult<()> {
    match ftp.rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => match ftp.rm(to) {
            Ok(()) => ftp.rename(from, to),
            Err(rm) if is_file_unavailable(&rm) => Err(e),
            Err(rm) => Err(rm),
        },
    }
}

/// 数据通道上的 IO 错误不代表控制连接断开
fn data_error(e: io::Error) -> FtpError {
    FtpError::ConnectionError(io::Error::other(e.to_string()))
}

#[async_trait]
impl ServerConnection for FtpConnection {
    async fn connect(&self) -> Result<()> {
        info!("连接到FTP服务器: {}", self.name);
        let config = self.config.clone();
        let timeout = self.timeout;
        let name = self.name.clone();
        let inner = self.inner.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<()> {
            let ftp = FtpConnection::open(&config, timeout).map_err(|e| TransferError::connection(&name, e))?;
            let mut guard = inner
                .lock()
                .map_err(|_| TransferError::connection(&name, "连接状态锁已损坏"))?;
            *guard = Some(ftp);
            Ok(())
        });

        // DNS 与 TLS 握手不受套接字超时约束，整体再加一层超时
        match tokio::time::timeout(self.timeout * 2, task).await {
            Ok(joined) => joined.map_err(|e| TransferError::connection(&self.name, e))??,
            Err(_) => return Err(TransferError::connection(&self.name, "连接超时")),
        }
        info!("成功连接到FTP服务器: {}", self.name);
        Ok(())
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
        let dir = directory.to_string();
        let entries = self
            .run("list", directory, move |ftp| {
                let lines = ftp.list(Some(&dir))?;
                let mut entries = Vec::new();
                for line in lines {
                    let file = match line.parse::<suppaftp::list::File>() {
                        Ok(f) => f,
                        Err(_) => {
                            debug!("跳过无法解析的列表行: {}", line);
                            continue;
                        }
                    };
                    if !file.is_file() {
                        continue;
                    }
                    let name = file_name(file.name()).to_string();
                    // 跳过未完成的上传
                    if name.ends_with(".part") {
                        continue;
                    }
                    let path = join_path(&dir, &name);
                    // LIST 的时间精度只到分钟，优先使用 MDTM
                    let modified = match ftp.mdtm(&path) {
                        Ok(t) => t,
                        Err(e) => {
                            debug!("MDTM 不可用 {}: {}", path, e);
                            DateTime::<Utc>::from(file.modified()).naive_utc()
                        }
                    };
                    entries.push(FileEntry {
                        name,
                        path,
                        size: file.size() as u64,
                        modified,
                    });
                }
                Ok(entries)
            })
            .await?;
        info!("在目录 {} 中找到 {} 个文件", directory, entries.len());
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        let (tx, stream) = blocking::read_channel();
        let inner = self.inner.clone();
        let name = self.name.clone();
        let p = path.to_string();

        tokio::task::spawn_blocking(move || {
            let result = with_stream(&inner, &name, |ftp| {
                let mut data = ftp
                    .retr_as_stream(&p)
                    .map_err(|e| classify(&name, "read", &p, e))?;
                match blocking::pump(&mut data, &tx) {
                    Ok(true) => ftp
                        .finalize_retr_stream(data)
                        .map_err(|e| classify(&name, "read", &p, e)),
                    Ok(false) => {
                        // 接收端已放弃，读掉服务器的结束应答
                        let _ = ftp.finalize_retr_stream(data);
                        Ok(())
                    }
                    Err(e) => {
                        let _ = ftp.finalize_retr_stream(data);
                        Err(TransferError::remote_io("read", &p, e))
                    }
                }
            });
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(stream)
    }

    async fn write_stream(&self, path: &str, stream: ByteStream) -> Result<u64> {
        let (tx, mut reader) = ChannelReader::channel();
        let p = path.to_string();
        let upload = self.run("write", path, move |ftp| {
            // 先写临时文件，完整上传后再替换目标，失败时已有的目标文件保持不变
            let part = part_path(&p);
            let result = store(ftp, &part, &mut reader).and_then(|written| {
                replace(ftp, &part, &p)?;
                Ok(written)
            });
            if result.is_err() {
                match ftp.rm(&part) {
                    Err(e) if !is_file_unavailable(&e) => warn!("清理临时文件 {} 失败: {}", part, e),
                    _ => {}
                }
            }
            result
        });

        let (fed, written) = tokio::join!(blocking::feed(stream, tx), upload);
        fed?;
        written
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let p = path.to_string();
        self.run("exists", path, move |ftp| match ftp.size(&p) {
            Ok(_) => Ok(true),
            Err(e) if is_file_unavailable(&e) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("移动文件: {} -> {}", from, to);
        let (f, t) = (from.to_string(), to.to_string());
        self.run("rename", from, move |ftp| ftp.rename(&f, &t)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.run("delete", path, move |ftp| match ftp.rm(&p) {
            Err(e) if is_file_unavailable(&e) => Ok(()),
            other => other,
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.run("mkdir", path, move |ftp| ftp.mkdir(&p)).await
    }

    async fn close(&self) {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = inner.lock() {
                if let Some(mut ftp) = guard.take() {
                    if let Err(e) = ftp.quit() {
                        debug!("关闭连接 {} 时出错: {}", name, e);
                    }
                }
            }
        })
        .await;
    }

    fn name(&self) -> &str {
        &self.name
    }
}
