use super::blocking::{self, ChannelReader};
use super::{file_name, join_path, part_path, resolve_addr, ByteStream, FileEntry, ServerConnection};
use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use ssh2::{ErrorCode, Session, Sftp};
use std::io;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// libssh2 会话级错误码
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
/// SSH_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

type SharedSession = Arc<Mutex<Option<SftpSession>>>;

/// SFTP 连接（ssh2）
pub struct SftpConnection {
    config: ServerConfig,
    timeout: Duration,
    name: String,
    inner: SharedSession,
}

impl SftpConnection {
    pub fn new(config: ServerConfig, timeout_secs: u64) -> Self {
        let name = format!("sftp://{}:{}", config.host, config.effective_port());
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

    fn open(config: &ServerConfig, timeout: Duration) -> std::result::Result<SftpSession, String> {
        let addr = resolve_addr(&config.host, config.effective_port()).map_err(|e| e.to_string())?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| format!("TCP 连接到 {} 失败: {}", addr, e))?;

        let mut session = Session::new().map_err(|e| format!("创建 SSH 会话失败: {}", e))?;
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| format!("SSH 握手失败: {}", e))?;

        let auth = match &config.key_file {
            Some(key) => session.userauth_pubkey_file(
                &config.user,
                None,
                Path::new(key),
                config.passphrase.as_deref(),
            ),
            None => session.userauth_password(&config.user, config.password.as_deref().unwrap_or("")),
        };
        if let Err(e) = auth {
            return Err(format!("SSH 认证失败: {}", e));
        }
        if !session.authenticated() {
            return Err("SSH 认证失败".to_string());
        }

        let sftp = session
            .sftp()
            .map_err(|e| format!("打开 SFTP 通道失败: {}", e))?;
        Ok(SftpSession { session, sftp })
    }

    async fn run<T, F>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> std::result::Result<T, ssh2::Error> + Send + 'static,
    {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let p = path.to_string();
        tokio::task::spawn_blocking(move || {
            with_sftp(&inner, &name, |sftp| f(sftp).map_err(|e| classify(&name, op, &p, e)))
        })
        .await
        .map_err(|e| blocking::join_error(op, path, e))?
    }
}

fn with_sftp<T>(inner: &SharedSession, name: &str, f: impl FnOnce(&Sftp) -> Result<T>) -> Result<T> {
    let guard = inner
        .lock()
        .map_err(|_| TransferError::connection(name, "连接状态锁已损坏"))?;
    let session = guard
        .as_ref()
        .ok_or_else(|| TransferError::connection(name, "未连接"))?;
    f(&session.sftp)
}

fn classify(name: &str, op: &'static str, path: &str, e: ssh2::Error) -> TransferError {
    match e.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV,
        ) => TransferError::connection(name, e),
        _ => TransferError::remote_io(op, path, e),
    }
}

fn is_not_found(e: &ssh2::Error) -> bool {
    e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

fn store(name: &str, sftp: &Sftp, path: &str, reader: &mut ChannelReader) -> Result<u64> {
    let mut file = sftp
        .create(Path::new(path))
        .map_err(|e| classify(name, "write", path, e))?;
    let written = io::copy(reader, &mut file).map_err(|e| TransferError::remote_io("write", path, e))?;
    file.close().map_err(|e| classify(name, "write", path, e))?;
    Ok(written)
}

/// SFTP v3 的 rename 不覆盖已有文件，目标存在时先删除
fn replace(sftp: &Sftp, from: &str, to: &str) -> std::result::Result<(), ssh2::Error> {
    let (from, to) = (Path::new(from), Path::new(to));
    match sftp.rename(from, to, None) {
        Ok(()) => Ok(()),
        Err(e) => match sftp.unlink(to) {
            Ok(()) => sftp.rename(from, to, None),
            Err(rm) if is_not_found(&rm) => Err(e),
            Err(rm) => Err(rm),
        },
    }
}

/// SFTP 的 mtime 是 Unix 时间戳，按 UTC 展开，与 FTP 的 MDTM 一致
fn to_naive(mtime: Option<u64>) -> NaiveDateTime {
    mtime
        .and_then(|t| DateTime::from_timestamp(t as i64, 0))
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

#[async_trait]
impl ServerConnection for SftpConnection {
    async fn connect(&self) -> Result<()> {
        info!("连接到SFTP服务器: {}", self.name);
        let config = self.config.clone();
        let timeout = self.timeout;
        let name = self.name.clone();
        let inner = self.inner.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<()> {
            let session = SftpConnection::open(&config, timeout).map_err(|e| TransferError::connection(&name, e))?;
            let mut guard = inner
                .lock()
                .map_err(|_| TransferError::connection(&name, "连接状态锁已损坏"))?;
            *guard = Some(session);
            Ok(())
        });

        match tokio::time::timeout(self.timeout * 2, task).await {
            Ok(joined) => joined.map_err(|e| TransferError::connection(&self.name, e))??,
            Err(_) => return Err(TransferError::connection(&self.name, "连接超时")),
        }
        info!("成功连接到SFTP服务器: {}", self.name);
        Ok(())
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileEntry>> {
        let dir = directory.to_string();
        let mut entries = self
            .run("list", directory, move |sftp| {
                let listing = sftp.readdir(Path::new(&dir))?;
                Ok(listing
                    .into_iter()
                    .filter(|(_, stat)| stat.is_file())
                    .filter_map(|(path, stat)| {
                        let name = file_name(&path.to_string_lossy()).to_string();
                        if name.is_empty() || name.ends_with(".part") {
                            return None;
                        }
                        Some(FileEntry {
                            path: join_path(&dir, &name),
                            name,
                            size: stat.size.unwrap_or(0),
                            modified: to_naive(stat.mtime),
                        })
                    })
                    .collect::<Vec<_>>())
            })
            .await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        info!("在目录 {} 中找到 {} 个文件", directory, entries.len());
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        let (tx, stream) = blocking::read_channel();
        let inner = self.inner.clone();
        let name = self.name.clone();
        let p = path.to_string();

        tokio::task::spawn_blocking(move || {
            let result = with_sftp(&inner, &name, |sftp| {
                let mut file = sftp
                    .open(Path::new(&p))
                    .map_err(|e| classify(&name, "read", &p, e))?;
                blocking::pump(&mut file, &tx)
                    .map(|_| ())
                    .map_err(|e| TransferError::remote_io("read", &p, e))
            });
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(stream)
    }

    async fn write_stream(&self, path: &str, stream: ByteStream) -> Result<u64> {
        let (tx, mut reader) = ChannelReader::channel();
        let inner = self.inner.clone();
        let name = self.name.clone();
        let p = path.to_string();

        let upload = async move {
            tokio::task::spawn_blocking(move || {
                with_sftp(&inner, &name, |sftp| {
                    // 先写临时文件，完整上传后再替换目标，失败时已有的目标文件保持不变
                    let part = part_path(&p);
                    let result = store(&name, sftp, &part, &mut reader).and_then(|written| {
                        replace(sftp, &part, &p).map_err(|e| classify(&name, "write", &p, e))?;
                        Ok(written)
                    });
                    if result.is_err() {
                        match sftp.unlink(Path::new(&part)) {
                            Err(e) if !is_not_found(&e) => warn!("清理临时文件 {} 失败: {}", part, e),
                            _ => {}
                        }
                    }
                    result
                })
            })
            .await
            .map_err(|e| blocking::join_error("write", path, e))?
        };

        let (fed, written) = tokio::join!(blocking::feed(stream, tx), upload);
        fed?;
        written
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let p = path.to_string();
        self.run("exists", path, move |sftp| match sftp.stat(Path::new(&p)) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("移动文件: {} -> {}", from, to);
        let (f, t) = (from.to_string(), to.to_string());
        self.run("rename", from, move |sftp| {
            sftp.rename(Path::new(&f), Path::new(&t), None)
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.run("delete", path, move |sftp| match sftp.unlink(Path::new(&p)) {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.run("mkdir", path, move |sftp| sftp.mkdir(Path::new(&p), 0o755))
            .await
    }

    async fn close(&self) {
        let inner = self.inner.clone();
        let name = self.name.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = inner.lock() {
                if let Some(SftpSession { session, sftp }) = guard.take() {
                    drop(sftp);
                    if let Err(e) = session.disconnect(None, "", None) {
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
