//! 日志模块 - 文件日志与大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

pub const LOG_FILE_NAME: &str = "ftp-transfer.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件（控制台输出始终开启）
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录
    #[serde(default = "default_directory")]
    pub directory: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

fn default_directory() -> String {
    "logs".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            directory: default_directory(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 当前日志文件及已写入的大小
struct LogFile {
    writer: BufWriter<File>,
    size: u64,
    /// 轮转失败后不再尝试，继续追加到当前文件
    rotation_failed: bool,
}

impl LogFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            size,
            rotation_failed: false,
        })
    }

    fn rotate(&mut self, path: &Path) -> io::Result<()> {
        self.writer.flush()?;
        backup(path)?;
        *self = Self::open(path)?;
        Ok(())
    }
}

/// 把当前日志改名为 `.log.old`，覆盖上一份备份
fn backup(path: &Path) -> io::Result<()> {
    let backup_path = path.with_extension("log.old");
    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(path, &backup_path)
}

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 `.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    state: Arc<Mutex<LogFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb as u64) * 1024 * 1024;
        // 上次运行留下的超限文件先轮转掉
        if fs::metadata(&file_path).is_ok_and(|m| m.len() > max_size) {
            backup(&file_path)?;
        }

        Ok(Self {
            state: Arc::new(Mutex::new(LogFile::open(&file_path)?)),
            file_path,
            max_size,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// 单次写入使用的句柄
pub struct LogWriter {
    state: Arc<Mutex<LogFile>>,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        let n = log.writer.write(buf)?;
        log.writer.flush()?;
        log.size += n as u64;

        if log.size > self.max_size && !log.rotation_failed {
            if let Err(e) = log.rotate(&self.file_path) {
                log.rotation_failed = true;
                eprintln!("日志轮转失败 {}: {}", self.file_path.display(), e);
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?
            .writer
            .flush()
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            state: self.state.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}
