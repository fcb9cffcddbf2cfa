//! 传输任务配置模块

use crate::core::collision::CollisionPolicy;
use crate::core::filter::FilterCriteria;
use crate::error::{Result, TransferError};
use crate::logging::LogConfig;
use anyhow::Context;
use chrono::{Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 服务器协议
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Ftp,
    /// AUTH TLS 升级
    FtpsExplicit,
    /// 连接即 TLS
    FtpsImplicit,
    Sftp,
    /// 本地目录
    Local,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::FtpsExplicit => 21,
            Protocol::FtpsImplicit => 990,
            Protocol::Sftp => 22,
            Protocol::Local => 0,
        }
    }
}

/// 单个服务器的连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    /// 未设置时使用协议默认端口
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SFTP 私钥文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// FTP 被动模式，SFTP 忽略
    #[serde(default = "default_true")]
    pub passive: bool,
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// FTPS 是否校验服务器证书
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// 本地协议的根目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_true() -> bool {
    true
}

fn default_directory() -> String {
    "/".to_string()
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            host: String::new(),
            port: None,
            user: default_user(),
            password: None,
            key_file: None,
            passphrase: None,
            passive: default_true(),
            directory: default_directory(),
            encoding: default_encoding(),
            tls_verify: default_true(),
            root: None,
        }
    }
}

impl ServerConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn is_utf8(&self) -> bool {
        let normalized: String = self
            .encoding
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect();
        normalized.eq_ignore_ascii_case("utf8")
    }

    fn validate(&self, role: &str) -> Result<()> {
        let invalid = |msg: &str| Err(TransferError::Config(format!("{}: {}", role, msg)));

        if self.directory.trim().is_empty() {
            return invalid("directory 不能为空");
        }
        match self.protocol {
            Protocol::Local => {
                if self.root.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    return invalid("本地协议需要 root");
                }
            }
            Protocol::Sftp => {
                if self.host.trim().is_empty() {
                    return invalid("host 不能为空");
                }
                if self.password.is_none() && self.key_file.is_none() {
                    return invalid("SFTP 需要 password 或 key_file");
                }
            }
            _ => {
                if self.host.trim().is_empty() {
                    return invalid("host 不能为空");
                }
            }
        }
        if self.port == Some(0) {
            return invalid("port 不能为 0");
        }
        Ok(())
    }
}

/// 归档配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 源服务器上的备份目录
    #[serde(default)]
    pub backup_directory: String,
}

/// 重试间隔策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 首次尝试之外的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// 第 `retry` 次重试（从 1 开始）之前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.delay_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms)
    }
}

/// 计算时间表达式使用的参考时钟
///
/// 文件时间不做时区换算：FTP（MDTM / LIST）与 SFTP 报告的都是 UTC 时间，
/// 本地目录报告的是本机时间。源端为 FTP / SFTP 时应配置 `utc`，
/// 否则 `current_day` 等相对时间会按本机与 UTC 的时差整体偏移。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceClock {
    #[default]
    Local,
    Utc,
}

impl ReferenceClock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            ReferenceClock::Local => Local::now().naive_local(),
            ReferenceClock::Utc => Utc::now().naive_utc(),
        }
    }
}

/// 一次传输任务的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub source: ServerConfig,
    pub destination: ServerConfig,
    #[serde(default)]
    pub filter: FilterCriteria,
    #[serde(default)]
    pub collision: CollisionPolicy,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// 失败文件数达到该值时报告为超过阈值，0 表示不启用
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub clock: ReferenceClock,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    crate::connection::DEFAULT_TIMEOUT_SECS
}

impl TransferConfig {
    /// 从 JSON 配置文件加载并校验
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: TransferConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 静态校验，不涉及任何网络操作
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.destination.validate("destination")?;
        if self.archive.enabled && self.archive.backup_directory.trim().is_empty() {
            return Err(TransferError::Config(
                "启用归档时 backup_directory 不能为空".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(TransferError::Config("timeout_secs 必须大于 0".to_string()));
        }
        Ok(())
    }
}
