//! 错误分类 - 配置错误快速失败，单文件错误可重试，连接错误终止本次运行

use thiserror::Error;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// 过滤条件无效（配置阶段，不会发起任何网络请求）
    #[error("无效的过滤条件: {0}")]
    InvalidFilterCriteria(String),

    /// 时间表达式无法解析
    #[error("无效的时间表达式: {0}")]
    InvalidTimeExpression(String),

    /// 连接级错误，整个运行终止
    #[error("连接失败 [{server}]: {reason}")]
    Connection { server: String, reason: String },

    /// 单次远程操作失败，由编排器重试
    #[error("远程操作失败 [{op}] {path}: {reason}")]
    RemoteIo {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// 归档失败，不影响传输结果
    #[error("归档失败 {path}: {reason}")]
    Archive { path: String, reason: String },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("操作已取消")]
    Cancelled,
}

impl TransferError {
    pub fn connection(server: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    pub fn remote_io(op: &'static str, path: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteIo {
            op,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn archive(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Archive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// 是否为连接级错误
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// 是否为配置类错误（过滤条件、时间表达式、配置本身）
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidFilterCriteria(_) | Self::InvalidTimeExpression(_) | Self::Config(_)
        )
    }

    /// 是否可以由编排器重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteIo { .. })
    }
}
