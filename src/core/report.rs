//! 传输报告 - 汇总每个文件的结果

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 单个文件的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Transferred {
        file: String,
        target: String,
        bytes: u64,
    },
    /// 目标重名，以新名称传输
    Renamed {
        file: String,
        target: String,
        bytes: u64,
    },
    Skipped {
        file: String,
    },
    Failed {
        file: String,
        reason: String,
        attempts: u32,
    },
    Archived {
        file: String,
        archive_path: String,
    },
    ArchiveFailed {
        file: String,
        reason: String,
    },
}

impl TransferOutcome {
    pub fn file(&self) -> &str {
        match self {
            TransferOutcome::Transferred { file, .. }
            | TransferOutcome::Renamed { file, .. }
            | TransferOutcome::Skipped { file }
            | TransferOutcome::Failed { file, .. }
            | TransferOutcome::Archived { file, .. }
            | TransferOutcome::ArchiveFailed { file, .. } => file,
        }
    }

    /// 传输成功（含重命名传输）
    pub fn is_transfer_success(&self) -> bool {
        matches!(
            self,
            TransferOutcome::Transferred { .. } | TransferOutcome::Renamed { .. }
        )
    }
}

/// 整体运行结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    AllFailed,
    FailureThresholdExceeded,
    ConnectionError,
    Cancelled,
}

/// 冻结后的传输报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub trace_id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub outcomes: Vec<TransferOutcome>,
    pub files_found: usize,
    pub files_succeeded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub bytes_transferred: u64,
    /// 连接级失败原因，存在时本次运行提前终止
    pub connection_error: Option<String>,
    pub cancelled: bool,
}

impl TransferReport {
    pub fn renamed_files(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                TransferOutcome::Renamed { file, target, .. } => Some((file.as_str(), target.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failed_files(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                TransferOutcome::Failed { file, reason, .. } => Some((file.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// 按优先级判定：连接错误 > 取消 > 超过阈值 > 全部失败 > 部分成功
    pub fn classify(&self, failure_threshold: u32) -> RunStatus {
        if self.connection_error.is_some() {
            RunStatus::ConnectionError
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if failure_threshold > 0 && self.files_failed >= failure_threshold as usize {
            RunStatus::FailureThresholdExceeded
        } else if self.files_failed > 0 && self.files_failed == self.files_found {
            RunStatus::AllFailed
        } else if self.files_failed > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// 运行期间逐条累积结果，`finish` 后不可再修改
pub struct ReportAggregator {
    trace_id: String,
    started_at: DateTime<Local>,
    outcomes: Vec<TransferOutcome>,
    files_found: usize,
    files_succeeded: usize,
    files_skipped: usize,
    files_failed: usize,
    bytes_transferred: u64,
    connection_error: Option<String>,
    cancelled: bool,
}

impl ReportAggregator {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            started_at: Local::now(),
            outcomes: Vec::new(),
            files_found: 0,
            files_succeeded: 0,
            files_skipped: 0,
            files_failed: 0,
            bytes_transferred: 0,
            connection_error: None,
            cancelled: false,
        }
    }

    pub fn set_found(&mut self, count: usize) {
        self.files_found = count;
    }

    pub fn record(&mut self, outcome: TransferOutcome) {
        match &outcome {
            TransferOutcome::Transferred { bytes, .. } | TransferOutcome::Renamed { bytes, .. } => {
                self.files_succeeded += 1;
                self.bytes_transferred += bytes;
            }
            TransferOutcome::Skipped { .. } => self.files_skipped += 1,
            TransferOutcome::Failed { .. } => self.files_failed += 1,
            TransferOutcome::Archived { .. } | TransferOutcome::ArchiveFailed { .. } => {}
        }
        self.outcomes.push(outcome);
    }

    pub fn connection_failed(&mut self, reason: impl Into<String>) {
        self.connection_error = Some(reason.into());
    }

    pub fn cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn files_succeeded(&self) -> usize {
        self.files_succeeded
    }

    pub fn files_failed(&self) -> usize {
        self.files_failed
    }

    pub fn files_skipped(&self) -> usize {
        self.files_skipped
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn finish(self) -> TransferReport {
        TransferReport {
            trace_id: self.trace_id,
            started_at: self.started_at,
            finished_at: Local::now(),
            outcomes: self.outcomes,
            files_found: self.files_found,
            files_succeeded: self.files_succeeded,
            files_skipped: self.files_skipped,
            files_failed: self.files_failed,
            bytes_transferred: self.bytes_transferred,
            connection_error: self.connection_error,
            cancelled: self.cancelled,
        }
    }
}

/// 报告投递目标
pub trait ReportSink: Send + Sync {
    fn deliver(&self, report: &TransferReport) -> io::Result<()>;
}

/// 把报告摘要写入日志
pub struct LogReportSink {
    failure_threshold: u32,
}

impl LogReportSink {
    pub fn new(failure_threshold: u32) -> Self {
        Self { failure_threshold }
    }
}

impl ReportSink for LogReportSink {
    fn deliver(&self, report: &TransferReport) -> io::Result<()> {
        let status = report.classify(self.failure_threshold);
        let summary = format!(
            "[{}] 传输结束 {:?}: 找到 {} 个文件，成功 {}，跳过 {}，失败 {}，传输 {} 字节，耗时 {} 秒",
            report.trace_id,
            status,
            report.files_found,
            report.files_succeeded,
            report.files_skipped,
            report.files_failed,
            report.bytes_transferred,
            report.duration_secs()
        );

        match status {
            RunStatus::Success | RunStatus::Cancelled => info!("{}", summary),
            RunStatus::PartialSuccess => warn!("{}", summary),
            _ => error!("{}", summary),
        }
        if let Some(reason) = &report.connection_error {
            error!("连接错误: {}", reason);
        }
        for (file, target) in report.renamed_files() {
            info!("  重命名: {} -> {}", file, target);
        }
        for (file, reason) in report.failed_files() {
            warn!("  失败: {} ({})", file, reason);
        }
        Ok(())
    }
}

/// 把完整报告写成 JSON 文件
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonReportSink {
    fn deliver(&self, report: &TransferReport) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
        fs::write(&self.path, content)
    }
}
