use crate::config::TransferConfig;
use crate::connection::{create_connection, join_path, FileEntry, ServerConnection};
use crate::core::archive::{ArchiveManager, ArchiveResult};
use crate::core::collision::{CollisionAction, CollisionResolver};
use crate::core::filter::FileFilter;
use crate::core::report::{ReportAggregator, TransferOutcome, TransferReport};
use crate::error::{Result, TransferError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    ConnectingSource,
    ConnectingDestination,
    Listing,
    PerFileLoop,
    Finalizing,
    Done,
    ConnectionFailed,
}

/// 传输进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub trace_id: String,
    pub phase: RunPhase,
    pub current_file: String,
    pub files_found: usize,
    pub files_completed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub bytes_transferred: u64,
}

/// 单次运行的上下文
struct RunContext<'a> {
    trace_id: String,
    source: &'a dyn ServerConnection,
    dest: &'a dyn ServerConnection,
    report: ReportAggregator,
    files_found: usize,
}

/// 传输编排器：连接 → 列表 → 过滤 → 逐个传输并归档 → 汇总报告
pub struct TransferOrchestrator {
    config: TransferConfig,
    cancelled: Arc<AtomicBool>,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl TransferOrchestrator {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// 请求取消，在下一个文件开始前生效
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 取消标志，可交给信号处理器
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 按配置创建连接并运行
    pub async fn run(&self) -> Result<TransferReport> {
        self.config.validate()?;
        let source = create_connection(&self.config.source, self.config.timeout_secs);
        let dest = create_connection(&self.config.destination, self.config.timeout_secs);
        self.run_with(source, dest).await
    }

    /// 使用给定连接运行
    ///
    /// 配置错误在任何网络操作之前以 `Err` 返回；其余情况都返回报告，
    /// 连接级失败记录在 `TransferReport::connection_error` 中。
    pub async fn run_with(
        &self,
        source: Arc<dyn ServerConnection>,
        dest: Arc<dyn ServerConnection>,
    ) -> Result<TransferReport> {
        self.config.validate()?;
        let filter = FileFilter::new(&self.config.filter, self.config.clock.now())?;

        let trace_id = Uuid::new_v4().to_string();
        let span = info_span!("transfer", trace_id = %trace_id);
        let ctx = RunContext {
            report: ReportAggregator::new(&trace_id),
            trace_id,
            source: source.as_ref(),
            dest: dest.as_ref(),
            files_found: 0,
        };
        Ok(self.execute(ctx, &filter).instrument(span).await)
    }

    async fn execute(&self, mut ctx: RunContext<'_>, filter: &FileFilter) -> TransferReport {
        info!("开始传输任务: {} -> {}", ctx.source.name(), ctx.dest.name());
        debug!("过滤条件: {}", filter);
        self.send_progress(&ctx, RunPhase::Init, "");

        self.send_progress(&ctx, RunPhase::ConnectingSource, "");
        if let Err(e) = ctx.source.connect().await {
            return self.abort(ctx, e).await;
        }

        self.send_progress(&ctx, RunPhase::ConnectingDestination, "");
        if let Err(e) = ctx.dest.connect().await {
            return self.abort(ctx, e).await;
        }

        self.send_progress(&ctx, RunPhase::Listing, "");
        let entries = match self.list_with_retry(ctx.source).await {
            Ok(entries) => entries,
            Err(e) => return self.abort(ctx, e).await,
        };
        let listed = entries.len();
        let selected = filter.select(entries);
        ctx.files_found = selected.len();
        ctx.report.set_found(selected.len());
        info!("源目录共 {} 个文件，符合条件 {} 个", listed, selected.len());

        let mut archive = ArchiveManager::new(self.config.archive.clone());
        archive.prepare(ctx.source).await;
        let mut resolver = CollisionResolver::new(self.config.collision);

        for entry in &selected {
            if self.is_cancelled() {
                info!("传输已取消，剩余文件不再处理");
                ctx.report.cancelled();
                break;
            }
            self.send_progress(&ctx, RunPhase::PerFileLoop, &entry.name);

            let outcome = match self.transfer_file(&ctx, entry, &mut resolver).await {
                Ok(outcome) => outcome,
                Err(e) => return self.abort(ctx, e).await,
            };
            let succeeded = outcome.is_transfer_success();
            ctx.report.record(outcome);

            if succeeded && archive.enabled() {
                let now = self.config.clock.now();
                match archive.archive(ctx.source, &entry.path, &entry.name, now).await {
                    Ok(ArchiveResult::Archived(archive_path)) => ctx.report.record(TransferOutcome::Archived {
                        file: entry.name.clone(),
                        archive_path,
                    }),
                    Ok(ArchiveResult::Disabled) => {}
                    Err(e) => {
                        warn!("归档 {} 失败: {}", entry.path, e);
                        ctx.report.record(TransferOutcome::ArchiveFailed {
                            file: entry.name.clone(),
                            reason: e.to_string(),
                        });
                        if e.is_connection() {
                            return self.abort(ctx, e).await;
                        }
                    }
                }
            }
            self.send_progress(&ctx, RunPhase::PerFileLoop, &entry.name);
        }

        self.send_progress(&ctx, RunPhase::Finalizing, "");
        ctx.source.close().await;
        ctx.dest.close().await;

        self.send_progress(&ctx, RunPhase::Done, "");
        ctx.report.finish()
    }

    /// 连接级失败：记录原因、关闭连接并冻结报告
    async fn abort(&self, mut ctx: RunContext<'_>, e: TransferError) -> TransferReport {
        error!("连接级错误，终止本次运行: {}", e);
        ctx.report.connection_failed(e.to_string());
        self.send_progress(&ctx, RunPhase::ConnectionFailed, "");
        ctx.source.close().await;
        ctx.dest.close().await;
        ctx.report.finish()
    }

    /// 列表失败按重试策略重试，最终失败视为连接级错误
    async fn list_with_retry(&self, source: &dyn ServerConnection) -> Result<Vec<FileEntry>> {
        let retry = &self.config.retry;
        let directory = &self.config.source.directory;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match source.list(directory).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) if attempt > retry.max_retries => {
                    return Err(TransferError::connection(
                        source.name(),
                        format!("列出目录 {} 失败: {}", directory, e),
                    ))
                }
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "列出目录失败，{}ms 后重试 ({}/{}): {}",
                        delay.as_millis(),
                        attempt,
                        retry.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 传输单个文件，单次操作错误在内部重试并折算为 `Failed`，只有连接级错误返回 `Err`
    async fn transfer_file(
        &self,
        ctx: &RunContext<'_>,
        entry: &FileEntry,
        resolver: &mut CollisionResolver,
    ) -> Result<TransferOutcome> {
        let retry = &self.config.retry;
        let target = join_path(&self.config.destination.directory, &entry.name);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt_transfer(ctx, entry, &target, resolver).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) if attempt > retry.max_retries => {
                    error!("文件 {} 传输最终失败 (共尝试 {} 次): {}", entry.name, attempt, e);
                    return Ok(TransferOutcome::Failed {
                        file: entry.name.clone(),
                        reason: e.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "文件 {} 传输失败，{}ms 后重试 ({}/{}): {}",
                        entry.name,
                        delay.as_millis(),
                        attempt,
                        retry.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// 一次完整尝试：冲突处理 → 打开读取 → 写入目标
    async fn attempt_transfer(
        &self,
        ctx: &RunContext<'_>,
        entry: &FileEntry,
        target: &str,
        resolver: &mut CollisionResolver,
    ) -> Result<TransferOutcome> {
        let action = resolver
            .resolve(ctx.dest, target, self.config.clock.now())
            .await?;
        // owned: 目标路径由本次尝试新建，失败时可以删除
        let (path, renamed, owned) = match action {
            CollisionAction::Skip => {
                info!("目标已存在，跳过: {}", entry.name);
                return Ok(TransferOutcome::Skipped {
                    file: entry.name.clone(),
                });
            }
            CollisionAction::Proceed(path) => (path, false, true),
            CollisionAction::Overwrite(path) => (path, false, false),
            CollisionAction::Renamed(path) => (path, true, true),
        };

        let stream = match ctx.source.open_read(&entry.path).await {
            Ok(stream) => stream,
            Err(e) => {
                resolver.release(&path);
                return Err(e);
            }
        };

        debug!("传输: {} -> {} ({} 字节)", entry.path, path, entry.size);
        match ctx.dest.write_stream(&path, stream).await {
            Ok(bytes) => {
                info!("传输完成: {} -> {} ({} 字节)", entry.name, path, bytes);
                Ok(if renamed {
                    TransferOutcome::Renamed {
                        file: entry.name.clone(),
                        target: path,
                        bytes,
                    }
                } else {
                    TransferOutcome::Transferred {
                        file: entry.name.clone(),
                        target: path,
                        bytes,
                    }
                })
            }
            Err(e) => {
                // 清理不完整的目标文件；覆盖模式下目标是已有文件，保留
                if owned {
                    if let Err(del) = ctx.dest.delete(&path).await {
                        warn!("清理不完整文件 {} 失败: {}", path, del);
                    }
                }
                resolver.release(&path);
                Err(e)
            }
        }
    }

    /// 发送进度更新，通道已满时丢弃
    fn send_progress(&self, ctx: &RunContext<'_>, phase: RunPhase, current_file: &str) {
        debug!("阶段: {:?} {}", phase, current_file);
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(TransferProgress {
                trace_id: ctx.trace_id.clone(),
                phase,
                current_file: current_file.to_string(),
                files_found: ctx.files_found,
                files_completed: ctx.report.files_succeeded(),
                files_skipped: ctx.report.files_skipped(),
                files_failed: ctx.report.files_failed(),
                bytes_transferred: ctx.report.bytes_transferred(),
            });
        }
    }
}
