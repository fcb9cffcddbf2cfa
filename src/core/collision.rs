//! 目标端同名文件处理

use crate::connection::ServerConnection;
use crate::error::{Result, TransferError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// 重名时的最大序号
pub const MAX_TIE_BREAK: u32 = 999;

/// 同名冲突策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    Skip,
    Overwrite,
    /// 在扩展名前插入时间戳
    #[default]
    Rename,
}

/// 冲突处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionAction {
    /// 目标不存在，写入原目标路径
    Proceed(String),
    /// 目标已存在且允许覆盖
    Overwrite(String),
    /// 写入新生成的路径
    Renamed(String),
    Skip,
}

/// 生成带时间戳的文件名，`seq > 0` 时追加序号
///
/// `report.csv` → `report_20230102-153000.csv`，`report_20230102-153000_1.csv`
pub fn timestamped_name(path: &str, now: NaiveDateTime, seq: u32) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    };
    let mut suffix = format!("_{}", now.format("%Y%m%d-%H%M%S"));
    if seq > 0 {
        suffix.push_str(&format!("_{}", seq));
    }

    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let (base, ext) = name.split_at(pos);
            format!("{}{}{}{}", dir, base, suffix, ext)
        }
        _ => format!("{}{}{}", dir, name, suffix),
    }
}

/// 找一个目标端不存在且本次运行未分配过的时间戳名称，并登记
pub async fn unique_name(
    conn: &dyn ServerConnection,
    path: &str,
    now: NaiveDateTime,
    reserved: &mut HashSet<String>,
) -> Result<String> {
    for seq in 0..=MAX_TIE_BREAK {
        let candidate = timestamped_name(path, now, seq);
        if reserved.contains(&candidate) || conn.exists(&candidate).await? {
            continue;
        }
        reserved.insert(candidate.clone());
        return Ok(candidate);
    }
    Err(TransferError::remote_io(
        "rename",
        path,
        format!("尝试 {} 次后仍无法生成唯一文件名", MAX_TIE_BREAK),
    ))
}

/// 冲突解析器，记录本次运行已分配的路径
pub struct CollisionResolver {
    policy: CollisionPolicy,
    reserved: HashSet<String>,
}

impl CollisionResolver {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            reserved: HashSet::new(),
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    pub async fn resolve(
        &mut self,
        dest: &dyn ServerConnection,
        target: &str,
        now: NaiveDateTime,
    ) -> Result<CollisionAction> {
        let taken = self.reserved.contains(target) || dest.exists(target).await?;
        if !taken {
            self.reserved.insert(target.to_string());
            return Ok(CollisionAction::Proceed(target.to_string()));
        }

        match self.policy {
            CollisionPolicy::Skip => {
                debug!("目标已存在，跳过: {}", target);
                Ok(CollisionAction::Skip)
            }
            CollisionPolicy::Overwrite => {
                debug!("目标已存在，覆盖: {}", target);
                Ok(CollisionAction::Overwrite(target.to_string()))
            }
            CollisionPolicy::Rename => {
                let renamed = unique_name(dest, target, now, &mut self.reserved).await?;
                debug!("目标已存在，重命名: {} -> {}", target, renamed);
                Ok(CollisionAction::Renamed(renamed))
            }
        }
    }

    /// 本次尝试失败且目标已清理，释放分配的路径
    pub fn release(&mut self, path: &str) {
        self.reserved.remove(path);
    }
}
