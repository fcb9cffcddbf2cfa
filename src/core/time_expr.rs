//! 时间表达式 - 将相对/绝对时间标记解析为绝对时刻
//!
//! 支持的形式：
//! - `YYYY-MM-DD HH:MM:SS` 绝对时间
//! - `current_day` / `current_hour` / `current_minute` / `current_time`
//! - `days_before_{n}` / `hours_before_{n}` / `minutes_before_{n}`

use crate::error::{Result, TransferError};
use chrono::{Duration, NaiveDateTime, Timelike};
use std::str::FromStr;

pub const ABSOLUTE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 截断粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Day,
    Hour,
    Minute,
    Second,
}

/// 已解析的时间表达式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpression {
    Absolute(NaiveDateTime),
    CurrentDay,
    CurrentHour,
    CurrentMinute,
    CurrentTime,
    DaysBefore(u32),
    HoursBefore(u32),
    MinutesBefore(u32),
}

impl FromStr for TimeExpression {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        let invalid = || TransferError::InvalidTimeExpression(s.to_string());

        match token {
            "current_day" => return Ok(Self::CurrentDay),
            "current_hour" => return Ok(Self::CurrentHour),
            "current_minute" => return Ok(Self::CurrentMinute),
            "current_time" => return Ok(Self::CurrentTime),
            _ => {}
        }

        if let Some(n) = token.strip_prefix("days_before_") {
            return parse_count(n).map(Self::DaysBefore).ok_or_else(invalid);
        }
        if let Some(n) = token.strip_prefix("hours_before_") {
            return parse_count(n).map(Self::HoursBefore).ok_or_else(invalid);
        }
        if let Some(n) = token.strip_prefix("minutes_before_") {
            return parse_count(n).map(Self::MinutesBefore).ok_or_else(invalid);
        }

        NaiveDateTime::parse_from_str(token, ABSOLUTE_FORMAT)
            .map(Self::Absolute)
            .map_err(|_| invalid())
    }
}

/// 只接受纯数字（不带符号）
fn parse_count(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn truncate(dt: NaiveDateTime, unit: Unit) -> NaiveDateTime {
    let t = dt.time();
    let secs = match unit {
        Unit::Day => t.num_seconds_from_midnight(),
        Unit::Hour => t.minute() * 60 + t.second(),
        Unit::Minute => t.second(),
        Unit::Second => 0,
    };
    dt.with_nanosecond(0).unwrap_or(dt) - Duration::seconds(secs as i64)
}

impl TimeExpression {
    /// 以 `now` 为参考时刻求值
    pub fn resolve(&self, now: NaiveDateTime) -> Result<NaiveDateTime> {
        let shifted = |delta: Duration, unit: Unit| {
            now.checked_sub_signed(delta)
                .map(|dt| truncate(dt, unit))
                .ok_or_else(|| TransferError::InvalidTimeExpression(format!("{:?} 超出时间范围", self)))
        };

        match *self {
            Self::Absolute(dt) => Ok(dt),
            Self::CurrentDay => Ok(truncate(now, Unit::Day)),
            Self::CurrentHour => Ok(truncate(now, Unit::Hour)),
            Self::CurrentMinute => Ok(truncate(now, Unit::Minute)),
            Self::CurrentTime => Ok(truncate(now, Unit::Second)),
            Self::DaysBefore(n) => shifted(Duration::days(n as i64), Unit::Day),
            Self::HoursBefore(n) => shifted(Duration::hours(n as i64), Unit::Hour),
            Self::MinutesBefore(n) => shifted(Duration::minutes(n as i64), Unit::Minute),
        }
    }
}

/// 解析并求值单个时间标记
pub fn resolve(token: &str, now: NaiveDateTime) -> Result<NaiveDateTime> {
    token.parse::<TimeExpression>()?.resolve(now)
}
