//! 文件过滤 - 按名称模式、扩展名或修改时间选择待传输文件

use super::time_expr;
use crate::connection::FileEntry;
use crate::error::{Result, TransferError};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// 过滤条件（配置形式）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterCriteria {
    #[default]
    All,
    /// 整名匹配，`*` 匹配任意字符序列
    Pattern { pattern: String },
    /// 扩展名集合，不区分大小写
    Extension { extensions: Vec<String> },
    /// 一个标记表示"不早于"，两个标记表示闭区间
    ModificationTime { times: Vec<String> },
}

#[derive(Debug, Clone)]
enum Matcher {
    All,
    Pattern(Regex),
    Extension(HashSet<String>),
    Window {
        min: NaiveDateTime,
        max: Option<NaiveDateTime>,
    },
}

/// 已编译的过滤器
#[derive(Debug, Clone)]
pub struct FileFilter {
    matcher: Matcher,
}

impl FileFilter {
    /// 编译过滤条件；时间标记以 `now` 为参考时刻求值
    pub fn new(criteria: &FilterCriteria, now: NaiveDateTime) -> Result<Self> {
        let matcher = match criteria {
            FilterCriteria::All => Matcher::All,
            FilterCriteria::Pattern { pattern } => Matcher::Pattern(compile_glob(pattern)?),
            FilterCriteria::Extension { extensions } => {
                let set: HashSet<String> = extensions
                    .iter()
                    .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect();
                if set.is_empty() {
                    return Err(TransferError::InvalidFilterCriteria(
                        "扩展名列表为空".to_string(),
                    ));
                }
                Matcher::Extension(set)
            }
            FilterCriteria::ModificationTime { times } => match times.as_slice() {
                [single] => Matcher::Window {
                    min: time_expr::resolve(single, now)?,
                    max: None,
                },
                [a, b] => {
                    let (a, b) = (time_expr::resolve(a, now)?, time_expr::resolve(b, now)?);
                    Matcher::Window {
                        min: a.min(b),
                        max: Some(a.max(b)),
                    }
                }
                _ => {
                    return Err(TransferError::InvalidFilterCriteria(format!(
                        "修改时间过滤需要 1 或 2 个时间标记，实际 {} 个",
                        times.len()
                    )))
                }
            },
        };
        Ok(Self { matcher })
    }

    /// 判断单个文件是否被选中
    pub fn matches(&self, entry: &FileEntry) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Pattern(re) => re.is_match(&entry.name),
            Matcher::Extension(set) => Path::new(&entry.name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| set.contains(&e.to_lowercase()))
                .unwrap_or(false),
            Matcher::Window { min, max } => {
                entry.modified >= *min && max.map_or(true, |max| entry.modified <= max)
            }
        }
    }

    /// 按原顺序筛选
    pub fn select(&self, entries: Vec<FileEntry>) -> Vec<FileEntry> {
        entries.into_iter().filter(|e| self.matches(e)).collect()
    }
}

impl fmt::Display for FileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::All => write!(f, "全部文件"),
            Matcher::Pattern(re) => write!(f, "名称匹配 {}", re.as_str()),
            Matcher::Extension(set) => {
                let mut exts: Vec<_> = set.iter().map(String::as_str).collect();
                exts.sort_unstable();
                write!(f, "扩展名 [{}]", exts.join(", "))
            }
            Matcher::Window { min, max: None } => write!(f, "修改时间 >= {}", min),
            Matcher::Window { min, max: Some(max) } => {
                write!(f, "修改时间在 [{}, {}] 之间", min, max)
            }
        }
    }
}

/// `*` 转换为任意字符序列，其余字符按字面匹配，整名锚定
fn compile_glob(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(TransferError::InvalidFilterCriteria(
            "名称模式不能为空".to_string(),
        ));
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?s)^{}$", body))
        .map_err(|e| TransferError::InvalidFilterCriteria(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time_expr::ABSOLUTE_FORMAT;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, ABSOLUTE_FORMAT).unwrap()
    }

    fn entry(name: &str, modified: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            path: format!("/in/{}", name),
            size: 1,
            modified: at(modified),
        }
    }

    fn names(filter: &FileFilter, entries: &[FileEntry]) -> Vec<String> {
        filter
            .select(entries.to_vec())
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    fn now() -> NaiveDateTime {
        at("2024-05-06 12:00:00")
    }

    #[test]
    fn test_all_is_identity() {
        let entries = vec![entry("b", "2024-01-01 00:00:00"), entry("a", "2024-01-01 00:00:00")];
        let filter = FileFilter::new(&FilterCriteria::All, now()).unwrap();
        assert_eq!(names(&filter, &entries), vec!["b", "a"]);
    }

    #[test]
    fn test_pattern_is_anchored() {
        let entries = vec![
            entry("data_1.csv", "2024-01-01 00:00:00"),
            entry("data_1.csv.bak", "2024-01-01 00:00:00"),
            entry("old_data_1.csv", "2024-01-01 00:00:00"),
            entry("DATA_2.csv", "2024-01-01 00:00:00"),
            entry("dataXcsv", "2024-01-01 00:00:00"),
        ];
        let filter = FileFilter::new(
            &FilterCriteria::Pattern {
                pattern: "data_*.csv".to_string(),
            },
            now(),
        )
        .unwrap();
        assert_eq!(names(&filter, &entries), vec!["data_1.csv"]);
    }

    #[test]
    fn test_pattern_literals() {
        let filter = FileFilter::new(
            &FilterCriteria::Pattern {
                pattern: "a+b(1)?.txt".to_string(),
            },
            now(),
        )
        .unwrap();
        assert!(filter.matches(&entry("a+b(1)?.txt", "2024-01-01 00:00:00")));
        assert!(!filter.matches(&entry("aab(1)x.txt", "2024-01-01 00:00:00")));
    }

    #[test]
    fn test_extension() {
        let entries = vec![
            entry("a.CSV", "2024-01-01 00:00:00"),
            entry("b.txt", "2024-01-01 00:00:00"),
            entry(".csv", "2024-01-01 00:00:00"),
            entry("noext", "2024-01-01 00:00:00"),
            entry("c.tar.gz", "2024-01-01 00:00:00"),
        ];
        let filter = FileFilter::new(
            &FilterCriteria::Extension {
                extensions: vec![".csv".to_string(), "GZ".to_string(), " ".to_string()],
            },
            now(),
        )
        .unwrap();
        assert_eq!(names(&filter, &entries), vec!["a.CSV", "c.tar.gz"]);
    }

    #[test]
    fn test_window_order_independent() {
        let entries = vec![
            entry("early", "2024-05-01 00:00:00"),
            entry("lower", "2024-05-02 00:00:00"),
            entry("inside", "2024-05-03 10:00:00"),
            entry("upper", "2024-05-04 00:00:00"),
            entry("late", "2024-05-05 00:00:00"),
        ];
        let forward = FilterCriteria::ModificationTime {
            times: vec!["2024-05-02 00:00:00".to_string(), "2024-05-04 00:00:00".to_string()],
        };
        let backward = FilterCriteria::ModificationTime {
            times: vec!["2024-05-04 00:00:00".to_string(), "2024-05-02 00:00:00".to_string()],
        };
        let a = names(&FileFilter::new(&forward, now()).unwrap(), &entries);
        let b = names(&FileFilter::new(&backward, now()).unwrap(), &entries);
        assert_eq!(a, vec!["lower", "inside", "upper"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_bound_relative() {
        let entries = vec![
            entry("old", "2024-05-04 23:59:59"),
            entry("boundary", "2024-05-05 00:00:00"),
            entry("new", "2024-05-06 11:00:00"),
        ];
        let filter = FileFilter::new(
            &FilterCriteria::ModificationTime {
                times: vec!["days_before_1".to_string()],
            },
            now(),
        )
        .unwrap();
        assert_eq!(names(&filter, &entries), vec!["boundary", "new"]);
    }

    #[test]
    fn test_invalid_criteria() {
        let bad = [
            FilterCriteria::Pattern {
                pattern: String::new(),
            },
            FilterCriteria::Extension { extensions: vec![] },
            FilterCriteria::Extension {
                extensions: vec![" ".to_string(), ".".to_string()],
            },
            FilterCriteria::ModificationTime { times: vec![] },
            FilterCriteria::ModificationTime {
                times: vec!["current_day".into(), "current_hour".into(), "current_time".into()],
            },
        ];
        for criteria in bad {
            assert!(matches!(
                FileFilter::new(&criteria, now()),
                Err(TransferError::InvalidFilterCriteria(_))
            ));
        }

        assert!(matches!(
            FileFilter::new(
                &FilterCriteria::ModificationTime {
                    times: vec!["days_before_x".to_string()]
                },
                now()
            ),
            Err(TransferError::InvalidTimeExpression(_))
        ));
    }

    #[test]
    fn test_serde_shape() {
        let criteria: FilterCriteria =
            serde_json::from_str(r#"{"type":"modification_time","times":["current_day"]}"#).unwrap();
        assert_eq!(
            criteria,
            FilterCriteria::ModificationTime {
                times: vec!["current_day".to_string()]
            }
        );
        let all: FilterCriteria = serde_json::from_str(r#"{"type":"all"}"#).unwrap();
        assert_eq!(all, FilterCriteria::All);
    }
}
