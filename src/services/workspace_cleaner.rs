//! 工作目录清理 - 业务能力层
//!
//! 把单元工作目录下的每一项分为"保留"或"删除"。尽力而为：
//! 某一项删除失败只记入报告，继续处理其余项。

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 保留规则
#[derive(Debug, Clone)]
pub struct KeepList {
    /// 按名称保留的目录（图像、可见度数据）
    dirs: Vec<String>,
    /// 按文件名通配符保留的文件
    file_patterns: Vec<Regex>,
}

impl KeepList {
    pub fn new<D, P>(dirs: D, file_patterns: P) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            file_patterns: file_patterns
                .into_iter()
                .filter_map(|p| wildcard_regex(p.as_ref()))
                .collect(),
        }
    }

    /// 脚本和日志总是保留
    pub fn with_default_files<D>(dirs: D) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self::new(dirs, ["*.py", "*.log"])
    }

    pub fn keeps_dir(&self, name: &str) -> bool {
        self.dirs.iter().any(|d| d == name)
    }

    pub fn keeps_file(&self, name: &str) -> bool {
        self.file_patterns.iter().any(|re| re.is_match(name))
    }
}

/// `*` 通配符转正则，其余字符按字面匹配
fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).ok()
}

/// 清理结果
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, io::Error)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 工作目录清理器
pub struct WorkspaceCleaner;

impl WorkspaceCleaner {
    /// 删除 `dir` 下不在保留规则中的所有项
    pub fn clean(dir: &Path, keep: &KeepList) -> CleanupReport {
        let mut report = CleanupReport::default();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                report.failures.push((dir.to_path_buf(), e));
                return report;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.failures.push((dir.to_path_buf(), e));
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            // 不跟随符号链接
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            let keep_it = if is_dir {
                keep.keeps_dir(&name)
            } else {
                keep.keeps_file(&name)
            };
            if keep_it {
                report.kept.push(path);
                continue;
            }

            let result = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => report.removed.push(path),
                Err(e) => report.failures.push((path, e)),
            }
        }

        report
    }
}
