use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 计算引擎报告致命级诊断时写入日志的标记
pub const SEVERITY_MARKER: &str = "SEVERE";

/// 一处命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SevereHit {
    pub file: PathBuf,
    /// 从 1 开始
    pub line: usize,
}

/// 扫描 `dir` 下所有 `*.log` 文件（不递归），返回含标记的行
///
/// 日志可能含非 UTF-8 字节，按有损方式解码。
pub fn scan_logs(dir: &Path) -> io::Result<Vec<SevereHit>> {
    let mut log_files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    log_files.sort();

    let mut hits = Vec::new();
    for file in log_files {
        let bytes = fs::read(&file)?;
        let content = String::from_utf8_lossy(&bytes);
        for (index, line) in content.lines().enumerate() {
            if line.contains(SEVERITY_MARKER) {
                hits.push(SevereHit {
                    file: file.clone(),
                    line: index + 1,
                });
            }
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("casa-1.log"), "INFO ok\nWARN meh\n").unwrap();
        assert!(scan_logs(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_marker_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("casa-1.log"), "INFO ok\n").unwrap();
        fs::write(
            dir.path().join("casa-2.log"),
            "INFO a\nINFO b\n2024-01-01 SEVERE tclean::::  Error\n",
        )
        .unwrap();
        // 非日志文件不扫描
        fs::write(dir.path().join("script.py"), "# SEVERE\n").unwrap();

        let hits = scan_logs(dir.path()).unwrap();
        assert_eq!(
            hits,
            vec![SevereHit {
                file: dir.path().join("casa-2.log"),
                line: 3,
            }]
        );
    }

    #[test]
    fn test_non_utf8_log() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("casa.log"), b"\xff\xfe SEVERE\n").unwrap();
        assert_eq!(scan_logs(dir.path()).unwrap().len(), 1);
    }
}
