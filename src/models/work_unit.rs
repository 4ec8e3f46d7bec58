use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

/// ASDM 压缩包后缀
pub const ASDM_TAR_SUFFIX: &str = ".asdm.sdm.tar";

const UID_MARKER: &str = "_uid___";

/// 归档服务返回的一条匹配记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub url: String,
    pub size_bytes: u64,
}

impl ArchiveRecord {
    /// 以 GB 表示的大小，仅用于日志
    pub fn size_gb(&self) -> f64 {
        (self.size_bytes as f64 / 1024f64.powi(3) * 100.0).round() / 100.0
    }
}

/// 一个待处理的数据单元
///
/// 创建后不可变，一次运行中最多处理一次。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    /// 由文件名导出的标识，例如 `uid___A002_Xc3e2f0_X9c1e`
    pub id: String,
    /// 项目编号，例如 `2017.1.00001.S`
    pub project_id: Option<String>,
    /// 下载地址
    pub url: String,
    pub size_bytes: u64,
}

impl WorkUnit {
    pub fn from_record(record: &ArchiveRecord) -> Self {
        let file_name = file_name_from_url(&record.url);
        let (id, project_id) = identity_from_file_name(file_name);
        Self {
            id,
            project_id,
            url: record.url.clone(),
            size_bytes: record.size_bytes,
        }
    }

    /// 下载后的文件名
    pub fn file_name(&self) -> &str {
        file_name_from_url(&self.url)
    }

    /// 标识会被用作工作根目录下的单元目录名
    pub fn has_safe_id(&self) -> bool {
        is_safe_identity(&self.id)
    }
}

/// 标识必须恰好是一个普通路径分量：非空，不含分隔符，不是 `.` 或 `..`
pub fn is_safe_identity(id: &str) -> bool {
    if id.chars().any(std::path::is_separator) {
        return false;
    }
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// URL 的最后一段（忽略查询串）
pub fn file_name_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// 从 `<project>_uid___<rest>.asdm.sdm.tar` 导出单元标识和项目编号
///
/// 不符合该格式时退回到去掉后缀的文件名，项目编号为空。
pub fn identity_from_file_name(file_name: &str) -> (String, Option<String>) {
    let stem = file_name.strip_suffix(ASDM_TAR_SUFFIX).unwrap_or(file_name);
    match stem.split_once(UID_MARKER) {
        Some((project, rest)) if !rest.is_empty() => {
            let project = (!project.is_empty()).then(|| project.to_string());
            (format!("uid___{rest}"), project)
        }
        _ => (stem.to_string(), None),
    }
}
