//! 数据下载与解包

use crate::error::{ArchiveError, FileError};
use crate::models::file_name_from_url;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// 数据获取
#[async_trait]
pub trait DataFetcher: Send + Sync {
    /// 把 `url` 下载到 `dest_dir`，返回本地文件路径
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError>;

    /// 把压缩包解到 `unit_dir`
    async fn extract(&self, archive: &Path, unit_dir: &Path) -> Result<(), FileError>;
}

/// HTTP 下载 + 系统 tar 解包
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataFetcher for HttpFetcher {
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let download_error = |message: String| ArchiveError::Download {
            url: url.to_string(),
            message,
        };

        let dest = dest_dir.join(file_name_from_url(url));
        // 先写临时文件，完整后再改名，中断时不会留下看似完整的压缩包
        let partial = dest.with_extension("part");

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(e.to_string()))?;

        let mut file = File::create(&partial)
            .await
            .map_err(|e| download_error(format!("无法创建 {}: {}", partial.display(), e)))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_error(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| download_error(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| download_error(e.to_string()))?;

        debug!("下载完成: {} ({} 字节)", dest.display(), written);
        Ok(dest)
    }

    async fn extract(&self, archive: &Path, unit_dir: &Path) -> Result<(), FileError> {
        if !archive.exists() {
            return Err(FileError::NotFound {
                path: archive.to_path_buf(),
            });
        }

        info!("📦 解包 {}", archive.display());
        let output = Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(unit_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FileError::io(archive, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FileError::io(
                archive,
                std::io::Error::other(format!("tar 退出码 {:?}: {}", output.status.code(), stderr.trim())),
            ));
        }
        Ok(())
    }
}

/// 在单元目录中找到原始 ASDM：`<project>/*/*/*/raw/*`
pub fn locate_asdm(unit_dir: &Path, project_id: &str) -> Option<PathBuf> {
    let mut level = vec![unit_dir.join(project_id)];
    for _ in 0..3 {
        level = level.iter().flat_map(|dir| sorted_subdirs(dir)).collect();
    }
    level
        .iter()
        .map(|dir| dir.join("raw"))
        .filter(|raw| raw.is_dir())
        .flat_map(|raw| sorted_entries(&raw))
        .next()
}

/// ASDM 对应的可见度数据名：`X.asdm.sdm` → `X.ms`
pub fn vis_name_for(asdm: &Path) -> String {
    let base = asdm
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match base.strip_suffix(".asdm.sdm") {
        Some(stem) => format!("{stem}.ms"),
        None => format!("{base}.ms"),
    }
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    entries
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    sorted_entries(dir).into_iter().filter(|p| p.is_dir()).collect()
}
