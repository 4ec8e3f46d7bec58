use crate::error::FileError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;

/// 校准源目录中的一项，只关心名称
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    names: Vec<CatalogName>,
}

#[derive(Debug, Deserialize)]
struct CatalogName {
    name: String,
}

/// 读取校准源目录 JSON，返回去重排序后的目标源名称
///
/// 每项取 `names[0].name`，没有名称的项跳过。
pub async fn load_catalog_targets(path: &Path) -> Result<Vec<String>, FileError> {
    if !path.exists() {
        return Err(FileError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| FileError::io(path, e))?;

    let targets = parse_catalog(&content).map_err(|source| FileError::JsonParseFailed {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("从 {} 读取到 {} 个目标源", path.display(), targets.len());
    Ok(targets)
}

pub fn parse_catalog(content: &str) -> Result<Vec<String>, serde_json::Error> {
    let entries: Vec<CatalogEntry> = serde_json::from_str(content)?;
    let names: BTreeSet<String> = entries
        .into_iter()
        .filter_map(|entry| entry.names.into_iter().next())
        .map(|n| n.name.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    Ok(names.into_iter().collect())
}
