use crate::error::{ConfigError, FileError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 成像模式，对应不同的 tclean 模板
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingMode {
    /// 全带宽连续谱
    Mfs,
    /// 逐 spw 连续谱
    MfsSpw,
    /// 谱线立方体
    Cube,
}

impl ImagingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImagingMode::Mfs => "mfs",
            ImagingMode::MfsSpw => "mfs_spw",
            ImagingMode::Cube => "cube",
        }
    }
}

impl fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImagingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mfs" => Ok(ImagingMode::Mfs),
            "mfs_spw" => Ok(ImagingMode::MfsSpw),
            "cube" => Ok(ImagingMode::Cube),
            other => Err(ConfigError::invalid(
                "imaging mode",
                format!("不支持的模式 {other:?}"),
            )),
        }
    }
}

/// 各阶段开关
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    /// 是否成像
    pub tclean: bool,
    /// 是否自校准（要求 tclean）
    pub selfcal: bool,
    /// 是否导出 FITS
    pub export_fits: bool,
    /// 处理结束后删除下载的 ASDM 压缩包
    pub remove_asdm: bool,
    /// 清理中间产物，只保留图像、可见度数据、脚本和日志
    pub remove_intermediate: bool,
    /// 清理时连同 CASA 图像目录一起删除，只留 FITS
    pub remove_casa_images: bool,
}

/// tclean 参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TcleanConfig {
    /// 依次执行的成像模式
    pub modes: Vec<ImagingMode>,
    /// 加权方式，默认 natural
    pub weighting: String,
    /// briggs robust 参数，默认 0.5
    pub robust: f64,
}

impl Default for TcleanConfig {
    fn default() -> Self {
        Self {
            modes: vec![ImagingMode::Mfs],
            weighting: "natural".to_string(),
            robust: 0.5,
        }
    }
}

/// 自校准参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfcalConfig {
    /// 自校准后的成像模式，只支持 mfs 和 cube
    pub specmode: ImagingMode,
    pub weighting: String,
    pub robust: f64,
}

impl Default for SelfcalConfig {
    fn default() -> Self {
        Self {
            specmode: ImagingMode::Cube,
            weighting: "natural".to_string(),
            robust: 0.5,
        }
    }
}

/// 程序配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 目标源名称
    pub targets: Vec<String>,
    /// ALMA 校准源目录 JSON，条目的 `names[0].name` 作为目标源
    pub catalog_json: Option<PathBuf>,
    /// 波段选择字符串，例如 "3,7"
    pub band: String,
    /// Cycle 选择字符串，例如 "4,6~10"
    pub cycle: String,
    /// 工作根目录
    pub work_dir: PathBuf,
    /// CASA 可执行文件
    pub casa_path: String,
    /// 归档服务地址
    pub archive_url: String,
    /// 归档查询最大尝试次数
    pub archive_max_retries: usize,
    /// 归档查询重试间隔（秒）
    pub archive_retry_delay_secs: u64,
    /// 同时处理的数据单元数量
    pub n_parallel: usize,
    /// 同时下载的数量
    pub download_parallel: usize,
    /// 跳过之前成功处理过的数据单元
    pub resume: bool,
    /// 日志级别（RUST_LOG 优先）
    pub log_level: String,
    pub stages: StageToggles,
    pub tclean: TcleanConfig,
    pub selfcal: SelfcalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            catalog_json: None,
            band: String::new(),
            cycle: String::new(),
            work_dir: PathBuf::from("./"),
            casa_path: "casa".to_string(),
            archive_url: "https://almascience.nao.ac.jp".to_string(),
            archive_max_retries: 3,
            archive_retry_delay_secs: 3,
            n_parallel: 1,
            download_parallel: 5,
            resume: false,
            log_level: "info".to_string(),
            stages: StageToggles::default(),
            tclean: TcleanConfig::default(),
            selfcal: SelfcalConfig::default(),
        }
    }
}

impl Config {
    /// 从环境变量读取，未设置的项使用默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// 读取 TOML 配置文件，缺省项使用默认值
    pub fn from_toml_file(path: &Path) -> Result<Self, FileError> {
        let content = std::fs::read_to_string(path).map_err(|e| FileError::io(path, e))?;
        toml::from_str(&content).map_err(|source| FileError::TomlParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 用 `ALMAQSO_*` 环境变量覆盖已有配置
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_string("ALMAQSO_TARGETS") {
            self.targets = split_list(&v);
        }
        if let Some(v) = env_string("ALMAQSO_CATALOG_JSON") {
            self.catalog_json = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("ALMAQSO_BAND") {
            self.band = v;
        }
        if let Some(v) = env_string("ALMAQSO_CYCLE") {
            self.cycle = v;
        }
        if let Some(v) = env_string("ALMAQSO_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("ALMAQSO_CASA_PATH") {
            self.casa_path = v;
        }
        if let Some(v) = env_string("ALMAQSO_ARCHIVE_URL") {
            self.archive_url = v;
        }
        if let Some(v) = env_parse("ALMAQSO_N_PARALLEL", "usize")? {
            self.n_parallel = v;
        }
        if let Some(v) = env_parse("ALMAQSO_DOWNLOAD_PARALLEL", "usize")? {
            self.download_parallel = v;
        }
        if let Some(v) = env_parse("ALMAQSO_RESUME", "bool")? {
            self.resume = v;
        }
        if let Some(v) = env_string("ALMAQSO_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(self)
    }

    /// 检查配置是否可以启动一次运行
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_parallel == 0 {
            return Err(ConfigError::invalid("n_parallel", "必须至少为 1"));
        }
        if self.download_parallel == 0 {
            return Err(ConfigError::invalid("download_parallel", "必须至少为 1"));
        }
        if self.archive_max_retries == 0 {
            return Err(ConfigError::invalid("archive_max_retries", "必须至少为 1"));
        }
        if self.targets.is_empty() && self.catalog_json.is_none() {
            return Err(ConfigError::invalid(
                "targets",
                "需要指定目标源或校准源目录",
            ));
        }
        if self.stages.tclean && self.tclean.modes.is_empty() {
            return Err(ConfigError::invalid("tclean.modes", "成像已启用但模式列表为空"));
        }
        if self.stages.selfcal && !self.stages.tclean {
            return Err(ConfigError::invalid("stages.selfcal", "自校准需要先启用 tclean"));
        }
        if self.stages.selfcal && self.selfcal.specmode == ImagingMode::MfsSpw {
            return Err(ConfigError::invalid(
                "selfcal.specmode",
                "自校准只支持 mfs 或 cube",
            ));
        }
        Ok(())
    }

    /// 成功记录文件位置
    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join(crate::services::success_ledger::LEDGER_FILE_NAME)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, expected_type: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
