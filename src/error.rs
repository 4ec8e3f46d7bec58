use std::path::PathBuf;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 归档服务错误
    #[error("归档服务错误: {0}")]
    Archive(#[from] ArchiveError),
    /// 计算引擎错误
    #[error("计算引擎错误: {0}")]
    Engine(#[from] EngineError),
    /// 脚本模板错误
    #[error("模板错误: {0}")]
    Template(#[from] TemplateError),
    /// 校准步骤选择错误
    #[error("校准步骤选择错误: {0}")]
    StepSelection(#[from] SelectorError),
    /// 成功记录错误
    #[error("成功记录错误: {0}")]
    Ledger(#[from] LedgerError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// 归档服务错误
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// 可重试的服务错误（网络中断、5xx）
    #[error("服务暂时不可用 ({endpoint}): {message}")]
    Transient { endpoint: String, message: String },
    /// 不可重试的错误
    #[error("请求被拒绝 ({endpoint}): {message}")]
    Permanent { endpoint: String, message: String },
    /// 返回内容无法解析
    #[error("响应解析失败 ({endpoint}): {message}")]
    BadResponse { endpoint: String, message: String },
    /// 下载失败
    #[error("下载失败 ({url}): {message}")]
    Download { url: String, message: String },
}

impl ArchiveError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Transient { .. })
    }

    pub(crate) fn from_reqwest(endpoint: impl Into<String>, err: reqwest::Error) -> Self {
        let endpoint = endpoint.into();
        let message = err.to_string();
        let server_side = err.status().map(|s| s.is_server_error()).unwrap_or(false);
        if err.is_timeout() || err.is_connect() || err.is_request() || server_side {
            ArchiveError::Transient { endpoint, message }
        } else {
            ArchiveError::Permanent { endpoint, message }
        }
    }
}

/// 计算引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 进程无法启动
    #[error("无法启动 {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 进程以非零状态退出，附带完整输出
    #[error("脚本 {script} 退出码 {code:?}\nstdout: {stdout}\nstderr: {stderr}")]
    NonZeroExit {
        script: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// 写入脚本失败
    #[error("无法写入脚本 {path}: {source}")]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 模板渲染错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// 模板引用了未提供的参数
    #[error("模板 {template} 缺少参数 `{name}`")]
    MissingParameter { template: String, name: String },
    /// 花括号不成对
    #[error("模板 {template} 在偏移 {offset} 处格式错误")]
    Malformed { template: String, offset: usize },
}

/// 校准步骤选择错误
#[derive(Debug, Error)]
pub enum SelectorError {
    /// 脚本不存在或无法读取
    #[error("无法读取校准脚本 {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 脚本行数不足
    #[error("校准脚本 {path} 缺少第 {line} 行")]
    MissingLine { path: PathBuf, line: usize },
    /// 该行不是 `# N: 'label'` 形式
    #[error("校准脚本 {path} 第 {line} 行格式无法识别: {content}")]
    MalformedLine {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// 成功记录错误
#[derive(Debug, Error)]
pub enum LedgerError {
    /// 记录文件读写失败
    #[error("记录文件 {path} 读写失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 写入线程已退出
    #[error("记录写入任务已停止")]
    WriterGone,
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件或目录不存在
    #[error("路径不存在: {path}")]
    NotFound { path: PathBuf },
    /// 读写失败
    #[error("文件操作失败 ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置值非法
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: String, reason: String },
}

// ========== 便捷构造函数 ==========

impl FileError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FileError::Io {
            path: path.into(),
            source,
        }
    }
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
