//! 计算引擎 - 基础设施层
//!
//! 唯一直接启动 CASA 进程的地方，只暴露"在某个目录里运行脚本"的能力。
//! 不认识数据单元，也不处理流程。
//!
//! 引擎调用没有超时：卡住的 CASA 会一直占用所在 worker。

use crate::error::{AppResult, EngineError};
use crate::infrastructure::templates::{Template, TemplateParams};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// 一次引擎调用的输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    /// 合并多次调用的输出
    pub fn append(&mut self, other: EngineOutput) {
        self.stdout.push_str(&other.stdout);
        self.stdout.push('\n');
        self.stderr.push_str(&other.stderr);
        self.stderr.push('\n');
    }
}

/// 计算引擎
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// 在 `workdir` 中运行已经存在的脚本，同步等待结束
    ///
    /// 非零退出视为失败，错误中带有 stdout 和 stderr。
    async fn run_file(&self, workdir: &Path, script_name: &str)
        -> Result<EngineOutput, EngineError>;

    /// 渲染模板、写入 `workdir`，再运行
    async fn run_script(
        &self,
        workdir: &Path,
        template: Template,
        params: &TemplateParams,
        suffix: &str,
    ) -> AppResult<EngineOutput> {
        let content = template.render(params)?;
        let script_name = template.script_name(suffix);
        write_script(workdir, &script_name, &content).await?;
        Ok(self.run_file(workdir, &script_name).await?)
    }
}

/// 把脚本写入工作目录
pub async fn write_script(
    workdir: &Path,
    script_name: &str,
    content: &str,
) -> Result<(), EngineError> {
    let path = workdir.join(script_name);
    tokio::fs::write(&path, content)
        .await
        .map_err(|source| EngineError::ScriptWrite { path, source })
}

/// 通过 `casa --nologger --nogui -c` 运行脚本
pub struct CasaEngine {
    casa_path: String,
}

impl CasaEngine {
    pub fn new(casa_path: impl Into<String>) -> Self {
        Self {
            casa_path: casa_path.into(),
        }
    }

    pub fn casa_path(&self) -> &str {
        &self.casa_path
    }
}

#[async_trait]
impl ComputeEngine for CasaEngine {
    async fn run_file(
        &self,
        workdir: &Path,
        script_name: &str,
    ) -> Result<EngineOutput, EngineError> {
        debug!("运行 CASA 脚本: {} (目录: {})", script_name, workdir.display());

        let output = Command::new(&self.casa_path)
            .args(["--nologger", "--nogui", "-c", script_name])
            .current_dir(workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: self.casa_path.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(EngineError::NonZeroExit {
                script: script_name.to_string(),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(EngineOutput { stdout, stderr })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// 用 shell 脚本冒充 casa：打印参数，脚本名含 fail 时退出 3
    fn fake_casa(dir: &Path) -> String {
        let path = dir.join("fake-casa");
        std::fs::write(
            &path,
            "#!/bin/sh\necho \"args: $*\"\necho \"to stderr\" >&2\ncase \"$4\" in *fail*) exit 3;; esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_success_captures_streams() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CasaEngine::new(fake_casa(dir.path()));

        let out = engine.run_file(dir.path(), "ok.py").await.unwrap();
        assert_eq!(out.stdout.trim(), "args: --nologger --nogui -c ok.py");
        assert_eq!(out.stderr.trim(), "to stderr");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_streams() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CasaEngine::new(fake_casa(dir.path()));

        let err = engine.run_file(dir.path(), "fail.py").await.unwrap_err();
        match err {
            EngineError::NonZeroExit {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, Some(3));
                assert!(stdout.contains("fail.py"));
                assert!(stderr.contains("to stderr"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_script_writes_rendered_template() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CasaEngine::new(fake_casa(dir.path()));
        let params: TemplateParams = [("dir", "dirty".to_string())].into_iter().collect();

        engine
            .run_script(dir.path(), Template::ExportFits, &params, "_dirty")
            .await
            .unwrap();

        let script = std::fs::read_to_string(dir.path().join("export_fits_dirty.py")).unwrap();
        assert!(script.contains("dir = \"dirty\""));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CasaEngine::new("/nonexistent/casa");
        let err = engine.run_file(dir.path(), "x.py").await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
