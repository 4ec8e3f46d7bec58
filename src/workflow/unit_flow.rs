//! 单元处理流程 - 流程层
//!
//! 核心职责：定义"一个数据单元"的完整处理流程
//!
//! 流程顺序（每一步都以前一步成功为前提）：
//! 1. 导入 ASDM，生成校准脚本
//! 2. 以 apply-only 方式重放校准
//! 3. 去掉目标源，只保留校准源
//! 4. 按模式依次成像（可选）
//! 5. 自校准（可选）
//! 6. 导出 FITS（可选）
//! 7. 清理中间产物（尽力而为，失败只告警）
//! 8. 扫描日志中的 SEVERE
//!
//! 任何阶段出错，后续阶段（包括清理和扫描）都不再执行。

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{Config, ImagingMode, SelfcalConfig, StageToggles, TcleanConfig};
use crate::error::{AppError, AppResult, ConfigError, FileError};
use crate::infrastructure::compute_engine::write_script;
use crate::infrastructure::{ComputeEngine, EngineOutput, Template, TemplateParams};
use crate::services::{
    scan_logs, CalibrationStepSelector, CleanupReport, KeepList, WorkspaceCleaner,
};
use crate::workflow::unit_ctx::{FailureKind, PipelineState, Stage, UnitCtx, UnitOutcome};

/// 成像输出目录
pub const DIRTY_DIR: &str = "dirty";
/// 自校准输出目录
pub const SELFCAL_DIR: &str = "selfcal";

const FITS_SUFFIX: &str = "_fits";

/// 阶段失败：在哪一步、因为什么
struct StageFailure {
    stage: Stage,
    error: AppError,
}

/// 清理实现，在阻塞线程上运行
type Cleaner = fn(&Path, &KeepList) -> CleanupReport;

fn at(stage: Stage) -> impl FnOnce(AppError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// 单元处理流程
///
/// - 不持有任何单元状态，可被多个 worker 共享
/// - 计算工作全部交给 ComputeEngine
pub struct UnitFlow {
    engine: Arc<dyn ComputeEngine>,
    stages: StageToggles,
    tclean: TcleanConfig,
    selfcal: SelfcalConfig,
    cleaner: Cleaner,
}

impl UnitFlow {
    pub fn new(config: &Config, engine: Arc<dyn ComputeEngine>) -> Self {
        Self {
            engine,
            stages: config.stages.clone(),
            tclean: config.tclean.clone(),
            selfcal: config.selfcal.clone(),
            cleaner: WorkspaceCleaner::clean,
        }
    }

    #[cfg(test)]
    fn with_cleaner(mut self, cleaner: Cleaner) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// 从解包完成的状态开始，运行到终态
    pub async fn run(&self, ctx: &UnitCtx) -> PipelineState {
        let mut state = PipelineState::extracted(ctx);
        info!("{} ▶️ 开始处理 ({})", ctx, ctx.vis);

        if let Err(failure) = self.run_stages(ctx, &mut state).await {
            error!(
                "{} ❌ 阶段 {} 失败: {}",
                ctx, failure.stage, failure.error
            );
            state.finish(UnitOutcome::Failed(FailureKind::Stage {
                stage: failure.stage,
                message: failure.error.to_string(),
            }));
            return state;
        }

        self.cleanup(ctx, &mut state).await;

        let outcome = self.verify(ctx, &mut state).await;
        match &outcome {
            UnitOutcome::Success => info!("{} ✅ 处理成功", ctx),
            UnitOutcome::Failed(kind) => error!("{} ❌ {}", ctx, kind),
        }
        state.finish(outcome);
        state
    }

    async fn run_stages(&self, ctx: &UnitCtx, state: &mut PipelineState) -> Result<(), StageFailure> {
        self.generate_script(ctx, state)
            .await
            .map_err(at(Stage::ScriptGenerated))?;
        state.advance(Stage::ScriptGenerated);

        self.calibrate(ctx, state)
            .await
            .map_err(at(Stage::Calibrated))?;
        state.advance(Stage::Calibrated);

        self.remove_target(ctx, state)
            .await
            .map_err(at(Stage::TargetRemoved))?;
        state.advance(Stage::TargetRemoved);

        if self.stages.tclean {
            self.image(ctx, state).await.map_err(at(Stage::Imaged))?;
            state.advance(Stage::Imaged);
        }

        if self.stages.selfcal {
            self.self_calibrate(ctx, state)
                .await
                .map_err(at(Stage::SelfCalibrated))?;
            state.advance(Stage::SelfCalibrated);
        }

        if self.stages.export_fits {
            self.export(ctx, state).await.map_err(at(Stage::Exported))?;
            state.advance(Stage::Exported);
        }

        Ok(())
    }

    // ========== 各阶段 ==========

    async fn generate_script(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        info!("{} 📝 导入 ASDM 并生成校准脚本", ctx);
        let params = TemplateParams::from([
            ("asdm", ctx.asdm.to_string_lossy().into_owned()),
            ("vis", state.vis.clone()),
        ]);
        let output = self
            .engine
            .run_script(&ctx.unit_dir, Template::MakeScript, &params, "")
            .await?;
        record_output(ctx, state, Stage::ScriptGenerated, output);
        Ok(())
    }

    async fn calibrate(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        let script = format!("{}.scriptForCalibration.py", state.vis);
        let selection = CalibrationStepSelector::select(&ctx.unit_dir.join(&script))?;
        info!(
            "{} 🔧 重放校准步骤 {:?} (共 {} 步, apply-only)",
            ctx,
            selection.variant,
            selection.steps.len()
        );

        let driver = format!("{}.scriptForCalibration.part.py", state.vis);
        write_script(&ctx.unit_dir, &driver, &selection.driver_script(&script)).await?;
        let output = self.engine.run_file(&ctx.unit_dir, &driver).await?;
        record_output(ctx, state, Stage::Calibrated, output);

        state.vis = format!("{}.split", state.vis);
        Ok(())
    }

    async fn remove_target(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        info!("{} ✂️ 去除目标源", ctx);
        let params = TemplateParams::from([("vis", state.vis.clone())]);
        let output = self
            .engine
            .run_script(&ctx.unit_dir, Template::RemoveTarget, &params, "")
            .await?;
        record_output(ctx, state, Stage::TargetRemoved, output);

        state.vis = format!("{}.split", state.vis);
        Ok(())
    }

    /// 逐模式成像，任一模式失败即放弃其余模式
    async fn image(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        let savemodel = if self.stages.selfcal {
            "modelcolumn"
        } else {
            "none"
        };

        for mode in &self.tclean.modes {
            info!("{} 🖼️ 成像 (specmode: {})", ctx, mode);
            let params = TemplateParams::from([
                ("vis", state.vis.clone()),
                ("dir", DIRTY_DIR.to_string()),
                ("weighting", self.tclean.weighting.clone()),
                ("robust", self.tclean.robust.to_string()),
                ("savemodel", savemodel.to_string()),
            ]);
            let output = self
                .engine
                .run_script(&ctx.unit_dir, Template::for_imaging(*mode), &params, "")
                .await?;
            record_output(ctx, state, Stage::Imaged, output);
        }
        Ok(())
    }

    async fn self_calibrate(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        let mode: ImagingMode = self.selfcal.specmode;
        let template = Template::for_selfcal(mode).ok_or_else(|| {
            ConfigError::invalid("selfcal.specmode", format!("不支持 {mode}"))
        })?;

        let selfcal_dir = ctx.unit_dir.join(SELFCAL_DIR);
        recreate_dir(&selfcal_dir).await?;

        info!("{} 🔁 自校准 (specmode: {})", ctx, mode);
        let params = TemplateParams::from([
            ("vis", state.vis.clone()),
            ("dir", SELFCAL_DIR.to_string()),
            ("weighting", self.selfcal.weighting.clone()),
            ("robust", self.selfcal.robust.to_string()),
        ]);
        let output = self
            .engine
            .run_script(&ctx.unit_dir, template, &params, "")
            .await?;
        record_output(ctx, state, Stage::SelfCalibrated, output);
        Ok(())
    }

    async fn export(&self, ctx: &UnitCtx, state: &mut PipelineState) -> AppResult<()> {
        for dir in [DIRTY_DIR, SELFCAL_DIR] {
            if !ctx.unit_dir.join(dir).is_dir() {
                debug!("{} 没有 {} 目录，跳过导出", ctx, dir);
                continue;
            }
            info!("{} 💾 导出 FITS: {}", ctx, dir);
            let params = TemplateParams::from([("dir", dir.to_string())]);
            let output = self
                .engine
                .run_script(&ctx.unit_dir, Template::ExportFits, &params, &format!("_{dir}"))
                .await?;
            record_output(ctx, state, Stage::Exported, output);
        }
        Ok(())
    }

    /// 清理失败只告警，不改变结果
    async fn cleanup(&self, ctx: &UnitCtx, state: &mut PipelineState) {
        state.advance(Stage::CleanedUp);
        if !self.stages.remove_intermediate {
            return;
        }

        let keep = self.keep_list(&state.vis);
        let dir = ctx.unit_dir.clone();
        let cleaner = self.cleaner;
        match tokio::task::spawn_blocking(move || cleaner(&dir, &keep)).await {
            Ok(report) => {
                for (path, e) in &report.failures {
                    warn!("{} ⚠️ 清理 {} 失败: {}", ctx, path.display(), e);
                }
                info!(
                    "{} 🧹 清理完成: 删除 {} 项, 保留 {} 项",
                    ctx,
                    report.removed.len(),
                    report.kept.len()
                );
            }
            Err(e) => warn!("{} ⚠️ 清理任务异常: {}", ctx, e),
        }
    }

    fn keep_list(&self, vis: &str) -> KeepList {
        let mut dirs = Vec::new();
        if !self.stages.remove_casa_images {
            dirs.push(DIRTY_DIR.to_string());
            dirs.push(SELFCAL_DIR.to_string());
        }
        dirs.push(format!("{DIRTY_DIR}{FITS_SUFFIX}"));
        dirs.push(format!("{SELFCAL_DIR}{FITS_SUFFIX}"));
        dirs.push(vis.to_string());
        KeepList::with_default_files(dirs)
    }

    async fn verify(&self, ctx: &UnitCtx, state: &mut PipelineState) -> UnitOutcome {
        state.advance(Stage::Verified);

        let dir = ctx.unit_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_logs(&dir)).await;
        let hits = match scanned {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                return UnitOutcome::Failed(FailureKind::Stage {
                    stage: Stage::Verified,
                    message: format!("无法扫描日志: {e}"),
                })
            }
            Err(e) => {
                return UnitOutcome::Failed(FailureKind::Stage {
                    stage: Stage::Verified,
                    message: e.to_string(),
                })
            }
        };

        if hits.is_empty() {
            return UnitOutcome::Success;
        }
        for hit in &hits {
            warn!("{} ⚠️ SEVERE: {}:{}", ctx, hit.file.display(), hit.line);
        }
        UnitOutcome::Failed(FailureKind::SevereMarkers { hits })
    }
}

/// 记下引擎输出：stdout 为 debug，stderr 非空时告警
fn record_output(ctx: &UnitCtx, state: &mut PipelineState, stage: Stage, output: EngineOutput) {
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        debug!("{} [{}] STDOUT:\n{}", ctx, stage, stdout);
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        warn!("{} ⚠️ [{}] STDERR:\n{}", ctx, stage, stderr);
    }
    state.push_output(stage, output);
}

async fn recreate_dir(dir: &Path) -> Result<(), FileError> {
    if tokio::fs::metadata(dir).await.is_ok() {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| FileError::io(dir, e))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FileError::io(dir, e))
}
