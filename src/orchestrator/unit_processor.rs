//! 单个单元处理器 - 编排层
//!
//! ## 职责
//!
//! 把一个 `WorkUnit` 从下载带到终态：
//!
//! 1. **下载**：占用下载池的一个名额，完成后立即释放
//! 2. **准备**：占用计算池的一个名额，重建单元目录、解包、定位 ASDM
//! 3. **流程**：交给 `UnitFlow` 跑完各阶段
//! 4. **收尾**：按配置删除下载的压缩包
//!
//! 下载或准备失败时不会进入流程，结果直接记为失败，
//! 标识使用从 URL 导出的那个。

use crate::clients::{locate_asdm, vis_name_for, DataFetcher};
use crate::error::FileError;
use crate::models::WorkUnit;
use crate::workflow::{FailureKind, UnitCtx, UnitFlow, UnitOutcome};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// 单元处理结果
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub outcome: UnitOutcome,
}

impl UnitReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// 单元处理器，所有 worker 共享同一个实例
pub struct UnitProcessor {
    work_dir: PathBuf,
    fetcher: Arc<dyn DataFetcher>,
    flow: UnitFlow,
    download_slots: Arc<Semaphore>,
    compute_slots: Arc<Semaphore>,
    remove_asdm: bool,
}

impl UnitProcessor {
    pub fn new(
        work_dir: PathBuf,
        fetcher: Arc<dyn DataFetcher>,
        flow: UnitFlow,
        download_parallel: usize,
        n_parallel: usize,
        remove_asdm: bool,
    ) -> Self {
        Self {
            work_dir,
            fetcher,
            flow,
            download_slots: Arc::new(Semaphore::new(download_parallel)),
            compute_slots: Arc::new(Semaphore::new(n_parallel)),
            remove_asdm,
        }
    }

    /// 处理一个单元，不返回错误：所有失败都体现在结果里
    pub async fn process(&self, unit: WorkUnit) -> UnitReport {
        let archive = match self.download(&unit).await {
            Ok(path) => path,
            Err(e) => {
                error!("❌ [单元 {}] 下载失败: {:#}", unit.id, e);
                return preparation_failed(unit, format!("{e:#}"));
            }
        };

        let outcome = {
            let Ok(_permit) = self.compute_slots.acquire().await else {
                return preparation_failed(unit, "计算池已关闭".to_string());
            };

            match self.prepare(&unit, &archive).await {
                Ok(ctx) => {
                    let state = self.flow.run(&ctx).await;
                    state.outcome.unwrap_or(UnitOutcome::Failed(FailureKind::Stage {
                        stage: state.stage,
                        message: "流程未给出结果".to_string(),
                    }))
                }
                Err(e) => {
                    error!("❌ [单元 {}] 准备失败: {:#}", unit.id, e);
                    UnitOutcome::Failed(FailureKind::Preparation {
                        message: format!("{e:#}"),
                    })
                }
            }
        };

        if self.remove_asdm {
            match tokio::fs::remove_file(&archive).await {
                Ok(()) => info!("🗑️ 已删除 {}", archive.display()),
                Err(e) => warn!("⚠️ 删除 {} 失败: {}", archive.display(), e),
            }
        }

        UnitReport { unit, outcome }
    }

    async fn download(&self, unit: &WorkUnit) -> Result<PathBuf> {
        let _permit = self
            .download_slots
            .acquire()
            .await
            .map_err(|_| anyhow!("下载池已关闭"))?;

        info!(
            "⬇️ [单元 {}] 开始下载 ({:.2} GB)",
            unit.id,
            unit.size_bytes as f64 / 1024f64.powi(3)
        );
        let path = self
            .fetcher
            .download(&unit.url, &self.work_dir)
            .await
            .with_context(|| format!("下载 {}", unit.url))?;
        info!("✓ [单元 {}] 下载完成", unit.id);
        Ok(path)
    }

    /// 重建单元目录，解包，找到 ASDM
    async fn prepare(&self, unit: &WorkUnit, archive: &Path) -> Result<UnitCtx> {
        if !unit.has_safe_id() {
            return Err(anyhow!("非法单元标识 {:?}", unit.id));
        }
        let unit_dir = self.work_dir.join(&unit.id);
        if tokio::fs::metadata(&unit_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&unit_dir)
                .await
                .map_err(|e| FileError::io(&unit_dir, e))?;
        }
        tokio::fs::create_dir_all(&unit_dir)
            .await
            .map_err(|e| FileError::io(&unit_dir, e))?;

        self.fetcher.extract(archive, &unit_dir).await?;

        let project = unit
            .project_id
            .as_deref()
            .with_context(|| format!("无法从 {} 得到项目编号", unit.file_name()))?;
        let asdm = locate_asdm(&unit_dir, project).with_context(|| {
            format!("{} 中没有找到 {}/*/*/*/raw/*", unit_dir.display(), project)
        })?;
        let vis = vis_name_for(&asdm);
        let asdm = asdm
            .strip_prefix(&unit_dir)
            .map(Path::to_path_buf)
            .unwrap_or(asdm);

        Ok(UnitCtx::new(unit.clone(), unit_dir, asdm, vis))
    }
}

fn preparation_failed(unit: WorkUnit, message: String) -> UnitReport {
    UnitReport {
        unit,
        outcome: UnitOutcome::Failed(FailureKind::Preparation { message }),
    }
}
