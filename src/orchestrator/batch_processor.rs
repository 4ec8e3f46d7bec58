//! 批量单元处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责一次完整运行的调度和汇总。
//!
//! ## 核心功能
//!
//! 1. **运行准备**：创建工作根目录，清掉上次中断留下的压缩包
//! 2. **生成单元列表**：目标源 × 波段/Cycle 选择 → 归档查询 → 去重
//! 3. **断点续跑**：通过 SuccessLedger 跳过之前成功的单元
//! 4. **并发控制**：下载池和计算池各一个 Semaphore，任务放进 JoinSet
//! 5. **结果收集**：按完成顺序收集，成功的立即写入记录
//! 6. **全局统计**：每个单元一行，外加总数
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个单元的细节，委托给 unit_processor
//! - **日志注入**：每个 worker 任务挂上带自己单元标识的 dispatcher
//! - **外部协作者可替换**：归档、下载、计算引擎都通过 trait 注入

use crate::clients::{AlmaArchiveClient, ArchiveService, DataFetcher, HttpFetcher};
use crate::config::Config;
use crate::infrastructure::{CasaEngine, ComputeEngine};
use crate::models::{
    load_catalog_targets, ArchiveRecord, RangeSelector, RunSummary, SelectionSet, UnitStatus,
    WorkUnit, ASDM_TAR_SUFFIX,
};
use crate::orchestrator::unit_processor::{UnitProcessor, UnitReport};
use crate::services::SuccessLedger;
use crate::utils::LogHandle;
use crate::workflow::{FailureKind, UnitFlow, UnitOutcome};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

/// 归档查询得到的单元
#[derive(Default)]
struct ResolvedUnits {
    units: Vec<WorkUnit>,
    /// (汇总中的名称, 原因)
    rejected: Vec<(String, String)>,
}

/// 应用主结构
pub struct App {
    config: Config,
    archive: Arc<dyn ArchiveService>,
    fetcher: Arc<dyn DataFetcher>,
    engine: Arc<dyn ComputeEngine>,
    log: LogHandle,
}

impl App {
    /// 用真实的归档服务、HTTP 下载和 CASA 初始化应用
    pub fn initialize(config: Config, log: LogHandle) -> Result<Self> {
        config.validate().context("配置检查失败")?;

        let archive = AlmaArchiveClient::new(
            config.archive_url.clone(),
            config.archive_max_retries,
            Duration::from_secs(config.archive_retry_delay_secs),
        );
        let engine = CasaEngine::new(config.casa_path.clone());

        Ok(Self::with_services(
            config,
            log,
            Arc::new(archive),
            Arc::new(HttpFetcher::new()),
            Arc::new(engine),
        ))
    }

    /// 注入外部协作者
    pub fn with_services(
        config: Config,
        log: LogHandle,
        archive: Arc<dyn ArchiveService>,
        fetcher: Arc<dyn DataFetcher>,
        engine: Arc<dyn ComputeEngine>,
    ) -> Self {
        Self {
            config,
            archive,
            fetcher,
            engine,
            log,
        }
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<RunSummary> {
        log_startup(&self.config);

        self.pre_process().await?;

        let resolved = self.resolve_units().await?;

        // resume=false 时即使没有单元也要清空记录
        let ledger = SuccessLedger::open(self.config.ledger_path())
            .await
            .context("无法打开成功记录")?;
        let filtered = ledger
            .filter(resolved.units, self.config.resume)
            .await
            .context("无法读取成功记录")?;

        let mut summary = RunSummary::default();
        for (label, reason) in resolved.rejected {
            summary.push(label, UnitStatus::Failed(reason));
        }
        if filtered.pending.is_empty() && filtered.skipped.is_empty() && summary.total() == 0 {
            warn!("⚠️ 没有找到符合条件的数据，程序结束");
            return Ok(summary);
        }

        for unit in &filtered.skipped {
            summary.push(unit.id.clone(), UnitStatus::PreviouslySuccessful);
        }
        log_units_loaded(filtered.pending.len(), filtered.skipped.len(), &self.config);

        for report in self.process_all_units(filtered.pending, &ledger).await {
            let status = match report.outcome {
                UnitOutcome::Success => UnitStatus::Success,
                UnitOutcome::Failed(kind) => UnitStatus::Failed(kind.to_string()),
            };
            summary.push(report.unit.id, status);
        }

        summary.sort();
        print_final_stats(&summary);
        Ok(summary)
    }

    /// 创建工作根目录，删除上次中断留下的压缩包
    async fn pre_process(&self) -> Result<()> {
        let work_dir = &self.config.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("无法创建工作目录: {}", work_dir.display()))?;

        let mut entries = tokio::fs::read_dir(work_dir)
            .await
            .with_context(|| format!("无法读取工作目录: {}", work_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name.ends_with(ASDM_TAR_SUFFIX) || name.ends_with(".asdm.sdm.part");
            if !stale {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => info!("🗑️ 删除上次残留的 {}", name),
                Err(e) => warn!("⚠️ 无法删除 {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// 目标源：配置中的列表，否则读校准源目录
    async fn resolve_targets(&self) -> Result<Vec<String>> {
        let mut targets: BTreeSet<String> = self
            .config
            .targets
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if targets.is_empty() {
            if let Some(catalog) = &self.config.catalog_json {
                targets.extend(load_catalog_targets(catalog).await?);
            }
        }
        Ok(targets.into_iter().collect())
    }

    /// 查询归档服务，得到去重后的单元列表；任何查询失败都终止运行
    ///
    /// 标识不能安全地用作目录名的记录不进入处理，直接记为失败。
    async fn resolve_units(&self) -> Result<ResolvedUnits> {
        let targets = self.resolve_targets().await?;
        let bands = RangeSelector::parse(&self.config.band);
        let cycles = RangeSelector::parse(&self.config.cycle);
        info!(
            "📋 目标源 {} 个, 波段: {}, Cycle: {}",
            targets.len(),
            bands,
            cycles
        );

        let mut seen = HashSet::new();
        let mut resolved = ResolvedUnits::default();
        for target in &targets {
            let records = self
                .query_target(target, &bands, &cycles)
                .await
                .with_context(|| format!("查询 {} 失败", target))?;

            for record in records {
                let unit = WorkUnit::from_record(&record);
                if !unit.has_safe_id() {
                    warn!(
                        "⚠️ {}: 无法从 {} 得到合法的单元标识 ({:?})，不处理",
                        target, record.url, unit.id
                    );
                    let label = unit.file_name().to_string();
                    if seen.insert(label.clone()) {
                        resolved
                            .rejected
                            .push((label, format!("非法单元标识 {:?}", unit.id)));
                    }
                    continue;
                }
                if !seen.insert(unit.id.clone()) {
                    continue;
                }
                info!("✓ {}: {} ({:.2} GB)", target, unit.id, record.size_gb());
                resolved.units.push(unit);
            }
        }
        Ok(resolved)
    }

    async fn query_target(
        &self,
        target: &str,
        bands: &SelectionSet,
        cycles: &SelectionSet,
    ) -> Result<Vec<ArchiveRecord>> {
        info!("🔍 查询目标源 {}", target);
        let records = self.archive.query(target, bands, cycles).await?;
        if records.is_empty() {
            info!("{} 没有符合条件的数据", target);
        }
        Ok(records)
    }

    /// 并发处理所有单元，按完成顺序收集结果
    async fn process_all_units(
        &self,
        units: Vec<WorkUnit>,
        ledger: &SuccessLedger,
    ) -> Vec<UnitReport> {
        let flow = UnitFlow::new(&self.config, self.engine.clone());
        let processor = Arc::new(UnitProcessor::new(
            self.config.work_dir.clone(),
            self.fetcher.clone(),
            flow,
            self.config.download_parallel,
            self.config.n_parallel,
            self.config.stages.remove_asdm,
        ));

        let mut tasks = JoinSet::new();
        let mut pending_ids = Vec::with_capacity(units.len());
        for unit in units {
            pending_ids.push(unit.id.clone());
            let processor = processor.clone();
            let dispatch = self.log.with_origin(&unit.id).dispatch();
            tasks.spawn(async move { processor.process(unit).await }.with_subscriber(dispatch));
        }

        let total = pending_ids.len();
        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    if report.is_success() {
                        if let Err(e) = ledger.record(&report.unit.id).await {
                            error!("❌ 无法写入成功记录 {}: {}", report.unit.id, e);
                        }
                    }
                    info!(
                        "📊 进度 {}/{}: {} {}",
                        reports.len() + 1,
                        total,
                        report.unit.id,
                        if report.is_success() { "✅" } else { "❌" }
                    );
                    reports.push(report);
                }
                Err(e) => error!("任务执行失败: {}", e),
            }
        }

        // 崩溃的任务没有结果，仍然要出现在汇总里
        let finished: HashSet<String> = reports.iter().map(|r| r.unit.id.clone()).collect();
        for id in pending_ids.into_iter().filter(|id| !finished.contains(id)) {
            reports.push(UnitReport {
                unit: WorkUnit {
                    id: id.clone(),
                    project_id: None,
                    url: String::new(),
                    size_bytes: 0,
                },
                outcome: UnitOutcome::Failed(FailureKind::Preparation {
                    message: "worker 任务异常退出".to_string(),
                }),
            });
        }

        reports
    }
}

// ========== 日志辅助函数 ==========

fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - ALMA QSO 数据处理");
    info!("📂 工作目录: {}", config.work_dir.display());
    info!(
        "📊 计算并发数: {}, 下载并发数: {}",
        config.n_parallel, config.download_parallel
    );
    info!("{}", "=".repeat(60));
}

fn log_units_loaded(pending: usize, skipped: usize, config: &Config) {
    info!("✓ 共 {} 个待处理的数据单元", pending);
    if config.resume {
        info!("之前已成功的单元 {} 个，本次不再处理", skipped);
    }
}

fn print_final_stats(summary: &RunSummary) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    for entry in &summary.entries {
        info!("{}: {}", entry.unit_id, entry.status);
    }
    info!("{}", "─".repeat(60));
    info!("✅ 成功: {}/{}", summary.succeeded(), summary.total());
    info!("❌ 失败: {}", summary.failed());
    info!("⏭️ 之前已成功: {}", summary.skipped());
    info!("{}", "=".repeat(60));
}
