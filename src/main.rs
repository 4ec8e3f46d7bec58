use almaqso::config::{Config, ImagingMode};
use almaqso::{App, LogAggregator};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::instrument::WithSubscriber;
use tracing::{error, info};

/// 下载并处理 ALMA 校准源数据
#[derive(Parser, Debug)]
#[command(name = "almaqso", version, about)]
struct Cli {
    /// TOML 配置文件，命令行参数优先
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 目标源名称，可重复或用逗号分隔
    #[arg(short, long, value_delimiter = ',')]
    target: Vec<String>,

    /// 校准源目录 JSON
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// 波段，例如 "3,7"
    #[arg(short, long)]
    band: Option<String>,

    /// Cycle，例如 "4,6~10"
    #[arg(long)]
    cycle: Option<String>,

    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// CASA 可执行文件
    #[arg(long)]
    casa: Option<String>,

    /// 同时处理的单元数量
    #[arg(short = 'n', long)]
    n_parallel: Option<usize>,

    /// 跳过之前成功处理过的单元
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    tclean: bool,

    /// 成像模式: mfs, mfs_spw, cube
    #[arg(long, value_delimiter = ',')]
    mode: Vec<ImagingMode>,

    #[arg(long)]
    selfcal: bool,

    #[arg(long)]
    export_fits: bool,

    #[arg(long)]
    remove_asdm: bool,

    #[arg(long)]
    remove_intermediate: bool,

    #[arg(long)]
    remove_casa_images: bool,
}

impl Cli {
    /// 配置文件 → 环境变量 → 命令行，依次覆盖
    fn into_config(self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::from_toml_file(path)?,
            None => Config::default(),
        };
        let mut config = base.with_env_overrides()?;

        if !self.target.is_empty() {
            config.targets = self.target;
        }
        if let Some(catalog) = self.catalog {
            config.catalog_json = Some(catalog);
        }
        if let Some(band) = self.band {
            config.band = band;
        }
        if let Some(cycle) = self.cycle {
            config.cycle = cycle;
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = work_dir;
        }
        if let Some(casa) = self.casa {
            config.casa_path = casa;
        }
        if let Some(n) = self.n_parallel {
            config.n_parallel = n;
        }
        if !self.mode.is_empty() {
            config.tclean.modes = self.mode;
        }
        config.resume |= self.resume;
        config.stages.tclean |= self.tclean;
        config.stages.selfcal |= self.selfcal;
        config.stages.export_fits |= self.export_fits;
        config.stages.remove_asdm |= self.remove_asdm;
        config.stages.remove_intermediate |= self.remove_intermediate;
        config.stages.remove_casa_images |= self.remove_casa_images;

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("无法创建工作目录: {}", config.work_dir.display()))?;
    let aggregator = LogAggregator::start_run(&config.work_dir)
        .context("无法创建日志文件")?
        .with_filter(&config.log_level);
    let log = aggregator.handle("main");
    let log_path = aggregator.path().to_path_buf();

    let app = App::initialize(config, log.clone())?;
    let result = async {
        let summary = app.run().await;
        match &summary {
            Ok(_) => info!("\n日志已保存至: {}", log_path.display()),
            Err(e) => error!("❌ 运行终止: {:#}", e),
        }
        summary
    }
    .with_subscriber(log.dispatch())
    .await;

    aggregator.stop().context("日志写线程异常")?;

    let summary = result?;
    if summary.failed() > 0 {
        std::process::exit(1);
    }
    Ok(())
}
