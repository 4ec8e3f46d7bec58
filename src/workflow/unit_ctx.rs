//! 单元处理上下文
//!
//! 封装"我正在处理哪个数据单元、在哪个目录里、走到了哪一步"

use crate::infrastructure::EngineOutput;
use crate::models::WorkUnit;
use crate::services::SevereHit;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

/// 流程阶段，严格按声明顺序推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Extracted,
    ScriptGenerated,
    Calibrated,
    TargetRemoved,
    Imaged,
    SelfCalibrated,
    Exported,
    CleanedUp,
    Verified,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extracted => "extracted",
            Stage::ScriptGenerated => "script_generated",
            Stage::Calibrated => "calibrated",
            Stage::TargetRemoved => "target_removed",
            Stage::Imaged => "imaged",
            Stage::SelfCalibrated => "self_calibrated",
            Stage::Exported => "exported",
            Stage::CleanedUp => "cleaned_up",
            Stage::Verified => "verified",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// 在进入流程前（下载、解包、定位 ASDM）失败
    Preparation { message: String },
    /// 某个阶段出错
    Stage { stage: Stage, message: String },
    /// 流程正常结束，但日志中有致命级诊断
    SevereMarkers { hits: Vec<SevereHit> },
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Preparation { message } => write!(f, "准备阶段失败: {message}"),
            FailureKind::Stage { stage, message } => write!(f, "阶段 {stage} 失败: {message}"),
            FailureKind::SevereMarkers { hits } => {
                write!(f, "日志中发现 {} 处 SEVERE", hits.len())
            }
        }
    }
}

/// 单元最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Success,
    Failed(FailureKind),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Success)
    }
}

/// 单元处理上下文
#[derive(Debug, Clone)]
pub struct UnitCtx {
    pub unit: WorkUnit,

    /// 单元工作目录，由处理该单元的 worker 独占
    pub unit_dir: PathBuf,

    /// 原始 ASDM，相对于工作目录
    pub asdm: PathBuf,

    /// 导入后的可见度数据名
    pub vis: String,
}

impl UnitCtx {
    pub fn new(unit: WorkUnit, unit_dir: PathBuf, asdm: PathBuf, vis: String) -> Self {
        Self {
            unit,
            unit_dir,
            asdm,
            vis,
        }
    }

    pub fn id(&self) -> &str {
        &self.unit.id
    }
}

impl Display for UnitCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[单元 {}]", self.unit.id)
    }
}

/// 单元流程状态
///
/// 只由执行该单元的 worker 持有和修改。
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// 最后完成的阶段
    pub stage: Stage,

    /// 当前的可见度数据名，校准和去目标源后各加一次 `.split`
    pub vis: String,

    /// 每个阶段的引擎输出
    pub outputs: Vec<(Stage, EngineOutput)>,

    pub outcome: Option<UnitOutcome>,

    pub unit_dir: PathBuf,
}

impl PipelineState {
    /// 解包完成后的初始状态
    pub fn extracted(ctx: &UnitCtx) -> Self {
        Self {
            stage: Stage::Extracted,
            vis: ctx.vis.clone(),
            outputs: Vec::new(),
            outcome: None,
            unit_dir: ctx.unit_dir.clone(),
        }
    }

    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }

    /// 记录一次阶段输出
    pub fn push_output(&mut self, stage: Stage, output: EngineOutput) {
        match self.outputs.last_mut() {
            Some((last, acc)) if *last == stage => acc.append(output),
            _ => self.outputs.push((stage, output)),
        }
    }

    /// 某阶段的引擎输出
    pub fn output_of(&self, stage: Stage) -> Option<&EngineOutput> {
        self.outputs
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, out)| out)
    }

    pub fn advance(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn finish(&mut self, outcome: UnitOutcome) {
        self.outcome = Some(outcome);
    }

    pub fn is_success(&self) -> bool {
        self.outcome.as_ref().is_some_and(UnitOutcome::is_success)
    }
}
