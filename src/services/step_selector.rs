//! 校准步骤选择 - 业务能力层
//!
//! 生成的校准脚本开头按行列出各步骤名称（`N: 'label',`）。
//! 固定位置那一行的名称决定脚本是短版本还是长版本，
//! 从而决定以 apply-only 方式重放哪些步骤。

use crate::error::SelectorError;
use std::path::Path;

/// 被检查的行（从 0 开始）
pub const PROBE_LINE_INDEX: usize = 21;

/// 短版本在该行的步骤名称
pub const SHORT_VARIANT_LABEL: &str = "Application of the bandpass and gain cal tables";

/// 脚本变体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVariant {
    /// 步骤 0..=16
    Short,
    /// 步骤 0..=17
    Long,
}

impl ScriptVariant {
    fn last_step(self) -> u32 {
        match self {
            ScriptVariant::Short => 16,
            ScriptVariant::Long => 17,
        }
    }
}

/// 需要重放的步骤
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSelection {
    pub variant: ScriptVariant,
    pub steps: Vec<u32>,
    pub apply_only: bool,
}

impl StepSelection {
    pub fn for_variant(variant: ScriptVariant) -> Self {
        Self {
            variant,
            steps: (0..=variant.last_step()).collect(),
            apply_only: true,
        }
    }

    /// 生成驱动脚本：设定步骤后执行原校准脚本
    pub fn driver_script(&self, calibration_script: &str) -> String {
        let steps: Vec<String> = self.steps.iter().map(u32::to_string).collect();
        let apply_only = if self.apply_only { "True" } else { "False" };
        format!(
            "mysteps = [{}]\napplyonly = {}\nexecfile(\"{}\", globals())\n",
            steps.join(","),
            apply_only,
            calibration_script
        )
    }
}

/// 校准步骤选择器
pub struct CalibrationStepSelector;

impl CalibrationStepSelector {
    /// 读取校准脚本并给出需要重放的步骤
    ///
    /// 脚本缺失或探测行无法识别都是致命错误，不做猜测。
    pub fn select(script_path: &Path) -> Result<StepSelection, SelectorError> {
        let content =
            std::fs::read_to_string(script_path).map_err(|source| SelectorError::Unreadable {
                path: script_path.to_path_buf(),
                source,
            })?;

        let line = content
            .lines()
            .nth(PROBE_LINE_INDEX)
            .ok_or_else(|| SelectorError::MissingLine {
                path: script_path.to_path_buf(),
                line: PROBE_LINE_INDEX + 1,
            })?;

        let label = step_label(line).ok_or_else(|| SelectorError::MalformedLine {
            path: script_path.to_path_buf(),
            line: PROBE_LINE_INDEX + 1,
            content: line.to_string(),
        })?;

        Ok(StepSelection::for_variant(Self::classify(label)))
    }

    /// 两种已知情况之一，靠一次字符串比较决定
    pub fn classify(label: &str) -> ScriptVariant {
        if label == SHORT_VARIANT_LABEL {
            ScriptVariant::Short
        } else {
            ScriptVariant::Long
        }
    }
}

/// `16: 'Application of ...',` 中引号内的部分
fn step_label(line: &str) -> Option<&str> {
    let after_colon = line.split(':').nth(1)?;
    let mut quoted = after_colon.split('\'');
    quoted.next()?;
    let label = quoted.next()?;
    // 只有一个引号时 split 也会给出第二段
    quoted.next()?;
    Some(label)
}
