use std::fmt;

/// 单元在本次运行中的最终状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Success,
    /// 失败原因
    Failed(String),
    /// 之前的运行已成功，本次跳过
    PreviouslySuccessful,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Success => f.write_str("✅ 成功"),
            UnitStatus::Failed(reason) => write!(f, "❌ 失败 ({reason})"),
            UnitStatus::PreviouslySuccessful => f.write_str("⏭️ 之前已成功"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub unit_id: String,
    pub status: UnitStatus,
}

/// 一次运行的汇总，每个单元一项
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub entries: Vec<SummaryEntry>,
}

impl RunSummary {
    pub fn push(&mut self, unit_id: impl Into<String>, status: UnitStatus) {
        self.entries.push(SummaryEntry {
            unit_id: unit_id.into(),
            status,
        });
    }

    /// 按单元标识排序，便于阅读
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Success))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::PreviouslySuccessful))
    }

    pub fn status_of(&self, unit_id: &str) -> Option<&UnitStatus> {
        self.entries
            .iter()
            .find(|e| e.unit_id == unit_id)
            .map(|e| &e.status)
    }

    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.status)).count()
    }
}
