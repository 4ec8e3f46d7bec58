//! 范围选择字符串解析
//!
//! 语法与 CASA 的选择字符串一致：以 `,` 或 `;` 分隔的若干项，每项为
//! `N`、`A~B`（闭区间）或 `<N`（即 `[0, N)`）。非法项只产生警告并被跳过。

use std::fmt;
use tracing::warn;

/// 解析后的整数集合，严格递增、无重复
///
/// 内部以合并后的闭区间保存，`<100000` 这类大范围不会展开成巨大数组。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    ranges: Vec<(u32, u32)>,
}

/// 被跳过的非法项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionWarning {
    pub token: String,
    pub reason: &'static str,
}

impl fmt::Display for SelectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "非法选择项 '{}' 已忽略 ({})", self.token, self.reason)
    }
}

/// 范围选择解析器
pub struct RangeSelector;

impl RangeSelector {
    /// 解析选择字符串，非法项以 warn 级别记录
    pub fn parse(spec: &str) -> SelectionSet {
        let (set, warnings) = Self::parse_with_warnings(spec);
        for w in &warnings {
            warn!("⚠️ {}", w);
        }
        set
    }

    /// 解析选择字符串，同时返回被跳过的项
    pub fn parse_with_warnings(spec: &str) -> (SelectionSet, Vec<SelectionWarning>) {
        let mut ranges = Vec::new();
        let mut warnings = Vec::new();

        for item in spec.split([',', ';']) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match parse_item(item) {
                Ok(Some(range)) => ranges.push(range),
                // `<0` 合法但为空
                Ok(None) => {}
                Err(reason) => warnings.push(SelectionWarning {
                    token: item.to_string(),
                    reason,
                }),
            }
        }

        (SelectionSet::from_ranges(ranges), warnings)
    }
}

fn parse_item(item: &str) -> Result<Option<(u32, u32)>, &'static str> {
    if let Some(rest) = item.strip_prefix('<') {
        let upper = parse_number(rest)?;
        return Ok(upper.checked_sub(1).map(|hi| (0, hi)));
    }

    if let Some((start, end)) = item.split_once('~') {
        let start = parse_number(start)?;
        let end = parse_number(end)?;
        if start > end {
            return Err("区间起点大于终点");
        }
        return Ok(Some((start, end)));
    }

    let value = parse_number(item)?;
    Ok(Some((value, value)))
}

fn parse_number(text: &str) -> Result<u32, &'static str> {
    let text = text.trim();
    if text.is_empty() {
        return Err("缺少数字");
    }
    text.parse::<u32>().map_err(|_| "不是非负整数")
}

impl SelectionSet {
    fn from_ranges(mut ranges: Vec<(u32, u32)>) -> Self {
        ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (lo, hi) in ranges {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        Self { ranges: merged }
    }

    /// 空集合在下游表示"不过滤"
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, value: u32) -> bool {
        self.ranges
            .binary_search_by(|&(lo, hi)| {
                if hi < value {
                    std::cmp::Ordering::Less
                } else if lo > value {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// 合并后的闭区间，升序且互不相邻
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// 升序遍历所有值
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// 值的个数
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo) as usize + 1)
            .sum()
    }
}

impl fmt::Display for SelectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(全部)");
        }
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{lo}~{hi}")
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
