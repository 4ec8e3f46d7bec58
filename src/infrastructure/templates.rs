//! CASA 脚本模板
//!
//! 模板在编译期嵌入。占位符语法：`{name}` 替换为参数值，
//! `{{` 和 `}}` 输出字面花括号。

use crate::config::ImagingMode;
use crate::error::TemplateError;
use std::collections::BTreeMap;

/// 模板参数
pub type TemplateParams = BTreeMap<&'static str, String>;

/// 已知模板
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// 导入 ASDM 并生成校准脚本
    MakeScript,
    /// 只保留校准源
    RemoveTarget,
    TcleanMfs,
    TcleanMfsSpw,
    TcleanCube,
    SelfcalMfs,
    SelfcalCube,
    ExportFits,
}

impl Template {
    pub fn for_imaging(mode: ImagingMode) -> Self {
        match mode {
            ImagingMode::Mfs => Template::TcleanMfs,
            ImagingMode::MfsSpw => Template::TcleanMfsSpw,
            ImagingMode::Cube => Template::TcleanCube,
        }
    }

    /// 自校准只有 mfs 和 cube 两种模板
    pub fn for_selfcal(mode: ImagingMode) -> Option<Self> {
        match mode {
            ImagingMode::Mfs => Some(Template::SelfcalMfs),
            ImagingMode::Cube => Some(Template::SelfcalCube),
            ImagingMode::MfsSpw => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Template::MakeScript => "make_script",
            Template::RemoveTarget => "remove_target",
            Template::TcleanMfs => "tclean_mfs",
            Template::TcleanMfsSpw => "tclean_mfs_spw",
            Template::TcleanCube => "tclean_cube",
            Template::SelfcalMfs => "selfcal_mfs",
            Template::SelfcalCube => "selfcal_cube",
            Template::ExportFits => "export_fits",
        }
    }

    /// 渲染后写入工作目录的脚本名
    pub fn script_name(self, suffix: &str) -> String {
        format!("{}{}.py", self.name(), suffix)
    }

    fn source(self) -> &'static str {
        match self {
            Template::MakeScript => include_str!("../../templates/make_script.py"),
            Template::RemoveTarget => include_str!("../../templates/remove_target.py"),
            Template::TcleanMfs => include_str!("../../templates/tclean_mfs.py"),
            Template::TcleanMfsSpw => include_str!("../../templates/tclean_mfs_spw.py"),
            Template::TcleanCube => include_str!("../../templates/tclean_cube.py"),
            Template::SelfcalMfs => include_str!("../../templates/selfcal_mfs.py"),
            Template::SelfcalCube => include_str!("../../templates/selfcal_cube.py"),
            Template::ExportFits => include_str!("../../templates/export_fits.py"),
        }
    }

    pub fn render(self, params: &TemplateParams) -> Result<String, TemplateError> {
        render(self.name(), self.source(), params)
    }
}

/// 按命名占位符替换
pub fn render(
    template_name: &str,
    source: &str,
    params: &TemplateParams,
) -> Result<String, TemplateError> {
    let malformed = |offset| TemplateError::Malformed {
        template: template_name.to_string(),
        offset,
    };

    let mut out = String::with_capacity(source.len());
    let mut chars = source.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' => {
                if chars.next_if(|&(_, c)| c == '{').is_some() {
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, c)) if c.is_alphanumeric() || c == '_' => name.push(c),
                        _ => return Err(malformed(offset)),
                    }
                }
                if name.is_empty() {
                    return Err(malformed(offset));
                }
                let value = params.get(name.as_str()).ok_or_else(|| {
                    TemplateError::MissingParameter {
                        template: template_name.to_string(),
                        name: name.clone(),
                    }
                })?;
                out.push_str(value);
            }
            '}' => {
                if chars.next_if(|&(_, c)| c == '}').is_none() {
                    return Err(malformed(offset));
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }

    Ok(out)
}
