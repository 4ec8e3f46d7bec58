//! # almaqso
//!
//! 批量下载并处理 ALMA 校准源（QSO）数据的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有外部进程，只暴露能力
//! - `ComputeEngine` - 在工作目录中运行 CASA 脚本
//! - `Template` - 编译期嵌入的脚本模板和命名占位符替换
//!
//! ### ② 外部服务（Clients）
//! - `ArchiveService` - ALMA 归档查询（TAP + datalink）
//! - `DataFetcher` - 下载和解包
//!
//! ### ③ 业务能力层（Services）
//! - `SuccessLedger` - 断点续跑的成功记录
//! - `CalibrationStepSelector` - 决定以 apply-only 方式重放哪些校准步骤
//! - `WorkspaceCleaner` - 清理中间产物
//! - `scan_logs` - 扫描 SEVERE
//!
//! ### ④ 流程层（Workflow）
//! - `UnitCtx` / `PipelineState` - 单元上下文和状态
//! - `UnitFlow` - 单元的阶段状态机
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 一次运行的调度和汇总
//! - `orchestrator/unit_processor` - 单个单元的下载、准备和执行
//!
//! ### 日志
//! - `utils/logging` - 单写者日志汇总，不使用全局 subscriber
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{RangeSelector, RunSummary, SelectionSet, UnitStatus, WorkUnit};
pub use orchestrator::App;
pub use services::{CalibrationStepSelector, SuccessLedger};
pub use utils::{LogAggregator, LogHandle};
pub use workflow::{PipelineState, Stage, UnitFlow, UnitOutcome};
