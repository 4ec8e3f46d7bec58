//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责一次运行的调度和汇总，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量单元处理器
//! - 管理一次运行（准备、查询、过滤、调度、汇总）
//! - 控制下载和计算的并发数量（Semaphore）
//! - 给每个 worker 注入自己的日志来源
//! - 写入成功记录，输出全局统计
//!
//! ### `unit_processor` - 单个单元处理器
//! - 下载、解包、定位 ASDM
//! - 调用 UnitFlow 跑完各阶段
//! - 按配置删除压缩包
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<WorkUnit>)
//!     ↓
//! unit_processor (处理单个 WorkUnit 的下载和准备)
//!     ↓
//! workflow::UnitFlow (各阶段状态机)
//!     ↓
//! services (能力层：步骤选择 / 清理 / 日志扫描 / 成功记录)
//!     ↓
//! infrastructure (基础设施：ComputeEngine、脚本模板)
//! ```

pub mod batch_processor;
pub mod unit_processor;

// 重新导出主要类型
pub use batch_processor::App;
pub use unit_processor::{UnitProcessor, UnitReport};
