pub mod unit_ctx;
pub mod unit_flow;

pub use unit_ctx::{FailureKind, PipelineState, Stage, UnitCtx, UnitOutcome};
pub use unit_flow::{UnitFlow, DIRTY_DIR, SELFCAL_DIR};
