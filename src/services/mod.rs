pub mod severity_scanner;
pub mod step_selector;
pub mod success_ledger;
pub mod workspace_cleaner;

pub use severity_scanner::{scan_logs, SevereHit, SEVERITY_MARKER};
pub use step_selector::{CalibrationStepSelector, ScriptVariant, StepSelection};
pub use success_ledger::{LedgerFilter, SuccessLedger};
pub use workspace_cleaner::{CleanupReport, KeepList, WorkspaceCleaner};
