pub mod loaders;
pub mod run_summary;
pub mod selection;
pub mod work_unit;

pub use loaders::load_catalog_targets;
pub use run_summary::{RunSummary, SummaryEntry, UnitStatus};
pub use selection::{RangeSelector, SelectionSet, SelectionWarning};
pub use work_unit::{
    file_name_from_url, identity_from_file_name, is_safe_identity, ArchiveRecord, WorkUnit,
    ASDM_TAR_SUFFIX,
};
