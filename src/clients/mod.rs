pub mod archive_client;
pub mod download_client;

pub use archive_client::{AlmaArchiveClient, ArchiveService};
pub use download_client::{locate_asdm, vis_name_for, DataFetcher, HttpFetcher};
