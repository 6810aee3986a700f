pub mod archive_installer;
pub mod download_manager;
pub mod link_resolver;
pub mod transfer_engine;

pub use archive_installer::{ActiveExtractions, ArchiveInstaller};
pub use download_manager::{build_http_client, DownloadManager};
pub use link_resolver::LinkResolver;
pub use transfer_engine::{Segment, TransferEngine, TransferPlan};
