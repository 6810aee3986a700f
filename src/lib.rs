pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use errors::{LauncherError, Result};
pub use models::{DownloadEvent, DownloadRequest, DownloadState, InstallResult};
pub use services::{build_http_client, DownloadManager};
pub use utils::file::FileManager;
