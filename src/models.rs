use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of one tracked download+install job.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Downloading,
    Extracting,
    AwaitingExtraction,
    Ready,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Ready | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadRequest {
    pub game_id: String,
    pub url: String,
    pub file_name: String,
    #[serde(default)]
    pub expected_executable: Option<String>,
}

/// One entry on the process-wide progress stream, filtered by `game_id`
/// on the consumer side. Fields are populated per state: `received`/`total`
/// while downloading, `install_directory`/`executable_path` on `Ready`,
/// `message` on `Failed`, `finished_at` on every terminal state.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadEvent {
    pub game_id: String,
    pub state: DownloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl DownloadEvent {
    pub fn new(game_id: &str, state: DownloadState) -> Self {
        Self {
            game_id: game_id.to_string(),
            state,
            received: None,
            total: None,
            file_path: None,
            install_directory: None,
            executable_path: None,
            message: None,
            finished_at: None,
        }
    }
}

/// Outcome of a successful extraction. `executable_path` always lives
/// under `install_directory`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstallResult {
    pub install_directory: PathBuf,
    pub executable_path: PathBuf,
}
