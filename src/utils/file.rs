use std::path::{Path, PathBuf};

/// Owns the directory layout every service writes into. Archives land in
/// `downloads_dir`, installed games under `install_dir`.
#[derive(Clone)]
pub struct FileManager {
    app_data_dir: PathBuf,
    downloads_dir: PathBuf,
    install_dir: PathBuf,
}

impl FileManager {
    pub fn new(app_data_dir: PathBuf, downloads_dir: PathBuf, install_dir: PathBuf) -> Self {
        Self {
            app_data_dir,
            downloads_dir,
            install_dir,
        }
    }

    /// Layout resolved from the environment, the portable marker, or the
    /// platform data directory.
    pub fn from_env() -> Self {
        Self::new(
            super::paths::resolve_data_dir(),
            super::paths::resolve_downloads_dir(),
            super::paths::resolve_games_dir(),
        )
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn archive_path(&self, file_name: &str) -> PathBuf {
        self.downloads_dir.join(sanitize_file_name(file_name))
    }

    /// In-progress download file for one attempt. Attempts get distinct
    /// paths so a superseded job can never write into its successor's
    /// archive.
    pub fn part_path(&self, file_name: &str, attempt: u64) -> PathBuf {
        self.downloads_dir
            .join(format!("{}.part-{}", sanitize_file_name(file_name), attempt))
    }
}

pub fn sanitize_file_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => ch,
        })
        .collect::<String>()
        .trim()
        .trim_end_matches('.')
        .to_string();
    if cleaned.is_empty() {
        "download.bin".to_string()
    } else {
        cleaned
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let value = bytes as f64;
    if value >= TB {
        format!("{:.2} TB", value / TB)
    } else if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.0} MB", value / MB)
    } else if value >= KB {
        format!("{:.0} KB", value / KB)
    } else {
        format!("{} B", bytes)
    }
}
