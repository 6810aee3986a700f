use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

pub fn resolve_root_dir() -> PathBuf {
    if let Ok(value) = std::env::var("MINATO_ROOT_DIR") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if let Some(dir) = ensure_dir(&path) {
                return dir;
            }
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(data) = dirs::data_dir() {
        let candidate = data.join("minato-launcher");
        if let Some(found) = ensure_dir(&candidate) {
            return found;
        }
    }

    PathBuf::from(".")
}

pub fn resolve_data_dir() -> PathBuf {
    let root = resolve_root_dir();
    let config = root.join("config");
    if let Some(dir) = ensure_dir(&config) {
        return dir;
    }
    root
}

pub fn resolve_downloads_dir() -> PathBuf {
    let root = resolve_root_dir();
    let candidates = [root.join("downloads"), root.join("cache").join("downloads")];
    for candidate in candidates {
        if let Some(dir) = ensure_dir(&candidate) {
            return dir;
        }
    }
    root.join("downloads")
}

pub fn resolve_games_dir() -> PathBuf {
    let root = resolve_root_dir();
    if is_portable_root(&root) {
        let candidates = [root.join("minatoapps").join("common"), root.join("games")];
        for candidate in candidates {
            if let Some(dir) = ensure_dir(&candidate) {
                return dir;
            }
        }
    }

    let fallback = root.join("games");
    ensure_dir(&fallback).unwrap_or(fallback)
}

pub fn resolve_log_dir() -> PathBuf {
    if let Ok(value) = std::env::var("MINATO_LOG_DIR") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if let Some(dir) = ensure_dir(&path) {
                return dir;
            }
        }
    }

    let root = resolve_root_dir();
    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    PathBuf::from("logs")
}
