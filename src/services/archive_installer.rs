use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use zip::ZipArchive;

use crate::errors::{LauncherError, Result};
use crate::models::InstallResult;
use crate::utils::file::sanitize_file_name;

/// Install directories currently being written, keyed by game id. Shared
/// with the orchestrator so a forced shutdown can delete half-written
/// directories.
pub type ActiveExtractions = Arc<Mutex<HashMap<String, PathBuf>>>;

const EXECUTABLE_EXTENSIONS: &[&str] = &["exe"];
const MAX_DIR_PROBES: u32 = 1000;

/// Unpacks a downloaded archive into a fresh directory under
/// `install_root` and locates the game executable inside it.
#[derive(Clone)]
pub struct ArchiveInstaller {
    install_root: PathBuf,
}

impl ArchiveInstaller {
    pub fn new(install_root: PathBuf) -> Self {
        Self { install_root }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub async fn install(
        &self,
        archive_path: &Path,
        expected_executable: Option<&str>,
        game_id: &str,
        active: &ActiveExtractions,
    ) -> Result<InstallResult> {
        fs::create_dir_all(&self.install_root)?;

        let stem = archive_path
            .file_stem()
            .map(|value| sanitize_file_name(&value.to_string_lossy()))
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                LauncherError::Extraction(format!("unusable archive name: {:?}", archive_path))
            })?;

        let install_dir = claim_install_dir(&self.install_root, &stem)?;
        if let Ok(mut map) = active.lock() {
            map.insert(game_id.to_string(), install_dir.clone());
        }

        let archive = archive_path.to_path_buf();
        let target = install_dir.clone();
        let hint = expected_executable.map(|value| value.to_string());
        let outcome = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            extract_zip_archive(&archive, &target)?;
            locate_executable(&target, hint.as_deref()).ok_or_else(|| {
                LauncherError::NoExecutableFound(target.display().to_string())
            })
        })
        .await
        .unwrap_or_else(|err| {
            Err(LauncherError::Extraction(format!(
                "extraction task failed: {}",
                err
            )))
        });

        if let Ok(mut map) = active.lock() {
            map.remove(game_id);
        }

        match outcome {
            Ok(executable_path) => {
                info!(game_id, dir = %install_dir.display(), "archive installed");
                Ok(InstallResult {
                    install_directory: install_dir,
                    executable_path,
                })
            }
            Err(err) => {
                warn!(game_id, error = %err, "install failed, removing directory");
                let _ = fs::remove_dir_all(&install_dir);
                Err(err)
            }
        }
    }
}

/// Atomically reserves `stem`, then `stem-1`, `stem-2` and so on until a
/// directory can be created.
fn claim_install_dir(root: &Path, stem: &str) -> Result<PathBuf> {
    for probe in 0..MAX_DIR_PROBES {
        let name = if probe == 0 {
            stem.to_string()
        } else {
            format!("{}-{}", stem, probe)
        };
        let candidate = root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(LauncherError::Extraction(format!(
        "could not allocate install directory for '{}'",
        stem
    )))
}

fn is_safe_relative_path(path: &Path) -> bool {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

fn extract_zip_archive(archive_path: &Path, install_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| LauncherError::Extraction(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| LauncherError::Extraction(err.to_string()))?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            warn!(entry = %name, "skipping unsafe archive entry");
            continue;
        }
        let out_path = install_dir.join(entry_path);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

/// Depth-first file listing in directory order, so the hint search and
/// the extension fallback are deterministic for a given tree.
fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        children.sort();
        for child in children {
            if child.is_dir() {
                stack.push(child);
            } else {
                files.push(child);
            }
        }
    }
    files
}

fn normalize_rel(value: &str) -> String {
    value.replace('\\', "/").trim_matches('/').to_ascii_lowercase()
}

fn locate_executable(root: &Path, hint: Option<&str>) -> Option<PathBuf> {
    let files = list_files(root);

    if let Some(hint) = hint {
        let needle = normalize_rel(hint);
        if !needle.is_empty() {
            // Full relative path first, then bare file name.
            for file in &files {
                if let Ok(rel) = file.strip_prefix(root) {
                    if normalize_rel(&rel.to_string_lossy()) == needle {
                        return Some(file.clone());
                    }
                }
            }
            let base = needle.rsplit('/').next().unwrap_or(&needle);
            for file in &files {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_ascii_lowercase());
                if name.as_deref() == Some(base) {
                    return Some(file.clone());
                }
            }
        }
    }

    files.into_iter().find(|file| {
        file.extension()
            .map(|ext| {
                EXECUTABLE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false)
    })
}
