use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{LauncherError, Result};
use crate::models::{DownloadEvent, DownloadRequest, DownloadState, InstallResult};
use crate::services::archive_installer::{ActiveExtractions, ArchiveInstaller};
use crate::services::link_resolver::LinkResolver;
use crate::services::transfer_engine::TransferEngine;
use crate::utils::file::FileManager;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

struct JobHandle {
    token: CancellationToken,
    seq: u64,
}

struct ParkedArchive {
    archive_path: PathBuf,
    expected_executable: Option<String>,
}

pub fn build_http_client() -> Result<Client> {
    let connect_timeout_seconds = env_usize("MINATO_HTTP_CONNECT_TIMEOUT_SECONDS")
        .unwrap_or(30)
        .clamp(1, 300) as u64;

    let mut client_builder = Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_seconds))
        .pool_max_idle_per_host(16)
        .tcp_nodelay(true);

    if let Some(proxy_url) = std::env::var("MINATO_PROXY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        match reqwest::Proxy::all(&proxy_url) {
            Ok(proxy) => {
                client_builder = client_builder.proxy(proxy);
                info!("using proxy: {}", proxy_url);
            }
            Err(err) => warn!("invalid MINATO_PROXY '{}': {}", proxy_url, err),
        }
    }

    client_builder
        .build()
        .map_err(|err| LauncherError::Config(format!("http client: {}", err)))
}

/// Drives the resolve → transfer → extract pipeline for each game and
/// publishes lifecycle events on a broadcast stream. One job per game id;
/// a newer job silently discards the prior one.
#[derive(Clone)]
pub struct DownloadManager {
    resolver: LinkResolver,
    engine: TransferEngine,
    installer: ArchiveInstaller,
    files: FileManager,
    registry: Arc<Mutex<HashMap<String, JobHandle>>>,
    parked: Arc<Mutex<HashMap<String, ParkedArchive>>>,
    active_extractions: ActiveExtractions,
    events: broadcast::Sender<DownloadEvent>,
    next_seq: Arc<AtomicU64>,
}

impl DownloadManager {
    pub fn new(client: Client, files: FileManager) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            resolver: LinkResolver::new(client.clone()),
            engine: TransferEngine::new(client),
            installer: ArchiveInstaller::new(files.install_dir().to_path_buf()),
            files,
            registry: Arc::new(Mutex::new(HashMap::new())),
            parked: Arc::new(Mutex::new(HashMap::new())),
            active_extractions: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn start_download(&self, request: DownloadRequest) {
        let game_id = request.game_id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();

        if let Ok(mut registry) = self.registry.lock() {
            if let Some(previous) = registry.insert(
                game_id.clone(),
                JobHandle {
                    token: token.clone(),
                    seq,
                },
            ) {
                info!(%game_id, "superseding active job");
                previous.token.cancel();
            }
        }
        if let Ok(mut parked) = self.parked.lock() {
            parked.remove(&game_id);
        }

        self.emit(DownloadEvent::new(&game_id, DownloadState::Queued));

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_download(request, token, seq).await;
        });
    }

    pub fn cancel_download(&self, game_id: &str) {
        if let Ok(registry) = self.registry.lock() {
            if let Some(handle) = registry.get(game_id) {
                info!(%game_id, "cancelling active download");
                handle.token.cancel();
                return;
            }
        }

        let parked = self
            .parked
            .lock()
            .ok()
            .and_then(|mut map| map.remove(game_id));
        if let Some(parked) = parked {
            info!(%game_id, "discarding parked archive");
            let _ = fs::remove_file(&parked.archive_path);
            let mut event = DownloadEvent::new(game_id, DownloadState::Cancelled);
            event.finished_at = Some(chrono::Utc::now().timestamp());
            self.emit(event);
        }
    }

    /// Re-registers an already-downloaded archive after a restart, so the
    /// caller can resume or cancel it without re-downloading.
    pub fn park_awaiting_extraction(
        &self,
        game_id: &str,
        file_path: &str,
        expected_executable: Option<&str>,
    ) {
        if let Ok(mut parked) = self.parked.lock() {
            parked.insert(
                game_id.to_string(),
                ParkedArchive {
                    archive_path: PathBuf::from(file_path),
                    expected_executable: expected_executable.map(|v| v.to_string()),
                },
            );
        }
        let mut event = DownloadEvent::new(game_id, DownloadState::AwaitingExtraction);
        event.file_path = Some(file_path.to_string());
        self.emit(event);
    }

    pub async fn resume_extraction(
        &self,
        game_id: &str,
        file_path: &str,
        expected_executable: Option<&str>,
    ) -> Result<InstallResult> {
        let parked_hint = self
            .parked
            .lock()
            .ok()
            .and_then(|mut map| map.remove(game_id))
            .and_then(|parked| parked.expected_executable);
        let hint = expected_executable
            .map(|v| v.to_string())
            .or(parked_hint);

        self.emit(DownloadEvent::new(game_id, DownloadState::Extracting));

        let archive_path = PathBuf::from(file_path);
        match self
            .installer
            .install(&archive_path, hint.as_deref(), game_id, &self.active_extractions)
            .await
        {
            Ok(result) => {
                let _ = fs::remove_file(&archive_path);
                self.emit(ready_event(game_id, &result));
                Ok(result)
            }
            Err(err) => {
                error!(%game_id, error = %err, "resumed extraction failed");
                self.emit(failed_event(game_id, &err));
                Err(err)
            }
        }
    }

    /// Cancels every in-flight job and removes half-written install
    /// directories. Downloaded archives stay on disk for later resume.
    pub fn shutdown(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            for handle in registry.values() {
                handle.token.cancel();
            }
            registry.clear();
        }
        if let Ok(mut active) = self.active_extractions.lock() {
            for (game_id, dir) in active.drain() {
                warn!(%game_id, dir = %dir.display(), "removing interrupted extraction");
                let _ = fs::remove_dir_all(&dir);
            }
        }
    }

    async fn run_download(self, request: DownloadRequest, token: CancellationToken, seq: u64) {
        let game_id = request.game_id.clone();
        let archive_path = self.files.archive_path(&request.file_name);
        let part_path = self.files.part_path(&request.file_name, seq);

        let outcome = self
            .run_pipeline(&request, &part_path, &archive_path, &token)
            .await;
        if outcome.is_err() {
            // The part file belongs to this attempt alone, so removal is
            // safe even when a successor job is already running.
            let _ = fs::remove_file(&part_path);
        }

        // A newer job owns this id now; its discarded predecessor stays
        // silent and must not touch the shared archive path.
        let still_current = self
            .registry
            .lock()
            .map(|mut registry| {
                if registry.get(&game_id).map(|handle| handle.seq) == Some(seq) {
                    registry.remove(&game_id);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !still_current {
            return;
        }

        if outcome.is_err() {
            let _ = fs::remove_file(&archive_path);
        }

        match outcome {
            Ok(result) => {
                info!(%game_id, exe = %result.executable_path.display(), "download ready");
                self.emit(ready_event(&game_id, &result));
            }
            Err(err) if err.is_cancelled() => {
                info!(%game_id, "download cancelled");
                let mut event = DownloadEvent::new(&game_id, DownloadState::Cancelled);
                event.finished_at = Some(chrono::Utc::now().timestamp());
                self.emit(event);
            }
            Err(err) => {
                error!(%game_id, error = %err, "download failed");
                self.emit(failed_event(&game_id, &err));
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &DownloadRequest,
        part_path: &Path,
        archive_path: &Path,
        token: &CancellationToken,
    ) -> Result<InstallResult> {
        let game_id = &request.game_id;
        let direct_url = self.resolver.resolve(&request.url).await?;
        info!(%game_id, url = %direct_url, "link resolved");

        let mut event = DownloadEvent::new(game_id, DownloadState::Downloading);
        event.received = Some(0);
        self.emit(event);

        let events = self.events.clone();
        let progress_id = game_id.clone();
        let mut last_emit = Instant::now();
        self.engine
            .download(
                &direct_url,
                part_path,
                move |received, total| {
                    let complete = total == Some(received);
                    if !complete && last_emit.elapsed() < PROGRESS_INTERVAL {
                        return;
                    }
                    last_emit = Instant::now();
                    let mut event = DownloadEvent::new(&progress_id, DownloadState::Downloading);
                    event.received = Some(received);
                    event.total = total;
                    let _ = events.send(event);
                },
                token,
            )
            .await?;

        if token.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }

        let _ = fs::remove_file(archive_path);
        fs::rename(part_path, archive_path)?;

        self.emit(DownloadEvent::new(game_id, DownloadState::Extracting));
        let result = self
            .installer
            .install(
                archive_path,
                request.expected_executable.as_deref(),
                game_id,
                &self.active_extractions,
            )
            .await?;

        // Cancellation that raced extraction still wins.
        if token.is_cancelled() {
            let _ = fs::remove_dir_all(&result.install_directory);
            return Err(LauncherError::Cancelled);
        }

        let _ = fs::remove_file(archive_path);
        Ok(result)
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }
}

fn ready_event(game_id: &str, result: &InstallResult) -> DownloadEvent {
    let mut event = DownloadEvent::new(game_id, DownloadState::Ready);
    event.install_directory = Some(result.install_directory.display().to_string());
    event.executable_path = Some(result.executable_path.display().to_string());
    event.finished_at = Some(chrono::Utc::now().timestamp());
    event
}

fn failed_event(game_id: &str, err: &LauncherError) -> DownloadEvent {
    let mut event = DownloadEvent::new(game_id, DownloadState::Failed);
    event.message = Some(err.to_string());
    event.finished_at = Some(chrono::Utc::now().timestamp());
    event
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}
