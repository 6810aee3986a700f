use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use sysinfo::Disks;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{LauncherError, Result};
use crate::utils::file::format_bytes;

const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;
const MIN_SEGMENT_SIZE: u64 = 1024 * 1024;
const MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_SEGMENT_WORKERS: usize = 4;
const MAX_SEGMENT_WORKERS: usize = 16;

/// Inclusive byte range assigned to one ranged request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// What the capability probe learned about a URL. `segments` is only
/// populated when ranged requests are usable.
#[derive(Clone, Debug, Default)]
pub struct TransferPlan {
    pub total_bytes: Option<u64>,
    pub supports_range: bool,
    pub segments: Option<Vec<Segment>>,
}

enum SegmentMsg {
    Bytes(u64),
    Failed(LauncherError),
}

/// Streams a URL to disk, splitting into concurrent ranged requests when
/// the server advertises support and falling back to a single stream
/// otherwise.
#[derive(Clone)]
pub struct TransferEngine {
    client: Client,
    segment_size: u64,
    max_workers: usize,
}

impl TransferEngine {
    pub fn new(client: Client) -> Self {
        let segment_size = env_u64("MINATO_SEGMENT_SIZE_BYTES")
            .unwrap_or(DEFAULT_SEGMENT_SIZE)
            .clamp(MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE);
        let max_workers = env_usize("MINATO_MAX_SEGMENT_WORKERS")
            .unwrap_or(DEFAULT_SEGMENT_WORKERS)
            .clamp(1, MAX_SEGMENT_WORKERS);
        Self::with_limits(client, segment_size, max_workers)
    }

    pub fn with_limits(client: Client, segment_size: u64, max_workers: usize) -> Self {
        Self {
            client,
            segment_size: segment_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// Best-effort HEAD. Any probe failure downgrades to a single-stream
    /// plan instead of failing the download.
    pub async fn probe(&self, url: &str) -> TransferPlan {
        let mut plan = TransferPlan::default();

        let response = match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "probe rejected, using single stream");
                return plan;
            }
            Err(err) => {
                debug!(error = %err, "probe failed, using single stream");
                return plan;
            }
        };

        let headers = response.headers();
        plan.total_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|total| *total > 0);

        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        plan.supports_range = accepts_ranges && plan.total_bytes.is_some();
        if plan.supports_range {
            plan.segments = plan
                .total_bytes
                .map(|total| plan_segments(total, self.segment_size));
        }
        plan
    }

    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        mut on_progress: impl FnMut(u64, Option<u64>) + Send,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }

        let plan = self.probe(url).await;

        if let Some(total) = plan.total_bytes {
            check_disk_space(destination, total)?;
        }

        // The fallback restarts the byte count from zero; the high-water
        // floor keeps reported progress non-decreasing across strategies.
        let mut high_water: u64 = 0;
        let mut report = |received: u64, total: Option<u64>| {
            high_water = high_water.max(received);
            on_progress(high_water, total);
        };

        if let (true, Some(total), Some(segments)) =
            (plan.supports_range, plan.total_bytes, plan.segments.clone())
        {
            match self
                .download_segmented(url, destination, total, segments, &mut report, token)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(error = %err, url, "segmented transfer failed, retrying single stream");
                }
            }
        }

        self.download_single(url, destination, plan.total_bytes, &mut report, token)
            .await
    }

    async fn download_segmented(
        &self,
        url: &str,
        destination: &Path,
        total: u64,
        segments: Vec<Segment>,
        on_progress: &mut (impl FnMut(u64, Option<u64>) + Send),
        token: &CancellationToken,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(destination)
            .await?;
        file.set_len(total).await?;
        drop(file);

        let queue = Arc::new(Mutex::new(VecDeque::from(segments)));
        let abort = token.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<SegmentMsg>();

        let mut workers = Vec::with_capacity(self.max_workers);
        for _ in 0..self.max_workers {
            let client = self.client.clone();
            let url = url.to_string();
            let path = destination.to_path_buf();
            let queue = Arc::clone(&queue);
            let abort = abort.clone();
            let tx = tx.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    if abort.is_cancelled() {
                        break;
                    }
                    let segment = match queue.lock().ok().and_then(|mut q| q.pop_front()) {
                        Some(segment) => segment,
                        None => break,
                    };
                    if let Err(err) =
                        fetch_segment(&client, &url, &path, segment, &tx, &abort).await
                    {
                        abort.cancel();
                        // A worker stopped by the abort token reports
                        // nothing; only the originating error matters.
                        if !err.is_cancelled() {
                            let _ = tx.send(SegmentMsg::Failed(err));
                        }
                        break;
                    }
                }
            }));
        }
        drop(tx);

        // Single consumer of byte deltas keeps the reported count
        // monotonic regardless of segment completion order.
        let mut received: u64 = 0;
        let mut failure: Option<LauncherError> = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                SegmentMsg::Bytes(count) => {
                    received = (received + count).min(total);
                    on_progress(received, Some(total));
                }
                SegmentMsg::Failed(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        for worker in workers {
            let _ = worker.await;
        }

        if token.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if received < total {
            return Err(LauncherError::Transfer(format!(
                "incomplete transfer: {} of {}",
                format_bytes(received),
                format_bytes(total)
            )));
        }
        Ok(())
    }

    async fn download_single(
        &self,
        url: &str,
        destination: &Path,
        known_total: Option<u64>,
        on_progress: &mut (impl FnMut(u64, Option<u64>) + Send),
        token: &CancellationToken,
    ) -> Result<()> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::Transfer(format!(
                "{} returned {}",
                url, status
            )));
        }

        let total = known_total.or(response.content_length()).filter(|t| *t > 0);

        // A prior segmented attempt may have preallocated the file.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(destination)
            .await?;

        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(LauncherError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(chunk) => chunk?,
                None => break,
            };
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            on_progress(received, total);
        }
        file.flush().await?;

        if let Some(total) = total {
            if received != total {
                return Err(LauncherError::Transfer(format!(
                    "incomplete transfer: {} of {}",
                    format_bytes(received),
                    format_bytes(total)
                )));
            }
        }
        Ok(())
    }
}

async fn fetch_segment(
    client: &Client,
    url: &str,
    path: &Path,
    segment: Segment,
    tx: &mpsc::UnboundedSender<SegmentMsg>,
    abort: &CancellationToken,
) -> Result<()> {
    let response = client
        .get(url)
        .header(RANGE, format!("bytes={}-{}", segment.start, segment.end))
        .send()
        .await?;

    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(LauncherError::Transfer(format!(
            "segment {} expected 206, got {}",
            segment.index,
            response.status()
        )));
    }

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(std::io::SeekFrom::Start(segment.start)).await?;

    let mut remaining = segment.len();
    let mut stream = response.bytes_stream();
    while remaining > 0 {
        let chunk = tokio::select! {
            _ = abort.cancelled() => return Err(LauncherError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let chunk = match chunk {
            Some(chunk) => chunk?,
            None => break,
        };
        // Never account past the assigned range even if the server
        // overserves.
        let take = (chunk.len() as u64).min(remaining) as usize;
        file.write_all(&chunk[..take]).await?;
        remaining -= take as u64;
        let _ = tx.send(SegmentMsg::Bytes(take as u64));
    }
    file.flush().await?;

    if remaining > 0 {
        return Err(LauncherError::Transfer(format!(
            "segment {} truncated, {} short",
            segment.index,
            format_bytes(remaining)
        )));
    }
    Ok(())
}

pub fn plan_segments(total: u64, segment_size: u64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while start < total {
        let end = (start + segment_size).min(total) - 1;
        segments.push(Segment { index, start, end });
        start = end + 1;
        index += 1;
    }
    segments
}

fn check_disk_space(destination: &Path, required: u64) -> Result<()> {
    let parent = destination.parent().unwrap_or(destination);
    if let Some(available) = available_disk_space(parent) {
        if available < required {
            return Err(LauncherError::Transfer(format!(
                "not enough disk space: need {}, {} available",
                format_bytes(required),
                format_bytes(available)
            )));
        }
    }
    Ok(())
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }

    best.map(|(_, available)| available)
        .or_else(|| disks.list().first().map(|disk| disk.available_space()))
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("minato-transfer-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    /// Minimal HTTP/1.1 fixture. Serves `payload` and honors Range
    /// requests with 206 responses when `ranges` is set.
    async fn spawn_fixture(payload: Vec<u8>, ranges: bool) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = Arc::new(payload);

        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let payload = Arc::clone(&payload);
                tokio::spawn(async move {
                    let mut raw = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        raw.extend_from_slice(&buf[..n]);
                        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&raw);
                    let is_head = request.starts_with("HEAD ");
                    let range = request
                        .lines()
                        .find(|line| line.to_ascii_lowercase().starts_with("range:"))
                        .and_then(|line| parse_range(line, payload.len() as u64));

                    let response = match range {
                        Some((start, end)) if ranges => {
                            let body = &payload[start as usize..=end as usize];
                            let mut head = format!(
                                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                                body.len(), start, end, payload.len()
                            ).into_bytes();
                            head.extend_from_slice(body);
                            head
                        }
                        _ => {
                            let accept = if ranges { "bytes" } else { "none" };
                            let mut head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: {}\r\nConnection: close\r\n\r\n",
                                payload.len(), accept
                            ).into_bytes();
                            if !is_head {
                                head.extend_from_slice(&payload);
                            }
                            head
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/file.bin", addr), handle)
    }

    /// Range-capable fixture that serves only the first ranged request
    /// with 206 and rejects the rest with 500, forcing the single-stream
    /// fallback mid-transfer. Unranged GETs serve the full payload.
    async fn spawn_failing_range_fixture(payload: Vec<u8>) -> (String, JoinHandle<()>) {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = Arc::new(payload);
        let served_ranges = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let payload = Arc::clone(&payload);
                let served_ranges = Arc::clone(&served_ranges);
                tokio::spawn(async move {
                    let mut raw = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        raw.extend_from_slice(&buf[..n]);
                        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&raw);
                    let is_head = request.starts_with("HEAD ");
                    let range = request
                        .lines()
                        .find(|line| line.to_ascii_lowercase().starts_with("range:"))
                        .and_then(|line| parse_range(line, payload.len() as u64));

                    let response = match range {
                        Some((start, end)) => {
                            if served_ranges.fetch_add(1, Ordering::SeqCst) > 0 {
                                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                            } else {
                                let body = &payload[start as usize..=end as usize];
                                let mut head = format!(
                                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                                    body.len(), start, end, payload.len()
                                ).into_bytes();
                                head.extend_from_slice(body);
                                head
                            }
                        }
                        None => {
                            let mut head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                                payload.len()
                            ).into_bytes();
                            if !is_head {
                                head.extend_from_slice(&payload);
                            }
                            head
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/file.bin", addr), handle)
    }

    fn parse_range(line: &str, total: u64) -> Option<(u64, u64)> {
        let range = line.split_once('=')?.1.trim();
        let (start, end) = range.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if start <= end && end < total {
            Some((start, end))
        } else {
            None
        }
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn segments_cover_payload_without_overlap() {
        let segments = plan_segments(20_000, 8192);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments.last().unwrap().end, 19_999);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        let covered: u64 = segments.iter().map(Segment::len).sum();
        assert_eq!(covered, 20_000);
    }

    #[test]
    fn exact_multiple_produces_equal_segments() {
        let segments = plan_segments(16_384, 8192);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.len() == 8192));
    }

    #[tokio::test]
    async fn probe_reports_range_support() {
        let payload = test_payload(10_000);
        let (url, server) = spawn_fixture(payload, true).await;

        let engine = TransferEngine::with_limits(Client::new(), 4096, 4);
        let plan = engine.probe(&url).await;
        assert_eq!(plan.total_bytes, Some(10_000));
        assert!(plan.supports_range);
        assert_eq!(plan.segments.unwrap().len(), 3);

        server.abort();
    }

    #[tokio::test]
    async fn segmented_download_reassembles_payload() {
        let payload = test_payload(50_000);
        let (url, server) = spawn_fixture(payload.clone(), true).await;
        let destination = temp_file("segmented.bin");

        let engine = TransferEngine::with_limits(Client::new(), 4096, 4);
        let mut updates: Vec<(u64, Option<u64>)> = Vec::new();
        engine
            .download(
                &url,
                &destination,
                |received, total| updates.push((received, total)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        assert!(!updates.is_empty());
        for pair in updates.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        let (last_received, last_total) = *updates.last().unwrap();
        assert_eq!(last_received, 50_000);
        assert_eq!(last_total, Some(50_000));

        server.abort();
    }

    #[tokio::test]
    async fn fallback_after_partial_segments_keeps_progress_monotonic() {
        let payload = test_payload(20_000);
        let (url, server) = spawn_failing_range_fixture(payload.clone()).await;
        let destination = temp_file("fallback.bin");

        let engine = TransferEngine::with_limits(Client::new(), 4096, 4);
        let mut updates: Vec<(u64, Option<u64>)> = Vec::new();
        engine
            .download(
                &url,
                &destination,
                |received, total| updates.push((received, total)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        for pair in updates.windows(2) {
            assert!(
                pair[0].0 <= pair[1].0,
                "progress regressed from {} to {}",
                pair[0].0,
                pair[1].0
            );
        }
        assert_eq!(updates.last().unwrap().0, 20_000);

        server.abort();
    }

    #[tokio::test]
    async fn falls_back_to_single_stream_without_range_support() {
        let payload = test_payload(30_000);
        let (url, server) = spawn_fixture(payload.clone(), false).await;
        let destination = temp_file("single.bin");

        let engine = TransferEngine::with_limits(Client::new(), 4096, 4);
        engine
            .download(&url, &destination, |_, _| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        server.abort();
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_transfer() {
        let payload = test_payload(10_000);
        let (url, server) = spawn_fixture(payload, true).await;
        let destination = temp_file("cancelled.bin");

        let token = CancellationToken::new();
        token.cancel();

        let engine = TransferEngine::with_limits(Client::new(), 4096, 4);
        let err = engine
            .download(&url, &destination, |_, _| {}, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        server.abort();
    }
}
