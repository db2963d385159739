//! Download - splits a URL into parts, drives them concurrently and merges the results
//!
//! Parts are allocated once, on the first start, from a HEAD probe. Later
//! starts resume the same parts from their own offsets. Pause, pend and
//! cancel interrupt every running part and return only after each one has
//! acknowledged.

use crate::engine::part::{Part, PartReport, TransferContext};
use crate::engine::rate_limiter::BandwidthLimiter;
use crate::engine::EngineContext;
use crate::error::{QgetError, Result};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use qget_types::{CoreEvent, DownloadSnapshot, Status};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct DownloadState {
    status: Status,
    total_size: u64,
    downloaded: u64,
    /// Bytes per second, refreshed by the progress monitor
    rate: f64,
    error: Option<String>,
    initialized: bool,
}

/// One logical transfer
pub struct Download {
    id: u64,
    url: String,
    /// Name of the owning queue
    queue: String,
    destination: PathBuf,
    output_name: String,
    engine: EngineContext,
    state: Mutex<DownloadState>,
    parts: RwLock<Vec<Arc<Part>>>,
    init_lock: tokio::sync::Mutex<()>,
    running: tokio::sync::Mutex<()>,
}

impl Download {
    pub fn new(
        id: u64,
        url: String,
        queue: String,
        destination: PathBuf,
        output_name: String,
        engine: EngineContext,
    ) -> Self {
        Self {
            id,
            url,
            queue,
            destination,
            output_name,
            engine,
            state: Mutex::new(DownloadState {
                status: Status::Pending,
                total_size: 0,
                downloaded: 0,
                rate: 0.0,
                error: None,
                initialized: false,
            }),
            parts: RwLock::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild a download from a persisted snapshot.
    ///
    /// Parts are not restored: an interrupted transfer starts over, and a
    /// download that was running comes back as pending.
    pub fn restore(snapshot: &DownloadSnapshot, engine: EngineContext) -> Self {
        let download = Self::new(
            snapshot.id,
            snapshot.url.clone(),
            snapshot.queue.clone(),
            snapshot.destination.clone(),
            snapshot.output_name.clone(),
            engine,
        );

        {
            let mut state = download.state.lock();
            state.status = match snapshot.status {
                Status::InProgress => Status::Pending,
                other => other,
            };
            state.error = snapshot.error.clone();
            if snapshot.status == Status::Completed {
                state.total_size = snapshot.total_size;
                state.downloaded = snapshot.total_size;
            }
        }

        download
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn output_path(&self) -> PathBuf {
        self.destination.join(&self.output_name)
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    pub fn parts(&self) -> Vec<Arc<Part>> {
        self.parts.read().clone()
    }

    /// Sum of bytes downloaded by every part
    pub fn downloaded(&self) -> u64 {
        let parts = self.parts.read();
        if parts.is_empty() {
            return self.state.lock().downloaded;
        }
        parts.iter().map(|p| p.downloaded()).sum()
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let parts: Vec<_> = self.parts.read().iter().map(|p| p.snapshot()).collect();
        let state = self.state.lock();
        let downloaded = if parts.is_empty() {
            state.downloaded
        } else {
            parts.iter().map(|p| p.downloaded).sum()
        };

        DownloadSnapshot {
            id: self.id,
            url: self.url.clone(),
            queue: self.queue.clone(),
            destination: self.destination.clone(),
            output_name: self.output_name.clone(),
            total_size: state.total_size,
            downloaded,
            progress: percent(downloaded, state.total_size),
            rate: state.rate,
            status: state.status,
            error: state.error.clone(),
            parts,
        }
    }

    /// Move to `next` if the transition table allows it
    fn transition(&self, next: Status) -> bool {
        let error = {
            let mut state = self.state.lock();
            if state.status == next {
                return true;
            }
            if !state.status.can_transition(next) {
                debug!(
                    "Download {}: ignoring transition {} -> {}",
                    self.id, state.status, next
                );
                return false;
            }
            state.status = next;
            if next != Status::Failed {
                state.error = None;
            }
            if next != Status::InProgress {
                state.rate = 0.0;
            }
            state.error.clone()
        };

        self.engine.emit(CoreEvent::DownloadStatusChanged {
            id: self.id,
            status: next,
            error,
        });
        true
    }

    fn fail_with(&self, e: &QgetError) {
        self.state.lock().error = Some(e.to_string());
        self.transition(Status::Failed);
    }

    /// Take a pending download for the queue `queue`.
    ///
    /// Returns false when the download moved elsewhere or is no longer pending.
    pub fn claim(&self, queue: &str) -> bool {
        if self.queue != queue || self.status() != Status::Pending {
            return false;
        }
        self.transition(Status::InProgress)
    }

    /// Make a paused, failed or cancelled download eligible for dispatch again
    pub fn reset_to_pending(&self) -> Result<()> {
        let from = self.status();
        if from == Status::Pending {
            return Ok(());
        }
        if from == Status::InProgress || !self.transition(Status::Pending) {
            return Err(QgetError::InvalidTransition {
                from,
                to: Status::Pending,
            });
        }
        Ok(())
    }

    /// Run the download to completion, failure or interruption.
    ///
    /// Starts are serialized: a second call waits for the first to return.
    /// Interruptions come back as `QgetError::Interrupted`; the interrupting
    /// call settles the final status.
    pub async fn start(self: &Arc<Self>, limiter: BandwidthLimiter) -> Result<()> {
        let _running = self.running.lock().await;

        let from = self.status();
        // Paused or cancelled while waiting for a previous start to return
        if matches!(from, Status::Paused | Status::Cancelled) {
            return Err(QgetError::Interrupted(from));
        }
        if !self.transition(Status::InProgress) {
            return Err(QgetError::InvalidTransition {
                from,
                to: Status::InProgress,
            });
        }

        info!("Starting download {}: {}", self.id, self.url);

        if let Err(e) = self.ensure_initialized().await {
            error!("Download {} could not be initialized: {}", self.id, e);
            self.fail_with(&e);
            return Err(e);
        }

        // Read before the status check: an interrupt flips the download
        // status first, so one that misses the check is seen by the parts
        let parts = self.parts();
        let generations: Vec<u64> = parts.iter().map(|p| p.generation()).collect();

        // Pause or cancel may have landed during the probe
        let status = self.status();
        if status != Status::InProgress {
            return Err(QgetError::Interrupted(status));
        }

        self.spawn_progress_monitor();
        let result = self.run_parts(&parts, &generations, limiter).await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_interruption() => {
                info!("Download {} interrupted: {}", self.id, e);
                return Err(e);
            }
            Err(e) => {
                error!("Download {} failed: {}", self.id, e);
                self.fail_with(&e);
                return Err(e);
            }
        }

        let status = self.status();
        if status != Status::InProgress {
            return Err(QgetError::Interrupted(status));
        }

        if let Err(e) = self.merge(&parts).await {
            error!("Download {} could not be merged: {}", self.id, e);
            self.fail_with(&e);
            return Err(e);
        }

        {
            let mut state = self.state.lock();
            state.downloaded = state.total_size;
        }
        self.transition(Status::Completed);
        self.engine.emit(CoreEvent::DownloadProgress {
            id: self.id,
            downloaded: self.total_size(),
            total: self.total_size(),
            rate: 0.0,
            progress: 100.0,
        });
        info!(
            "Download {} completed: {}",
            self.id,
            self.output_path().display()
        );
        Ok(())
    }

    /// Spawn one task per part and wait for all of them to report.
    ///
    /// The first failure interrupts the remaining parts and is returned
    /// without waiting for them to finish.
    async fn run_parts(
        &self,
        parts: &[Arc<Part>],
        generations: &[u64],
        limiter: BandwidthLimiter,
    ) -> Result<()> {
        let ctx = TransferContext {
            client: self.engine.client.clone(),
            url: self.url.clone(),
            limiter,
            chunk_size: self.engine.settings.chunk_size,
        };

        let (tx, mut rx) = mpsc::channel::<PartReport>(parts.len().max(1));
        for (part, generation) in parts.iter().zip(generations) {
            tokio::spawn(Arc::clone(part).start(*generation, ctx.clone(), tx.clone()));
        }
        drop(tx);

        let mut remaining = parts.len();
        while remaining > 0 {
            let Some((index, result)) = rx.recv().await else {
                break;
            };
            remaining -= 1;

            match result {
                Ok(()) => debug!("Download {}: part {} done", self.id, index),
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    warn!("Download {}: part {} failed: {}", self.id, index, e);
                    join_all(
                        parts
                            .iter()
                            .filter(|p| p.index() != index && p.status() == Status::InProgress)
                            .map(|p| p.fail()),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// HEAD the URL and allocate parts, once per download life
    async fn ensure_initialized(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.state.lock().initialized {
            return Ok(());
        }

        let response = self.engine.client.head(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(QgetError::ServerError {
                status: status.as_u16(),
                message: format!("HEAD {} failed", self.url),
            });
        }

        // reqwest reports an empty body for HEAD, so read the header itself
        let total_size: u64 = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        if total_size == 0 {
            return Err(QgetError::EmptyContent(self.url.clone()));
        }

        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim().is_empty() && !v.trim().eq_ignore_ascii_case("none"))
            .unwrap_or(false);

        let part_count = if accepts_ranges {
            self.engine.settings.part_count.max(1)
        } else {
            1
        };

        tokio::fs::create_dir_all(&self.destination).await?;

        let parts: Vec<Arc<Part>> = partition(total_size, part_count)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                Arc::new(Part::new(index, start, end, self.part_path(start, end)))
            })
            .collect();

        // Leftovers from an earlier life would be appended to
        for part in &parts {
            part.delete_file().await?;
        }

        info!(
            "Download {}: {} bytes in {} part(s){}",
            self.id,
            total_size,
            parts.len(),
            if accepts_ranges { "" } else { " (no range support)" }
        );

        *self.parts.write() = parts;
        let mut state = self.state.lock();
        state.total_size = total_size;
        state.downloaded = 0;
        state.initialized = true;
        Ok(())
    }

    fn part_path(&self, start: u64, end: u64) -> PathBuf {
        self.destination
            .join(format!("{}{}-{}.part", self.output_name, start, end))
    }

    /// Concatenate part files in index order into the output file, then delete them
    async fn merge(&self, parts: &[Arc<Part>]) -> Result<()> {
        let final_path = self.output_path();
        info!("Merging {} part(s) into {:?}", parts.len(), final_path);

        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&final_path)
            .await?;

        for part in parts {
            let mut input = File::open(part.path()).await?;
            let copied = tokio::io::copy(&mut input, &mut output).await?;
            if copied != part.len() {
                return Err(QgetError::Unknown(format!(
                    "Part {} holds {} bytes, expected {}",
                    part.index(),
                    copied,
                    part.len()
                )));
            }
        }

        output.flush().await?;
        output.sync_all().await?;

        for part in parts {
            part.delete_file().await?;
        }
        Ok(())
    }

    /// Refresh aggregate bytes, rate and percentage at a sub-second cadence.
    ///
    /// Stops once the download has been out of `InProgress` for two ticks.
    fn spawn_progress_monitor(self: &Arc<Self>) {
        let download = Arc::clone(self);
        let period = Duration::from_millis(self.engine.settings.progress_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            let mut last_bytes = download.downloaded();
            let mut last_time = Instant::now();
            let mut idle_ticks = 0;

            loop {
                ticker.tick().await;

                let status = download.status();
                let bytes = download.downloaded();
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();

                let rate = if status == Status::Paused || elapsed <= 0.0 {
                    0.0
                } else {
                    bytes.saturating_sub(last_bytes) as f64 / elapsed
                };
                download.record_progress(bytes, rate);

                last_bytes = bytes;
                last_time = now;

                if status == Status::InProgress {
                    idle_ticks = 0;
                } else {
                    idle_ticks += 1;
                    if idle_ticks >= 2 {
                        break;
                    }
                }
            }
        });
    }

    fn record_progress(&self, downloaded: u64, rate: f64) {
        let (total, rate) = {
            let mut state = self.state.lock();
            state.downloaded = downloaded;
            if state.status == Status::InProgress {
                state.rate = rate;
            }
            (state.total_size, state.rate)
        };

        self.engine.emit(CoreEvent::DownloadProgress {
            id: self.id,
            downloaded,
            total,
            rate,
            progress: percent(downloaded, total),
        });
    }

    pub async fn pause(&self) -> Result<()> {
        self.interrupt(Status::Paused).await
    }

    /// Put an in-flight download back in line without counting as a user pause
    pub async fn pend(&self) -> Result<()> {
        self.interrupt(Status::Pending).await
    }

    /// Stop the transfer and discard every part file
    pub async fn cancel(&self) -> Result<()> {
        self.interrupt(Status::Cancelled).await?;

        let parts = std::mem::take(&mut *self.parts.write());
        for part in &parts {
            if let Err(e) = part.delete_file().await {
                warn!(
                    "Download {}: failed to remove {:?}: {}",
                    self.id,
                    part.path(),
                    e
                );
            }
        }

        let mut state = self.state.lock();
        state.initialized = false;
        state.downloaded = 0;
        Ok(())
    }

    /// Move to `status`, then stop every part.
    ///
    /// The download status changes first so a concurrent `start` either sees
    /// it or started its parts from generations this call will bump.
    async fn interrupt(&self, status: Status) -> Result<()> {
        let from = self.status();
        if !from.can_transition(status) || !self.transition(status) {
            return Err(QgetError::InvalidTransition { from, to: status });
        }

        let parts = self.parts();
        join_all(parts.iter().map(|part| async move {
            match status {
                Status::Paused => part.pause().await,
                Status::Pending => part.pend().await,
                Status::Cancelled => part.cancel().await,
                _ => part.fail().await,
            }
        }))
        .await;

        info!("Download {} is {}", self.id, self.status());
        Ok(())
    }
}

/// Split `[0, total)` into `count` contiguous inclusive ranges.
///
/// The last range absorbs the remainder. Never yields an empty range, so
/// fewer ranges come back when `total < count`.
pub fn partition(total: u64, count: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }

    let count = (count.max(1) as u64).min(total);
    let size = total / count;

    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 {
                total - 1
            } else {
                (i + 1) * size - 1
            };
            (start, end)
        })
        .collect()
}

fn percent(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64 * 100.0).min(100.0)
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("queue", &self.queue)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partitions(total: u64, count: usize) {
        let ranges = partition(total, count);
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {:?}", ranges);
        }
        let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(covered, total);
    }

    #[test]
    fn test_partition_covers_range() {
        for total in [1, 2, 7, 100, 1001, 1 << 20, (1 << 30) + 3] {
            for count in 1..=8 {
                assert_partitions(total, count);
            }
        }
    }

    #[test]
    fn test_partition_last_absorbs_remainder() {
        assert_eq!(partition(10, 3), vec![(0, 2), (3, 5), (6, 9)]);
    }

    #[test]
    fn test_partition_small_file() {
        assert_eq!(partition(3, 5), vec![(0, 0), (1, 1), (2, 2)]);
        assert!(partition(0, 5).is_empty());
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(200, 200), 100.0);
    }
}
