//! Part - downloads one byte range of a URL into its own temporary file
//!
//! A part is driven by a single transfer task at a time. Other tasks read its
//! progress under the state lock and interrupt it through a private control
//! channel that the transfer loop polls before every read.

use crate::engine::rate_limiter::BandwidthLimiter;
use crate::error::{QgetError, Result};
use futures::TryStreamExt;
use parking_lot::Mutex;
use qget_types::{PartSnapshot, Status};
use reqwest::Client;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// What every part of one download start shares
#[derive(Clone)]
pub struct TransferContext {
    pub client: Client,
    pub url: String,
    pub limiter: BandwidthLimiter,
    pub chunk_size: usize,
}

/// Outcome of one part start, tagged with the part index
pub type PartReport = (usize, Result<()>);

/// Request to stop a running transfer loop
struct Interrupt {
    status: Status,
    ack: oneshot::Sender<()>,
}

struct PartState {
    status: Status,
    downloaded: u64,
    /// Bumped by every interrupt
    generation: u64,
    /// Present only while a transfer loop is running
    control: Option<mpsc::Sender<Interrupt>>,
}

/// One contiguous byte range `[start, end]` of a download
pub struct Part {
    index: usize,
    start: u64,
    end: u64,
    path: PathBuf,
    state: Mutex<PartState>,
}

impl Part {
    pub fn new(index: usize, start: u64, end: u64, path: PathBuf) -> Self {
        Self {
            index,
            start,
            end,
            path,
            state: Mutex::new(PartState {
                status: Status::Pending,
                downloaded: 0,
                generation: 0,
                control: None,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn downloaded(&self) -> u64 {
        self.state.lock().downloaded
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn snapshot(&self) -> PartSnapshot {
        let state = self.state.lock();
        PartSnapshot {
            index: self.index,
            start: self.start,
            end: self.end,
            downloaded: state.downloaded,
            status: state.status,
        }
    }

    /// Download the remaining bytes of the range and report on `results`.
    ///
    /// `generation` is the value read before the caller decided to start. If
    /// an interrupt landed since, the part keeps the status it set and reports
    /// the interruption. Starting a completed part reports success without
    /// touching the network.
    pub async fn start(
        self: Arc<Self>,
        generation: u64,
        ctx: TransferContext,
        results: mpsc::Sender<PartReport>,
    ) {
        let result = self.run(generation, &ctx).await;
        if let Err(e) = &result {
            if !e.is_interruption() {
                warn!("Part {} failed: {}", self.index, e);
            }
        }
        let _ = results.send((self.index, result)).await;
    }

    async fn run(&self, generation: u64, ctx: &TransferContext) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(1);
        let resume_from = {
            let mut state = self.state.lock();
            if state.status == Status::Completed {
                return Ok(());
            }
            // Interrupted before this task got to run
            if state.generation != generation || state.status == Status::Cancelled {
                return Err(QgetError::Interrupted(state.status));
            }
            if state.downloaded >= self.len() {
                state.status = Status::Completed;
                return Ok(());
            }
            state.status = Status::InProgress;
            state.control = Some(tx);
            self.start + state.downloaded
        };

        info!(
            "Downloading part {} (bytes {}-{})",
            self.index, resume_from, self.end
        );

        let outcome = self.transfer(ctx, resume_from, &mut rx).await;

        match outcome {
            Ok(()) => {
                self.finish(Status::Completed);
                info!(
                    "Part {} complete (bytes {}-{})",
                    self.index, self.start, self.end
                );
                Ok(())
            }
            Err(Stop::Interrupted(interrupt)) => {
                self.finish(interrupt.status);
                debug!(
                    "Part {} stopped as {} at {} bytes",
                    self.index,
                    interrupt.status,
                    self.downloaded()
                );
                let _ = interrupt.ack.send(());
                Err(QgetError::Interrupted(interrupt.status))
            }
            Err(Stop::Failed(e)) => {
                self.finish(Status::Failed);
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        ctx: &TransferContext,
        resume_from: u64,
        control: &mut mpsc::Receiver<Interrupt>,
    ) -> Result<(), Stop> {
        let request = ctx
            .client
            .get(&ctx.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", resume_from, self.end));

        let response = tokio::select! {
            biased;
            Some(interrupt) = control.recv() => return Err(Stop::Interrupted(interrupt)),
            response = request.send() => response.map_err(QgetError::from)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(QgetError::ServerError {
                status: status.as_u16(),
                message: format!("Failed to download part {}", self.index),
            }
            .into());
        }
        let mut resume_from = resume_from;
        if status != reqwest::StatusCode::PARTIAL_CONTENT && resume_from > 0 {
            if self.start > 0 {
                return Err(QgetError::ServerError {
                    status: status.as_u16(),
                    message: format!("Server ignored range request for part {}", self.index),
                }
                .into());
            }
            // Whole body again: only a part starting at byte 0 can take it
            warn!(
                "Server ignored range request for part {}, restarting it from byte 0",
                self.index
            );
            self.state.lock().downloaded = 0;
            resume_from = 0;
        }

        // Drop anything past the counted bytes so the file mirrors `downloaded`
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(QgetError::from)?;
        let already = resume_from - self.start;
        file.set_len(already).await.map_err(QgetError::from)?;
        file.seek(SeekFrom::Start(already))
            .await
            .map_err(QgetError::from)?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut buffer = vec![0u8; ctx.chunk_size.max(1)];

        let result = loop {
            if let Ok(interrupt) = control.try_recv() {
                break Err(Stop::Interrupted(interrupt));
            }

            ctx.limiter.wait_for_token().await;

            let n = match reader.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => break Err(QgetError::Io(e).into()),
            };

            let remaining = self.len() - self.downloaded();
            if n == 0 {
                break Err(QgetError::Unknown(format!(
                    "Connection closed with {} bytes of part {} missing",
                    remaining, self.index
                ))
                .into());
            }

            let n = n.min(remaining as usize);
            if let Err(e) = file.write_all(&buffer[..n]).await {
                break Err(QgetError::Io(e).into());
            }
            if self.add_downloaded(n as u64) >= self.len() {
                break Ok(());
            }
        };

        file.flush().await.map_err(QgetError::from)?;
        if result.is_ok() {
            file.sync_all().await.map_err(QgetError::from)?;
        }
        result
    }

    fn add_downloaded(&self, n: u64) -> u64 {
        let mut state = self.state.lock();
        state.downloaded += n;
        state.downloaded
    }

    /// Leave the transfer loop in `status`
    fn finish(&self, status: Status) {
        let mut state = self.state.lock();
        state.control = None;
        if state.status.can_transition(status) {
            state.status = status;
        }
    }

    pub async fn pause(&self) {
        self.interrupt(Status::Paused).await;
    }

    pub async fn pend(&self) {
        self.interrupt(Status::Pending).await;
    }

    pub async fn cancel(&self) {
        self.interrupt(Status::Cancelled).await;
    }

    pub async fn fail(&self) {
        self.interrupt(Status::Failed).await;
    }

    /// Stop a running transfer loop, or set the status directly when idle.
    ///
    /// Returns once the loop has acknowledged or exited.
    async fn interrupt(&self, status: Status) {
        let control = {
            let state = self.state.lock();
            if state.status == Status::InProgress {
                state.control.clone()
            } else {
                None
            }
        };

        if let Some(control) = control {
            let (ack, acked) = oneshot::channel();
            if control.send(Interrupt { status, ack }).await.is_ok() {
                // An error here means the loop exited on its own first
                let _ = acked.await;
            }
        }

        let mut state = self.state.lock();
        state.generation += 1;
        if state.status != status && state.status.can_transition(status) {
            state.status = status;
        }
        debug!(
            "Part {} is {} with {} bytes downloaded",
            self.index, state.status, state.downloaded
        );
    }

    /// Remove the temporary file, tolerating its absence
    pub async fn delete_file(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Why a transfer loop ended early
enum Stop {
    Interrupted(Interrupt),
    Failed(QgetError),
}

impl From<QgetError> for Stop {
    fn from(error: QgetError) -> Self {
        Stop::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TransferContext {
        TransferContext {
            client: Client::new(),
            // Nothing listens here; a completed part must never connect
            url: "http://127.0.0.1:9/never".to_string(),
            limiter: BandwidthLimiter::unlimited(),
            chunk_size: 32 * 1024,
        }
    }

    #[tokio::test]
    async fn test_completed_part_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let part = Arc::new(Part::new(0, 0, 9, dir.path().join("f0-9.part")));
        part.add_downloaded(10);
        part.finish(Status::InProgress);
        part.finish(Status::Completed);

        let (tx, mut rx) = mpsc::channel(1);
        part.clone().start(part.generation(), context(), tx).await;

        let (index, result) = rx.recv().await.unwrap();
        assert_eq!(index, 0);
        assert!(result.is_ok());
        assert_eq!(part.status(), Status::Completed);
        assert_eq!(part.downloaded(), 10);
    }

    #[tokio::test]
    async fn test_idle_interrupt_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let part = Part::new(1, 10, 19, dir.path().join("f10-19.part"));

        part.pause().await;
        assert_eq!(part.status(), Status::Paused);
        part.pend().await;
        assert_eq!(part.status(), Status::Pending);
        part.cancel().await;
        assert_eq!(part.status(), Status::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_part_ignores_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let part = Part::new(0, 0, 0, dir.path().join("f0-0.part"));
        part.finish(Status::InProgress);
        part.finish(Status::Completed);

        part.cancel().await;
        assert_eq!(part.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_failed_connection_marks_part_failed() {
        let dir = tempfile::tempdir().unwrap();
        let part = Arc::new(Part::new(0, 0, 99, dir.path().join("f0-99.part")));

        let (tx, mut rx) = mpsc::channel(1);
        part.clone().start(part.generation(), context(), tx).await;

        let (_, result) = rx.recv().await.unwrap();
        assert!(matches!(result, Err(QgetError::Network(_))));
        assert_eq!(part.status(), Status::Failed);
    }

    #[tokio::test]
    async fn test_interrupt_before_run_keeps_status() {
        let dir = tempfile::tempdir().unwrap();
        let part = Arc::new(Part::new(0, 0, 99, dir.path().join("f0-99.part")));

        // Spawned, then paused before the task took the state lock
        let generation = part.generation();
        part.pause().await;

        let (tx, mut rx) = mpsc::channel(1);
        part.clone().start(generation, context(), tx).await;

        let (_, result) = rx.recv().await.unwrap();
        assert!(matches!(result, Err(QgetError::Interrupted(Status::Paused))));
        assert_eq!(part.status(), Status::Paused);
        assert!(!part.path().exists());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let part = Part::new(0, 0, 9, dir.path().join("missing.part"));
        assert!(part.delete_file().await.is_ok());
    }
}
