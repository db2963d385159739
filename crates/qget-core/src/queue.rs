//! Queue - a named worker pool dispatching pending downloads under one policy

use crate::engine::{BandwidthLimiter, Download, EngineContext};
use crate::error::{QgetError, Result};
use chrono::NaiveTime;
use parking_lot::{Mutex, RwLock};
use qget_types::{CoreEvent, QueueConfig, QueueSnapshot, Status};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything that exists only while the queue is active
struct Activation {
    sender: mpsc::Sender<Arc<Download>>,
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// A download queue with its own concurrency, bandwidth, retry and time-window policy
pub struct Queue {
    name: String,
    config: RwLock<QueueConfig>,
    activation: Mutex<Option<Activation>>,
    engine: EngineContext,
}

impl Queue {
    pub fn new(config: QueueConfig, engine: EngineContext) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            activation: Mutex::new(None),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> QueueConfig {
        self.config.read().clone()
    }

    /// Replace the policy in place. Concurrency, retries and bandwidth apply
    /// from the next activation on.
    pub fn update_config(&self, config: QueueConfig) {
        *self.config.write() = config;
    }

    pub fn is_active(&self) -> bool {
        self.activation.lock().is_some()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            config: self.config(),
            active: self.is_active(),
        }
    }

    /// Whether the clock time `now` is inside the queue's daily window
    pub fn check_active_time(&self, now: NaiveTime) -> bool {
        self.config.read().window.contains(now)
    }

    /// Activate the queue and feed it `pending` in order. No-op when already active.
    pub fn start(&self, pending: Vec<Arc<Download>>) {
        let mut activation = self.activation.lock();
        if activation.is_some() {
            return;
        }

        let config = self.config();
        let settings = &self.engine.settings;
        let (sender, receiver) = mpsc::channel(settings.dispatch_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stop = CancellationToken::new();
        let limiter = BandwidthLimiter::new(config.bandwidth_kib, settings.chunk_size, stop.clone());

        let workers = (0..config.concurrency)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.name.clone(),
                    config.retries,
                    Arc::clone(&receiver),
                    stop.clone(),
                    limiter.clone(),
                ))
            })
            .collect();

        info!(
            "Queue {:?} started: {} worker(s), {} pending, bandwidth {}",
            self.name,
            config.concurrency,
            pending.len(),
            if config.bandwidth_kib == 0 {
                "unlimited".to_string()
            } else {
                format!("{} KiB/s", config.bandwidth_kib)
            }
        );

        if !pending.is_empty() {
            let feeder = sender.clone();
            let feeder_stop = stop.clone();
            tokio::spawn(async move {
                for download in pending {
                    tokio::select! {
                        _ = feeder_stop.cancelled() => break,
                        sent = feeder.send(download) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        *activation = Some(Activation {
            sender,
            stop,
            workers,
        });
        drop(activation);

        self.engine.emit(CoreEvent::QueueStarted {
            name: self.name.clone(),
        });
    }

    /// Enqueue without blocking. Does nothing while inactive; the active-hours
    /// monitor feeds pending downloads once the window opens.
    pub fn add_download(&self, download: Arc<Download>) -> Result<()> {
        let activation = self.activation.lock();
        let Some(activation) = activation.as_ref() else {
            debug!(
                "Queue {:?} inactive, download {} waits for its window",
                self.name,
                download.id()
            );
            return Ok(());
        };

        match activation.sender.try_send(download) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(download)) => {
                warn!(
                    "Queue {:?} is full, download {} not dispatched",
                    self.name,
                    download.id()
                );
                Err(QgetError::QueueFull(self.name.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QgetError::QueueFull(self.name.clone())),
        }
    }

    /// Deactivate and wait for every worker to exit. No-op when inactive.
    ///
    /// Downloads the workers are running go back to `Pending`.
    pub async fn stop(&self) {
        let activation = self.activation.lock().take();
        let Some(activation) = activation else {
            return;
        };

        activation.stop.cancel();
        drop(activation.sender);

        for worker in activation.workers {
            if let Err(e) = worker.await {
                error!("Queue {:?} worker panicked: {}", self.name, e);
            }
        }

        info!("Queue {:?} stopped", self.name);
        self.engine.emit(CoreEvent::QueueStopped {
            name: self.name.clone(),
        });
    }
}

async fn run_worker(
    worker: u32,
    queue: String,
    retries: u32,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Download>>>>,
    stop: CancellationToken,
    limiter: BandwidthLimiter,
) {
    debug!("Queue {:?} worker {} up", queue, worker);

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = async { receiver.lock().await.recv().await } => next,
        };
        let Some(download) = next else {
            break;
        };
        if stop.is_cancelled() {
            break;
        }

        if !download.claim(&queue) {
            debug!(
                "Queue {:?} worker {}: skipping download {} ({})",
                queue,
                worker,
                download.id(),
                download.status()
            );
            continue;
        }

        let attempts = retries + 1;
        for attempt in 1..=attempts {
            let run = download.start(limiter.clone());
            tokio::pin!(run);
            let result = tokio::select! {
                result = &mut run => result,
                _ = stop.cancelled() => {
                    // Deactivation puts in-flight work back in line
                    if download.status() == Status::InProgress {
                        if let Err(e) = download.pend().await {
                            warn!("Download {} could not be pended: {}", download.id(), e);
                        }
                    }
                    run.await
                }
            };
            let Err(e) = result else {
                break;
            };

            // Only failures are retried; pause, pend and cancel are final
            if download.status() != Status::Failed {
                break;
            }
            if attempt == attempts {
                error!(
                    "Download {} failed after {} attempt(s): {}",
                    download.id(),
                    attempts,
                    e
                );
                break;
            }
            if stop.is_cancelled() {
                break;
            }
            warn!(
                "Download {} failed (attempt {}/{}): {}. Retrying.",
                download.id(),
                attempt,
                attempts,
                e
            );
        }
    }

    debug!("Queue {:?} worker {} down", queue, worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use qget_types::{ActiveWindow, EngineSettings};

    fn queue(config: QueueConfig) -> Queue {
        Queue::new(config, EngineContext::new(EngineSettings::default()).unwrap())
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_check_active_time() {
        let mut config = QueueConfig::new("night", "/tmp");
        config.window = ActiveWindow::from_hm((1, 30), (6, 15)).unwrap();
        let q = queue(config);

        assert!(!q.check_active_time(t(1, 29)));
        assert!(q.check_active_time(t(1, 30)));
        assert!(q.check_active_time(t(6, 14)));
        assert!(!q.check_active_time(t(6, 15)));
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let mut config = QueueConfig::new("main", "/tmp");
        config.concurrency = 3;
        let q = queue(config);

        assert!(!q.is_active());
        q.start(Vec::new());
        assert!(q.is_active());
        // Second start is a no-op
        q.start(Vec::new());
        assert!(q.is_active());

        q.stop().await;
        assert!(!q.is_active());
        // Second stop is a no-op
        q.stop().await;
        assert!(!q.is_active());

        q.start(Vec::new());
        assert!(q.is_active());
        q.stop().await;
    }

    #[tokio::test]
    async fn test_add_to_inactive_queue_is_noop() {
        let engine = EngineContext::new(EngineSettings::default()).unwrap();
        let q = Queue::new(QueueConfig::new("main", "/tmp"), engine.clone());
        let download = Arc::new(Download::new(
            1,
            "http://127.0.0.1:9/file.bin".to_string(),
            "main".to_string(),
            "/tmp".into(),
            "file.bin".to_string(),
            engine,
        ));

        assert!(q.add_download(Arc::clone(&download)).is_ok());
        assert_eq!(download.status(), Status::Pending);
    }

    #[tokio::test]
    async fn test_full_channel_reports_back_pressure() {
        let settings = EngineSettings {
            dispatch_capacity: 1,
            ..EngineSettings::default()
        };
        let engine = EngineContext::new(settings).unwrap();
        // No workers, so nothing drains the channel
        let mut config = QueueConfig::new("main", "/tmp");
        config.concurrency = 0;
        let q = Queue::new(config, engine.clone());
        q.start(Vec::new());

        let make = |id| {
            Arc::new(Download::new(
                id,
                "http://127.0.0.1:9/x".to_string(),
                "main".to_string(),
                "/tmp".into(),
                "x".to_string(),
                engine.clone(),
            ))
        };

        assert!(q.add_download(make(1)).is_ok());
        match q.add_download(make(2)) {
            Err(QgetError::QueueFull(name)) => assert_eq!(name, "main"),
            other => panic!("expected QueueFull, got {:?}", other.err()),
        }
        q.stop().await;
    }
}
