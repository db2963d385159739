//! Active-hours monitor - starts and stops queues as their daily windows open and close
//!
//! Runs a background task that periodically compares the local clock time with
//! each queue's window and reconciles the queue's activation with it.

use crate::manager::Registry;
use crate::queue::Queue;
use chrono::{Local, NaiveTime};
use qget_types::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle of the running monitor task
pub(crate) struct ActiveHoursMonitor {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveHoursMonitor {
    /// Spawn the monitor. The first check runs immediately.
    pub fn spawn(registry: Arc<RwLock<Registry>>, period: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let period = period.max(Duration::from_secs(1));

        info!("Starting active-hours monitor (every {:?})", period);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let guard = registry.write().await;
                        reconcile(&guard, Local::now().time()).await;
                    }
                }
            }
            debug!("Active-hours monitor exited");
        });

        Self { stop, handle }
    }

    /// Stop the monitor and wait for an in-flight check to finish
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!("Active-hours monitor panicked: {}", e);
        }
        info!("Active-hours monitor stopped");
    }
}

/// Bring every queue's activation in line with its window at `now`
pub(crate) async fn reconcile(registry: &Registry, now: NaiveTime) {
    for queue in registry.queues.values() {
        reconcile_queue(registry, queue, now).await;
    }
}

/// Start `queue` with its pending downloads when its window is open, or put
/// its in-flight downloads back in line and stop it when the window is closed
pub(crate) async fn reconcile_queue(registry: &Registry, queue: &Arc<Queue>, now: NaiveTime) {
    let in_window = queue.check_active_time(now);

    if queue.is_active() && !in_window {
        info!(
            "Queue {:?} left its window {} at {}",
            queue.name(),
            queue.config().window,
            now.format("%H:%M")
        );
        for download in registry.members(queue.name()) {
            if download.status() == Status::InProgress {
                if let Err(e) = download.pend().await {
                    warn!("Download {} could not be pended: {}", download.id(), e);
                }
            }
        }
        queue.stop().await;
    } else if !queue.is_active() && in_window {
        info!(
            "Queue {:?} entered its window {} at {}",
            queue.name(),
            queue.config().window,
            now.format("%H:%M")
        );
        queue.start(registry.pending_in(queue.name()));
    }
}
