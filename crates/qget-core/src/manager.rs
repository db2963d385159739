//! Manager - process-wide registry of queues and downloads
//!
//! Every public operation takes the registry lock for its whole duration, so
//! operations are serialized with each other. Locked sections only call into
//! queues and downloads, never back into the manager.

use crate::engine::{Download, EngineContext};
use crate::error::{QgetError, Result};
use crate::queue::Queue;
use crate::scheduler::{self, ActiveHoursMonitor};
use chrono::NaiveTime;
use parking_lot::Mutex;
use qget_types::{
    CoreEvent, DownloadSnapshot, EngineSettings, ManagerSnapshot, NewDownload, QueueConfig,
    QueueSnapshot, Status,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use url::Url;

/// The two collections the manager guards
pub(crate) struct Registry {
    pub next_id: u64,
    pub queues: BTreeMap<String, Arc<Queue>>,
    /// Insertion order
    pub downloads: Vec<Arc<Download>>,
}

impl Registry {
    fn find(&self, id: u64) -> Result<Arc<Download>> {
        self.downloads
            .iter()
            .find(|d| d.id() == id)
            .cloned()
            .ok_or(QgetError::DownloadNotFound(id))
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| QgetError::QueueNotFound(name.to_string()))
    }

    /// Downloads owned by `queue`, in insertion order
    pub fn members(&self, queue: &str) -> Vec<Arc<Download>> {
        self.downloads
            .iter()
            .filter(|d| d.queue() == queue)
            .cloned()
            .collect()
    }

    /// Pending downloads owned by `queue`, in insertion order
    pub fn pending_in(&self, queue: &str) -> Vec<Arc<Download>> {
        self.downloads
            .iter()
            .filter(|d| d.queue() == queue && d.status() == Status::Pending)
            .cloned()
            .collect()
    }
}

/// The qget download manager
#[derive(Clone)]
pub struct Manager {
    registry: Arc<RwLock<Registry>>,
    engine: EngineContext,
    monitor: Arc<Mutex<Option<ActiveHoursMonitor>>>,
}

impl Manager {
    /// Create an empty manager
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Self::from_snapshot(ManagerSnapshot::default(), settings)
    }

    /// Rebuild a manager from a persisted snapshot. Every queue starts inactive.
    pub fn from_snapshot(snapshot: ManagerSnapshot, settings: EngineSettings) -> Result<Self> {
        let engine = EngineContext::new(settings)?;

        let mut queues = BTreeMap::new();
        for config in snapshot.queues {
            config.validate().map_err(QgetError::InvalidConfig)?;
            if queues.contains_key(&config.name) {
                return Err(QgetError::QueueExists(config.name));
            }
            queues.insert(
                config.name.clone(),
                Arc::new(Queue::new(config, engine.clone())),
            );
        }

        let downloads: Vec<Arc<Download>> = snapshot
            .downloads
            .iter()
            .map(|d| Arc::new(Download::restore(d, engine.clone())))
            .collect();

        let next_id = downloads
            .iter()
            .map(|d| d.id() + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.next_id);

        info!(
            "Manager ready with {} queue(s) and {} download(s)",
            queues.len(),
            downloads.len()
        );

        Ok(Self {
            registry: Arc::new(RwLock::new(Registry {
                next_id,
                queues,
                downloads,
            })),
            engine,
            monitor: Arc::new(Mutex::new(None)),
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.engine.events.subscribe()
    }

    fn is_started(&self) -> bool {
        self.monitor.lock().is_some()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Launch the active-hours monitor. No-op when already started.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let period = Duration::from_secs(self.engine.settings.schedule_interval_secs);
        *monitor = Some(ActiveHoursMonitor::spawn(Arc::clone(&self.registry), period));
    }

    /// Stop the monitor, put in-flight downloads back in line and stop every queue
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }

        let registry = self.registry.write().await;
        for download in &registry.downloads {
            if download.status() == Status::InProgress {
                if let Err(e) = download.pend().await {
                    warn!("Download {} could not be pended: {}", download.id(), e);
                }
            }
        }
        for queue in registry.queues.values() {
            queue.stop().await;
        }
        info!("Manager stopped");
    }

    /// Reconcile every queue with its window at `now`, as one monitor tick does
    pub async fn check_active_hours(&self, now: NaiveTime) {
        let registry = self.registry.write().await;
        scheduler::reconcile(&registry, now).await;
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Register a download under an existing queue and dispatch it if the queue is active
    pub async fn add_download(&self, request: NewDownload) -> Result<u64> {
        let url = Url::parse(&request.url)
            .map_err(|e| QgetError::InvalidUrl(format!("{}: {}", request.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(QgetError::InvalidUrl(format!(
                "{}: unsupported scheme {:?}",
                request.url,
                url.scheme()
            )));
        }

        let mut registry = self.registry.write().await;
        let queue = registry.queue(&request.queue)?;

        let destination = request
            .destination
            .unwrap_or_else(|| queue.config().save_path);
        let output_name = match request.output_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => output_name_from_url(&url),
        };

        let id = registry.next_id;
        registry.next_id += 1;

        let download = Arc::new(Download::new(
            id,
            request.url,
            request.queue,
            destination,
            output_name,
            self.engine.clone(),
        ));

        // A full dispatch channel rejects the download outright
        queue.add_download(Arc::clone(&download))?;
        registry.downloads.push(download);

        info!("Added download {} to queue {:?}", id, queue.name());
        self.engine.emit(CoreEvent::DownloadAdded { id });
        Ok(id)
    }

    /// Cancel a download, discard its part files and forget it.
    ///
    /// A completed output file stays on disk.
    pub async fn remove_download(&self, id: u64) -> Result<()> {
        let mut registry = self.registry.write().await;
        let download = registry.find(id)?;

        if download.status() != Status::Completed {
            download.cancel().await?;
        }
        registry.downloads.retain(|d| d.id() != id);

        info!("Removed download {}", id);
        self.engine.emit(CoreEvent::DownloadRemoved { id });
        Ok(())
    }

    pub async fn pause_download(&self, id: u64) -> Result<()> {
        let registry = self.registry.read().await;
        let download = registry.find(id)?;
        download.pause().await
    }

    /// Make a paused, failed or cancelled download pending again and
    /// dispatch it if its queue is active
    pub async fn resume_download(&self, id: u64) -> Result<()> {
        let registry = self.registry.read().await;
        let download = registry.find(id)?;

        match download.status() {
            Status::InProgress | Status::Completed => return Ok(()),
            Status::Pending => {}
            Status::Paused | Status::Failed | Status::Cancelled => {
                // Fail before touching the status when the queue is gone
                registry.queue(download.queue())?;
                download.reset_to_pending()?;
            }
        }

        let queue = registry.queue(download.queue())?;
        queue.add_download(download)
    }

    /// Snapshots of every download, in insertion order
    pub async fn list_downloads(&self) -> Vec<DownloadSnapshot> {
        let registry = self.registry.read().await;
        registry.downloads.iter().map(|d| d.snapshot()).collect()
    }

    pub async fn get_download(&self, id: u64) -> Result<DownloadSnapshot> {
        let registry = self.registry.read().await;
        Ok(registry.find(id)?.snapshot())
    }

    // ========================================================================
    // Queue Operations
    // ========================================================================

    pub async fn add_queue(&self, config: QueueConfig) -> Result<()> {
        config.validate().map_err(QgetError::InvalidConfig)?;

        let mut registry = self.registry.write().await;
        if registry.queues.contains_key(&config.name) {
            return Err(QgetError::QueueExists(config.name));
        }

        let name = config.name.clone();
        let queue = Arc::new(Queue::new(config, self.engine.clone()));
        registry.queues.insert(name.clone(), Arc::clone(&queue));
        info!("Added queue {:?}", name);

        if self.is_started() {
            scheduler::reconcile_queue(&registry, &queue, chrono::Local::now().time()).await;
        }
        Ok(())
    }

    /// Cancel every member download, then stop and forget the queue
    pub async fn remove_queue(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let queue = registry.queue(name)?;

        for download in registry.members(name) {
            if download.status().can_transition(Status::Cancelled) {
                if let Err(e) = download.cancel().await {
                    warn!("Download {} could not be cancelled: {}", download.id(), e);
                }
            }
        }

        queue.stop().await;
        registry.queues.remove(name);
        info!("Removed queue {:?}", name);
        Ok(())
    }

    /// Replace a queue's policy. Renaming is not supported.
    pub async fn update_queue(&self, name: &str, config: QueueConfig) -> Result<()> {
        if config.name != name {
            return Err(QgetError::InvalidConfig(format!(
                "queue {:?} cannot be renamed to {:?}",
                name, config.name
            )));
        }
        config.validate().map_err(QgetError::InvalidConfig)?;

        let registry = self.registry.write().await;
        let queue = registry.queue(name)?;
        queue.update_config(config);
        info!("Updated queue {:?}", name);

        if self.is_started() {
            scheduler::reconcile_queue(&registry, &queue, chrono::Local::now().time()).await;
        }
        Ok(())
    }

    /// Snapshots of every queue, ordered by name
    pub async fn list_queues(&self) -> Vec<QueueSnapshot> {
        let registry = self.registry.read().await;
        registry.queues.values().map(|q| q.snapshot()).collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Everything needed to rebuild an equivalent manager with `from_snapshot`
    pub async fn snapshot(&self) -> ManagerSnapshot {
        let registry = self.registry.read().await;
        ManagerSnapshot {
            next_id: registry.next_id,
            queues: registry.queues.values().map(|q| q.config()).collect(),
            downloads: registry.downloads.iter().map(|d| d.snapshot()).collect(),
        }
    }
}

/// Last non-empty path segment of `url`, percent-decoded, or `download`
fn output_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| match urlencoding::decode(segment) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => segment.to_string(),
        })
        .map(|name| name.replace(['/', '\\'], "_"))
        .filter(|name| !name.trim().is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(url: &str) -> String {
        output_name_from_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_output_name_from_url() {
        assert_eq!(name("http://example.com/files/archive.tar.gz"), "archive.tar.gz");
        assert_eq!(name("http://example.com/files/archive.zip?token=1"), "archive.zip");
        assert_eq!(name("http://example.com/dir/"), "dir");
        assert_eq!(name("http://example.com/my%20file.iso"), "my file.iso");
        assert_eq!(name("http://example.com/a%2Fb"), "a_b");
        assert_eq!(name("http://example.com/"), "download");
        assert_eq!(name("http://example.com"), "download");
    }

    #[tokio::test]
    async fn test_add_download_validation() {
        let manager = Manager::new(EngineSettings::default()).unwrap();
        manager
            .add_queue(QueueConfig::new("main", "/tmp/qget"))
            .await
            .unwrap();

        let err = manager
            .add_download(NewDownload::new("not a url", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, QgetError::InvalidUrl(_)));

        let err = manager
            .add_download(NewDownload::new("ftp://example.com/f", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, QgetError::InvalidUrl(_)));

        let err = manager
            .add_download(NewDownload::new("http://example.com/f", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, QgetError::QueueNotFound(_)));

        assert!(manager.list_downloads().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_download_defaults() {
        let manager = Manager::new(EngineSettings::default()).unwrap();
        manager
            .add_queue(QueueConfig::new("main", "/tmp/qget"))
            .await
            .unwrap();

        let first = manager
            .add_download(NewDownload::new("http://example.com/a/b.bin", "main"))
            .await
            .unwrap();
        let mut request = NewDownload::new("http://example.com/c", "main");
        request.output_name = Some("named.bin".to_string());
        request.destination = Some("/tmp/elsewhere".into());
        let second = manager.add_download(request).await.unwrap();

        assert_eq!(second, first + 1);

        let a = manager.get_download(first).await.unwrap();
        assert_eq!(a.output_name, "b.bin");
        assert_eq!(a.destination, std::path::PathBuf::from("/tmp/qget"));
        assert_eq!(a.status, Status::Pending);

        let b = manager.get_download(second).await.unwrap();
        assert_eq!(b.output_name, "named.bin");
        assert_eq!(b.destination, std::path::PathBuf::from("/tmp/elsewhere"));
    }

    #[tokio::test]
    async fn test_queue_validation() {
        let manager = Manager::new(EngineSettings::default()).unwrap();
        let mut config = QueueConfig::new("main", "/tmp");

        config.concurrency = 0;
        assert!(matches!(
            manager.add_queue(config.clone()).await,
            Err(QgetError::InvalidConfig(_))
        ));

        config.concurrency = 2;
        manager.add_queue(config.clone()).await.unwrap();
        assert!(matches!(
            manager.add_queue(config.clone()).await,
            Err(QgetError::QueueExists(_))
        ));

        let renamed = QueueConfig::new("other", "/tmp");
        assert!(matches!(
            manager.update_queue("main", renamed).await,
            Err(QgetError::InvalidConfig(_))
        ));

        config.retries = 3;
        manager.update_queue("main", config).await.unwrap();
        let queues = manager.list_queues().await;
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].config.retries, 3);
        assert!(!queues[0].active);

        assert!(matches!(
            manager.remove_queue("missing").await,
            Err(QgetError::QueueNotFound(_))
        ));
        manager.remove_queue("main").await.unwrap();
        assert!(manager.list_queues().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_inactive_queue() {
        let manager = Manager::new(EngineSettings::default()).unwrap();
        manager
            .add_queue(QueueConfig::new("main", "/tmp/qget"))
            .await
            .unwrap();
        let id = manager
            .add_download(NewDownload::new("http://example.com/f.bin", "main"))
            .await
            .unwrap();

        manager.pause_download(id).await.unwrap();
        assert_eq!(manager.get_download(id).await.unwrap().status, Status::Paused);

        manager.resume_download(id).await.unwrap();
        assert_eq!(manager.get_download(id).await.unwrap().status, Status::Pending);

        assert!(matches!(
            manager.pause_download(42).await,
            Err(QgetError::DownloadNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restores_ids() {
        let manager = Manager::new(EngineSettings::default()).unwrap();
        manager
            .add_queue(QueueConfig::new("main", "/tmp/qget"))
            .await
            .unwrap();
        manager
            .add_download(NewDownload::new("http://example.com/1", "main"))
            .await
            .unwrap();
        manager
            .add_download(NewDownload::new("http://example.com/2", "main"))
            .await
            .unwrap();

        let mut snapshot = manager.snapshot().await;
        snapshot.next_id = 0;

        let restored = Manager::from_snapshot(snapshot, EngineSettings::default()).unwrap();
        let id = restored
            .add_download(NewDownload::new("http://example.com/3", "main"))
            .await
            .unwrap();
        assert_eq!(id, 2);
        assert_eq!(restored.list_downloads().await.len(), 3);
    }
}
