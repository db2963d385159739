//! Storage layer for manager state (one JSON file)

use crate::error::{QgetError, Result};
use qget_types::ManagerSnapshot;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// JSON file holding a [`ManagerSnapshot`]
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or an empty one when the file does not exist yet
    pub async fn load(&self) -> Result<ManagerSnapshot> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state at {:?}, starting empty", self.path);
                return Ok(ManagerSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&content)?)
    }

    /// Write the snapshot through a temporary file so readers never see a torn file
    pub async fn save(&self, snapshot: &ManagerSnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| QgetError::InvalidConfig(format!("{:?} is not a file path", self.path)))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp = self.path.with_file_name(temp_name);

        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;

        debug!(
            "Saved {} queue(s) and {} download(s) to {:?}",
            snapshot.queues.len(),
            snapshot.downloads.len(),
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qget_types::QueueConfig;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("state.json"));

        let snapshot = storage.load().await.unwrap();
        assert_eq!(snapshot.next_id, 0);
        assert!(snapshot.queues.is_empty());
        assert!(snapshot.downloads.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nested").join("state.json"));

        let snapshot = ManagerSnapshot {
            next_id: 7,
            queues: vec![QueueConfig::new("main", "/downloads")],
            downloads: Vec::new(),
        };
        storage.save(&snapshot).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.next_id, 7);
        assert_eq!(loaded.queues, snapshot.queues);
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let result = Storage::new(path).load().await;
        assert!(matches!(result, Err(QgetError::Serialization(_))));
    }
}
