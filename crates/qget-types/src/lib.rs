//! Shared types for qget
//!
//! This crate contains the serializable data structures exchanged between
//! the download engine, the CLI and whatever persists manager state.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status shared by downloads and their parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Paused,
    Cancelled,
    Failed,
    Completed,
}

impl Status {
    /// Whether a transfer can move from `self` to `next`.
    ///
    /// Staying in the same status is always allowed. `Completed` is terminal.
    pub fn can_transition(self, next: Status) -> bool {
        use Status::*;

        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, InProgress | Paused | Cancelled),
            InProgress => matches!(next, Pending | Paused | Cancelled | Failed | Completed),
            Paused => matches!(next, Pending | InProgress | Cancelled),
            Failed => matches!(next, Pending | InProgress | Paused | Cancelled),
            Cancelled => matches!(next, Pending),
            Completed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Completed
    }

    pub fn is_active(self) -> bool {
        self == Status::InProgress
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in progress",
            Status::Paused => "paused",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
            Status::Completed => "completed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// Daily clock-time interval during which a queue may run transfers
///
/// Times are kept at minute resolution. A window whose end is before its
/// start wraps past midnight; equal start and end means the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    #[serde(with = "hhmm_serde")]
    pub start: NaiveTime,
    #[serde(with = "hhmm_serde")]
    pub end: NaiveTime,
}

impl ActiveWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: truncate_to_minute(start),
            end: truncate_to_minute(end),
        }
    }

    /// Build a window from `(hour, minute)` pairs, `None` if either is out of range
    pub fn from_hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self::new(
            NaiveTime::from_hms_opt(start.0, start.1, 0)?,
            NaiveTime::from_hms_opt(end.0, end.1, 0)?,
        ))
    }

    /// A window that is open all day
    pub fn always() -> Self {
        Self::new(NaiveTime::MIN, NaiveTime::MIN)
    }

    /// Check whether the clock time `now` falls inside the window
    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = minute_of_day(now);
        let start = minute_of_day(self.start);
        let end = minute_of_day(self.end);

        if start == end {
            true
        } else if start < end {
            start <= now && now < end
        } else {
            now >= start || now < end
        }
    }
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Display for ActiveWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// Serialize `NaiveTime` as "HH:MM"
mod hhmm_serde {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .map_err(|e| serde::de::Error::custom(format!("Invalid time {:?}: {}", s, e)))
    }
}

/// Policy of a named queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub save_path: PathBuf,
    /// Number of downloads the queue runs at once
    pub concurrency: u32,
    /// Extra attempts after a failed download
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub window: ActiveWindow,
    /// Bandwidth ceiling in KiB/s shared by every transfer of the queue (0 = unlimited)
    #[serde(default)]
    pub bandwidth_kib: u64,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            save_path: save_path.into(),
            concurrency: 1,
            retries: 0,
            window: ActiveWindow::always(),
            bandwidth_kib: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("queue name must not be empty".to_string());
        }
        if self.concurrency < 1 {
            return Err(format!(
                "queue {:?}: concurrency must be at least 1",
                self.name
            ));
        }
        Ok(())
    }
}

/// Queue configuration plus runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(flatten)]
    pub config: QueueConfig,
    pub active: bool,
}

// ============================================================================
// Download Types
// ============================================================================

/// Request to register a new download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDownload {
    pub url: String,
    pub queue: String,
    /// Output file name (derived from the URL when unset)
    #[serde(default)]
    pub output_name: Option<String>,
    /// Destination directory (the queue's save path when unset)
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl NewDownload {
    pub fn new(url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: queue.into(),
            output_name: None,
            destination: None,
        }
    }
}

/// One byte range of a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSnapshot {
    pub index: usize,
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub downloaded: u64,
    pub status: Status,
}

/// Point-in-time view of a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: u64,
    pub url: String,
    pub queue: String,
    pub destination: PathBuf,
    pub output_name: String,
    pub total_size: u64,
    pub downloaded: u64,
    /// Percentage in `[0, 100]`
    pub progress: f64,
    /// Bytes per second
    pub rate: f64,
    pub status: Status,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub parts: Vec<PartSnapshot>,
}

/// Everything needed to rebuild an equivalent manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub next_id: u64,
    pub queues: Vec<QueueConfig>,
    pub downloads: Vec<DownloadSnapshot>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Parts per download when the server accepts ranges
    pub part_count: usize,
    /// Bytes read per bandwidth token
    pub chunk_size: usize,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Capacity of each queue's dispatch channel
    pub dispatch_capacity: usize,
    pub progress_interval_ms: u64,
    pub schedule_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            part_count: 5,
            chunk_size: 32 * 1024,
            user_agent: concat!("qget/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            dispatch_capacity: 64,
            progress_interval_ms: 500,
            schedule_interval_secs: 60,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadAdded {
        id: u64,
    },
    DownloadRemoved {
        id: u64,
    },
    DownloadStatusChanged {
        id: u64,
        status: Status,
        error: Option<String>,
    },
    DownloadProgress {
        id: u64,
        downloaded: u64,
        total: u64,
        rate: f64,
        progress: f64,
    },
    QueueStarted {
        name: String,
    },
    QueueStopped {
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_same_day() {
        let w = ActiveWindow::from_hm((9, 30), (17, 0)).unwrap();
        assert!(!w.contains(t(9, 29)));
        assert!(w.contains(t(9, 30)));
        assert!(w.contains(t(16, 59)));
        assert!(!w.contains(t(17, 0)));
        assert!(!w.contains(t(23, 0)));
    }

    #[test]
    fn test_window_ignores_seconds() {
        let w = ActiveWindow::from_hm((9, 30), (9, 31)).unwrap();
        assert!(w.contains(NaiveTime::from_hms_opt(9, 30, 59).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(9, 31, 1).unwrap()));
    }

    #[test]
    fn test_window_overnight() {
        let w = ActiveWindow::from_hm((22, 0), (6, 0)).unwrap();
        assert!(w.contains(t(23, 15)));
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(5, 59)));
        assert!(!w.contains(t(6, 0)));
        assert!(!w.contains(t(12, 0)));
    }

    #[test]
    fn test_window_equal_bounds_is_whole_day() {
        let w = ActiveWindow::always();
        assert!(w.contains(t(0, 0)));
        assert!(w.contains(t(23, 59)));
    }

    #[test]
    fn test_window_serializes_as_hhmm() {
        let w = ActiveWindow::from_hm((8, 5), (20, 45)).unwrap();
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"start":"08:05","end":"20:45"}"#);
        let back: ActiveWindow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::Pending.can_transition(Status::InProgress));
        assert!(Status::InProgress.can_transition(Status::Completed));
        assert!(Status::Failed.can_transition(Status::InProgress));
        assert!(Status::Cancelled.can_transition(Status::Pending));
        assert!(!Status::Cancelled.can_transition(Status::InProgress));
        assert!(!Status::Completed.can_transition(Status::Pending));
        assert!(!Status::Pending.can_transition(Status::Completed));
    }

    #[test]
    fn test_queue_validation() {
        let mut q = QueueConfig::new("main", "/tmp");
        assert!(q.validate().is_ok());
        q.concurrency = 0;
        assert!(q.validate().is_err());
        q.concurrency = 2;
        q.name = "  ".to_string();
        assert!(q.validate().is_err());
    }
}
