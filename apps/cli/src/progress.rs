//! Progress bars driven by core events

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use qget_core::types::{CoreEvent, DownloadSnapshot, Status};
use qget_core::Manager;
use std::collections::HashMap;

/// Manages progress bars for multiple downloads
pub struct RunProgress {
    multi: MultiProgress,
    bars: HashMap<u64, ProgressBar>,
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar_for(&mut self, download: &DownloadSnapshot) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(download.id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(download.total_size));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▓▒░  "),
            );
            pb.set_prefix(download.output_name.clone());
            pb.set_position(download.downloaded);
            pb
        })
    }

    /// Update the bars from one event
    pub async fn handle_event(&mut self, manager: &Manager, event: &CoreEvent) {
        match event {
            CoreEvent::DownloadProgress {
                id,
                downloaded,
                total,
                ..
            } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.set_length(*total);
                    pb.set_position(*downloaded);
                }
            }

            CoreEvent::DownloadStatusChanged { id, status, error } => {
                if *status == Status::InProgress && !self.bars.contains_key(id) {
                    if let Ok(download) = manager.get_download(*id).await {
                        self.bar_for(&download);
                    }
                }
                let Some(pb) = self.bars.get(id) else {
                    return;
                };

                match status {
                    Status::InProgress => pb.set_message(""),
                    Status::Completed => {
                        pb.finish_with_message(format!("{} done", style("✓").green().bold()));
                    }
                    Status::Failed => {
                        pb.set_message(format!(
                            "{} {}",
                            style("✗").red().bold(),
                            error.as_deref().unwrap_or("failed")
                        ));
                    }
                    Status::Paused => pb.set_message(format!("{} paused", style("⏸").yellow())),
                    Status::Pending => pb.set_message(format!("{} waiting", style("·").dim())),
                    Status::Cancelled => {
                        pb.abandon_with_message(format!("{} cancelled", style("○").dim()));
                    }
                }
            }

            CoreEvent::QueueStarted { name } => {
                let _ = self
                    .multi
                    .println(format!("{} queue {} started", style("▶").green(), style(name).bold()));
            }

            CoreEvent::QueueStopped { name } => {
                let _ = self
                    .multi
                    .println(format!("{} queue {} stopped", style("■").dim(), style(name).bold()));
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}
