//! CLI command implementations

use crate::output::{self, parse_window, print_done, print_download, print_queue};
use crate::progress::RunProgress;
use crate::{OutputFormat, QueueAction, QueueOptions};
use anyhow::{anyhow, Result};
use console::style;
use qget_core::types::{EngineSettings, NewDownload, QueueConfig, Status};
use qget_core::{Manager, Storage};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Queue used when `add` names none; created on first use
pub const DEFAULT_QUEUE: &str = "main";

/// Manager rebuilt from the state file, plus where to write it back
pub struct Context {
    manager: Manager,
    storage: Storage,
}

impl Context {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let storage = Storage::new(path);
        let snapshot = storage.load().await?;
        let manager = Manager::from_snapshot(snapshot, EngineSettings::default())?;
        Ok(Self { manager, storage })
    }

    async fn save(&self) -> Result<()> {
        self.storage.save(&self.manager.snapshot().await).await?;
        Ok(())
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn add_download(
    ctx: &Context,
    url: String,
    queue: String,
    name: Option<String>,
    dest: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    if queue == DEFAULT_QUEUE && !has_queue(ctx, DEFAULT_QUEUE).await {
        let save_path = dirs::download_dir()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        ctx.manager
            .add_queue(QueueConfig::new(DEFAULT_QUEUE, save_path))
            .await?;
    }

    let mut request = NewDownload::new(url, queue);
    request.output_name = name;
    request.destination = dest;

    let id = ctx.manager.add_download(request).await?;
    ctx.save().await?;

    let download = ctx.manager.get_download(id).await?;
    print_done(
        &format!(
            "Added download #{}: {}",
            id,
            style(&download.output_name).cyan()
        ),
        &download,
        format,
    )
}

pub async fn list_downloads(ctx: &Context, show_all: bool, format: OutputFormat) -> Result<()> {
    let downloads = ctx.manager.list_downloads().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&downloads)?);
        }
        OutputFormat::Human => {
            if downloads.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &downloads {
                print_download(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(downloads.len()).bold());
        }
    }

    Ok(())
}

pub async fn remove_download(ctx: &Context, id: u64, format: OutputFormat) -> Result<()> {
    ctx.manager.remove_download(id).await?;
    ctx.save().await?;
    print_done(&format!("Download #{} removed", id), &id, format)
}

pub async fn pause_download(ctx: &Context, id: u64, format: OutputFormat) -> Result<()> {
    ctx.manager.pause_download(id).await?;
    ctx.save().await?;
    let download = ctx.manager.get_download(id).await?;
    print_done(&format!("Download #{} paused", id), &download, format)
}

pub async fn resume_download(ctx: &Context, id: u64, format: OutputFormat) -> Result<()> {
    ctx.manager.resume_download(id).await?;
    ctx.save().await?;
    let download = ctx.manager.get_download(id).await?;
    print_done(
        &format!("Download #{} is {}", id, download.status),
        &download,
        format,
    )
}

// ============================================================================
// Queue Commands
// ============================================================================

async fn has_queue(ctx: &Context, name: &str) -> bool {
    ctx.manager
        .list_queues()
        .await
        .iter()
        .any(|q| q.config.name == name)
}

fn apply_options(config: &mut QueueConfig, options: QueueOptions) -> Result<()> {
    if let Some(path) = options.path {
        config.save_path = path;
    }
    if let Some(concurrency) = options.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(retries) = options.retries {
        config.retries = retries;
    }
    if let Some(window) = options.window {
        config.window = parse_window(&window)?;
    }
    if let Some(bandwidth) = options.bandwidth {
        config.bandwidth_kib = bandwidth;
    }
    Ok(())
}

pub async fn queue_action(ctx: &Context, action: QueueAction, format: OutputFormat) -> Result<()> {
    match action {
        QueueAction::List => {
            let queues = ctx.manager.list_queues().await;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&queues)?);
                }
                OutputFormat::Human => {
                    if queues.is_empty() {
                        println!("{}", style("No queues").dim());
                    }
                    for queue in &queues {
                        print_queue(queue);
                    }
                }
            }
        }

        QueueAction::Add { name, options } => {
            let save_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let mut config = QueueConfig::new(name, save_path);
            apply_options(&mut config, options)?;

            ctx.manager.add_queue(config.clone()).await?;
            ctx.save().await?;
            print_done(
                &format!("Created queue: {}", style(&config.name).cyan()),
                &config,
                format,
            )?;
        }

        QueueAction::Update { name, options } => {
            let mut config = ctx
                .manager
                .list_queues()
                .await
                .into_iter()
                .find(|q| q.config.name == name)
                .map(|q| q.config)
                .ok_or_else(|| anyhow!("Queue not found: {}", name))?;
            apply_options(&mut config, options)?;

            ctx.manager.update_queue(&name, config.clone()).await?;
            ctx.save().await?;
            print_done(
                &format!("Updated queue: {}", style(&name).cyan()),
                &config,
                format,
            )?;
        }

        QueueAction::Remove { name } => {
            ctx.manager.remove_queue(&name).await?;
            ctx.save().await?;
            print_done(&format!("Queue {} removed", name), &name, format)?;
        }
    }

    Ok(())
}

// ============================================================================
// Run
// ============================================================================

/// Start the manager and show progress until every dispatched download
/// settled, or until Ctrl-C. State is saved on the way out.
pub async fn run(ctx: &Context, keep_alive: bool, format: OutputFormat) -> Result<()> {
    let mut events = ctx.manager.subscribe();
    let mut progress = RunProgress::new();
    ctx.manager.start();
    info!("Running queued downloads");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, saving state");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if matches!(format, OutputFormat::Human) {
                        progress.handle_event(&ctx.manager, &event).await;
                    } else {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Progress display skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if !keep_alive && settled(ctx).await {
                    break;
                }
            }
        }
    }

    ctx.manager.stop().await;
    progress.clear();
    ctx.save().await?;

    if matches!(format, OutputFormat::Human) {
        let downloads = ctx.manager.list_downloads().await;
        let completed = downloads
            .iter()
            .filter(|d| d.status == Status::Completed)
            .count();
        println!(
            "{} {} of {} download(s) completed",
            style("✓").green().bold(),
            completed,
            downloads.len()
        );
        for failed in downloads.iter().filter(|d| d.status == Status::Failed) {
            println!(
                "  {} #{} {}: {}",
                output::status_icon(failed.status),
                failed.id,
                failed.output_name,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

/// Nothing is transferring and no active queue has pending work
async fn settled(ctx: &Context) -> bool {
    let active: Vec<String> = ctx
        .manager
        .list_queues()
        .await
        .into_iter()
        .filter(|q| q.active)
        .map(|q| q.config.name)
        .collect();

    ctx.manager.list_downloads().await.iter().all(|d| match d.status {
        Status::InProgress => false,
        Status::Pending => !active.contains(&d.queue),
        _ => true,
    })
}
