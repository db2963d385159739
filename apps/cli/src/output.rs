//! Output formatting utilities

use crate::OutputFormat;
use anyhow::{anyhow, Result};
use console::style;
use qget_core::types::{ActiveWindow, DownloadSnapshot, QueueSnapshot, Status};
use serde::Serialize;

/// Print a confirmation line, or `value` as JSON
pub fn print_done<T: Serialize>(message: &str, value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human => println!("{} {}", style("✓").green().bold(), message),
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec.max(0.0)))
}

pub fn format_bandwidth(kib: u64) -> String {
    if kib == 0 {
        "unlimited".to_string()
    } else {
        format_speed(kib.saturating_mul(1024) as f64)
    }
}

/// Parse `HH:MM-HH:MM`
pub fn parse_window(value: &str) -> Result<ActiveWindow> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| anyhow!("window must look like HH:MM-HH:MM, got {:?}", value))?;

    let parse = |t: &str| -> Result<(u32, u32)> {
        let (h, m) = t
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid time {:?}", t))?;
        Ok((h.parse()?, m.parse()?))
    };

    ActiveWindow::from_hm(parse(start)?, parse(end)?)
        .ok_or_else(|| anyhow!("time out of range in window {:?}", value))
}

pub fn status_icon(status: Status) -> console::StyledObject<&'static str> {
    match status {
        Status::Completed => style("✓").green(),
        Status::InProgress => style("↓").cyan(),
        Status::Paused => style("⏸").yellow(),
        Status::Failed => style("✗").red(),
        Status::Cancelled => style("○").dim(),
        Status::Pending => style("·").dim(),
    }
}

pub fn print_download(download: &DownloadSnapshot, detailed: bool) {
    println!(
        "{} {} {} {} [{}]",
        status_icon(download.status),
        style(format!("#{}", download.id)).dim(),
        style(&download.output_name).bold(),
        style(format!("{:.1}%", download.progress)).dim(),
        style(download.status).dim()
    );

    if detailed {
        println!("    URL: {}", download.url);
        println!("    Queue: {}", download.queue);
        println!("    Destination: {}", download.destination.display());
        if download.total_size > 0 {
            println!(
                "    Size: {} / {}",
                format_bytes(download.downloaded),
                format_bytes(download.total_size)
            );
        }
        if !download.parts.is_empty() {
            println!("    Parts: {}", download.parts.len());
        }
        if let Some(ref error) = download.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

pub fn print_queue(queue: &QueueSnapshot) {
    let config = &queue.config;
    let state = if queue.active {
        style("active").green()
    } else {
        style("idle").dim()
    };
    println!(
        "{} {} [{}]",
        style("•").cyan(),
        style(&config.name).bold(),
        state
    );
    println!("    Path: {}", config.save_path.display());
    println!(
        "    Concurrency: {}  Retries: {}  Window: {}  Bandwidth: {}",
        config.concurrency,
        config.retries,
        config.window,
        format_bandwidth(config.bandwidth_kib)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_parse_window() {
        let window = parse_window("22:30-06:00").unwrap();
        assert_eq!(window.start, NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        assert_eq!(window.end, NaiveTime::from_hms_opt(6, 0, 0).unwrap());

        assert!(parse_window("22:30").is_err());
        assert!(parse_window("25:00-01:00").is_err());
        assert!(parse_window("aa:00-01:00").is_err());
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(0), "unlimited");
        assert!(format_bandwidth(512).ends_with("/s"));
        assert!(format_bandwidth(u64::MAX).ends_with("/s"));
    }
}
