//! Token bucket bandwidth limiter shared by every part of a queue activation
//!
//! A background ticker pushes tokens into a bounded channel at the configured rate.
//! Each token authorizes one chunk-sized read, so the average throughput
//! converges to the configured rate with jitter bounded by one chunk.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fastest ticker period; higher rates put several tokens in each tick
const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(3600);
/// Most tokens a bucket holds, and most issued by one tick
const MAX_BUCKET: usize = 4096;

/// Bandwidth limiter scoped to one queue activation
///
/// Cloning is cheap and every clone draws from the same bucket.
#[derive(Clone)]
pub struct BandwidthLimiter {
    /// KiB per second, 0 = unlimited
    rate_kib: u64,
    tokens: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    stop: CancellationToken,
}

impl BandwidthLimiter {
    /// Create a limiter issuing `rate_kib` KiB/s worth of `chunk_size` tokens.
    ///
    /// Token issuance ends as soon as `stop` is cancelled. Must be called
    /// from inside a tokio runtime when `rate_kib > 0`.
    pub fn new(rate_kib: u64, chunk_size: usize, stop: CancellationToken) -> Self {
        if rate_kib == 0 {
            return Self {
                rate_kib,
                tokens: None,
                stop,
            };
        }

        let schedule = Schedule::new(rate_kib, chunk_size);
        let (tx, rx) = mpsc::channel(schedule.capacity);
        let ticker_stop = stop.clone();

        debug!(
            "Bandwidth limiter: {} KiB/s, {:.2} tokens every {:?}, bucket of {}",
            rate_kib, schedule.per_tick, schedule.period, schedule.capacity
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(schedule.period);
            let mut credit = 0.0;
            'ticks: loop {
                tokio::select! {
                    _ = ticker_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        credit += schedule.per_tick;
                        while credit >= 1.0 {
                            match tx.try_send(()) {
                                Ok(()) => credit -= 1.0,
                                // A full bucket drops the rest of the tick
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    credit = 0.0;
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break 'ticks,
                            }
                        }
                    }
                }
            }
        });

        Self {
            rate_kib,
            tokens: Some(Arc::new(Mutex::new(rx))),
            stop,
        }
    }

    /// A limiter that never blocks
    pub fn unlimited() -> Self {
        Self::new(0, 1, CancellationToken::new())
    }

    pub fn rate_kib(&self) -> u64 {
        self.rate_kib
    }

    /// Wait until one chunk may be read.
    ///
    /// Returns immediately when unlimited, and once the stop signal fires.
    pub async fn wait_for_token(&self) {
        let Some(tokens) = &self.tokens else {
            return;
        };

        let mut rx = tokens.lock().await;
        tokio::select! {
            _ = rx.recv() => {}
            _ = self.stop.cancelled() => {}
        }
    }
}

/// How often the ticker fires and how many tokens each tick is worth
#[derive(Debug)]
struct Schedule {
    period: Duration,
    per_tick: f64,
    capacity: usize,
}

impl Schedule {
    fn new(rate_kib: u64, chunk_size: usize) -> Self {
        let tokens_per_sec = rate_kib.saturating_mul(1024) as f64 / chunk_size.max(1) as f64;
        let exact = Duration::try_from_secs_f64(1.0 / tokens_per_sec).unwrap_or(MAX_PERIOD);
        let period = exact.clamp(MIN_PERIOD, MAX_PERIOD);
        let per_tick = if period == exact {
            1.0
        } else {
            (tokens_per_sec * period.as_secs_f64()).min(MAX_BUCKET as f64)
        };
        let capacity = (tokens_per_sec.floor() as usize).clamp(1, MAX_BUCKET);

        Self {
            period,
            per_tick,
            capacity,
        }
    }
}
