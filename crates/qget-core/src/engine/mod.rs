//! Download engine
//!
//! Leaf-first building blocks of a transfer:
//! - Token bucket bandwidth limiting shared across a queue activation
//! - Parts that fetch one byte range each into a temporary file
//! - Downloads that fan out over their parts and merge the results

mod download;
mod part;
mod rate_limiter;

pub use download::*;
pub use part::*;
pub use rate_limiter::*;

use crate::error::Result;
use qget_types::{CoreEvent, EngineSettings};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Handles shared by every queue and download of one manager
#[derive(Clone)]
pub struct EngineContext {
    pub client: Client,
    pub settings: Arc<EngineSettings>,
    pub events: broadcast::Sender<CoreEvent>,
}

impl EngineContext {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        // No overall timeout: a part may stream for hours
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        let (events, _) = broadcast::channel(1000);

        Ok(Self {
            client,
            settings: Arc::new(settings),
            events,
        })
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }
}
