//! Source of bucket topology.
//!
//! The core treats the provider as a black box that produces monotone-revision
//! configs and pushes a [`DcpEvent::ConfigRevision`] into the conductor's
//! event queue whenever the revision advances.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use model::bucket::BucketConfig;
use model::event::DcpEvent;
use tokio::sync::mpsc;

use crate::error::ClientError;

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Fetch a fresh config, retrying internally up to `attempts` times with
    /// `wait_between` pauses; each attempt is bounded by `timeout`.
    async fn refresh(
        &self,
        timeout: Duration,
        attempts: u32,
        wait_between: Duration,
    ) -> Result<Arc<BucketConfig>, ClientError>;

    /// The last config observed, if any.
    fn config(&self) -> Option<Arc<BucketConfig>>;

    /// Called once by the conductor so the provider can publish revision
    /// changes into the repair queue.
    fn attach_sink(&self, _sink: mpsc::UnboundedSender<DcpEvent>) {}
}

/// Provider over a topology the embedder supplies directly, typically a
/// static single-node deployment or a test harness. `update` swaps in a
/// newer revision and notifies the fixer.
pub struct FixedConfigProvider {
    current: Mutex<Arc<BucketConfig>>,
    sink: Mutex<Option<mpsc::UnboundedSender<DcpEvent>>>,
}

impl FixedConfigProvider {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            current: Mutex::new(Arc::new(config)),
            sink: Mutex::new(None),
        }
    }

    /// Install a new revision. Stale revisions are ignored.
    pub fn update(&self, config: BucketConfig) {
        let config = Arc::new(config);
        {
            let mut current = self.current.lock().unwrap();
            if config.rev <= current.rev {
                info!(
                    "Ignoring config with stale revision {} (current {})",
                    config.rev, current.rev
                );
                return;
            }
            *current = Arc::clone(&config);
        }
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            let _ = sink.send(DcpEvent::ConfigRevision { config });
        }
    }
}

#[async_trait]
impl ConfigProvider for FixedConfigProvider {
    async fn refresh(
        &self,
        _timeout: Duration,
        _attempts: u32,
        _wait_between: Duration,
    ) -> Result<Arc<BucketConfig>, ClientError> {
        Ok(Arc::clone(&self.current.lock().unwrap()))
    }

    fn config(&self) -> Option<Arc<BucketConfig>> {
        Some(Arc::clone(&self.current.lock().unwrap()))
    }

    fn attach_sink(&self, sink: mpsc::UnboundedSender<DcpEvent>) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}
