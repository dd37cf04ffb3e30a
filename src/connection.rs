//! Connection Manager (§4.2): lazily connects to a primary store and an
//! optional read-only poll store, making both handles visible to callers
//! atomically once the connection attempt completes.
//!
//! A hand-rolled pending-continuation queue is unnecessary here:
//! `tokio::sync::OnceCell` already gives every concurrent caller before
//! readiness a future that resolves to the same connection attempt, with no
//! risk of a second attempt racing the first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::store::{Connect, StoreError};

struct Handles<S> {
    primary: Arc<S>,
    poll: Option<Arc<S>>,
}

pub struct ConnectionManager<S> {
    config: AdapterConfig,
    handles: OnceCell<Handles<S>>,
    closed: AtomicBool,
}

impl<S: Connect + Send + Sync + 'static> ConnectionManager<S> {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            handles: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a manager around handles that are already connected, bypassing
    /// the lazy-connect path. Used by the in-memory test fixture.
    pub fn from_handles(config: AdapterConfig, primary: Arc<S>, poll: Option<Arc<S>>) -> Self {
        let handles = OnceCell::new();
        let _ = handles.set(Handles { primary, poll });
        Self {
            config,
            handles,
            closed: AtomicBool::new(false),
        }
    }

    async fn ensure_connected(&self) -> AdapterResult<&Handles<S>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::AlreadyClosed);
        }

        let handles = self
            .handles
            .get_or_try_init(|| async {
                debug!(mongo = %redact(&self.config.mongo), "connecting to primary store");
                let primary = Arc::new(S::connect(&self.config.mongo, self.config.mongo_options.as_ref()).await?);

                let poll = match &self.config.mongo_poll {
                    Some(uri) => {
                        debug!(mongo_poll = %redact(uri), "connecting to poll store");
                        Some(Arc::new(S::connect(uri, self.config.mongo_poll_options.as_ref()).await?))
                    }
                    None => None,
                };

                Ok::<_, StoreError>(Handles { primary, poll })
            })
            .await?;

        // Re-check: close() may have raced the connect attempt.
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::AlreadyClosed);
        }

        Ok(handles)
    }

    pub async fn primary(&self) -> AdapterResult<Arc<S>> {
        Ok(self.ensure_connected().await?.primary.clone())
    }

    /// The dedicated poll handle if one is configured, else the primary
    /// handle — callers never need to special-case the no-poll-store setup.
    pub async fn poll(&self) -> AdapterResult<Arc<S>> {
        let handles = self.ensure_connected().await?;
        Ok(handles.poll.clone().unwrap_or_else(|| handles.primary.clone()))
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.config.effective_poll_delay_ms())
    }

    pub async fn close(&self) -> AdapterResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn redact(uri: &str) -> String {
    match uri.find('@') {
        Some(at) => format!("mongodb://***{}", &uri[at..]),
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn from_handles_skips_connect() {
        let manager = ConnectionManager::from_handles(
            AdapterConfig::new("memory://unused"),
            Arc::new(MemoryStore::new()),
            None,
        );
        assert!(manager.primary().await.is_ok());
    }

    #[tokio::test]
    async fn poll_falls_back_to_primary_when_unconfigured() {
        let manager = ConnectionManager::from_handles(
            AdapterConfig::new("memory://unused"),
            Arc::new(MemoryStore::new()),
            None,
        );
        assert!(manager.poll().await.is_ok());
    }

    #[tokio::test]
    async fn closed_manager_rejects_new_operations() {
        let manager = ConnectionManager::from_handles(
            AdapterConfig::new("memory://unused"),
            Arc::new(MemoryStore::new()),
            None,
        );
        manager.close().await.unwrap();
        assert!(matches!(manager.primary().await, Err(AdapterError::AlreadyClosed)));
    }
}
