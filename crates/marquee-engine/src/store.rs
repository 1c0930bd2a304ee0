use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use marquee_core::context::PendingContext;
use marquee_core::errors::StoreError;
use marquee_core::ids::UserId;

/// Expiry settings for pending contexts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl ContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

pub type ContextUpdate = Box<dyn FnOnce(&mut PendingContext) + Send>;

/// Per-user pending disambiguation state.
///
/// Readers never see an inactive or expired context: `get` and `update`
/// treat both exactly like a missing one.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, user: &UserId) -> Option<PendingContext>;

    /// Replace any context the user had.
    async fn set(&self, user: &UserId, context: PendingContext) -> Result<(), StoreError>;

    /// Mutate a live context in place, keeping `created_at`. Returns false
    /// when there is no live context.
    async fn update(&self, user: &UserId, f: ContextUpdate) -> Result<bool, StoreError>;

    async fn clear(&self, user: &UserId) -> Result<(), StoreError>;

    /// Drop every expired or inactive context. Returns how many went.
    async fn sweep(&self) -> usize;

    fn is_expired(&self, context: &PendingContext) -> bool;
}

pub struct MemoryContextStore {
    entries: DashMap<UserId, PendingContext>,
    ttl: chrono::Duration,
}

impl MemoryContextStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.ttl())
    }

    /// Number of stored entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, context: &PendingContext) -> bool {
        context.active && !self.is_expired(context)
    }
}

impl Default for MemoryContextStore {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, user: &UserId) -> Option<PendingContext> {
        let entry = self.entries.get(user)?;
        self.is_live(entry.value()).then(|| entry.value().clone())
    }

    async fn set(&self, user: &UserId, context: PendingContext) -> Result<(), StoreError> {
        debug!(user_id = %user, kind = context.kind().as_str(), "context stored");
        self.entries.insert(user.clone(), context);
        Ok(())
    }

    async fn update(&self, user: &UserId, f: ContextUpdate) -> Result<bool, StoreError> {
        let Some(mut entry) = self.entries.get_mut(user) else {
            return Ok(false);
        };
        if !self.is_live(entry.value()) {
            return Ok(false);
        }
        let created_at = entry.created_at;
        f(entry.value_mut());
        entry.created_at = created_at;
        Ok(true)
    }

    async fn clear(&self, user: &UserId) -> Result<(), StoreError> {
        if self.entries.remove(user).is_some() {
            debug!(user_id = %user, "context cleared");
        }
        Ok(())
    }

    async fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, context| self.is_live(context));
        before.saturating_sub(self.entries.len())
    }

    fn is_expired(&self, context: &PendingContext) -> bool {
        Utc::now().signed_duration_since(context.created_at) > self.ttl
    }
}

/// Periodically sweep expired contexts until `cancel` fires.
pub fn start_sweep_task(
    store: Arc<dyn ContextStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.sweep().await;
                    if removed > 0 {
                        info!(removed, "expired contexts swept");
                    }
                }
            }
        }
    })
}
