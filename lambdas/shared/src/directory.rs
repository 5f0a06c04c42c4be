//! Account directory: a short-TTL read-through cache of onboarded integrations
//!
//! Lookups never fan out into concurrent refreshes. Readers that find the
//! cache stale queue on a single refresh lock and re-check freshness once
//! they hold it, so only the first of them calls the upstream source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::models::Integration;

/// Upstream list-integrations call
#[async_trait]
pub trait IntegrationSource: Send + Sync {
    async fn list_integrations(&self) -> Result<Vec<Integration>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Integration>,
    refreshed_at: Option<DateTime<Utc>>,
}

pub struct AccountDirectory {
    source: Arc<dyn IntegrationSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
}

impl AccountDirectory {
    pub fn new(source: Arc<dyn IntegrationSource>, ttl: Duration) -> Self {
        Self::with_clock(source, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn IntegrationSource>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            state: RwLock::new(CacheState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Cached integration for an account, refreshing first if the cache has expired
    pub async fn get(&self, account_id: &str) -> Result<Option<Integration>> {
        {
            let state = self.state.read().await;
            if self.is_fresh(&state) {
                return Ok(state.entries.get(account_id).cloned());
            }
        }

        self.refresh_if_stale().await?;

        let state = self.state.read().await;
        Ok(state.entries.get(account_id).cloned())
    }

    /// Like `get`, but an unknown account is an `UnauthorizedAccount` error
    pub async fn lookup(&self, account_id: &str) -> Result<Integration> {
        self.get(account_id)
            .await?
            .ok_or_else(|| Error::UnauthorizedAccount(account_id.to_string()))
    }

    fn is_fresh(&self, state: &CacheState) -> bool {
        match state.refreshed_at {
            Some(at) => self.clock.now() - at < self.ttl,
            None => false,
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        // Another reader may have refreshed while we waited for the lock
        if self.is_fresh(&*self.state.read().await) {
            debug!("Account directory refreshed by a concurrent reader");
            return Ok(());
        }

        let integrations = self.source.list_integrations().await?;
        let entries: HashMap<String, Integration> = integrations
            .into_iter()
            .filter(|i| i.scan_enabled)
            .map(|i| (i.account_id.clone(), i))
            .collect();

        info!(account_count = entries.len(), "Refreshed account directory");

        let mut state = self.state.write().await;
        state.entries = entries;
        state.refreshed_at = Some(self.clock.now());
        Ok(())
    }
}
