//! Typed stores over the key-value persistence collaborator.
//!
//! Mutation is read-modify-write atomic per organization: each store keeps
//! a per-org async mutex so interleaved actions never observe stale state.
//! Different organizations never contend.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::shared::models::{OrganizationConfig, TicketArchive, TicketMetadata};
use crate::storage::{KvStore, StoreError};

const CONFIGS: &str = "configs";
const TICKETS: &str = "tickets";
const ARCHIVES: &str = "archives";

const CONFIG_RECORD: &str = "config";

#[derive(Default)]
struct OrgLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OrgLocks {
    async fn acquire(&self, org: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(org.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Organization configuration records, including the monotonically
/// increasing ticket counter.
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
    locks: OrgLocks,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: OrgLocks::default(),
        }
    }

    pub async fn load(&self, org: &str) -> Result<Option<OrganizationConfig>, StoreError> {
        match self.kv.get(CONFIGS, org, CONFIG_RECORD).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, org: &str, config: &OrganizationConfig) -> Result<(), StoreError> {
        self.kv.put(CONFIGS, org, CONFIG_RECORD, encode(config)?).await
    }

    /// Read-modify-write under the per-org lock. Returns `None` when the
    /// organization has no stored config.
    pub async fn update<F>(&self, org: &str, f: F) -> Result<Option<OrganizationConfig>, StoreError>
    where
        F: FnOnce(&mut OrganizationConfig),
    {
        let _guard = self.locks.acquire(org).await;
        let Some(mut config) = self.load(org).await? else {
            return Ok(None);
        };
        f(&mut config);
        self.save(org, &config).await?;
        Ok(Some(config))
    }

    /// Allocate the next ticket id from the organization counter.
    pub async fn allocate_ticket_id(&self, org: &str) -> Result<Option<u64>, StoreError> {
        let updated = self.update(org, |config| config.ticket_counter += 1).await?;
        Ok(updated.map(|config| config.ticket_counter))
    }
}

/// Live ticket metadata keyed by (organization, channel).
pub struct TicketStore {
    kv: Arc<dyn KvStore>,
    locks: OrgLocks,
}

impl TicketStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: OrgLocks::default(),
        }
    }

    pub async fn get(&self, org: &str, channel_id: &str) -> Result<Option<TicketMetadata>, StoreError> {
        match self.kv.get(TICKETS, org, channel_id).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, org: &str, meta: &TicketMetadata) -> Result<(), StoreError> {
        self.kv
            .put(TICKETS, org, &meta.channel_id, encode(meta)?)
            .await
    }

    pub async fn delete(&self, org: &str, channel_id: &str) -> Result<(), StoreError> {
        self.kv.delete(TICKETS, org, channel_id).await
    }

    /// Read-modify-write under the per-org lock; `None` when the channel
    /// has no metadata record.
    pub async fn update<F>(
        &self,
        org: &str,
        channel_id: &str,
        f: F,
    ) -> Result<Option<TicketMetadata>, StoreError>
    where
        F: FnOnce(&mut TicketMetadata),
    {
        let _guard = self.locks.acquire(org).await;
        let Some(mut meta) = self.get(org, channel_id).await? else {
            return Ok(None);
        };
        f(&mut meta);
        self.put(org, &meta).await?;
        Ok(Some(meta))
    }
}

/// Write-once archive records keyed by (organization, ticket id),
/// independent of the live metadata so they survive channel destruction.
pub struct ArchiveStore {
    kv: Arc<dyn KvStore>,
}

impl ArchiveStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn put(&self, org: &str, archive: &TicketArchive) -> Result<(), StoreError> {
        self.kv
            .put(ARCHIVES, org, &archive.ticket_id.to_string(), encode(archive)?)
            .await
    }

    pub async fn get(&self, org: &str, ticket_id: u64) -> Result<Option<TicketArchive>, StoreError> {
        match self.kv.get(ARCHIVES, org, &ticket_id.to_string()).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }
}
