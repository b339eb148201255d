//! Free-tier usage ledger
//!
//! Persistent per-user counters keyed by ISO week epoch, read-modified-
//! written against a key-value store on every metered call.
//!
//! The store offers no compare-and-swap, so two concurrent requests from
//! one user can both read the same pre-increment count and both write back
//! count+1, losing an increment. This under-bills and is accepted rather
//! than serialized away; writes are best-effort and never retract an
//! already-returned response.

use crate::utils::week::current_week_epoch;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-user usage record, stored as an opaque JSON blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(rename = "conversationCount", default)]
    pub conversation_count: u32,
    #[serde(rename = "imageCount", default)]
    pub image_count: u32,
    /// Lifetime-scoped credits; the one field that survives week rollover
    #[serde(rename = "bonusCredits", default)]
    pub bonus_credits: u32,
    /// ISO week epoch this record's counters belong to
    pub week: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

impl UsageRecord {
    /// Fresh zeroed record under the given week epoch
    fn new(week: String) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            conversation_count: 0,
            image_count: 0,
            bonus_credits: 0,
            week,
            created_at: now,
            last_updated: now,
        }
    }
}

/// Key-value persistence for usage records.
///
/// The production store is an external service; tests and single-node
/// deployments use [`MemoryStore`].
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Weekly quota limits for the free tier
#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub weekly_conversations: u32,
    pub weekly_images: u32,
}

/// Ledger over a usage store
pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
    limits: QuotaLimits,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>, limits: QuotaLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Load the record for a user, creating a zeroed one if absent.
    ///
    /// A record stored under a different week epoch is reset to zero
    /// counts; `bonusCredits` is carried forward unchanged.
    pub async fn load(&self, user_id: &str) -> Result<UsageRecord> {
        let week = current_week_epoch();
        let key = record_key(user_id);

        let record = match self.store.get(&key).await? {
            Some(raw) => match serde_json::from_str::<UsageRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Corrupt usage record for {}, resetting: {}", user_id, e);
                    UsageRecord::new(week.clone())
                }
            },
            None => {
                debug!("Creating usage record for {}", user_id);
                let record = UsageRecord::new(week.clone());
                self.persist(&key, &record).await;
                return Ok(record);
            }
        };

        if record.week != week {
            info!(
                "Week rollover for {} ({} -> {}), resetting counters",
                user_id, record.week, week
            );
            let mut reset = UsageRecord::new(week);
            reset.bonus_credits = record.bonus_credits;
            reset.created_at = record.created_at;
            self.persist(&key, &reset).await;
            return Ok(reset);
        }

        Ok(record)
    }

    /// Conversations still allowed this week (weekly limit plus lifetime
    /// bonus credits)
    pub fn remaining_conversations(&self, record: &UsageRecord) -> u32 {
        (self.limits.weekly_conversations + record.bonus_credits)
            .saturating_sub(record.conversation_count)
    }

    /// Images still allowed this week
    pub fn remaining_images(&self, record: &UsageRecord) -> u32 {
        self.limits.weekly_images.saturating_sub(record.image_count)
    }

    /// Count one conversation against the user's quota.
    ///
    /// Read-modify-write; see the module docs for the accepted race.
    pub async fn record_conversation(&self, user_id: &str) -> Result<UsageRecord> {
        let mut record = self.load(user_id).await?;
        record.conversation_count += 1;
        record.last_updated = Utc::now().timestamp_millis();
        self.persist(&record_key(user_id), &record).await;
        Ok(record)
    }

    /// Count one generated image against the user's quota
    pub async fn record_image(&self, user_id: &str) -> Result<UsageRecord> {
        let mut record = self.load(user_id).await?;
        record.image_count += 1;
        record.last_updated = Utc::now().timestamp_millis();
        self.persist(&record_key(user_id), &record).await;
        Ok(record)
    }

    /// Grant lifetime bonus credits (redeem codes, purchases)
    pub async fn grant_bonus(&self, user_id: &str, amount: u32) -> Result<UsageRecord> {
        let mut record = self.load(user_id).await?;
        record.bonus_credits += amount;
        record.last_updated = Utc::now().timestamp_millis();
        self.persist(&record_key(user_id), &record).await;
        info!(
            "Granted {} bonus credits to {} (total {})",
            amount, user_id, record.bonus_credits
        );
        Ok(record)
    }

    /// Best-effort write; a failure is logged, never surfaced
    async fn persist(&self, key: &str, record: &UsageRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize usage record: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.put(key, raw).await {
            warn!("Usage ledger write failed for {}: {}", key, e);
        }
    }
}

fn record_key(user_id: &str) -> String {
    format!("usage:{}", user_id)
}
