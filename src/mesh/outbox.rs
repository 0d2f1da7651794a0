//! Durable store-and-forward queue.
//!
//! Entries hold the **original** packet as received; the local hop is
//! appended only at send time, so however many times an entry is retried,
//! the wire sees exactly one new hop. All mutations write through to the
//! storage adapter, and `load` rebuilds the queue after a restart.

use crate::adapters::{Clock, Storage, StoreKind};
use crate::config::RetryPolicy;
use crate::error::StorageError;
use crate::types::{DeliveryStatus, MeshPacket, OutboxEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry budget remains; the entry stays pending.
    WillRetry,
    /// Retries exhausted or the packet is no longer alive.
    Permanent,
}

/// Counts by delivery status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct Outbox {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, OutboxEntry>>,
}

impl Outbox {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            storage,
            clock,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory queue from the durable store. Returns how many
    /// entries survived the restart. Values that fail to decode are dropped
    /// from the store rather than wedging startup.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let raw = self.storage.scan(StoreKind::Outbox).await?;
        let mut entries = self.entries.lock().await;
        entries.clear();
        for (key, bytes) in raw {
            match bincode::deserialize::<OutboxEntry>(&bytes) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping undecodable outbox entry");
                    self.storage.remove(StoreKind::Outbox, &key).await?;
                }
            }
        }
        Ok(entries.len())
    }

    /// Queue a packet. Idempotent by packet id; returns whether a new entry
    /// was created.
    pub async fn add(&self, packet: MeshPacket) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(packet.id()) {
            return Ok(false);
        }
        let entry = OutboxEntry::new(packet, self.clock.now_ms());
        self.persist(&entry).await?;
        entries.insert(entry.packet.id().to_string(), entry);
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Option<OutboxEntry> {
        self.entries.lock().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<OutboxEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Pending entries, most urgent first: priority descending, then
    /// creation time ascending, then id ascending so ties are stable.
    pub async fn pending_entries(&self) -> Vec<OutboxEntry> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<OutboxEntry> = entries
            .values()
            .filter(|e| e.status == DeliveryStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.packet
                .priority()
                .cmp(&a.packet.priority())
                .then(a.created_ms.cmp(&b.created_ms))
                .then(a.packet.id().cmp(b.packet.id()))
        });
        pending
    }

    pub async fn mark_sent(&self, id: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.status = DeliveryStatus::Sent;
            entry.last_attempt_ms = self.clock.now_ms();
            let entry = entry.clone();
            self.persist(&entry).await?;
        }
        Ok(())
    }

    /// Record a failed attempt and classify it against the retry budget.
    pub async fn mark_failed(&self, id: &str) -> Result<FailureDisposition, StorageError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return Ok(FailureDisposition::Permanent);
        };
        entry.retry_count += 1;
        entry.last_attempt_ms = self.clock.now_ms();

        let limit = self.policy.limit_for(entry.packet.is_sos());
        let disposition = if entry.retry_count >= limit || !entry.packet.is_alive() {
            entry.status = DeliveryStatus::Failed;
            FailureDisposition::Permanent
        } else {
            FailureDisposition::WillRetry
        };
        let entry = entry.clone();
        self.persist(&entry).await?;
        if disposition == FailureDisposition::Permanent {
            debug!(id, retries = entry.retry_count, "outbox entry exhausted");
        }
        Ok(disposition)
    }

    pub async fn remove(&self, id: &str) -> Result<Option<OutboxEntry>, StorageError> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(id);
        if removed.is_some() {
            self.storage.remove(StoreKind::Outbox, id).await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> OutboxStats {
        let entries = self.entries.lock().await;
        let mut stats = OutboxStats::default();
        for entry in entries.values() {
            match entry.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Sent => stats.sent += 1,
                DeliveryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop sent entries older than `retention`, keeping the durable store
    /// bounded on long-running nodes. Returns how many were pruned.
    pub async fn prune_sent(&self, retention: Duration) -> Result<usize, StorageError> {
        let cutoff = self.clock.now_ms() - retention.as_millis() as i64;
        let ids: Vec<String> = {
            let entries = self.entries.lock().await;
            entries
                .values()
                .filter(|e| e.status == DeliveryStatus::Sent && e.last_attempt_ms < cutoff)
                .map(|e| e.packet.id().to_string())
                .collect()
        };
        for id in &ids {
            self.remove(id).await?;
        }
        Ok(ids.len())
    }

    async fn persist(&self, entry: &OutboxEntry) -> Result<(), StorageError> {
        let bytes = bincode::serialize(entry)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.storage
            .put(StoreKind::Outbox, entry.packet.id(), bytes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ManualClock;
    use crate::store::MemoryStorage;
    use crate::types::{PacketType, Priority};

    fn make_packet(id: &str, priority: Priority, ttl: u32) -> MeshPacket {
        MeshPacket::from_parts(
            id.into(),
            "A".into(),
            if priority == Priority::Critical {
                PacketType::Sos
            } else {
                PacketType::Data
            },
            priority,
            String::new(),
            vec!["A".into()],
            ttl,
            0,
        )
        .unwrap()
    }

    fn make_outbox() -> (Outbox, Arc<MemoryStorage>, Arc<ManualClock>) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let outbox = Outbox::new(storage.clone(), clock.clone(), RetryPolicy::default());
        (outbox, storage, clock)
    }

    #[tokio::test]
    async fn add_is_idempotent_by_id() {
        let (outbox, _, _) = make_outbox();
        let packet = make_packet("p1", Priority::Critical, 20);
        assert!(outbox.add(packet.clone()).await.unwrap());
        assert!(!outbox.add(packet).await.unwrap());
        assert_eq!(outbox.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn pending_order_priority_then_age_then_id() {
        let (outbox, _, clock) = make_outbox();
        outbox
            .add(make_packet("older-low", Priority::Low, 20))
            .await
            .unwrap();
        clock.advance(10);
        outbox
            .add(make_packet("b-crit", Priority::Critical, 20))
            .await
            .unwrap();
        outbox
            .add(make_packet("a-crit", Priority::Critical, 20))
            .await
            .unwrap();
        clock.advance(10);
        outbox
            .add(make_packet("newer-crit", Priority::Critical, 20))
            .await
            .unwrap();

        let order: Vec<String> = outbox
            .pending_entries()
            .await
            .iter()
            .map(|e| e.packet.id().to_string())
            .collect();
        // Same-tick critical entries tie-break on id.
        assert_eq!(order, ["a-crit", "b-crit", "newer-crit", "older-low"]);
    }

    #[tokio::test]
    async fn retry_budget_sos_vs_plain() {
        let (outbox, _, _) = make_outbox();
        outbox
            .add(make_packet("sos", Priority::Critical, 20))
            .await
            .unwrap();
        outbox
            .add(make_packet("data", Priority::Low, 20))
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(
                outbox.mark_failed("data").await.unwrap(),
                FailureDisposition::WillRetry
            );
        }
        assert_eq!(
            outbox.mark_failed("data").await.unwrap(),
            FailureDisposition::Permanent
        );

        for _ in 0..9 {
            assert_eq!(
                outbox.mark_failed("sos").await.unwrap(),
                FailureDisposition::WillRetry
            );
        }
        assert_eq!(
            outbox.mark_failed("sos").await.unwrap(),
            FailureDisposition::Permanent
        );

        let stats = outbox.stats().await;
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn dead_packet_fails_permanently_on_first_failure() {
        let (outbox, _, _) = make_outbox();
        outbox
            .add(make_packet("dead", Priority::Critical, 0))
            .await
            .unwrap();
        assert_eq!(
            outbox.mark_failed("dead").await.unwrap(),
            FailureDisposition::Permanent
        );
    }

    #[tokio::test]
    async fn survives_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        {
            let outbox = Outbox::new(storage.clone(), clock.clone(), RetryPolicy::default());
            outbox
                .add(make_packet("keep", Priority::High, 20))
                .await
                .unwrap();
            outbox
                .add(make_packet("done", Priority::High, 20))
                .await
                .unwrap();
            outbox.mark_sent("done").await.unwrap();
        }

        let outbox = Outbox::new(storage, clock, RetryPolicy::default());
        assert_eq!(outbox.load().await.unwrap(), 2);
        let stats = outbox.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.sent, 1);
        // The stored packet is the original: no hop was appended.
        let entry = outbox.get("keep").await.unwrap();
        assert_eq!(entry.packet.trace().len(), 1);
    }

    #[tokio::test]
    async fn prune_sent_respects_retention() {
        let (outbox, _, clock) = make_outbox();
        outbox
            .add(make_packet("old", Priority::Low, 20))
            .await
            .unwrap();
        outbox.mark_sent("old").await.unwrap();
        clock.advance(10_000);
        outbox
            .add(make_packet("fresh", Priority::Low, 20))
            .await
            .unwrap();
        outbox.mark_sent("fresh").await.unwrap();

        let pruned = outbox.prune_sent(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(outbox.get("old").await.is_none());
        assert!(outbox.get("fresh").await.is_some());
    }
}
