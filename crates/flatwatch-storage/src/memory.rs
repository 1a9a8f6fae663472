use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatwatch_core::{DeliveryRecord, Listing, Recipient};
use tokio::sync::Mutex;

use crate::state::{StoreSnapshot, StoreState};
use crate::{InsertOutcome, Store, StoreError};

/// Process-local store; used by tests and by one-off extraction runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recipients(recipients: impl IntoIterator<Item = Recipient>) -> Self {
        let snapshot = StoreSnapshot {
            recipients: recipients
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            ..StoreSnapshot::default()
        };
        Self {
            state: Mutex::new(StoreState::from_snapshot(snapshot)),
        }
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.state.lock().await.snapshot().listings.clone()
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.state.lock().await.snapshot().deliveries.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_if_absent(&self, listing: &Listing) -> Result<InsertOutcome, StoreError> {
        Ok(self.state.lock().await.insert_listing(listing.clone()))
    }

    async fn was_delivered(&self, recipient_id: &str, listing_key: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.was_delivered(recipient_id, listing_key))
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.state.lock().await.insert_delivery(record.clone());
        Ok(())
    }

    async fn count_deliveries_between(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .count_deliveries_between(recipient_id, start, end))
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        Ok(self.state.lock().await.recipients())
    }

    async fn recipient(&self, id: &str) -> Result<Option<Recipient>, StoreError> {
        Ok(self.state.lock().await.recipient(id))
    }

    async fn save_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        self.state.lock().await.save_recipient(recipient.clone());
        Ok(())
    }
}
