use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use flatwatch_core::{DeliveryRecord, Listing, Recipient, Source};
use serde::{Deserialize, Serialize};

use crate::InsertOutcome;

/// Serializable content of the in-process stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub deliveries: Vec<DeliveryRecord>,
    #[serde(default)]
    pub recipients: BTreeMap<String, Recipient>,
}

/// Snapshot plus the lookup indices rebuilt from it.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    snapshot: StoreSnapshot,
    ids: HashSet<(Source, String)>,
    hashes: HashSet<String>,
    delivered: HashSet<(String, String)>,
}

impl StoreState {
    pub(crate) fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = Self::default();
        for listing in snapshot.listings {
            state.insert_listing(listing);
        }
        for record in snapshot.deliveries {
            state.insert_delivery(record);
        }
        state.snapshot.recipients = snapshot.recipients;
        state
    }

    pub(crate) fn snapshot(&self) -> &StoreSnapshot {
        &self.snapshot
    }

    pub(crate) fn insert_listing(&mut self, listing: Listing) -> InsertOutcome {
        let id_key = (!listing.external_id.trim().is_empty())
            .then(|| (listing.source, listing.external_id.clone()));
        let known_id = id_key.as_ref().is_some_and(|key| self.ids.contains(key));
        if known_id || self.hashes.contains(&listing.content_hash) {
            return InsertOutcome::AlreadyPresent;
        }
        if let Some(key) = id_key {
            self.ids.insert(key);
        }
        self.hashes.insert(listing.content_hash.clone());
        self.snapshot.listings.push(listing);
        InsertOutcome::Inserted
    }

    pub(crate) fn was_delivered(&self, recipient_id: &str, listing_key: &str) -> bool {
        self.delivered
            .contains(&(recipient_id.to_string(), listing_key.to_string()))
    }

    /// Returns false when the pair was already recorded.
    pub(crate) fn insert_delivery(&mut self, record: DeliveryRecord) -> bool {
        let key = (record.recipient_id.clone(), record.listing_key.clone());
        if !self.delivered.insert(key) {
            return false;
        }
        self.snapshot.deliveries.push(record);
        true
    }

    pub(crate) fn count_deliveries_between(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> u32 {
        let count = self
            .snapshot
            .deliveries
            .iter()
            .filter(|r| r.recipient_id == recipient_id && r.sent_at >= start && r.sent_at < end)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub(crate) fn recipients(&self) -> Vec<Recipient> {
        self.snapshot.recipients.values().cloned().collect()
    }

    pub(crate) fn recipient(&self, id: &str) -> Option<Recipient> {
        self.snapshot.recipients.get(id).cloned()
    }

    pub(crate) fn save_recipient(&mut self, recipient: Recipient) {
        self.snapshot
            .recipients
            .insert(recipient.id.clone(), recipient);
    }
}
