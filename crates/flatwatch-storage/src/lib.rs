//! Persistence and page-fetch collaborators for flatwatch.
//!
//! The [`Store`] trait is the only way the cycle engine touches durable state. Listing
//! inserts and delivery records are idempotent: a duplicate is reported, never raised.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatwatch_core::{DeliveryRecord, Listing, Recipient};
use thiserror::Error;

pub mod fetch;
pub mod file;
pub mod health;
pub mod memory;
pub mod pg;
mod state;

pub use fetch::{
    FetchError, FetchedPage, HttpClientConfig, HttpFetcher, PageFetcher, RetryPolicy, SourcePacer,
};
pub use file::FileStore;
pub use health::{HealthDetector, PageHealth};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use state::StoreSnapshot;

pub const CRATE_NAME: &str = "flatwatch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Durable listings, delivery records and recipient documents.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a listing unless its `(source, external_id)` or its content hash is already known.
    async fn insert_if_absent(&self, listing: &Listing) -> Result<InsertOutcome, StoreError>;

    async fn was_delivered(&self, recipient_id: &str, listing_key: &str) -> Result<bool, StoreError>;

    /// Record a confirmed send. Recording the same `(recipient_id, listing_key)` twice is a no-op.
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    /// Deliveries for a recipient with `start <= sent_at < end`.
    async fn count_deliveries_between(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// All recipients, ordered by id.
    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError>;

    async fn recipient(&self, id: &str) -> Result<Option<Recipient>, StoreError>;

    async fn save_recipient(&self, recipient: &Recipient) -> Result<(), StoreError>;
}
