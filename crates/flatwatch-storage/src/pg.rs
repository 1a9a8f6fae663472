use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatwatch_core::{DeliveryRecord, Listing, Recipient};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{InsertOutcome, Store, StoreError};

/// Postgres-backed store. Uniqueness lives in the schema: `listings` is unique on
/// `(source, external_id)` and on `content_hash`, `deliveries` on `(recipient_id, listing_key)`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_if_absent(&self, listing: &Listing) -> Result<InsertOutcome, StoreError> {
        let external_id = Some(listing.external_id.trim()).filter(|id| !id.is_empty());
        let result = sqlx::query(
            r#"
            INSERT INTO listings
                (source, external_id, content_hash, title, price, size, rooms, location,
                 description, url, date_posted, date_found)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(listing.source.as_str())
        .bind(external_id)
        .bind(&listing.content_hash)
        .bind(&listing.title)
        .bind(listing.price)
        .bind(listing.size)
        .bind(&listing.rooms)
        .bind(&listing.location)
        .bind(&listing.description)
        .bind(&listing.url)
        .bind(listing.date_posted)
        .bind(listing.date_found)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        })
    }

    async fn was_delivered(&self, recipient_id: &str, listing_key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM deliveries WHERE recipient_id = $1 AND listing_key = $2
            ) AS delivered
            "#,
        )
        .bind(recipient_id)
        .bind(listing_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("delivered")?)
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (recipient_id, listing_key, sent_at, channel, message_ref)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (recipient_id, listing_key) DO NOTHING
            "#,
        )
        .bind(&record.recipient_id)
        .bind(&record.listing_key)
        .bind(record.sent_at)
        .bind(&record.channel_outcome.channel)
        .bind(&record.channel_outcome.message_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_deliveries_between(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS sent
              FROM deliveries
             WHERE recipient_id = $1
               AND sent_at >= $2
               AND sent_at < $3
            "#,
        )
        .bind(recipient_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        let sent: i64 = row.try_get("sent")?;
        Ok(u32::try_from(sent).unwrap_or(u32::MAX))
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let rows = sqlx::query("SELECT document FROM recipients ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(recipient): Json<Recipient> = row.try_get("document")?;
            out.push(recipient);
        }
        Ok(out)
    }

    async fn recipient(&self, id: &str) -> Result<Option<Recipient>, StoreError> {
        let row = sqlx::query("SELECT document FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(recipient): Json<Recipient> = row.try_get("document")?;
                Ok(Some(recipient))
            }
            None => Ok(None),
        }
    }

    async fn save_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recipients (id, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
               SET document = EXCLUDED.document,
                   updated_at = NOW()
            "#,
        )
        .bind(&recipient.id)
        .bind(Json(recipient))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
