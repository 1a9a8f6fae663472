use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatwatch_core::{DeliveryRecord, Listing, Recipient};
use fs2::FileExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::state::{StoreSnapshot, StoreState};
use crate::{InsertOutcome, Store, StoreError};

/// Store persisted as one JSON document, shared by every process that opens the same path.
///
/// The file is the only copy of the state. Each operation takes an advisory lock on a sibling
/// `.lock` file and re-reads the snapshot, so writes from another process (an admin command next
/// to a running daemon) are seen and never overwritten. A mutation is applied to the freshly
/// loaded state and written through a temp file and an atomic rename; if the write fails nothing
/// changes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    serial: Mutex<()>,
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

impl FileStore {
    /// Open the snapshot at `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let store = Self {
            lock_path: path.with_file_name(lock_name),
            path,
            serial: Mutex::new(()),
        };
        let snapshot = store.read(|state| state.snapshot().clone()).await?;
        debug!(
            path = %store.path.display(),
            listings = snapshot.listings.len(),
            recipients = snapshot.recipients.len(),
            "opened file store"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Blocks until the advisory lock is held. It is released when the returned file is dropped.
    async fn lock(&self, mode: LockMode) -> Result<std::fs::File, StoreError> {
        let dir = self.dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|err| StoreError::io(&lock_path, err))?;
            let locked = match mode {
                LockMode::Shared => FileExt::lock_shared(&file),
                LockMode::Exclusive => FileExt::lock_exclusive(&file),
            };
            locked.map_err(|err| StoreError::io(&lock_path, err))?;
            Ok(file)
        })
        .await
        .map_err(|err| StoreError::io(&self.lock_path, std::io::Error::other(err)))?
    }

    async fn load(&self) -> Result<StoreState, StoreError> {
        let snapshot = match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<StoreSnapshot>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        Ok(StoreState::from_snapshot(snapshot))
    }

    async fn read<R>(&self, query: impl FnOnce(&StoreState) -> R) -> Result<R, StoreError> {
        let _serial = self.serial.lock().await;
        let _lock = self.lock(LockMode::Shared).await?;
        let state = self.load().await?;
        Ok(query(&state))
    }

    /// Run `mutate` against the current file content and persist when it reports a change.
    async fn update<R>(&self, mutate: impl FnOnce(&mut StoreState) -> (R, bool)) -> Result<R, StoreError> {
        let _serial = self.serial.lock().await;
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut state = self.load().await?;
        let (result, changed) = mutate(&mut state);
        if changed {
            self.persist(state.snapshot()).await?;
        }
        Ok(result)
    }

    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let dir = self.dir();
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(&temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn insert_if_absent(&self, listing: &Listing) -> Result<InsertOutcome, StoreError> {
        self.update(|state| {
            let outcome = state.insert_listing(listing.clone());
            (outcome, outcome == InsertOutcome::Inserted)
        })
        .await
    }

    async fn was_delivered(&self, recipient_id: &str, listing_key: &str) -> Result<bool, StoreError> {
        self.read(|state| state.was_delivered(recipient_id, listing_key))
            .await
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.update(|state| ((), state.insert_delivery(record.clone())))
            .await
    }

    async fn count_deliveries_between(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.read(|state| state.count_deliveries_between(recipient_id, start, end))
            .await
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        self.read(StoreState::recipients).await
    }

    async fn recipient(&self, id: &str) -> Result<Option<Recipient>, StoreError> {
        self.read(|state| state.recipient(id)).await
    }

    async fn save_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        self.update(|state| {
            state.save_recipient(recipient.clone());
            ((), true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flatwatch_core::{ChannelOutcome, SearchTarget, Source};
    use tempfile::tempdir;

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("flatwatch.json");
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap();

        {
            let store = FileStore::open(&path).await.expect("open");
            let mut recipient = Recipient::new("1001");
            recipient
                .targets
                .push(SearchTarget::new("https://www.kleinanzeigen.de/s-wohnung-mieten/c203"));
            store.save_recipient(&recipient).await.expect("save recipient");
            store
                .insert_if_absent(&Listing {
                    source: Source::Kleinanzeigen,
                    external_id: "2874410023".to_string(),
                    content_hash: "f00d".to_string(),
                    title: "Single-Apartment".to_string(),
                    price: Some(540),
                    size: Some(31),
                    rooms: Some("1".to_string()),
                    location: None,
                    description: String::new(),
                    url: "https://www.kleinanzeigen.de/s-anzeige/single/2874410023-203-4888"
                        .to_string(),
                    date_posted: Some(now),
                    date_found: now,
                })
                .await
                .expect("insert");
            store
                .record_delivery(&DeliveryRecord {
                    recipient_id: "1001".to_string(),
                    listing_key: "2874410023".to_string(),
                    sent_at: now,
                    channel_outcome: ChannelOutcome {
                        channel: "console".to_string(),
                        message_ref: None,
                    },
                })
                .await
                .expect("record");
        }

        let reopened = FileStore::open(&path).await.expect("reopen");
        assert!(reopened.was_delivered("1001", "2874410023").await.unwrap());
        let recipient = reopened.recipient("1001").await.unwrap().expect("recipient");
        assert_eq!(recipient.targets.len(), 1);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path().join("absent.json")).await.expect("open");
        assert!(store.recipients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_from_another_handle_are_seen_and_kept() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("flatwatch.json");
        let daemon = FileStore::open(&path).await.expect("daemon open");
        let admin = FileStore::open(&path).await.expect("admin open");

        daemon.save_recipient(&Recipient::new("7")).await.expect("daemon save");
        admin.save_recipient(&Recipient::new("42")).await.expect("admin save");
        assert!(daemon.recipient("42").await.unwrap().is_some());

        let mut seven = daemon.recipient("7").await.unwrap().expect("seven");
        seven.display_name = Some("Jonas".to_string());
        daemon.save_recipient(&seven).await.expect("daemon save again");

        let reopened = FileStore::open(&path).await.expect("reopen");
        let ids: Vec<_> = reopened
            .recipients()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["42", "7"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        let path = state_dir.join("flatwatch.json");
        let store = FileStore::open(&path).await.expect("open");
        store.save_recipient(&Recipient::new("7")).await.expect("save");

        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        let read_only = std::fs::write(state_dir.join(".writable"), b"").is_err();
        let result = store.save_recipient(&Recipient::new("8")).await;
        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        // running as root ignores directory permissions
        if read_only {
            assert!(result.is_err());
            assert!(store.recipient("8").await.unwrap().is_none());
            assert!(store.recipient("7").await.unwrap().is_some());
        }
    }
}
