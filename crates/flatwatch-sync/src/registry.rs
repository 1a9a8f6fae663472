//! Recipient import from YAML and stored access changes.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flatwatch_core::{AccessMode, Recipient, SearchTarget};
use flatwatch_storage::Store;
use serde::Deserialize;
use tracing::info;

use crate::access::{self, AccessCommand};
use crate::SyncError;

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientFile {
    pub recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientEntry {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub targets: Vec<SearchTarget>,
    #[serde(default)]
    pub mode: Option<AccessMode>,
    /// Grants a subscription of this many days after the targets are assigned.
    #[serde(default)]
    pub subscription_days: Option<i64>,
    #[serde(default)]
    pub daily_cap: Option<u32>,
}

impl RecipientEntry {
    pub fn commands(&self) -> Vec<AccessCommand> {
        let mut commands = vec![AccessCommand::AssignTargets {
            targets: self.targets.clone(),
            mode: self.mode,
        }];
        if let Some(days) = self.subscription_days {
            commands.push(AccessCommand::GrantSubscription { days: Some(days) });
        }
        commands
    }
}

pub fn load_recipient_file(path: &Path) -> Result<RecipientFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Load or create a recipient, apply `command` and save it.
pub async fn apply_access(
    store: &dyn Store,
    recipient_id: &str,
    command: AccessCommand,
    now: DateTime<Utc>,
) -> Result<Recipient, SyncError> {
    let mut recipient = store
        .recipient(recipient_id)
        .await?
        .unwrap_or_else(|| Recipient::new(recipient_id));
    access::apply(&mut recipient, command, now)?;
    store.save_recipient(&recipient).await?;
    Ok(recipient)
}

/// Create or update every recipient in `file`. Returns how many were written.
pub async fn import_recipients(store: &dyn Store, file: &RecipientFile, now: DateTime<Utc>) -> Result<usize, SyncError> {
    for entry in &file.recipients {
        let mut recipient = store
            .recipient(&entry.id)
            .await?
            .unwrap_or_else(|| Recipient::new(entry.id.clone()));
        if entry.display_name.is_some() {
            recipient.display_name = entry.display_name.clone();
        }
        if entry.daily_cap.is_some() {
            recipient.access.daily_cap = entry.daily_cap;
        }
        for command in entry.commands() {
            access::apply(&mut recipient, command, now)?;
        }
        store.save_recipient(&recipient).await?;
        info!(recipient_id = %recipient.id, targets = recipient.targets.len(), "recipient imported");
    }
    Ok(file.recipients.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use flatwatch_storage::MemoryStore;
    use std::io::Write;

    const YAML: &str = r#"
recipients:
  - id: "100200300"
    display_name: Lena
    mode: trial
    targets:
      - url: https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888
        location_filters: [Bessungen, "64283"]
        criteria:
          max_price: 1200
          excluded_keywords: [tausch]
  - id: "-100777"
    subscription_days: 90
    daily_cap: 20
    targets:
      - url: https://www.immowelt.de/classified-search?distributionTypes=Rent&locations=AD08DE6345
"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn import_creates_recipients_with_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipients.yaml");
        std::fs::File::create(&path).unwrap().write_all(YAML.as_bytes()).unwrap();

        let file = load_recipient_file(&path).unwrap();
        let store = MemoryStore::new();
        assert_eq!(import_recipients(&store, &file, now()).await.unwrap(), 2);

        let trial = store.recipient("100200300").await.unwrap().unwrap();
        assert_eq!(trial.access.access_mode, AccessMode::Trial);
        assert_eq!(trial.access.trial_expires_at, Some(now() + Duration::days(14)));
        assert_eq!(trial.targets[0].location_filters, vec!["Bessungen", "64283"]);
        assert_eq!(trial.targets[0].criteria.max_price, Some(1200));

        let group = store.recipient("-100777").await.unwrap().unwrap();
        assert_eq!(group.access.access_mode, AccessMode::Subscription);
        assert_eq!(group.access.subscription_expires_at, Some(now() + Duration::days(90)));
        assert_eq!(group.access.daily_cap, Some(20));
    }

    #[tokio::test]
    async fn reimport_keeps_the_first_trial() {
        let file: RecipientFile = serde_yaml::from_str(YAML).unwrap();
        let store = MemoryStore::new();
        import_recipients(&store, &file, now()).await.unwrap();
        import_recipients(&store, &file, now() + Duration::days(3)).await.unwrap();
        let trial = store.recipient("100200300").await.unwrap().unwrap();
        assert_eq!(trial.access.trial_expires_at, Some(now() + Duration::days(14)));
    }

    #[test]
    fn missing_file_is_an_error_with_context() {
        let err = load_recipient_file(Path::new("/nonexistent/recipients.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading /nonexistent/recipients.yaml"));
    }
}
