//! Access gate and the administrative commands that change a recipient's access.

use chrono::{DateTime, Duration, Utc};
use flatwatch_core::{AccessMode, Recipient, RecipientAccessState, SearchTarget, SUBSCRIPTION_DAYS, TRIAL_DAYS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AccessCommand {
    /// Replace the recipient's targets and restart its cadence.
    AssignTargets {
        targets: Vec<SearchTarget>,
        #[serde(default)]
        mode: Option<AccessMode>,
    },
    GrantSubscription {
        #[serde(default)]
        days: Option<i64>,
    },
    Revoke,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("recipient {0} already converted to a subscription; a trial cannot be granted")]
    TrialAfterConversion(String),
    #[error("subscription length must be at least one day, got {0}")]
    InvalidDuration(i64),
}

pub fn has_access(access: &RecipientAccessState, now: DateTime<Utc>) -> bool {
    let window = match access.access_mode {
        AccessMode::Trial => access.trial_expires_at,
        AccessMode::Subscription => access.subscription_expires_at,
    };
    window.is_some_and(|expires_at| now <= expires_at)
}

/// True once a trial has lapsed and the recipient was not told yet.
pub fn trial_notice_due(access: &RecipientAccessState, now: DateTime<Utc>) -> bool {
    access.access_mode == AccessMode::Trial
        && !access.trial_expired_notified
        && access.trial_expires_at.is_some_and(|expires_at| now > expires_at)
}

pub fn trial_expired_message(support_contact: &str) -> String {
    format!(
        "Your free trial has ended, so no further listings will be sent.\n\
         To keep receiving new listings, please contact {support_contact} to get a subscription."
    )
}

pub fn apply(recipient: &mut Recipient, command: AccessCommand, now: DateTime<Utc>) -> Result<(), AccessError> {
    let access = &mut recipient.access;
    match command {
        AccessCommand::AssignTargets { targets, mode } => {
            match mode {
                Some(AccessMode::Trial) => {
                    if access.converted_at.is_some() {
                        return Err(AccessError::TrialAfterConversion(recipient.id.clone()));
                    }
                    if access.trial_started_at.is_none() {
                        access.access_mode = AccessMode::Trial;
                        access.trial_started_at = Some(now);
                        access.trial_expires_at = Some(now + Duration::days(TRIAL_DAYS));
                        access.trial_expired_notified = false;
                    }
                }
                Some(AccessMode::Subscription) => convert(access, now),
                None => {}
            }
            recipient.targets = targets;
            access.last_cycle_at = None;
            access.next_due_at = None;
        }
        AccessCommand::GrantSubscription { days } => {
            let days = days.unwrap_or(SUBSCRIPTION_DAYS);
            if days < 1 {
                return Err(AccessError::InvalidDuration(days));
            }
            convert(access, now);
            access.subscription_expires_at = Some(now + Duration::days(days));
        }
        AccessCommand::Revoke => {
            access.subscription_expires_at = None;
        }
    }
    Ok(())
}

fn convert(access: &mut RecipientAccessState, now: DateTime<Utc>) {
    access.access_mode = AccessMode::Subscription;
    access.trial_started_at = None;
    access.trial_expires_at = None;
    access.trial_expired_notified = false;
    access.converted_at.get_or_insert(now);
}
