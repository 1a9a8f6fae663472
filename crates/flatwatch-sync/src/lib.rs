//! Cycle orchestration for flatwatch.
//!
//! A cycle fetches every distinct search target once, stores the extracted listings and fans
//! them out to each recipient that has access, is due, has budget left and has not seen them.

use flatwatch_adapters::ExtractError;
use flatwatch_storage::StoreError;
use thiserror::Error;

pub mod access;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod filter;
pub mod rate_limit;
pub mod registry;
pub mod schedule;

pub use access::{has_access, AccessCommand, AccessError};
pub use config::SyncConfig;
pub use dispatch::{format_message, ChannelError, ConsoleChannel, Dispatcher, MessagingChannel, TelegramChannel};
pub use engine::{CycleCounts, CycleEngine, CycleOutcome, CycleReport, RecipientReport, SkipReason, StatusEvent};
pub use rate_limit::DailyBudget;
pub use registry::{import_recipients, load_recipient_file, RecipientFile};
pub use schedule::{build_scheduler, next_aligned_tick, ActiveWindow, Cadence};

pub const CRATE_NAME: &str = "flatwatch-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("unknown recipient {0}")]
    UnknownRecipient(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
