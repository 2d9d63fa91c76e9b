//! Alarm relay - forwards AlertMobile alarm log entries to Slack.
//!
//! The relay logs in to the Alert Group portal, reads the recent alarm
//! history, and posts every entry it has not announced before to a Slack
//! incoming webhook. Announced entries are remembered on disk, so restarts do
//! not repeat messages.
//!
//! # Architecture
//!
//! - **PollLoop** - Orchestrates one fetch/parse/publish cycle per interval
//! - **Portal** - Session-based access to the login-walled portal
//! - **EventExtractor** - Turns the listing HTML into [`Event`]s
//! - **DedupStore** - Identity keys already announced
//! - **Notifier** - Formats and delivers messages
//! - **HealthSignal** - Liveness file for external probes
//!
//! # Modules
//!
//! - [`poll_loop`] - Cycle state machine and backoff
//! - [`portal`] - AlertMobile session client
//! - [`extract`] - HTML listing parser
//! - [`config`] - Environment configuration

pub mod clock;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod event;
pub mod extract;
pub mod health;
pub mod notifier;
pub mod poll_loop;
pub mod portal;

// Re-export commonly used types
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use dedup::{DedupStore, RetentionPolicy};
pub use error::{ErrorKind, RelayError};
pub use event::{Category, Event};
pub use extract::{AlertMobileExtractor, EventExtractor};
pub use health::HealthSignal;
pub use notifier::slack::SlackNotifier;
pub use notifier::{MentionPolicy, MessageFormatter, Notifier};
pub use poll_loop::{BackoffPolicy, CycleOutcome, CycleReport, LoopSettings, LoopState, PollLoop};
pub use portal::{AlertMobileClient, Portal, PortalCredentials, SessionState};
