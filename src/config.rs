//! Configuration loading.
//!
//! Everything comes from environment variables, read once at startup.
//! Secrets (customer code, webhook URL, Slack token) are kept out of `Debug`
//! output and never logged.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::constants;
use crate::dedup::RetentionPolicy;
use crate::error::RelayError;
use crate::poll_loop::{BackoffPolicy, LoopSettings};
use crate::portal::PortalCredentials;

/// Runtime configuration for the relay.
#[derive(Clone)]
pub struct Config {
    /// Portal customer number (`KLANT_NUMMER`).
    pub customer_number: String,
    /// Portal customer code (`KLANT_CODE`). Secret.
    pub customer_code: String,
    /// Slack incoming webhook (`SLACK_WEBHOOK_URL`). Secret.
    pub webhook_url: String,
    /// Bot token for `users.list` (`SLACK_API_BEARER`). Secret.
    pub slack_bearer: Option<String>,
    /// Usernames never @-mentioned (`SLACK_NO_MENTION_USERS`).
    pub no_mention_users: Vec<String>,
    /// Wrap messages in a section block (`SLACK_BLOCKS_WORKAROUND`).
    pub blocks_workaround: bool,
    /// Timezone of portal timestamps (`TZ`).
    pub timezone: Tz,
    /// Liveness file (`HEALTH_FILE`); `None` disables it.
    pub health_file: Option<PathBuf>,
    /// Delay between cycles (`POLL_INTERVAL`).
    pub poll_interval: Duration,
    /// Portal entry point (`ALERTMOBILE_URL`).
    pub portal_url: String,
    /// Dedup file (`ALARM_RELAY_STATE_FILE`).
    pub state_file: PathBuf,
    /// Stale-event cutoff (`ALARM_RELAY_MAX_EVENT_AGE`); `None` disables it.
    pub max_event_age: Option<Duration>,
    /// Dedup retention window (`ALARM_RELAY_RETENTION`).
    pub retention_window: Duration,
    /// Delivery attempts per event (`ALARM_RELAY_MAX_DELIVERY_ATTEMPTS`);
    /// `None` retries forever.
    pub max_delivery_attempts: Option<u32>,
    /// How long a portal session is reused (`ALARM_RELAY_SESSION_TTL`).
    pub session_ttl: Duration,
    /// First backoff delay (`ALARM_RELAY_BACKOFF_INITIAL`).
    pub backoff_initial: Duration,
    /// Backoff cap (`ALARM_RELAY_BACKOFF_MAX`).
    pub backoff_max: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const REDACTED: &str = "<redacted>";
        f.debug_struct("Config")
            .field("customer_number", &self.customer_number)
            .field("customer_code", &REDACTED)
            .field("webhook_url", &REDACTED)
            .field("slack_bearer", &self.slack_bearer.as_ref().map(|_| REDACTED))
            .field("no_mention_users", &self.no_mention_users)
            .field("blocks_workaround", &self.blocks_workaround)
            .field("timezone", &self.timezone)
            .field("health_file", &self.health_file)
            .field("poll_interval", &self.poll_interval)
            .field("portal_url", &self.portal_url)
            .field("state_file", &self.state_file)
            .field("max_event_age", &self.max_event_age)
            .field("retention_window", &self.retention_window)
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("session_ttl", &self.session_ttl)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_max", &self.backoff_max)
            .finish()
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's
    /// value or `None` when unset. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| RelayError::Config(format!("{name} is not set")))
        };
        let seconds = |name: &str, default: Duration| -> Result<Duration, RelayError> {
            match var(name) {
                Some(value) => value.trim().parse::<u64>().map(Duration::from_secs).map_err(|e| {
                    RelayError::Config(format!("{name} must be a whole number of seconds: {e}"))
                }),
                None => Ok(default),
            }
        };

        let tz_name = var("TZ").unwrap_or_else(|| constants::DEFAULT_TIMEZONE.to_string());
        let timezone = tz_name
            .trim()
            .parse::<Tz>()
            .map_err(|e| RelayError::Config(format!("TZ {tz_name:?} is not a known timezone: {e}")))?;

        let max_delivery_attempts = match var("ALARM_RELAY_MAX_DELIVERY_ATTEMPTS") {
            Some(value) => {
                let attempts = value.trim().parse::<u32>().map_err(|e| {
                    RelayError::Config(format!("ALARM_RELAY_MAX_DELIVERY_ATTEMPTS is invalid: {e}"))
                })?;
                (attempts > 0).then_some(attempts)
            }
            None => None,
        };

        let blocks_workaround = match var("SLACK_BLOCKS_WORKAROUND") {
            Some(value) => parse_flag(&value).ok_or_else(|| {
                RelayError::Config(format!("SLACK_BLOCKS_WORKAROUND {value:?} is not a boolean"))
            })?,
            None => false,
        };

        let max_event_age = seconds("ALARM_RELAY_MAX_EVENT_AGE", constants::DEFAULT_MAX_EVENT_AGE)?;

        let config = Self {
            customer_number: required("KLANT_NUMMER")?,
            customer_code: required("KLANT_CODE")?,
            webhook_url: required("SLACK_WEBHOOK_URL")?,
            slack_bearer: var("SLACK_API_BEARER"),
            no_mention_users: var("SLACK_NO_MENTION_USERS")
                .map(|names| names.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            blocks_workaround,
            timezone,
            health_file: var("HEALTH_FILE").map(PathBuf::from),
            poll_interval: seconds("POLL_INTERVAL", constants::DEFAULT_POLL_INTERVAL)?,
            portal_url: var("ALERTMOBILE_URL")
                .unwrap_or_else(|| constants::DEFAULT_PORTAL_URL.to_string()),
            state_file: var("ALARM_RELAY_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_file),
            max_event_age: (!max_event_age.is_zero()).then_some(max_event_age),
            retention_window: seconds("ALARM_RELAY_RETENTION", constants::DEFAULT_RETENTION_WINDOW)?,
            max_delivery_attempts,
            session_ttl: seconds("ALARM_RELAY_SESSION_TTL", constants::DEFAULT_SESSION_TTL)?,
            backoff_initial: seconds("ALARM_RELAY_BACKOFF_INITIAL", constants::DEFAULT_BACKOFF_INITIAL)?,
            backoff_max: seconds("ALARM_RELAY_BACKOFF_MAX", constants::DEFAULT_BACKOFF_MAX)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.poll_interval.is_zero() {
            return Err(RelayError::Config("POLL_INTERVAL must be positive".to_string()));
        }
        if self.backoff_initial.is_zero() {
            return Err(RelayError::Config(
                "ALARM_RELAY_BACKOFF_INITIAL must be positive".to_string(),
            ));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(RelayError::Config(
                "ALARM_RELAY_BACKOFF_INITIAL exceeds ALARM_RELAY_BACKOFF_MAX".to_string(),
            ));
        }
        if self.retention_window < self.poll_interval {
            return Err(RelayError::Config(
                "ALARM_RELAY_RETENTION must be at least POLL_INTERVAL".to_string(),
            ));
        }
        if !self.portal_url.starts_with("http://") && !self.portal_url.starts_with("https://") {
            return Err(RelayError::Config(format!(
                "ALERTMOBILE_URL {:?} is not an http(s) URL",
                self.portal_url
            )));
        }
        Ok(())
    }

    /// Portal login credentials.
    pub fn credentials(&self) -> PortalCredentials {
        PortalCredentials::new(&self.customer_number, &self.customer_code)
    }

    /// Poll loop tuning derived from this configuration.
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            poll_interval: self.poll_interval,
            backoff: BackoffPolicy::new(self.backoff_initial, self.backoff_max),
            max_event_age: self.max_event_age,
            timezone: self.timezone,
            retention: RetentionPolicy::new(self.retention_window),
            max_delivery_attempts: self.max_delivery_attempts,
            ..LoopSettings::default()
        }
    }
}

/// Default dedup file: `<data dir>/alarm-relay/published.json`.
pub fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("alarm-relay"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("published.json")
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
