//! Alarm events as extracted from the portal.
//!
//! An [`Event`] is immutable once built. Its identity key is derived from the
//! portal-provided fields only, so fetching the same listing twice yields the
//! same keys and nothing is announced twice.
//!
//! # Identity key
//!
//! Lowercase hex SHA-256 over, separated by `0x1f`:
//!
//! ```text
//! occurred_at (%Y-%m-%d %H:%M:%S) | raw alarm code | group | sector | description [| #n]
//! ```
//!
//! The `#n` ordinal is only present for the second and later copies of a
//! row that is otherwise identical to an earlier row on the same page.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Timestamp format used in messages and identity keys.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const KEY_SEPARATOR: u8 = 0x1f;

/// Coarse classification of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Anything that needs attention: burglary, restore, reset, unexpected
    /// arming state.
    Alarm,
    /// Routine arming, disarming and schedule changes.
    Info,
    /// Periodic self tests.
    Test,
    /// Free-form log lines without an alarm code.
    Unknown,
}

impl Category {
    /// Classifies a raw portal alarm code (`Alrm` column).
    pub fn from_portal_code(code: &str) -> Self {
        match code {
            "IN" | "UIT" | "AFW" => Self::Info,
            "24H" => Self::Test,
            "" => Self::Unknown,
            _ => Self::Alarm,
        }
    }

    /// Returns the lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::Info => "info",
            Self::Test => "test",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw portal alarm code to the code shown in notifications.
pub fn display_code(portal_code: &str) -> String {
    match portal_code {
        "IN" => "ALARM_ON",
        "UIT" => "ALARM_OFF",
        "TVU" => "UNEXPECT_ALARM_OFF",
        "TLI" => "UNEXPECT_NO_ALARM_YET",
        "AFW" => "OVERRIDE_ALARM_TIME",
        "" => "(log)",
        other => other,
    }
    .to_string()
}

/// One alarm/notification record from the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    identity_key: String,
    occurred_at: NaiveDateTime,
    category: Category,
    #[serde(skip)]
    portal_code: String,
    code: String,
    group: String,
    sector: String,
    description: String,
    raw_fields: BTreeMap<String, String>,
}

impl Event {
    /// Builds an event from portal fields.
    ///
    /// `portal_code` is the raw `Alrm` value; it is classified and mapped to
    /// its display code here.
    pub fn new(
        occurred_at: NaiveDateTime,
        portal_code: &str,
        group: impl Into<String>,
        sector: impl Into<String>,
        description: impl Into<String>,
        raw_fields: BTreeMap<String, String>,
    ) -> Self {
        let group = group.into();
        let sector = sector.into();
        let description = description.into();
        let identity_key =
            derive_identity_key(occurred_at, portal_code, &group, &sector, &description, 0);
        Self {
            identity_key,
            occurred_at,
            category: Category::from_portal_code(portal_code),
            portal_code: portal_code.to_string(),
            code: display_code(portal_code),
            group,
            sector,
            description,
            raw_fields,
        }
    }

    /// Re-derives the identity key for the `occurrence`-th identical copy of
    /// this row on one page. Occurrence 0 leaves the key unchanged.
    pub fn with_occurrence(mut self, occurrence: usize) -> Self {
        self.identity_key = derive_identity_key(
            self.occurred_at,
            &self.portal_code,
            &self.group,
            &self.sector,
            &self.description,
            occurrence,
        );
        self
    }

    /// Deterministic key used for deduplication.
    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    /// First characters of the identity key, for log lines.
    pub fn short_key(&self) -> &str {
        &self.identity_key[..self.identity_key.len().min(12)]
    }

    /// Portal wall-clock time of the event (installation timezone, no offset).
    pub fn occurred_at(&self) -> NaiveDateTime {
        self.occurred_at
    }

    /// Event classification.
    pub fn category(&self) -> Category {
        self.category
    }

    /// Display code, e.g. `ALARM_ON` or `INB`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Alarm group (user or zone number); may be empty.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Alarm sector; may be empty.
    pub fn sector(&self) -> &str {
        &self.sector
    }

    /// Merged free-text description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// All table columns of the source row, by header name.
    pub fn raw_fields(&self) -> &BTreeMap<String, String> {
        &self.raw_fields
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (G{}/S{}) [{}] {}",
            self.occurred_at.format(TIMESTAMP_FORMAT),
            self.code,
            self.group,
            self.sector,
            self.category,
            self.description
        )
    }
}

/// Computes the identity key for a set of portal fields.
pub fn derive_identity_key(
    occurred_at: NaiveDateTime,
    portal_code: &str,
    group: &str,
    sector: &str,
    description: &str,
    occurrence: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(occurred_at.format(TIMESTAMP_FORMAT).to_string().as_bytes());
    for part in [portal_code, group, sector, description] {
        hasher.update([KEY_SEPARATOR]);
        hasher.update(part.as_bytes());
    }
    if occurrence > 0 {
        hasher.update([KEY_SEPARATOR]);
        hasher.update(format!("#{occurrence}").as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
