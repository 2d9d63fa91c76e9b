//! Chat notifications for alarm events.
//!
//! [`MessageFormatter`] turns an [`Event`] into a one-line chat message and
//! [`Notifier`] delivers it. The Slack webhook implementation lives in
//! [`slack`].
//!
//! # Message format
//!
//! ```text
//! 2023-03-14 08:27:42: ALARM_OFF (G14/S0): by <@U0H87MYTC>
//! 2023-03-15 10:12:15: 24H (G/S0): (autotest)
//! 2023-03-15 12:14:20: INB (G1034/S0): INBRAAK   GBM RAAM KANTOOR (Inbraak) <-- <!channel>
//! ```
//!
//! Arming and disarming lines name the user; anything outside the routine
//! codes pings the whole channel.

pub mod slack;

use std::collections::{HashMap, HashSet};

use crate::error::RelayError;
use crate::event::{Event, TIMESTAMP_FORMAT};

/// Display codes that never ping the channel.
const ROUTINE_CODES: [&str; 4] = ["ALARM_ON", "ALARM_OFF", "24H", "OVERRIDE_ALARM_TIME"];

const ARMED_PREFIX: &str = "VOLL. ING ";
const DISARMED_PREFIX: &str = "UITGESCH. ";
const AUTOTEST_TEXT: &str = "AUTOTEST (Test)";
const CHANNEL_MENTION: &str = " <-- <!channel>";

/// Delivers formatted events to a chat endpoint.
pub trait Notifier {
    /// Sends one event.
    ///
    /// `Ok` means the endpoint accepted it; the caller then records the
    /// event as published.
    fn publish(&self, event: &Event) -> Result<(), RelayError>;
}

/// Decides how a username is rendered in a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionPolicy {
    no_mention: HashSet<String>,
    user_ids: HashMap<String, String>,
}

impl MentionPolicy {
    /// Creates a policy from the never-mention list and a
    /// lowercased display name to user id map.
    pub fn new<I, S>(no_mention: I, user_ids: HashMap<String, String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            no_mention: no_mention
                .into_iter()
                .map(|name| name.as_ref().to_lowercase())
                .collect(),
            user_ids: user_ids
                .into_iter()
                .map(|(name, id)| (name.to_lowercase(), id))
                .collect(),
        }
    }

    /// Number of known user ids.
    pub fn known_users(&self) -> usize {
        self.user_ids.len()
    }

    /// Renders `username` (already lowercased) as plain text or `<@ID>`.
    pub fn render(&self, username: &str) -> String {
        if self.no_mention.contains(username) {
            return username.to_string();
        }
        match self.user_ids.get(username) {
            Some(id) => format!("<@{id}>"),
            None => username.to_string(),
        }
    }
}

/// Builds the chat text for an event.
#[derive(Debug, Clone, Default)]
pub struct MessageFormatter {
    mentions: MentionPolicy,
}

impl MessageFormatter {
    /// Creates a formatter using `mentions` for user names.
    pub fn new(mentions: MentionPolicy) -> Self {
        Self { mentions }
    }

    /// The mention policy in use.
    pub fn mentions(&self) -> &MentionPolicy {
        &self.mentions
    }

    /// Formats `event` as a single message line.
    pub fn format(&self, event: &Event) -> String {
        let mut message = format!(
            "{}: {} (G{}/S{})",
            event.occurred_at().format(TIMESTAMP_FORMAT),
            event.code(),
            event.group(),
            event.sector()
        )
        .trim_end()
        .to_string();

        let info = self.info_text(event.code(), event.description());
        if !info.is_empty() {
            message.push_str(": ");
            message.push_str(&info);
        }
        message
    }

    fn info_text(&self, code: &str, description: &str) -> String {
        let actor = match code {
            "ALARM_ON" => actor_name(description, ARMED_PREFIX, "In"),
            "ALARM_OFF" => actor_name(description, DISARMED_PREFIX, "Uit"),
            "24H" if description == AUTOTEST_TEXT => return "(autotest)".to_string(),
            _ => None,
        };
        if let Some(name) = actor {
            return format!("by {}", self.mentions.render(&name.to_lowercase()));
        }
        if ROUTINE_CODES.contains(&code) {
            description.to_string()
        } else {
            format!("{description}{CHANNEL_MENTION}")
        }
    }
}

/// Extracts `NAME` from `"{prefix}NAME (In)"` or `"{prefix}NAME (hh:mm In)"`.
fn actor_name<'a>(description: &'a str, prefix: &str, action: &str) -> Option<&'a str> {
    let rest = description.strip_prefix(prefix)?;

    let plain = format!(" ({action})");
    if let Some(name) = rest.strip_suffix(plain.as_str()) {
        return Some(name);
    }

    // " (18:55 In)": the time is always five characters wide.
    let timed = rest.strip_suffix(&format!(" {action})"))?;
    let (name, time) = timed.rsplit_once(" (")?;
    (time.len() == 5).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn event(
        (y, mo, d, h, mi, s): (i32, u32, u32, u32, u32, u32),
        portal_code: &str,
        group: &str,
        description: &str,
    ) -> Event {
        let at = NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, s))
            .unwrap();
        Event::new(at, portal_code, group, "0", description, BTreeMap::new())
    }

    fn formatter() -> MessageFormatter {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "U0H87MYTC".to_string());
        MessageFormatter::new(MentionPolicy::new(Vec::<String>::new(), users))
    }

    #[test]
    fn test_alarm_off_mentions_known_user() {
        let e = event((2023, 3, 14, 8, 27, 42), "UIT", "14", "UITGESCH. ALICE (Uit)");
        assert_eq!(
            formatter().format(&e),
            "2023-03-14 08:27:42: ALARM_OFF (G14/S0): by <@U0H87MYTC>"
        );
    }

    #[test]
    fn test_alarm_off_with_time_in_description() {
        let e = event((2023, 3, 14, 18, 56, 5), "UIT", "6", "UITGESCH. ALICE (18:55 Uit)");
        assert_eq!(
            formatter().format(&e),
            "2023-03-14 18:56:05: ALARM_OFF (G6/S0): by <@U0H87MYTC>"
        );
    }

    #[test]
    fn test_alarm_on_unknown_user_is_plain_text() {
        let e = event((2023, 3, 14, 18, 56, 5), "IN", "6", "VOLL. ING BOB (In)");
        assert_eq!(formatter().format(&e), "2023-03-14 18:56:05: ALARM_ON (G6/S0): by bob");

        let e = event((2023, 3, 14, 18, 56, 5), "IN", "6", "VOLL. ING BOB (18:55 In)");
        assert_eq!(formatter().format(&e), "2023-03-14 18:56:05: ALARM_ON (G6/S0): by bob");
    }

    #[test]
    fn test_no_mention_list_wins_over_user_map() {
        let mut users = HashMap::new();
        users.insert("frank".to_string(), "12345679".to_string());
        let e = event((2023, 3, 14, 8, 27, 42), "UIT", "14", "UITGESCH. FRANK (Uit)");

        let mentioning = MessageFormatter::new(MentionPolicy::new(["not_frank"], users.clone()));
        assert_eq!(
            mentioning.format(&e),
            "2023-03-14 08:27:42: ALARM_OFF (G14/S0): by <@12345679>"
        );

        let suppressed = MessageFormatter::new(MentionPolicy::new(["Frank"], users));
        assert_eq!(suppressed.format(&e), "2023-03-14 08:27:42: ALARM_OFF (G14/S0): by frank");
    }

    #[test]
    fn test_autotest() {
        let e = event((2023, 3, 15, 10, 12, 15), "24H", "", "AUTOTEST (Test)");
        assert_eq!(formatter().format(&e), "2023-03-15 10:12:15: 24H (G/S0): (autotest)");
    }

    #[test]
    fn test_override_alarm_time_is_verbatim() {
        let e = event(
            (2023, 7, 11, 0, 17, 25),
            "AFW",
            "",
            "11-07-23 Afwijkende inschakeltijd 02:15",
        );
        assert_eq!(
            formatter().format(&e),
            "2023-07-11 00:17:25: OVERRIDE_ALARM_TIME (G/S0): 11-07-23 Afwijkende inschakeltijd 02:15"
        );
    }

    #[test]
    fn test_uncommon_code_pings_channel() {
        let e = event(
            (2023, 3, 15, 12, 14, 20),
            "INB",
            "1034",
            "INBRAAK   GBM RAAM KANTOOR (Inbraak)",
        );
        assert_eq!(
            formatter().format(&e),
            "2023-03-15 12:14:20: INB (G1034/S0): INBRAAK   GBM RAAM KANTOOR (Inbraak) <-- <!channel>"
        );
    }

    #[test]
    fn test_routine_code_with_unexpected_text_is_verbatim() {
        let e = event((2023, 3, 14, 8, 0, 0), "UIT", "3", "Uitgeschakeld via app");
        assert_eq!(
            formatter().format(&e),
            "2023-03-14 08:00:00: ALARM_OFF (G3/S0): Uitgeschakeld via app"
        );
    }

    #[test]
    fn test_actor_name_rejects_malformed_time() {
        assert_eq!(actor_name("VOLL. ING BOB (1855 In)", ARMED_PREFIX, "In"), None);
        assert_eq!(actor_name("VOLL. ING BOB (In)", DISARMED_PREFIX, "In"), None);
        assert_eq!(actor_name("VOLL. ING INST. (In)", ARMED_PREFIX, "In"), Some("INST."));
    }
}
