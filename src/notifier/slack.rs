//! Slack incoming-webhook delivery.

use std::collections::HashMap;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{MessageFormatter, Notifier};
use crate::constants;
use crate::error::{truncate_detail, RelayError};
use crate::event::Event;

/// Builds the webhook request body for `text`.
///
/// With `blocks_workaround` the message is wrapped in a section block, which
/// keeps the Android client from mangling `@..` sequences.
pub fn build_payload(text: &str, blocks_workaround: bool) -> Value {
    let message = json!({
        "text": text,
        "type": "mrkdwn",
        "verbatim": true,
    });
    if blocks_workaround {
        json!({ "blocks": [{ "type": "section", "text": message }] })
    } else {
        message
    }
}

/// Posts formatted events to a Slack incoming webhook.
#[derive(Clone)]
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
    formatter: MessageFormatter,
    blocks_workaround: bool,
}

impl std::fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackNotifier")
            .field("webhook_url", &"<redacted>")
            .field("formatter", &self.formatter)
            .field("blocks_workaround", &self.blocks_workaround)
            .finish()
    }
}

impl SlackNotifier {
    /// Creates a notifier with its own HTTP client.
    pub fn new(
        webhook_url: impl Into<String>,
        formatter: MessageFormatter,
        blocks_workaround: bool,
    ) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(RelayError::delivery)?;
        Ok(Self::with_client(client, webhook_url, formatter, blocks_workaround))
    }

    /// Creates a notifier around an existing HTTP client.
    pub fn with_client(
        client: Client,
        webhook_url: impl Into<String>,
        formatter: MessageFormatter,
        blocks_workaround: bool,
    ) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
            formatter,
            blocks_workaround,
        }
    }

    /// The formatter used for message text.
    pub fn formatter(&self) -> &MessageFormatter {
        &self.formatter
    }
}

impl Notifier for SlackNotifier {
    fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let text = self.formatter.format(event);
        let payload = build_payload(&text, self.blocks_workaround);
        log::debug!("Sending: {payload}");

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .map_err(RelayError::delivery)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().unwrap_or_default();
            return Err(RelayError::Delivery(format!(
                "webhook returned {status}: {}",
                truncate_detail(&body)
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UsersListResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct Member {
    id: String,
    #[serde(default)]
    profile: Profile,
}

#[derive(Debug, Default, Deserialize)]
struct Profile {
    #[serde(default)]
    display_name: String,
}

/// Fetches the workspace members and maps lowercased display names to ids.
///
/// Mentions are a nicety: without a token, or on any failure, this logs a
/// warning and returns an empty map.
pub fn fetch_user_map(client: &Client, url: &str, bearer: Option<&str>) -> HashMap<String, String> {
    let Some(bearer) = bearer.filter(|token| !token.is_empty()) else {
        log::info!("No Slack API token; users will not be @-mentioned");
        return HashMap::new();
    };

    match request_user_map(client, url, bearer) {
        Ok(users) => {
            log::info!("Loaded {} Slack users for mentions", users.len());
            users
        }
        Err(e) => {
            log::warn!("Failed to get Slack users.list: {e}");
            HashMap::new()
        }
    }
}

fn request_user_map(
    client: &Client,
    url: &str,
    bearer: &str,
) -> Result<HashMap<String, String>, RelayError> {
    let response = client
        .get(url)
        .bearer_auth(bearer)
        .send()
        .map_err(RelayError::network)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(RelayError::Network(format!(
            "users.list returned {status}: {}",
            truncate_detail(&body)
        )));
    }

    let body = response.text().map_err(RelayError::network)?;
    let list: UsersListResponse = serde_json::from_str(&body)
        .map_err(|e| RelayError::Parse(format!("{e}: {}", truncate_detail(&body))))?;
    // Slack reports API errors such as a bad token with HTTP 200.
    if !list.ok {
        return Err(RelayError::Auth(format!(
            "users.list refused: {}",
            list.error.as_deref().unwrap_or("unknown error")
        )));
    }

    Ok(list
        .members
        .into_iter()
        .filter(|member| !member.profile.display_name.is_empty())
        .map(|member| (member.profile.display_name.to_lowercase(), member.id))
        .collect())
}
