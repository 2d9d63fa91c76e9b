//! Error taxonomy for the relay.
//!
//! Every runtime failure the poll loop can hit maps onto one [`RelayError`]
//! variant. Only [`RelayError::Config`] is fatal, and only at startup; all
//! other kinds keep the process alive and are retried.
//!
//! Messages carry a truncated detail string and never include credentials,
//! cookie values or the webhook URL.

use thiserror::Error;

use crate::constants::LOG_DETAIL_LIMIT;

/// Errors raised by the relay's components.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Bad credentials, or the portal's login flow changed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The portal no longer accepts the current session.
    #[error("session expired: {0}")]
    AuthExpired(String),
    /// Timeouts, connection failures and unexpected HTTP statuses.
    #[error("network error: {0}")]
    Network(String),
    /// The fetched page lacks the structure the extractor relies on.
    #[error("unexpected page structure: {0}")]
    Parse(String),
    /// The chat endpoint did not accept a notification.
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// A required setting is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The dedup store could not be read or written.
    #[error("dedup store error: {0}")]
    Store(String),
}

/// Stable label for each [`RelayError`] variant.
///
/// Used for log fields and for counting consecutive failures of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`RelayError::Auth`].
    Auth,
    /// See [`RelayError::AuthExpired`].
    AuthExpired,
    /// See [`RelayError::Network`].
    Network,
    /// See [`RelayError::Parse`].
    Parse,
    /// See [`RelayError::Delivery`].
    Delivery,
    /// See [`RelayError::Config`].
    Config,
    /// See [`RelayError::Store`].
    Store,
}

impl ErrorKind {
    /// Returns the label used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthExpired => "auth_expired",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Delivery => "delivery",
            Self::Config => "config",
            Self::Store => "store",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelayError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::AuthExpired(_) => ErrorKind::AuthExpired,
            Self::Network(_) => ErrorKind::Network,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Delivery(_) => ErrorKind::Delivery,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Wraps a transport failure as [`RelayError::Network`].
    ///
    /// The request URL is stripped first: the webhook URL is itself a secret.
    pub fn network(err: reqwest::Error) -> Self {
        Self::Network(describe_transport_error(err))
    }

    /// Wraps a transport failure of a webhook call as [`RelayError::Delivery`].
    pub fn delivery(err: reqwest::Error) -> Self {
        Self::Delivery(describe_transport_error(err))
    }
}

fn describe_transport_error(err: reqwest::Error) -> String {
    let timed_out = err.is_timeout();
    let message = truncate_detail(&err.without_url().to_string());
    if timed_out {
        format!("timed out: {message}")
    } else {
        message
    }
}

/// Shortens upstream text (page bodies, API responses) for log output.
///
/// Cuts on a character boundary and marks the cut with `...`.
pub fn truncate_detail(detail: &str) -> String {
    let detail = detail.trim();
    match detail.char_indices().nth(LOG_DETAIL_LIMIT) {
        Some((idx, _)) => format!("{}...", &detail[..idx]),
        None => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(RelayError::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(RelayError::AuthExpired("x".into()).kind(), ErrorKind::AuthExpired);
        assert_eq!(RelayError::Network("x".into()).kind(), ErrorKind::Network);
        assert_eq!(RelayError::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(RelayError::Delivery("x".into()).kind(), ErrorKind::Delivery);
        assert_eq!(RelayError::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(RelayError::Store("x".into()).kind(), ErrorKind::Store);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = RelayError::Parse("no alarm table".into());
        assert_eq!(err.to_string(), "unexpected page structure: no alarm table");
    }

    #[test]
    fn test_truncate_detail_short_text_untouched() {
        assert_eq!(truncate_detail("  short  "), "short");
    }

    #[test]
    fn test_truncate_detail_cuts_long_text() {
        let long = "é".repeat(LOG_DETAIL_LIMIT + 50);
        let cut = truncate_detail(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), LOG_DETAIL_LIMIT + 3);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::AuthExpired.to_string(), "auth_expired");
        assert_eq!(ErrorKind::Delivery.as_str(), "delivery");
    }
}
