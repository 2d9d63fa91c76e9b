//! Application-wide constants for alarm-relay.
//!
//! This module centralizes magic numbers and defaults so they can be found
//! in one place. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Timeouts**: Network timeouts and navigation delays
//! - **Portal**: AlertMobile URLs and page markers
//! - **Polling**: Loop cadence, backoff and pruning defaults
//! - **Health**: Liveness file defaults

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for every upstream and downstream call.
///
/// A hung portal or webhook fails the call after this long, which sends
/// the poll loop into backoff instead of stalling it.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of redirects followed by hand while tracking cookies.
pub const MAX_REDIRECTS: usize = 5;

// ============================================================================
// Portal
// ============================================================================

/// Default AlertMobile portal entry point.
pub const DEFAULT_PORTAL_URL: &str = "https://alertmobile.alert-group.nl/koi_kb.php";

/// Query appended to the portal URL to reach the alarm history listing.
pub const LISTING_PATH: &str = "?mscherm=status&div=historie";

/// Text present on a fully rendered alarm listing.
pub const LISTING_MARKER: &str = "Recent ontvangen meldingen:";

/// Link present on the "change user" page the portal sometimes serves
/// instead of the listing right after login.
pub const CHANGE_USER_MARKER: &str = "koi_kb.php?mscherm=gebruiker_wijzigen";

/// Form field that only appears on the login page.
pub const LOGIN_FORM_MARKER: &str = "name=\"klantnr\"";

/// How many times the status page is requested while the portal keeps
/// serving the "change user" page.
pub const STATUS_NAVIGATION_ATTEMPTS: usize = 10;

/// Pause between those navigation attempts.
pub const STATUS_NAVIGATION_DELAY: Duration = Duration::from_millis(300);

/// Default lifetime of a portal session before logging in again.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Default IANA timezone of the portal's wall-clock timestamps.
pub const DEFAULT_TIMEZONE: &str = "Europe/Amsterdam";

// ============================================================================
// Slack
// ============================================================================

/// Slack Web API endpoint used to resolve display names to user IDs.
pub const SLACK_USERS_LIST_URL: &str = "https://slack.com/api/users.list";

// ============================================================================
// Polling & Backoff
// ============================================================================

/// Default delay between the end of one poll cycle and the next.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// First backoff delay after a failed cycle.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(60);

/// Upper bound for the exponential backoff delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

/// New events older than this are recorded as seen but not announced.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(4 * 60 * 60);

/// Published identities not seen upstream for this long are forgotten.
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How often the dedup store is pruned, independent of the poll interval.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Consecutive failures of one kind after which they are logged as errors.
pub const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

/// Granularity at which sleeps check the shutdown flag.
pub const SHUTDOWN_POLL_SLICE: Duration = Duration::from_millis(100);

/// Maximum characters of upstream detail copied into error messages.
pub const LOG_DETAIL_LIMIT: usize = 200;

// ============================================================================
// Health
// ============================================================================

/// Age after which the health file marks the process as unhealthy.
pub const HEALTH_STALENESS_THRESHOLD: Duration = Duration::from_secs(900);
