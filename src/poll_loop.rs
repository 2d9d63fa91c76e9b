//! The poll–parse–deduplicate–publish loop.
//!
//! # State machine
//!
//! ```text
//!            timer                ok               ok              ok
//! Idle ─────────────► Authenticating ──► Fetching ──► Parsing ──► Publishing ──► Idle
//!   ▲                      │                │            │
//!   │                      └────────────────┴────────────┘
//!   │                                  error
//!   │                                    ▼
//!   └──────────── sleep ◄──────── Backoff { attempt, delay }
//! ```
//!
//! A cycle either completes (the listing was parsed, even if nothing was new)
//! or fails at one stage. Every cycle that gets past Parsing touches the
//! health file, whatever happens while publishing. A failed cycle leaves the dedup store as it was, apart from events already
//! published and committed in that same cycle.
//!
//! Each new event is published and then committed before the next one is
//! looked at, so a crash between the two re-sends at most one message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::clock::Clock;
use crate::constants;
use crate::dedup::{DedupStore, RetentionPolicy};
use crate::error::{ErrorKind, RelayError};
use crate::event::Event;
use crate::extract::EventExtractor;
use crate::health::HealthSignal;
use crate::notifier::Notifier;
use crate::portal::{Portal, SessionState};

/// Exponential backoff between failed cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl BackoffPolicy {
    /// Creates a policy; `initial` should not exceed `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retrying after `attempt` consecutive failures
    /// (1-based): `initial * 2^(attempt-1)`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(constants::DEFAULT_BACKOFF_INITIAL, constants::DEFAULT_BACKOFF_MAX)
    }
}

/// Tuning for [`PollLoop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Delay between completed cycles.
    pub poll_interval: Duration,
    /// Delay schedule after failed cycles.
    pub backoff: BackoffPolicy,
    /// New events older than this are committed without being announced.
    pub max_event_age: Option<Duration>,
    /// Timezone the portal's wall-clock timestamps are in.
    pub timezone: Tz,
    /// How long committed identities are remembered.
    pub retention: RetentionPolicy,
    /// Minimum time between dedup store prunes.
    pub prune_interval: Duration,
    /// Give up on an event after this many failed deliveries.
    pub max_delivery_attempts: Option<u32>,
    /// Portal path of the alarm listing.
    pub listing_path: String,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: constants::DEFAULT_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
            max_event_age: Some(constants::DEFAULT_MAX_EVENT_AGE),
            timezone: chrono_tz::Europe::Amsterdam,
            retention: RetentionPolicy::new(constants::DEFAULT_RETENTION_WINDOW),
            prune_interval: constants::PRUNE_INTERVAL,
            max_delivery_attempts: None,
            listing_path: constants::LISTING_PATH.to_string(),
        }
    }
}

/// Step of a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Obtaining or reusing a portal session.
    Authenticating,
    /// Downloading the listing.
    Fetching,
    /// Extracting events from the listing.
    Parsing,
    /// Announcing and committing new events.
    Publishing,
}

impl Stage {
    /// Lowercase label for log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Publishing => "publishing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next cycle.
    Idle,
    /// See [`Stage::Authenticating`].
    Authenticating,
    /// See [`Stage::Fetching`].
    Fetching,
    /// See [`Stage::Parsing`].
    Parsing,
    /// See [`Stage::Publishing`].
    Publishing,
    /// Waiting after a failed cycle.
    Backoff {
        /// Consecutive failed cycles so far.
        attempt: u32,
        /// Delay before the next cycle.
        delay: Duration,
    },
}

impl From<Stage> for LoopState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Authenticating => Self::Authenticating,
            Stage::Fetching => Self::Fetching,
            Stage::Parsing => Self::Parsing,
            Stage::Publishing => Self::Publishing,
        }
    }
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Events on the fetched listing.
    pub listed: usize,
    /// Of those, not yet committed at the start of the cycle.
    pub new: usize,
    /// Delivered and committed.
    pub published: usize,
    /// Delivery failed; retried next cycle.
    pub failed: usize,
    /// Delivery failed too often; committed without being delivered.
    pub dropped: usize,
    /// Older than the stale cutoff; committed without being delivered.
    pub skipped_stale: usize,
}

/// Result of [`PollLoop::run_cycle`].
#[derive(Debug)]
pub enum CycleOutcome {
    /// The listing was parsed and every new event handled.
    Completed(CycleReport),
    /// The cycle stopped at `stage`.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Why it failed.
        error: RelayError,
    },
    /// Shutdown was requested before `stage` started.
    Interrupted {
        /// Stage that was skipped.
        stage: Stage,
    },
}

impl CycleOutcome {
    /// Returns true for [`CycleOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Drives the relay: fetch, parse, publish new events, repeat.
#[derive(Debug)]
pub struct PollLoop<P, E, N, C> {
    portal: P,
    extractor: E,
    notifier: N,
    clock: C,
    store: DedupStore,
    health: HealthSignal,
    settings: LoopSettings,
    session: Option<SessionState>,
    state: LoopState,
    failed_cycles: u32,
    failure_streak: Option<(ErrorKind, u32)>,
    delivery_attempts: HashMap<String, u32>,
    last_prune: Option<DateTime<Utc>>,
}

impl<P, E, N, C> PollLoop<P, E, N, C>
where
    P: Portal,
    E: EventExtractor,
    N: Notifier,
    C: Clock,
{
    /// Wires the loop together.
    pub fn new(
        portal: P,
        extractor: E,
        notifier: N,
        clock: C,
        store: DedupStore,
        health: HealthSignal,
        settings: LoopSettings,
    ) -> Self {
        Self {
            portal,
            extractor,
            notifier,
            clock,
            store,
            health,
            settings,
            session: None,
            state: LoopState::Idle,
            failed_cycles: 0,
            failure_streak: None,
            delivery_attempts: HashMap::new(),
            last_prune: None,
        }
    }

    /// Runs cycles until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!(
            "Polling every {}s ({} identities already published)",
            self.settings.poll_interval.as_secs(),
            self.store.len()
        );

        while !shutdown.load(Ordering::SeqCst) {
            let outcome = self.run_cycle(shutdown);
            match &outcome {
                CycleOutcome::Completed(report) => log::info!(
                    "Cycle complete: {} listed, {} new, {} published, {} failed, {} dropped, {} stale",
                    report.listed,
                    report.new,
                    report.published,
                    report.failed,
                    report.dropped,
                    report.skipped_stale
                ),
                CycleOutcome::Failed { .. } => {}
                CycleOutcome::Interrupted { stage } => {
                    log::info!("Shutdown requested before {stage}");
                    break;
                }
            }

            let delay = self.schedule(&outcome);
            if let LoopState::Backoff { attempt, .. } = self.state {
                log::info!("Retrying in {}s (attempt {attempt})", delay.as_secs());
            }
            if !self.clock.sleep(delay, shutdown) {
                break;
            }
        }

        self.state = LoopState::Idle;
        log::info!("Poll loop stopped");
    }

    /// Runs a single cycle without sleeping.
    pub fn run_cycle(&mut self, shutdown: &AtomicBool) -> CycleOutcome {
        let now = self.clock.now();

        if shutdown.load(Ordering::SeqCst) {
            return CycleOutcome::Interrupted {
                stage: Stage::Authenticating,
            };
        }
        self.state = LoopState::Authenticating;
        let mut session = match self.portal.ensure_session(self.session.take(), now) {
            Ok(session) => session,
            Err(error) => return self.fail(Stage::Authenticating, error),
        };

        if shutdown.load(Ordering::SeqCst) {
            self.session = Some(session);
            return CycleOutcome::Interrupted {
                stage: Stage::Fetching,
            };
        }
        self.state = LoopState::Fetching;
        let raw = match self.portal.fetch(&mut session, &self.settings.listing_path) {
            Ok(raw) => {
                self.session = Some(session);
                raw
            }
            Err(error) => {
                if error.kind() == ErrorKind::AuthExpired {
                    log::info!("Dropping portal session; logging in again next cycle");
                } else {
                    self.session = Some(session);
                }
                return self.fail(Stage::Fetching, error);
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            return CycleOutcome::Interrupted {
                stage: Stage::Parsing,
            };
        }
        self.state = LoopState::Parsing;
        let events = match self.extractor.parse(&raw) {
            Ok(events) => events,
            Err(error) => return self.fail(Stage::Parsing, error),
        };
        if let Err(e) = self.health.touch() {
            log::warn!("Failed to touch health file: {e:#}");
        }

        self.state = LoopState::Publishing;
        let report = match self.publish_new(&events, now, shutdown) {
            Ok(Some(report)) => report,
            Ok(None) => {
                return CycleOutcome::Interrupted {
                    stage: Stage::Publishing,
                }
            }
            Err(error) => return self.fail(Stage::Publishing, error),
        };

        if let Err(error) = self
            .store
            .mark_seen(events.iter().map(Event::identity_key), now)
        {
            return self.fail(Stage::Publishing, error);
        }
        self.delivery_attempts
            .retain(|key, _| events.iter().any(|event| event.identity_key() == key.as_str()));

        self.prune_if_due(now);

        if report.failed == 0 {
            self.failure_streak = None;
        }
        self.state = LoopState::Idle;
        CycleOutcome::Completed(report)
    }

    /// Updates the loop state after `outcome` and returns how long to wait
    /// before the next cycle.
    pub fn schedule(&mut self, outcome: &CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Completed(_) => {
                self.failed_cycles = 0;
                self.state = LoopState::Idle;
                self.settings.poll_interval
            }
            CycleOutcome::Failed { .. } => {
                self.failed_cycles = self.failed_cycles.saturating_add(1);
                let delay = self.settings.backoff.delay(self.failed_cycles);
                self.state = LoopState::Backoff {
                    attempt: self.failed_cycles,
                    delay,
                };
                delay
            }
            CycleOutcome::Interrupted { .. } => Duration::ZERO,
        }
    }

    /// Publishes and commits events not seen before, oldest first.
    ///
    /// Returns `None` when shutdown interrupted the batch.
    fn publish_new(
        &mut self,
        events: &[Event],
        now: DateTime<Utc>,
        shutdown: &AtomicBool,
    ) -> Result<Option<CycleReport>, RelayError> {
        let fresh: Vec<&Event> = events
            .iter()
            .filter(|event| self.store.is_new(event.identity_key()))
            .collect();
        let mut report = CycleReport {
            listed: events.len(),
            new: fresh.len(),
            ..CycleReport::default()
        };

        for event in fresh {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }

            // Only a first sighting can be stale; failed deliveries keep retrying.
            let retrying = self.delivery_attempts.contains_key(event.identity_key());
            if !retrying && self.is_stale(event, now) {
                log::warn!("Skipping stale event {}: {event}", event.short_key());
                self.store.commit(event.identity_key(), now)?;
                report.skipped_stale += 1;
                continue;
            }

            match self.notifier.publish(event) {
                Ok(()) => {
                    self.store.commit(event.identity_key(), now)?;
                    self.delivery_attempts.remove(event.identity_key());
                    log::info!("Published {}: {event}", event.short_key());
                    report.published += 1;
                }
                Err(error) => {
                    let attempts = self
                        .delivery_attempts
                        .entry(event.identity_key().to_string())
                        .or_insert(0);
                    *attempts += 1;
                    let attempts = *attempts;

                    if self
                        .settings
                        .max_delivery_attempts
                        .is_some_and(|max| attempts >= max)
                    {
                        log::error!(
                            "Dropping event {} after {attempts} failed deliveries: {event} ({error})",
                            event.short_key()
                        );
                        self.store.commit(event.identity_key(), now)?;
                        self.delivery_attempts.remove(event.identity_key());
                        report.dropped += 1;
                    } else {
                        self.record_failure(Stage::Publishing, &error);
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(Some(report))
    }

    fn is_stale(&self, event: &Event, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.settings.max_event_age else {
            return false;
        };
        let Some(occurred) = self
            .settings
            .timezone
            .from_local_datetime(&event.occurred_at())
            .earliest()
        else {
            return false;
        };
        now.signed_duration_since(occurred.with_timezone(&Utc))
            .to_std()
            .is_ok_and(|age| age > max_age)
    }

    fn prune_if_due(&mut self, now: DateTime<Utc>) {
        let interval = TimeDelta::from_std(self.settings.prune_interval).unwrap_or(TimeDelta::MAX);
        let due = match self.last_prune {
            Some(last) => now.signed_duration_since(last) >= interval,
            None => true,
        };
        if !due {
            return;
        }
        match self.store.prune(&self.settings.retention, now) {
            Ok(_) => self.last_prune = Some(now),
            Err(e) => log::warn!("Failed to prune dedup store: {e}"),
        }
    }

    fn fail(&mut self, stage: Stage, error: RelayError) -> CycleOutcome {
        self.record_failure(stage, &error);
        CycleOutcome::Failed { stage, error }
    }

    /// Logs a failure, escalating to `error` once the same kind keeps
    /// repeating.
    fn record_failure(&mut self, stage: Stage, error: &RelayError) {
        let kind = error.kind();
        let count = match self.failure_streak {
            Some((last, count)) if last == kind => count.saturating_add(1),
            _ => 1,
        };
        self.failure_streak = Some((kind, count));

        if count >= constants::FAILURE_ESCALATION_THRESHOLD {
            log::error!("{stage} failed ({kind}, {count} times in a row): {error}");
        } else {
            log::warn!("{stage} failed ({kind}): {error}");
        }
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The held portal session, if any.
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// Settings in use.
    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// The dedup store.
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// The portal client.
    pub fn portal(&self) -> &P {
        &self.portal
    }

    /// The notifier.
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// The clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The health signal.
    pub fn health(&self) -> &HealthSignal {
        &self.health
    }

    /// Consecutive failures of the most recent failure kind.
    pub fn failure_streak(&self) -> Option<(ErrorKind, u32)> {
        self.failure_streak
    }

    /// Consumes the loop, returning the dedup store.
    pub fn into_store(self) -> DedupStore {
        self.store
    }
}
