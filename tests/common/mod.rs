//! Scripted portal, recording notifier and manual clock for loop tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alarm_relay::{Clock, Event, Notifier, Portal, RelayError, SessionState};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

/// 2024-05-01 12:00:00 UTC, i.e. 14:00 in Amsterdam.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Builds an AlertMobile listing for 01/05/24 from `(time, code, description)`
/// rows, all on group 1, sector 0.
pub fn listing(rows: &[(&str, &str, &str)]) -> String {
    let mut body = String::from("<tr><td>01/05/24</td><td></td><td></td><td></td><td>---</td><td></td></tr>\n");
    for (time, code, description) in rows {
        body.push_str(&format!(
            "<tr><td>{time}</td><td>E0123456</td><td>{code}</td><td>1</td><td>0</td><td>{description}</td></tr>\n"
        ));
    }
    format!(
        "<html><body><h3>Recent ontvangen meldingen:</h3><table>\
         <thead><tr><th>Tijd</th><th>Aansluiting</th><th>Alrm</th>\
         <th>Groep</th><th>Sector</th><th>Omschrijving</th></tr></thead>\
         <tbody>{body}</tbody></table></body></html>"
    )
}

/// Burglary rows named `names`, one second apart from 13:00:01 local time.
pub fn alarms(names: &[&str]) -> String {
    let rows: Vec<(String, &str, &str)> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (format!("13:00:{:02}", i + 1), "INB", *name))
        .collect();
    let borrowed: Vec<(&str, &str, &str)> = rows
        .iter()
        .map(|(time, code, name)| (time.as_str(), *code, *name))
        .collect();
    listing(&borrowed)
}

/// One scripted answer of [`FakePortal::fetch`].
#[derive(Debug, Clone)]
pub enum Step {
    /// Serve this page.
    Page(String),
    /// The session was rejected.
    Unauthorized,
    /// The portal could not be reached.
    Down,
}

/// Portal that replays scripted fetch results.
#[derive(Debug, Default)]
pub struct FakePortal {
    steps: RefCell<VecDeque<Step>>,
    logins: Cell<u32>,
    failing_logins: Cell<u32>,
    fetches: Cell<u32>,
}

impl FakePortal {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            ..Self::default()
        }
    }

    pub fn pages(pages: Vec<String>) -> Self {
        Self::new(pages.into_iter().map(Step::Page).collect())
    }

    /// Makes the next `count` logins fail with bad credentials.
    pub fn fail_logins(self, count: u32) -> Self {
        self.failing_logins.set(count);
        self
    }

    pub fn push(&self, step: Step) {
        self.steps.borrow_mut().push_back(step);
    }

    pub fn logins(&self) -> u32 {
        self.logins.get()
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.get()
    }
}

impl Portal for FakePortal {
    fn ensure_session(
        &self,
        current: Option<SessionState>,
        now: DateTime<Utc>,
    ) -> Result<SessionState, RelayError> {
        if let Some(session) = current.filter(|s| !s.is_expired(now)) {
            return Ok(session);
        }
        if self.failing_logins.get() > 0 {
            self.failing_logins.set(self.failing_logins.get() - 1);
            return Err(RelayError::Auth("portal rejected the customer credentials".into()));
        }
        self.logins.set(self.logins.get() + 1);
        let mut session = SessionState::new(now, None);
        session.set_cookie("PHPSESSID", format!("session-{}", self.logins.get()));
        Ok(session)
    }

    fn fetch(&self, _session: &mut SessionState, _path: &str) -> Result<String, RelayError> {
        self.fetches.set(self.fetches.get() + 1);
        match self.steps.borrow_mut().pop_front() {
            Some(Step::Page(page)) => Ok(page),
            Some(Step::Unauthorized) => Err(RelayError::AuthExpired("portal returned 401".into())),
            Some(Step::Down) | None => Err(RelayError::Network("connection refused".into())),
        }
    }
}

/// Notifier that records descriptions and fails for selected ones.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    published: RefCell<Vec<String>>,
    attempts: RefCell<Vec<String>>,
    failing: RefCell<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries of events with this description fail until recovered.
    pub fn fail_for(&self, description: &str) {
        self.failing.borrow_mut().insert(description.to_string());
    }

    pub fn recover(&self, description: &str) {
        self.failing.borrow_mut().remove(description);
    }

    pub fn published(&self) -> Vec<String> {
        self.published.borrow().clone()
    }

    /// Drains the published list.
    pub fn take_published(&self) -> Vec<String> {
        std::mem::take(&mut *self.published.borrow_mut())
    }

    pub fn attempts_for(&self, description: &str) -> usize {
        self.attempts
            .borrow()
            .iter()
            .filter(|d| d.as_str() == description)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let description = event.description().to_string();
        self.attempts.borrow_mut().push(description.clone());
        if self.failing.borrow().contains(&description) {
            return Err(RelayError::Delivery("webhook returned 500".into()));
        }
        self.published.borrow_mut().push(description);
        Ok(())
    }
}

/// Clock that only moves when slept on.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
    sleeps: RefCell<Vec<Duration>>,
    stop_after: Cell<Option<usize>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
            sleeps: RefCell::new(Vec::new()),
            stop_after: Cell::new(None),
        }
    }

    /// Reports shutdown once `count` sleeps have been requested.
    pub fn stop_after_sleeps(self, count: usize) -> Self {
        self.stop_after.set(Some(count));
        self
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .set(self.now.get() + TimeDelta::from_std(by).unwrap());
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
        match self.stop_after.get() {
            Some(limit) if self.sleeps.borrow().len() >= limit => {
                shutdown.store(true, Ordering::SeqCst);
                false
            }
            _ => true,
        }
    }
}
