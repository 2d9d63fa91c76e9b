//! AlertMobile portal session client.
//!
//! The portal is a PHP site behind a customer-number login. Session state
//! (the PHP cookies) is modelled as an explicit [`SessionState`] value that
//! the caller holds and passes back in; the client itself keeps no cookie
//! jar.
//!
//! # Flow
//!
//! ```text
//! GET  koi_kb.php                      -> initial session cookie
//! POST koi_kb.php  klantnr, gecrypt    -> authenticated session
//! GET  koi_kb.php?mscherm=status&...   -> alarm history listing
//! ```
//!
//! `fetch` does a single request per call and never retries on errors;
//! retry policy belongs to the poll loop. The only repeat is the portal's
//! "change user" detour right after login, which needs another navigation
//! before the listing is served.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use md5::{Digest, Md5};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{redirect, StatusCode};

use crate::constants;
use crate::error::RelayError;

/// Cookies and lifetime of one portal login.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionState {
    cookies: BTreeMap<String, String>,
    established_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Cookie values are session secrets; only names are shown.
        f.debug_struct("SessionState")
            .field("cookies", &self.cookie_names())
            .field("established_at", &self.established_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl SessionState {
    /// Starts an empty session at `established_at`, valid for `ttl`
    /// (`None` = until the portal rejects it).
    pub fn new(established_at: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| established_at.checked_add_signed(ttl));
        Self {
            cookies: BTreeMap::new(),
            established_at,
            expires_at,
        }
    }

    /// When the login happened.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// When the session should be replaced, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Returns true once `now` has reached the expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Names of the cookies held, safe for logging.
    pub fn cookie_names(&self) -> Vec<&str> {
        self.cookies.keys().map(String::as_str).collect()
    }

    /// Sets a cookie directly.
    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    /// Value for a `Cookie` request header, if any cookie is held.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Applies the `Set-Cookie` headers of a response.
    ///
    /// Cookies sent with `Max-Age=0` are removed.
    pub fn absorb_set_cookies(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let mut parts = value.split(';');
            let Some((name, cookie_value)) = parts.next().and_then(|p| p.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let expired = parts.any(|attr| {
                attr.split_once('=').is_some_and(|(key, val)| {
                    key.trim().eq_ignore_ascii_case("max-age") && val.trim() == "0"
                })
            });
            if expired {
                self.cookies.remove(name);
            } else {
                self.cookies
                    .insert(name.to_string(), cookie_value.trim().to_string());
            }
        }
    }
}

/// Session-based access to the alarm portal.
pub trait Portal {
    /// Returns a usable session.
    ///
    /// `current` is handed back untouched while it has not expired;
    /// otherwise a fresh login is performed.
    fn ensure_session(
        &self,
        current: Option<SessionState>,
        now: DateTime<Utc>,
    ) -> Result<SessionState, RelayError>;

    /// Fetches one page with the session, updating its cookies.
    ///
    /// Fails with [`RelayError::AuthExpired`] when the portal no longer
    /// accepts the session; the caller must log in again before retrying.
    fn fetch(&self, session: &mut SessionState, path: &str) -> Result<String, RelayError>;
}

/// Customer credentials for the portal login form.
#[derive(Clone, PartialEq, Eq)]
pub struct PortalCredentials {
    customer_number: String,
    customer_code: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("customer_number", &self.customer_number)
            .field("customer_code", &"<redacted>")
            .finish()
    }
}

impl PortalCredentials {
    /// Creates credentials from the customer number and code.
    pub fn new(customer_number: impl Into<String>, customer_code: impl Into<String>) -> Self {
        Self {
            customer_number: customer_number.into(),
            customer_code: customer_code.into(),
        }
    }

    /// The customer number (not secret).
    pub fn customer_number(&self) -> &str {
        &self.customer_number
    }

    /// The login form's `gecrypt` field: lowercase hex MD5 of the code.
    pub fn login_digest(&self) -> String {
        format!("{:x}", Md5::digest(self.customer_code.as_bytes()))
    }
}

/// Blocking HTTP client for the AlertMobile portal.
#[derive(Debug, Clone)]
pub struct AlertMobileClient {
    client: Client,
    base_url: String,
    credentials: PortalCredentials,
    session_ttl: Option<Duration>,
}

impl AlertMobileClient {
    /// Creates a client for the portal at `base_url`.
    ///
    /// Redirects are followed by hand so that cookies set on intermediate
    /// responses end up in the [`SessionState`].
    pub fn new(
        base_url: impl Into<String>,
        credentials: PortalCredentials,
        session_ttl: Option<Duration>,
    ) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(RelayError::network)?;
        Ok(Self::with_client(client, base_url, credentials, session_ttl))
    }

    /// Creates a client around a pre-configured HTTP client.
    ///
    /// The client should not follow redirects itself.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        credentials: PortalCredentials,
        session_ttl: Option<Duration>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            credentials,
            session_ttl,
        }
    }

    /// Returns the portal URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends `request` with the session cookies, following redirects.
    fn send(
        &self,
        session: &mut SessionState,
        mut request: RequestBuilder,
    ) -> Result<Response, RelayError> {
        for _ in 0..=constants::MAX_REDIRECTS {
            if let Some(cookie) = session.cookie_header() {
                request = request.header(COOKIE, cookie);
            }
            let response = request.send().map_err(RelayError::network)?;
            session.absorb_set_cookies(response.headers());
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    RelayError::Network(format!(
                        "portal returned {} without a location",
                        response.status()
                    ))
                })?;
            let next = response
                .url()
                .join(location)
                .map_err(|e| RelayError::Network(format!("bad redirect target: {e}")))?;
            log::debug!("Following portal redirect to {}", next.path());
            request = self.client.get(next);
        }
        Err(RelayError::Network("too many portal redirects".to_string()))
    }

    fn login(&self, now: DateTime<Utc>) -> Result<SessionState, RelayError> {
        let mut session = SessionState::new(now, self.session_ttl);

        let landing = self.send(&mut session, self.client.get(&self.base_url))?;
        let status = landing.status();
        if status.is_server_error() {
            return Err(RelayError::Network(format!("portal landing page returned {status}")));
        }
        if !status.is_success() {
            return Err(RelayError::Auth(format!("portal landing page returned {status}")));
        }

        let digest = self.credentials.login_digest();
        let form = [
            ("klantnr", self.credentials.customer_number()),
            ("klantcode", ""),
            ("gecrypt", digest.as_str()),
        ];
        let response = self.send(&mut session, self.client.post(&self.base_url).form(&form))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(RelayError::Network(format!("portal login returned {status}")));
        }
        if !status.is_success() {
            return Err(RelayError::Auth(format!("portal login returned {status}")));
        }
        let body = response.text().map_err(RelayError::network)?;
        if body.contains(constants::LOGIN_FORM_MARKER) && !body.contains(constants::LISTING_MARKER)
        {
            return Err(RelayError::Auth(
                "portal rejected the customer credentials".to_string(),
            ));
        }

        log::info!(
            "Logged in to portal as customer {} (cookies: {:?})",
            self.credentials.customer_number(),
            session.cookie_names()
        );
        Ok(session)
    }
}

impl Portal for AlertMobileClient {
    fn ensure_session(
        &self,
        current: Option<SessionState>,
        now: DateTime<Utc>,
    ) -> Result<SessionState, RelayError> {
        match current {
            Some(session) if !session.is_expired(now) => Ok(session),
            Some(_) => {
                log::info!("Portal session expired, logging in again");
                self.login(now)
            }
            None => self.login(now),
        }
    }

    fn fetch(&self, session: &mut SessionState, path: &str) -> Result<String, RelayError> {
        let url = self.url_for(path);
        let mut body = String::new();

        for attempt in 0..constants::STATUS_NAVIGATION_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(constants::STATUS_NAVIGATION_DELAY);
            }

            let response = self.send(session, self.client.get(&url))?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(RelayError::AuthExpired(format!("portal returned {status}")));
            }
            if !status.is_success() {
                return Err(RelayError::Network(format!("portal returned {status}")));
            }
            body = response.text().map_err(RelayError::network)?;

            if body.contains(constants::LISTING_MARKER) {
                return Ok(body);
            }
            if body.contains(constants::CHANGE_USER_MARKER) {
                log::debug!("Portal served the change-user page, navigating again");
                continue;
            }
            if body.contains(constants::LOGIN_FORM_MARKER) {
                return Err(RelayError::AuthExpired(
                    "portal served the login form".to_string(),
                ));
            }
            return Ok(body);
        }

        log::warn!(
            "Portal kept serving the change-user page after {} attempts",
            constants::STATUS_NAVIGATION_ATTEMPTS
        );
        Ok(body)
    }
}
