//! A session: one reusable client identity.
//!
//! Sessions accumulate reputation through `mark_good` / `mark_bad` and
//! become unusable once their error score or usage count crosses its
//! threshold, or once they expire. Cookies are kept per URL origin so an
//! identity looks consistent to each site it visits.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// One cookie, name and value only; attributes are the browser's concern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Tunables for newly created sessions
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Session is retired once `error_score` reaches this
    pub max_error_score: f64,
    /// How much one `mark_good` call decays the error score
    pub error_score_decrement: f64,
    /// Session is retired once it has been used this many times
    pub max_usage_count: u32,
    /// Lifetime after which the session expires
    pub max_age_secs: i64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_error_score: 3.0,
            error_score_decrement: 1.0,
            max_usage_count: 50,
            max_age_secs: 3000,
        }
    }
}

/// Reputation-tracked identity bound to at most one proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub usage_count: u32,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_usage_count: u32,
    /// Cookies keyed by URL origin
    pub cookies: HashMap<String, Vec<Cookie>>,
    pub proxy_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session with a random id
    pub fn new(options: &SessionOptions) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            usage_count: 0,
            error_score: 0.0,
            max_error_score: options.max_error_score,
            error_score_decrement: options.error_score_decrement,
            max_usage_count: options.max_usage_count,
            cookies: HashMap::new(),
            proxy_url: None,
            created_at,
            expires_at: created_at + ChronoDuration::seconds(options.max_age_secs),
        }
    }

    /// Bind a proxy URL to this session
    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    /// Whether the session has outlived its expiry
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the session may still be handed out
    pub fn is_usable(&self) -> bool {
        self.error_score < self.max_error_score
            && self.usage_count < self.max_usage_count
            && !self.is_expired()
    }

    /// Record a successful use: decays the error score
    pub fn mark_good(&mut self) {
        self.usage_count += 1;
        self.error_score = (self.error_score - self.error_score_decrement).max(0.0);
    }

    /// Record a failed use: raises the error score
    pub fn mark_bad(&mut self) {
        self.usage_count += 1;
        self.error_score += 1.0;
    }

    /// Force the session unusable
    pub fn retire(&mut self) {
        self.error_score = self.max_error_score;
    }

    /// Cookies stored for the origin of `url`
    pub fn cookies_for(&self, url: &Url) -> &[Cookie] {
        self.cookies
            .get(&url.origin().ascii_serialization())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Store a cookie under the origin of `url`, replacing one with the
    /// same name.
    pub fn set_cookie(&mut self, url: &Url, cookie: Cookie) {
        let origin = url.origin().ascii_serialization();
        let jar = self.cookies.entry(origin).or_default();
        if let Some(existing) = jar.iter_mut().find(|c| c.name == cookie.name) {
            existing.value = cookie.value;
        } else {
            jar.push(cookie);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&SessionOptions::default())
    }

    #[test]
    fn test_new_session_is_usable() {
        let session = session();
        assert!(session.is_usable());
        assert_eq!(session.usage_count, 0);
        assert_eq!(session.error_score, 0.0);
    }

    #[test]
    fn test_mark_bad_until_retired() {
        let mut session = session();
        session.mark_bad();
        session.mark_bad();
        assert!(session.is_usable());
        session.mark_bad();
        assert!(!session.is_usable());
        assert_eq!(session.usage_count, 3);
    }

    #[test]
    fn test_mark_good_decays_error_score() {
        let mut session = session();
        session.mark_bad();
        session.mark_bad();
        session.mark_good();
        assert_eq!(session.error_score, 1.0);
        session.mark_good();
        session.mark_good();
        assert_eq!(session.error_score, 0.0);
    }

    #[test]
    fn test_usage_count_exhaustion() {
        let mut session = Session::new(&SessionOptions {
            max_usage_count: 2,
            ..SessionOptions::default()
        });
        session.mark_good();
        assert!(session.is_usable());
        session.mark_good();
        assert!(!session.is_usable());
    }

    #[test]
    fn test_expiry() {
        let session = Session::new(&SessionOptions {
            max_age_secs: -1,
            ..SessionOptions::default()
        });
        assert!(session.is_expired());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_retire() {
        let mut session = session();
        session.retire();
        assert!(!session.is_usable());
    }

    #[test]
    fn test_cookies_keyed_by_origin() {
        let mut session = session();
        let a = Url::parse("https://a.example.com/x").unwrap();
        let b = Url::parse("https://b.example.com/y").unwrap();

        session.set_cookie(
            &a,
            Cookie {
                name: "sid".into(),
                value: "1".into(),
            },
        );
        session.set_cookie(
            &a,
            Cookie {
                name: "sid".into(),
                value: "2".into(),
            },
        );

        assert_eq!(session.cookies_for(&a).len(), 1);
        assert_eq!(session.cookies_for(&a)[0].value, "2");
        assert!(session.cookies_for(&b).is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut session = session().with_proxy_url("http://proxy:8080");
        session.mark_bad();
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.error_score, 1.0);
        assert_eq!(back.proxy_url.as_deref(), Some("http://proxy:8080"));
    }
}
