//! Online-session and visit classification from visitor tokens.
//!
//! The server never stores issued tokens. An online token carries the online
//! window index it was issued in and is only honoured inside that window; a
//! visit token carries its issue time and is honoured indefinitely.

use crate::keys::KeyScheme;
use serde::Serialize;

/// Cookie holding the online-session token.
pub const ONLINE_COOKIE: &str = "oid";
/// Cookie holding the visit token.
pub const VISIT_COOKIE: &str = "sid";

/// Tokens presented by the visitor, as raw cookie values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTokens {
    pub online: Option<String>,
    pub visit: Option<String>,
}

impl RequestTokens {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Online,
    Visit,
}

impl TokenKind {
    pub fn cookie_name(&self) -> &'static str {
        match self {
            TokenKind::Online => ONLINE_COOKIE,
            TokenKind::Visit => VISIT_COOKIE,
        }
    }
}

/// A token the boundary layer must hand back to the visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub kind: TokenKind,
    pub value: String,
    /// Unix timestamp after which the client should drop the token.
    /// `None` means no expiry (session cookie).
    pub expires_at: Option<i64>,
}

impl IssuedToken {
    /// Seconds from `now` until expiry, for a cookie Max-Age.
    pub fn max_age(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| (at - now).max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDecision {
    pub is_new_online_session: bool,
    pub is_new_visit: bool,
    pub online_token: Option<IssuedToken>,
    pub visit_token: Option<IssuedToken>,
}

#[derive(Debug, Clone)]
pub struct SessionGate {
    keys: KeyScheme,
    visit_token_max_age_secs: Option<u64>,
}

impl SessionGate {
    pub fn new(keys: KeyScheme, visit_token_max_age_secs: Option<u64>) -> Self {
        Self {
            keys,
            visit_token_max_age_secs,
        }
    }

    pub fn classify(&self, tokens: &RequestTokens, now: i64) -> SessionDecision {
        let window = self.keys.window_of(now);

        let online_valid = tokens
            .online
            .as_deref()
            .and_then(|t| t.trim().parse::<i64>().ok())
            .is_some_and(|issued_window| issued_window == window);

        let visit_valid = tokens
            .visit
            .as_deref()
            .and_then(|t| t.trim().parse::<i64>().ok())
            .is_some_and(|issued_at| {
                issued_at > 0 && issued_at <= now + self.keys.online_window_secs()
            });

        let online_token = (!online_valid).then(|| IssuedToken {
            kind: TokenKind::Online,
            value: window.to_string(),
            expires_at: Some(self.keys.window_end(window)),
        });

        let visit_token = (!visit_valid).then(|| IssuedToken {
            kind: TokenKind::Visit,
            value: now.to_string(),
            expires_at: self
                .visit_token_max_age_secs
                .map(|max_age| now + max_age as i64),
        });

        SessionDecision {
            is_new_online_session: !online_valid,
            is_new_visit: !visit_valid,
            online_token,
            visit_token,
        }
    }
}
