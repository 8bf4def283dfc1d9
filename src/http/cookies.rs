//! Visitor tokens travel as cookies.

use crate::session::{IssuedToken, RequestTokens, ONLINE_COOKIE, VISIT_COOKIE};
use axum::http::header::COOKIE;
use axum::http::HeaderMap;

/// Pull the online and visit tokens out of every `Cookie` header.
///
/// Later occurrences of a name win; malformed pairs are ignored.
pub fn request_tokens(headers: &HeaderMap) -> RequestTokens {
    let mut tokens = RequestTokens::none();

    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match name.trim() {
                ONLINE_COOKIE => tokens.online = Some(value.to_string()),
                VISIT_COOKIE => tokens.visit = Some(value.to_string()),
                _ => {}
            }
        }
    }

    tokens
}

/// `Set-Cookie` value for an issued token.
pub fn set_cookie(token: &IssuedToken, now: i64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        token.kind.cookie_name(),
        token.value
    );
    if let Some(max_age) = token.max_age(now) {
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    cookie
}
