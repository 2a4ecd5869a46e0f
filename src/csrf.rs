//! Double-submit-cookie CSRF protection.
//!
//! The token lives in an `HttpOnly` cookie and is handed to the page through
//! `GET /api/csrf-token`; the page echoes it back in `x-csrf-token` on every
//! state-changing request and the two are compared in constant time.

use axum::http::{HeaderMap, Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::cookies::{read_cookie, SetCookie, CSRF_COOKIE};
use crate::session::token_prefix;
use crate::{AppState, Error};

pub const CSRF_HEADER: &str = "x-csrf-token";

/// 24 hours
pub const CSRF_TTL_SECS: i64 = 60 * 60 * 24;

const TOKEN_BYTES: usize = 32;

/// Endpoints reachable before a page has fetched its token, plus the upload
/// endpoint whose multipart client does not send the header.
pub const EXEMPT_PATHS: [&str; 4] = [
    "/api/auth/login",
    "/api/auth/register",
    "/api/csrf-token",
    "/api/upload",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingHeader,
    MissingCookie,
    LengthMismatch,
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct CsrfGuard {
    secure: bool,
}

impl CsrfGuard {
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }

    pub fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Keeps the cookie-bound token when there is one, mints a new one otherwise.
    ///
    /// The returned cookie must be written back on every call so the
    /// browser-side expiry slides forward.
    pub fn issue_or_reuse(&self, existing: Option<&str>) -> (String, SetCookie) {
        let token = match existing {
            Some(token) if is_well_formed(token) => token.to_owned(),
            Some(token) => {
                log::debug!("replacing malformed csrf cookie: prefix={}", token_prefix(token));
                Self::generate_token()
            }
            None => Self::generate_token(),
        };
        let cookie = self.cookie(token.clone());
        (token, cookie)
    }

    pub fn cookie(&self, token: String) -> SetCookie {
        SetCookie {
            name: CSRF_COOKIE,
            value: token,
            max_age_secs: CSRF_TTL_SECS,
            secure: self.secure,
        }
    }

    pub fn is_exempt(method: &Method, path: &str) -> bool {
        matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
            || EXEMPT_PATHS.iter().any(|p| path.starts_with(p))
    }

    pub fn validate(&self, method: &Method, path: &str, headers: &HeaderMap) -> Verdict {
        if Self::is_exempt(method, path) {
            return Verdict::Accepted;
        }
        let header = headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let cookie = read_cookie(headers, CSRF_COOKIE);
        compare(header, cookie.as_deref())
    }
}

/// Length is checked first; the byte comparison itself never exits early.
pub fn compare(header: Option<&str>, cookie: Option<&str>) -> Verdict {
    let header = match header {
        Some(h) => h,
        None => return Verdict::Rejected(Rejection::MissingHeader),
    };
    let cookie = match cookie {
        Some(c) => c,
        None => return Verdict::Rejected(Rejection::MissingCookie),
    };
    if header.len() != cookie.len() {
        return Verdict::Rejected(Rejection::LengthMismatch);
    }
    if bool::from(header.as_bytes().ct_eq(cookie.as_bytes())) {
        Verdict::Accepted
    } else {
        Verdict::Rejected(Rejection::Mismatch)
    }
}

fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Router-wide middleware; refuses state-changing requests with 403.
pub async fn guard<B>(req: Request<B>, next: Next<B>) -> Result<Response, Error> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .cloned()
        .ok_or_else(|| Error::internal("MissingState"))?;

    match state.csrf.validate(req.method(), req.uri().path(), req.headers()) {
        Verdict::Accepted => {
            log::trace!("csrf ok: {} {}", req.method(), req.uri().path());
            Ok(next.run(req).await)
        }
        Verdict::Rejected(reason) => {
            log::warn!(
                "csrf rejected ({:?}): {} {}",
                reason,
                req.method(),
                req.uri().path()
            );
            Err(Error::forbidden("Invalid or missing CSRF token"))
        }
    }
}
