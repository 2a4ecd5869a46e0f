use axum::headers::{Cookie, HeaderMapExt};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use std::fmt;

use crate::Error;

pub const SESSION_COOKIE: &str = "auth-token";
pub const CSRF_COOKIE: &str = "csrf-token";

/// A `Set-Cookie` value. Always `HttpOnly`, `SameSite=Lax`, path `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: &'static str,
    pub value: String,
    pub max_age_secs: i64,
    pub secure: bool,
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.name, self.value, self.max_age_secs
        )?;
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}

impl SetCookie {
    pub fn header_value(&self) -> Result<HeaderValue, Error> {
        Ok(HeaderValue::from_str(&self.to_string())?)
    }
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .typed_get::<Cookie>()
        .and_then(|jar| jar.get(name).map(str::to_owned))
        .filter(|v| !v.is_empty())
}

/// Appends every cookie to the response rendered from `body`.
pub fn with_cookies<R: IntoResponse>(body: R, cookies: &[SetCookie]) -> Result<Response, Error> {
    let mut res = body.into_response();
    for cookie in cookies {
        res.headers_mut().append(SET_COOKIE, cookie.header_value()?);
    }
    Ok(res)
}
