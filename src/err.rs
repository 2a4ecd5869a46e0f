#![allow(non_snake_case)]

use axum::http::header::{InvalidHeaderValue, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Every way a request can be refused.
///
/// Messages are meant for clients and stay generic; anything an operator
/// needs goes to the log before the error is built.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    Unauthenticated { message: String },
    Forbidden { message: String },
    RateLimited {
        message: String,
        #[serde(skip)]
        retry_after: u64,
    },
    Malformed { message: String },
    UserAlreadyExists { message: String },
    UserDoesNotExist { message: String },
    NotFound { message: String },
    InternalError {
        #[serde(skip)]
        kind: &'static str,
        message: String,
    },
}

#[derive(Serialize)]
struct Failure<'a> {
    success: bool,
    #[serde(flatten)]
    error: &'a Error,
}

impl Error {
    pub fn unauthenticated() -> Error {
        Error::Unauthenticated {
            message: "Not authenticated".to_string(),
        }
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Error {
        Error::Forbidden {
            message: msg.into(),
        }
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Error {
        Error::Malformed {
            message: msg.into(),
        }
    }

    pub fn internal(kind: &'static str) -> Error {
        Error::InternalError {
            kind,
            message: "Internal server error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Malformed { .. } | Error::UserAlreadyExists { .. } => StatusCode::BAD_REQUEST,
            Error::UserDoesNotExist { .. } | Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Error::InternalError { kind, .. } = &self {
            log::error!("responding {} ({})", status, kind);
        }
        let mut res = (
            status,
            Json(Failure {
                success: false,
                error: &self,
            }),
        )
            .into_response();
        if let Error::RateLimited { retry_after, .. } = &self {
            res.headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(*retry_after));
        }
        res
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        log::error!("database error: {}", err);
        Self::internal("DatabaseError")
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        log::error!("token signing error: {}", err);
        Self::internal("SigningError")
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        log::error!("serialization error: {}", err);
        Self::internal("SerializationError")
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        log::error!("password hashing error: {}", err);
        Self::internal("HashingError")
    }
}

impl From<InvalidHeaderValue> for Error {
    fn from(err: InvalidHeaderValue) -> Self {
        log::error!("invalid header value: {}", err);
        Self::internal("HeaderError")
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        log::error!("unexpected error: {:#}", err);
        Self::internal("Unknown")
    }
}
