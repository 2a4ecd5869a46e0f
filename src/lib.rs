pub mod auth;
pub mod clock;
pub mod config;
pub mod cookies;
pub mod csrf;
pub mod err;
pub mod models;
pub mod rate_limit;
pub mod session;

use axum::handler::Handler;
use axum::{middleware, routing::get, routing::post, Extension, Router};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;

use crate::clock::SharedClock;
use crate::config::Settings;
use crate::csrf::CsrfGuard;
use crate::err::{Fine, Maybe, Nothing};
use crate::models::UserDirectory;
use crate::rate_limit::RateLimiter;
use crate::session::SessionTokenService;

pub use crate::err::Error;

pub type Payload<T> = Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}

/// Everything a request handler can reach, shared behind one `Arc`.
pub struct AppState {
    pub sessions: SessionTokenService,
    pub csrf: CsrfGuard,
    pub limiter: RateLimiter,
    pub users: Arc<dyn UserDirectory>,
}

impl AppState {
    pub fn new(settings: &Settings, users: Arc<dyn UserDirectory>, clock: SharedClock) -> Self {
        Self {
            sessions: SessionTokenService::new(&settings.jwt_secret, clock.clone(), settings.production),
            csrf: CsrfGuard::new(settings.production),
            limiter: RateLimiter::new(clock),
            users,
        }
    }
}

/// Assembles the router. Requests pass the CSRF guard before reaching any
/// route; handlers do their own rate limiting and session checks.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/me", get(auth::me))
        .route("/api/csrf-token", get(auth::csrf_token))
        .fallback(err::handler404.into_service())
        .layer(
            ServiceBuilder::new()
                .layer(Extension(state))
                .layer(middleware::from_fn(csrf::guard)),
        )
}
