use axum::async_trait;
use axum::extract::{FromRequest, RequestParts};
use chrono::Duration;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::cookies::{read_cookie, SetCookie, SESSION_COOKIE};
use crate::{AppState, Error};

/// Session credentials live for 7 days.
pub const SESSION_TTL_SECS: i64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a request is made by, as carried inside the session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    subject: Subject,
    iat: i64,
    exp: i64,
}

/// Mints and checks signed session credentials (HS256 JWTs).
///
/// Stateless: there is no server-side record of issued tokens, so a token
/// stays valid until `exp` unless the secret is rotated.
#[derive(Clone)]
pub struct SessionTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    clock: SharedClock,
    ttl: Duration,
    secure: bool,
}

impl SessionTokenService {
    pub fn new(secret: &[u8], clock: SharedClock, secure: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is checked against our own clock in `verify`
        validation.validate_exp = false;
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            clock,
            ttl: Duration::seconds(SESSION_TTL_SECS),
            secure,
        }
    }

    pub fn issue(&self, subject: &Subject) -> Result<String, Error> {
        let iat = self.clock.now().timestamp();
        let claims = Claims {
            subject: subject.clone(),
            iat,
            exp: iat + self.ttl.num_seconds(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Returns the subject only for an untampered, unexpired, well-formed token.
    pub fn verify(&self, token: &str) -> Option<Subject> {
        let claims = match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                let reason = match err.kind() {
                    ErrorKind::InvalidSignature => "bad signature",
                    ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => "bad payload",
                    _ => "malformed",
                };
                log::debug!(
                    "session token rejected ({}): prefix={}",
                    reason,
                    token_prefix(token)
                );
                return None;
            }
        };

        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            log::debug!(
                "session token expired at {} (now {}): prefix={}",
                claims.exp,
                now,
                token_prefix(token)
            );
            return None;
        }
        Some(claims.subject)
    }

    pub fn cookie(&self, token: String) -> SetCookie {
        SetCookie {
            name: SESSION_COOKIE,
            value: token,
            max_age_secs: self.ttl.num_seconds(),
            secure: self.secure,
        }
    }
}

pub(crate) fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(10) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Extractor for handlers that need an authenticated caller; rejects with 401.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Subject);

impl Authenticated {
    pub fn require_role(&self, allowed: &[Role]) -> Result<&Subject, Error> {
        if allowed.contains(&self.0.role) {
            Ok(&self.0)
        } else {
            log::warn!(
                "subject {} with role {} denied, needs one of {:?}",
                self.0.id,
                self.0.role,
                allowed
            );
            Err(Error::forbidden("Insufficient permissions"))
        }
    }
}

#[async_trait]
impl<B> FromRequest<B> for Authenticated
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let state = req
            .extensions()
            .get::<Arc<AppState>>()
            .cloned()
            .ok_or_else(|| Error::internal("MissingState"))?;
        read_cookie(req.headers(), SESSION_COOKIE)
            .and_then(|token| state.sessions.verify(&token))
            .map(Authenticated)
            .ok_or_else(Error::unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn service() -> (SessionTokenService, ManualClock) {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let service = SessionTokenService::new(b"test-secret", Arc::new(clock.clone()), false);
        (service, clock)
    }

    fn subject(role: Role) -> Subject {
        Subject {
            id: 7,
            email: "ada@example.com".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            role,
        }
    }

    #[test]
    fn verify_reconstructs_issued_subject() {
        let (service, _) = service();
        for role in [Role::Admin, Role::Manager, Role::Student] {
            let token = service.issue(&subject(role)).unwrap();
            assert_eq!(service.verify(&token), Some(subject(role)));
        }
    }

    #[test]
    fn any_mutated_byte_is_rejected() {
        let (service, _) = service();
        let token = service.issue(&subject(Role::Student)).unwrap();
        for idx in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert_eq!(service.verify(&mutated), None, "byte {} accepted", idx);
        }
    }

    #[test]
    fn expiry_boundary() {
        let (service, clock) = service();
        let token = service.issue(&subject(Role::Manager)).unwrap();

        clock.advance(Duration::seconds(SESSION_TTL_SECS - 1));
        assert!(service.verify(&token).is_some());

        clock.advance(Duration::seconds(1));
        assert_eq!(service.verify(&token), None);
    }

    #[test]
    fn other_secret_is_rejected() {
        let (service, clock) = service();
        let token = service.issue(&subject(Role::Admin)).unwrap();
        let other = SessionTokenService::new(b"another-secret", Arc::new(clock), false);
        assert_eq!(other.verify(&token), None);
    }

    #[test]
    fn garbage_and_foreign_payloads_are_rejected() {
        let (service, _) = service();
        assert_eq!(service.verify(""), None);
        assert_eq!(service.verify("not.a.jwt"), None);

        // correctly signed, but the role is outside the enum
        let foreign = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({"id": 1, "email": "x@y.z", "role": "root", "iat": 0, "exp": i64::MAX}),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert_eq!(service.verify(&foreign), None);
    }

    #[test]
    fn role_checks() {
        let auth = Authenticated(subject(Role::Manager));
        assert!(auth.require_role(&[Role::Admin, Role::Manager]).is_ok());
        assert!(matches!(
            auth.require_role(&[Role::Admin]),
            Err(Error::Forbidden { .. })
        ));
    }

    #[test]
    fn session_cookie_contract() {
        let (service, _) = service();
        let cookie = service.cookie("tok".into());
        assert_eq!(
            cookie.to_string(),
            "auth-token=tok; Path=/; Max-Age=604800; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn session_cookie_is_secure_in_production() {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let service = SessionTokenService::new(b"test-secret", Arc::new(clock), true);
        assert_eq!(
            service.cookie("tok".into()).to_string(),
            "auth-token=tok; Path=/; Max-Age=604800; HttpOnly; SameSite=Lax; Secure"
        );
    }

    #[test]
    fn prefix_is_truncated() {
        assert_eq!(token_prefix("abcdefghijklmnop"), "abcdefghij");
        assert_eq!(token_prefix("short"), "short");
    }
}
