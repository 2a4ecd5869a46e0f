use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cookies::{read_cookie, with_cookies, CSRF_COOKIE};
use crate::err::Fine;
use crate::models::NewUser;
use crate::rate_limit::Policy;
use crate::session::{Authenticated, Role, Subject};
use crate::{breaks, proceeds, AppState, Error, Payload};

const PASSWORD_MIN: usize = 6;
const PASSWORD_MAX: usize = 100;
const NAME_MIN: usize = 2;
const NAME_MAX: usize = 100;

pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Pbkdf2.hash_password(password.as_bytes(), &salt)?.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(err) => {
            log::error!("stored password hash is unreadable: {}", err);
            false
        }
    }
}

/// `local@domain.tld`, no whitespace anywhere.
pub fn validate_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return false,
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

/// Trims and drops angle brackets.
pub fn sanitize_input(input: &str) -> String {
    input.trim().chars().filter(|c| *c != '<' && *c != '>').collect()
}

// Not `Json<T>`: a missing or unparsable body must reach field validation and
// come back as our 400, not as an extractor rejection.
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedIn {
    user: Subject,
    csrf_token: String,
}

pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    state.limiter.admit("login", &headers, &Policy::LOGIN)?;

    let login: LoginRequest = parse_body(&body);
    let (email, password) = match (present(&login.email), present(&login.password)) {
        (Some(email), Some(password)) => (email.trim().to_lowercase(), password),
        _ => return Err(Error::malformed("Email and password are required")),
    };

    let invalid = || Error::Unauthenticated {
        message: "Invalid email or password".to_string(),
    };
    let user = match state.users.find_by_email(&email).await? {
        Some(user) => user,
        None => {
            log::info!("login for unknown email");
            return Err(invalid());
        }
    };
    if !verify_password(password, &user.password_hash) {
        log::info!("login failed for user {}", user.id);
        return Err(invalid());
    }

    state.users.touch_login(user.id).await?;

    let subject = user.subject();
    let session = state.sessions.issue(&subject)?;
    let existing = read_cookie(&headers, CSRF_COOKIE);
    let (csrf_token, csrf_cookie) = state.csrf.issue_or_reuse(existing.as_deref());

    log::info!("user {} logged in as {}", subject.id, subject.role);
    with_cookies(
        Fine(LoggedIn {
            user: subject,
            csrf_token,
        }),
        &[state.sessions.cookie(session), csrf_cookie],
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    email: Option<String>,
    password: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Registered {
    user: Subject,
    token: String,
}

impl RegisterRequest {
    fn validate(&self) -> Result<NewUser, Error> {
        let (email, password, first_name, last_name) = match (
            present(&self.email),
            present(&self.password),
            present(&self.first_name),
            present(&self.last_name),
        ) {
            (Some(e), Some(p), Some(f), Some(l)) => (e, p, f, l),
            _ => return Err(Error::malformed("All fields are required")),
        };

        if !validate_email(email) {
            return Err(Error::malformed("Invalid email format"));
        }

        let password_len = password.chars().count();
        if password_len < PASSWORD_MIN {
            return Err(Error::malformed(format!(
                "Password must be at least {} characters",
                PASSWORD_MIN
            )));
        }
        if password_len > PASSWORD_MAX {
            return Err(Error::malformed(format!(
                "Password must be at most {} characters",
                PASSWORD_MAX
            )));
        }

        let first_name = sanitize_input(first_name);
        let last_name = sanitize_input(last_name);
        for name in [&first_name, &last_name] {
            let len = name.chars().count();
            if len < NAME_MIN || len > NAME_MAX {
                return Err(Error::malformed(format!(
                    "Names must be between {} and {} characters",
                    NAME_MIN, NAME_MAX
                )));
            }
        }

        let role = match present(&self.role) {
            Some(raw) => Role::parse(raw).ok_or_else(|| Error::malformed("Invalid user role"))?,
            None => Role::Student,
        };
        if role != Role::Student {
            return Err(Error::forbidden("Self-registration is limited to students"));
        }

        Ok(NewUser {
            email: email.trim().to_lowercase(),
            first_name,
            last_name,
            role,
            password_hash: hash_password(password)?,
        })
    }
}

pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    state
        .limiter
        .admit("register", &headers, &Policy::REGISTRATION)?;

    let request: RegisterRequest = parse_body(&body);
    let new_user = request.validate()?;
    let user = state.users.create(new_user).await?;

    let subject = user.subject();
    let token = state.sessions.issue(&subject)?;
    let cookie = state.sessions.cookie(token.clone());

    log::info!("registered user {} as {}", subject.id, subject.role);
    with_cookies(
        Fine(Registered {
            user: subject,
            token,
        }),
        &[cookie],
    )
}

#[derive(Debug, Serialize)]
pub struct CurrentUser {
    user: Subject,
}

pub async fn me(
    Authenticated(subject): Authenticated,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<CurrentUser> {
    let user = match state.users.find_by_id(subject.id).await? {
        Some(user) => user,
        None => {
            return breaks(Error::UserDoesNotExist {
                message: "User not found".to_string(),
            })
        }
    };
    proceeds(CurrentUser {
        user: user.subject(),
    })
}

#[derive(Debug, Serialize)]
pub struct CsrfIssued {
    token: String,
}

pub async fn csrf_token(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    state.limiter.admit("csrf", &headers, &Policy::TOKEN_ISSUANCE)?;

    let existing = read_cookie(&headers, CSRF_COOKIE);
    let (token, cookie) = state.csrf.issue_or_reuse(existing.as_deref());
    log::debug!("csrf token served (reused: {})", existing.as_deref() == Some(token.as_str()));
    with_cookies(Fine(CsrfIssued { token }), &[cookie])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("a@b.co"));
        assert!(validate_email("  first.last@school.edu "));
        assert!(!validate_email(""));
        assert!(!validate_email("no-at.example.com"));
        assert!(!validate_email("a@b"));
        assert!(!validate_email("a b@c.d"));
        assert!(!validate_email("@b.co"));
        assert!(!validate_email("a@@b.co"));
        assert!(!validate_email("a@.co"));
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_input("  <b>Ada</b> "), "bAda/b");
        assert_eq!(sanitize_input("<>"), "");
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not a hash"));
    }

    fn request(role: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            email: Some("New@Example.com".into()),
            password: Some("secret1".into()),
            first_name: Some(" Alan ".into()),
            last_name: Some("Turing".into()),
            role: role.map(str::to_string),
        }
    }

    #[test]
    fn register_validation() {
        let user = request(None).validate().unwrap();
        assert_eq!(user.email, "new@example.com");
        assert_eq!(user.first_name, "Alan");
        assert_eq!(user.role, Role::Student);

        assert!(request(Some("student")).validate().is_ok());
        assert!(matches!(
            request(Some("wizard")).validate(),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            request(Some("admin")).validate(),
            Err(Error::Forbidden { .. })
        ));

        let mut short = request(None);
        short.password = Some("12345".into());
        assert!(matches!(short.validate(), Err(Error::Malformed { .. })));

        let mut long = request(None);
        long.password = Some("x".repeat(101));
        assert!(matches!(long.validate(), Err(Error::Malformed { .. })));

        let mut tiny_name = request(None);
        tiny_name.last_name = Some("<T>".into());
        assert!(matches!(tiny_name.validate(), Err(Error::Malformed { .. })));

        let mut missing = request(None);
        missing.first_name = None;
        assert!(matches!(missing.validate(), Err(Error::Malformed { .. })));
    }

    #[test]
    fn lenient_body_parsing() {
        let parsed: LoginRequest = parse_body(&Bytes::from_static(b"not json"));
        assert!(parsed.email.is_none() && parsed.password.is_none());
    }
}
