use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::session::{Role, Subject};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn subject(&self) -> Subject {
        Subject {
            id: self.id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub password_hash: String,
}

/// Where accounts live. Emails are stored lower-cased and are unique.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, Error>;

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, Error>;

    /// Fails with `UserAlreadyExists` when the email is taken.
    async fn create(&self, user: NewUser) -> Result<UserRecord, Error>;

    async fn touch_login(&self, id: i64) -> Result<(), Error>;
}

fn already_exists() -> Error {
    Error::UserAlreadyExists {
        message: "A user with this email already exists".to_string(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsers {
    by_email: DashMap<String, UserRecord>,
    next_id: AtomicI64,
}

impl MemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserDirectory for MemoryUsers {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, Error> {
        Ok(self.by_email.get(email).map(|u| u.value().clone()))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, Error> {
        Ok(self
            .by_email
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.value().clone()))
    }

    async fn create(&self, user: NewUser) -> Result<UserRecord, Error> {
        match self.by_email.entry(user.email.clone()) {
            Entry::Occupied(_) => Err(already_exists()),
            Entry::Vacant(slot) => {
                let record = UserRecord {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                    email: user.email,
                    first_name: user.first_name,
                    last_name: user.last_name,
                    role: user.role,
                    password_hash: user.password_hash,
                    created_at: Utc::now(),
                    last_login: None,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn touch_login(&self, id: i64) -> Result<(), Error> {
        if let Some(mut user) = self.by_email.iter_mut().find(|u| u.id == id) {
            user.last_login = Some(Utc::now());
        }
        Ok(())
    }
}

pub const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('admin', 'manager', 'student')),
    password_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_login TIMESTAMPTZ
)
"#;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    first_name: String,
    last_name: String,
    role: String,
    password_hash: String,
    created_at: DateTime<Utc>,
    last_login: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = Role::parse(&row.role).ok_or_else(|| {
            log::error!("user {} has unknown role `{}`", row.id, row.role);
            Error::internal("DatabaseError")
        })?;
        Ok(UserRecord {
            id: row.id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            role,
            password_hash: row.password_hash,
            created_at: row.created_at,
            last_login: row.last_login,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgUsers {
    pg: PgPool,
}

impl PgUsers {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pg = PgPool::connect(url).await?;
        sqlx::query(USERS_SCHEMA).execute(&pg).await?;
        Ok(Self { pg })
    }
}

#[async_trait]
impl UserDirectory for PgUsers {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, Error> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = $1 LIMIT 1")
            .bind(email)
            .fetch_optional(&self.pg)
            .await?
            .map(UserRecord::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, Error> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pg)
            .await?
            .map(UserRecord::try_from)
            .transpose()
    }

    async fn create(&self, user: NewUser) -> Result<UserRecord, Error> {
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (email, first_name, last_name, role, password_hash) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .bind(&user.password_hash)
        .fetch_one(&self.pg)
        .await
        .map_err(|err| {
            let unique_violation = err
                .as_database_error()
                .and_then(|db| db.code())
                .map_or(false, |code| code == "23505");
            if unique_violation {
                already_exists()
            } else {
                Error::from(err)
            }
        })?;
        UserRecord::try_from(row)
    }

    async fn touch_login(&self, id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE users SET last_login = CURRENT_TIMESTAMP WHERE id = $1")
            .bind(id)
            .execute(&self.pg)
            .await?;
        Ok(())
    }
}
