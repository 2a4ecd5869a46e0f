use anyhow::{bail, Context};
use rand::{thread_rng, Rng};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Default interval between rate-limit sweeps (5 minutes)
const DEFAULT_SWEEP_SECS: u64 = 300;

#[derive(Clone)]
pub struct Settings {
    pub jwt_secret: Vec<u8>,
    /// Enables `Secure` on every cookie we set.
    pub production: bool,
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub sweep_interval: Duration,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("jwt_secret", &"<redacted>")
            .field("production", &self.production)
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl Settings {
    /// Reads settings from the process environment, after an optional `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(err).context("failed to read .env");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = get("APP_ENV")
            .map(|v| v.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let jwt_secret = match get("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret.into_bytes(),
            None if production => bail!("JWT_SECRET must be set when APP_ENV=production"),
            None => {
                log::warn!("JWT_SECRET not set, using an ephemeral secret; sessions will not survive a restart");
                let bytes: [u8; 32] = thread_rng().gen();
                bytes.to_vec()
            }
        };

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDR is not a socket address")?;

        let sweep_interval = match get("RATE_LIMIT_SWEEP_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .context("RATE_LIMIT_SWEEP_SECS is not an integer")?;
                if secs == 0 {
                    bail!("RATE_LIMIT_SWEEP_SECS must be positive");
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_SWEEP_SECS),
        };

        Ok(Self {
            jwt_secret,
            production,
            bind_addr,
            database_url: get("DATABASE_URL").filter(|s| !s.is_empty()),
            sweep_interval,
        })
    }
}
