use std::sync::Arc;

use openlms_gate::clock::SystemClock;
use openlms_gate::config::Settings;
use openlms_gate::models::{MemoryUsers, PgUsers, UserDirectory};
use openlms_gate::rate_limit::spawn_sweeper;
use openlms_gate::{app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let settings = Settings::from_env()?;
    log::debug!("loaded {:?}", settings);

    let users: Arc<dyn UserDirectory> = match &settings.database_url {
        Some(url) => Arc::new(PgUsers::connect(url).await?),
        None => {
            if settings.production {
                anyhow::bail!("DATABASE_URL must be set when APP_ENV=production");
            }
            log::warn!("DATABASE_URL not set, keeping users in memory");
            Arc::new(MemoryUsers::new())
        }
    };

    let state = Arc::new(AppState::new(&settings, users, Arc::new(SystemClock)));
    spawn_sweeper(state.limiter.clone(), settings.sweep_interval);

    log::info!(
        "Starting OpenLMS gate on http://{} ({})",
        settings.bind_addr,
        if settings.production { "production" } else { "development" }
    );
    axum::Server::bind(&settings.bind_addr)
        .serve(app(state).into_make_service())
        .await?;
    Ok(())
}
