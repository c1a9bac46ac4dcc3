use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;
mod store;

use config::Config;
use dbus_interface::{AppState, AttendanceService};
use rate_limiter::RateLimiter;
use store::ProfileStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let cfg = Config::from_env();

    // Model artifacts are loaded once at startup and shared read-only for the
    // life of the process. A missing cascade model is fatal; a missing
    // embedding model binds the histogram fallback strategy.
    let missing = rollcall_models::missing_models(&cfg.model_dir);
    for model in &missing {
        tracing::warn!(name = model.name, url = model.url, "model file missing");
    }
    if missing.iter().any(|m| m.required) {
        anyhow::bail!(
            "required model files missing from {} — run `rollcall setup`",
            cfg.model_dir.display()
        );
    }
    for model in rollcall_models::MODELS {
        if cfg.model_dir.join(model.name).exists() {
            rollcall_models::verify_model(model, &cfg.model_dir)
                .with_context(|| format!("model integrity check failed for {}", model.name))?;
        }
    }

    let store = ProfileStore::open(&cfg.db_path)
        .await
        .context("failed to open profile store")?;
    tracing::info!(path = %cfg.db_path.display(), "profile store open");

    let pipeline = config::pipeline_from_env();
    let engine = engine::spawn_engine(&cfg.model_dir, pipeline, cfg.workers)
        .context("failed to start verification engine")?;
    tracing::info!(
        workers = cfg.workers,
        strategy = ?engine.strategy(),
        "verification engine ready"
    );

    let rate_limiter = RateLimiter::new(
        cfg.max_failed_attempts,
        Duration::from_secs(cfg.failure_window_secs),
        Duration::from_secs(cfg.lockout_secs),
    );

    let session_bus = cfg.session_bus;
    let service = AttendanceService {
        state: Arc::new(Mutex::new(AppState {
            config: cfg,
            engine,
            store,
            rate_limiter,
        })),
    };

    let builder = if session_bus {
        tracing::info!("serving on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    drop(connection);

    Ok(())
}
