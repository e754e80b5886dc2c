//! AppState construction and background-task spawning.
//!
//! The composition root owns both stores, all caches and the workflow
//! registries; everything else borrows through `AppState` clones, so no
//! component needs a back-reference into another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fp_domain::config::{Config, ConfigSeverity};
use fp_imaging::draw::OsdFont;
use fp_infer::InferenceClient;
use fp_store::frs::FrsStore;
use fp_store::lprs::LprsStore;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::frs::caches::FrsCaches;
use crate::frs::{maintenance as frs_maintenance, stats};
use crate::lprs::ban::BanRegistry;
use crate::lprs::caches::LprsCaches;
use crate::lprs::maintenance as lprs_maintenance;
use crate::state::{AppState, FrsRuntime, LprsRuntime};
use crate::workflow::WorkflowRegistry;

/// Validate config, connect the stores, warm the caches and return a fully
/// wired [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Outbound HTTP + inference ────────────────────────────────────
    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let infer = InferenceClient::new(http.clone());
    tracing::info!("outbound HTTP client ready");

    // ── Stores ───────────────────────────────────────────────────────
    let frs_pool = fp_store::connect(&config.database.frs_url, config.database.max_connections)
        .await
        .context("connecting to the FRS database")?;
    let frs_store = FrsStore::new(frs_pool);
    tracing::info!("FRS store ready");

    let lprs_pool = fp_store::connect(&config.database.lprs_url, config.database.max_connections)
        .await
        .context("connecting to the LPRS database")?;
    let lprs_store = LprsStore::new(lprs_pool);
    tracing::info!("LPRS store ready");

    // ── OSD font ─────────────────────────────────────────────────────
    let osd_font = OsdFont::load(&config.frs.osd_font_path);
    match &osd_font {
        Some(_) => tracing::info!(path = %config.frs.osd_font_path, "OSD font loaded"),
        None => tracing::warn!(
            path = %config.frs.osd_font_path,
            "OSD font not found; frame overlays are disabled"
        ),
    }

    // ── Caches (warm once before serving) ────────────────────────────
    let frs_caches = FrsCaches::new();
    frs_caches.refresh(&frs_store).await;
    let lprs_caches = LprsCaches::new();
    lprs_caches.refresh(&lprs_store).await;
    tracing::info!("caches warmed");

    let frs = Arc::new(FrsRuntime {
        store: frs_store,
        caches: frs_caches,
        workflows: WorkflowRegistry::new(),
        unknown_descriptors: Mutex::new(HashMap::new()),
        dnn_stats: Mutex::new(HashMap::new()),
        osd_font,
    });
    stats::load(&frs.dnn_stats);

    let lprs = Arc::new(LprsRuntime {
        store: lprs_store,
        caches: lprs_caches,
        workflows: WorkflowRegistry::new(),
        bans: BanRegistry::new(),
    });

    Ok(AppState {
        config,
        http,
        infer,
        frs,
        lprs,
        shutdown: CancellationToken::new(),
        tracker: TaskTracker::new(),
    })
}

/// One periodic task; missed ticks are delayed, not queued, so a slow
/// iteration never causes a burst.
fn spawn_periodic<F, Fut>(state: &AppState, period: Duration, mut job: F)
where
    F: FnMut(AppState) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            job(state.clone()).await;
        }
    });
}

/// Spawn the cache pollers and the periodic maintenance tasks.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Cache pollers ────────────────────────────────────────────────
    spawn_periodic(state, state.config.frs.cache_update_interval, |state| async move {
        state.frs.caches.refresh(&state.frs.store).await;
    });
    spawn_periodic(state, state.config.lprs.cache_update_interval, |state| async move {
        state.lprs.caches.refresh(&state.lprs.store).await;
    });

    // ── FRS maintenance ──────────────────────────────────────────────
    spawn_periodic(state, state.config.frs.clear_old_log_faces, |state| async move {
        frs_maintenance::old_logs(&state.frs.store, &state.config.frs).await;
    });
    spawn_periodic(
        state,
        state.config.frs.flag_deleted_maintenance_interval,
        |state| async move {
            frs_maintenance::flag_deleted(&state.frs.store, &state.config.frs).await;
        },
    );
    spawn_periodic(
        state,
        state.config.frs.copy_events_maintenance_interval,
        |state| async move {
            frs_maintenance::copy_events(&state.frs.store, &state.config.frs).await;
        },
    );
    spawn_periodic(state, state.config.frs.clear_old_events, |state| async move {
        frs_maintenance::old_events(&state.config.frs).await;
    });

    // ── LPRS maintenance ─────────────────────────────────────────────
    spawn_periodic(
        state,
        state.config.lprs.ban_maintenance_interval,
        |state| async move {
            lprs_maintenance::ban_maintenance(&state.lprs.bans);
        },
    );
    spawn_periodic(
        state,
        state.config.lprs.events_log_maintenance_interval,
        |state| async move {
            lprs_maintenance::events_log_maintenance(&state.lprs.store, &state.config.lprs).await;
        },
    );
    tracing::info!("background tasks spawned");
}

/// Shutdown ordering: cancel in-flight work first (sleeps wake, iterations
/// exit without re-arming), join the fibers, then persist the counters.
pub async fn shutdown(state: &AppState) {
    tracing::info!("shutting down");
    state.shutdown.cancel();
    state.tracker.close();
    state.tracker.wait().await;
    stats::save(&state.frs.dnn_stats);
    tracing::info!("shutdown complete");
}
