//! tandem-relay: HTTP and WebSocket surface of the relay.
//!
//! Every route sits behind the ban gate. Channels and bans live in memory;
//! the ban list is mirrored to a JSON file and notes live in SQLite.

pub mod config;
pub mod gate;
pub mod handlers;
pub mod router;
pub mod state;
pub mod utils;

use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use tokio::sync::oneshot;

use crate::ledger::AbuseLedger;
use crate::notes::NoteStore;
use crate::storage::Storage;

use config::{Cli, Config};
use state::AppState;

/// Entry point: parse CLI, open stores, serve until Ctrl-C.
pub async fn run() -> Result<(), Box<dyn Error>> {
    crate::logging::init();

    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    crate::tlog!("tandem-relay starting");
    crate::tlog!("  data directory: {}", config.data_dir.display());
    crate::tlog!("  note database: {}", config.notes_db.display());
    if let Some(path) = &config.ledger.ban_list_path {
        crate::tlog!("  ban list: {}", path.display());
    }
    crate::tlog!(
        "  limits: {} strikes/day, {} requests/hour, {} whitelisted",
        config.ledger.max_strikes,
        config.ledger.max_usage_per_hour,
        config.ledger.whitelist.len()
    );

    let storage = Storage::open(&config.notes_db)?;
    let ledger = AbuseLedger::open(config.ledger.clone());
    let state = AppState::new(ledger, NoteStore::new(storage), config.relay.clone());

    let (stop_tx, stop_rx) = oneshot::channel();
    let maintenance = tokio::spawn(maintenance_loop(state.clone(), stop_rx));

    let app = router::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    crate::tlog!("tandem-relay listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        crate::tlog!("tandem-relay shutting down");
    })
    .await?;

    let _ = stop_tx.send(());
    let _ = maintenance.await;
    state.ledger.flush()?;
    Ok(())
}

/// Periodic housekeeping until `stop` fires: persist pending bans, sweep
/// abandoned channels and purge expired notes.
pub async fn maintenance_loop(state: AppState, mut stop: oneshot::Receiver<()>) {
    let period = state.config.maintenance_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => maintenance_tick(&state).await,
            _ = &mut stop => break,
        }
    }
}

pub async fn maintenance_tick(state: &AppState) {
    state.ledger.flush_if_due();

    let swept = state.registry.sweep_idle(state.config.channel_idle);
    if swept > 0 {
        crate::tlog!("maintenance: swept {} idle channels", swept);
    }

    match state.notes.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => crate::tlog!("maintenance: purged {} expired notes", purged),
        Err(e) => crate::tlog_warn!("maintenance: note purge failed: {}", e),
    }
}
