//! flashnotes: local-first scratchpad buffers served on loopback.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flashnotes::db::{self, backup, Store};
use flashnotes::error::FlashError;
use flashnotes::{api, AppState};

#[derive(Parser)]
#[command(name = "flashnotes", version, about = "Infinite scratchpad buffer store")]
struct Args {
    /// Port to listen on (loopback only)
    #[arg(short, long, default_value = "3919", env = "FLASHNOTES_PORT")]
    port: u16,

    /// Directory for the database and its backups
    #[arg(long, env = "FLASHNOTES_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Database file, overriding <data-dir>/flashnotes.db
    #[arg(short, long, env = "FLASHNOTES_DB")]
    db: Option<PathBuf>,

    /// Hours between automatic backups, 0 to disable
    #[arg(long, default_value = "24", env = "FLASHNOTES_BACKUP_HOURS")]
    backup_hours: u64,

    /// Backups kept after pruning
    #[arg(long, default_value_t = backup::DEFAULT_MAX_BACKUPS, env = "FLASHNOTES_MAX_BACKUPS")]
    max_backups: usize,

    /// Move an unreadable database aside and start with a fresh one
    #[arg(long)]
    recover_corrupt: bool,
}

// how often the backup loop wakes to check staleness
const BACKUP_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn open_store(path: &std::path::Path, recover: bool) -> Result<Store, FlashError> {
    let path_str = path.to_string_lossy();
    match Store::open(&path_str) {
        Err(FlashError::Corruption(msg)) if recover => {
            warn!(error = %msg, "database unreadable, recovering");
            backup::quarantine(path)?;
            Store::open(&path_str)
        }
        other => other,
    }
}

fn spawn_backup_loop(state: AppState, data_dir: PathBuf, interval: Duration) {
    tokio::spawn(async move {
        loop {
            if backup::needs_backup(&data_dir, interval) {
                let store = state.store.clone();
                let dir = data_dir.clone();
                let keep = state.max_backups;
                match tokio::task::spawn_blocking(move || store.create_backup(&dir, keep)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "scheduled backup failed"),
                    Err(e) => warn!(error = %e, "backup task panicked"),
                }
            }
            tokio::time::sleep(BACKUP_CHECK_INTERVAL).await;
        }
    });
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let Some(data_dir) = args
        .data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("flashnotes")))
    else {
        error!("no data directory available; pass --data-dir");
        std::process::exit(1);
    };
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(dir = %data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(1);
    }
    let db_path = args.db.clone().unwrap_or_else(|| data_dir.join(db::DB_FILE_NAME));

    let store = match open_store(&db_path, args.recover_corrupt) {
        Ok(s) => s,
        Err(e @ FlashError::Corruption(_)) => {
            error!(error = %e, path = %db_path.display(), "database unreadable; rerun with --recover-corrupt to start fresh");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, path = %db_path.display(), "failed to open database");
            std::process::exit(1);
        }
    };

    let mut state = AppState::new(store, Some(data_dir.clone()));
    state.max_backups = args.max_backups;

    if args.backup_hours > 0 {
        let interval = Duration::from_secs(args.backup_hours.saturating_mul(3600));
        spawn_backup_loop(state.clone(), data_dir.clone(), interval);
        info!(every_hours = args.backup_hours, keep = args.max_backups, "automatic backups enabled");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %db_path.display(),
        "flashnotes starting"
    );

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind address");
            std::process::exit(1);
        }
    };

    let app = api::router(state.clone());
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.checkpoint()).await {
        Ok(Ok(())) => info!("wal checkpointed"),
        Ok(Err(e)) => warn!(error = %e, "final checkpoint failed"),
        Err(e) => warn!(error = %e, "checkpoint task panicked"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutting down");
}
