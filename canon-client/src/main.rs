//! canon - terminal session sync and recovery client
//!
//! Runs the sync runtime against the session backend, or performs one-shot
//! cache and orphan operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use canon_client::{
    resync_once, spawn_refresher, ClientConfig, ConfigLoader, ConnectionManager,
    FileAlarmScheduler, FileStore, HttpOrphanBackend, OperationReport, OrphanDetector,
    SessionCache, SocketConnector, SyncClient, SyncEvent, SystemClock,
};
use canon_utils::{init_logging_with_config, CanonError, LogConfig, Result};

mod cli;

use cli::{Args, Command, OrphanAction, Targets};

const RESYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    let log_config = match args.command() {
        Command::Sync => LogConfig::sync(),
        _ => LogConfig::cli(),
    };
    init_logging_with_config(log_config.verbose(args.verbose))?;
    tracing::debug!("CLI args: {:?}", args);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("canon error: {}", e);
            eprintln!("Error: {}", e);
            Err(e)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = ConfigLoader::load_and_validate(args.config.as_deref())?;
    if let Some(addr) = &args.addr {
        config.connection.addr = Some(addr.clone());
    }

    match args.command() {
        Command::Sync => run_sync(config).await,
        Command::Sessions => print_sessions(&config),
        Command::Orphans { action } => run_orphans(&config, action).await,
    }
}

fn open_cache(config: &ClientConfig) -> SessionCache<FileStore> {
    let path = config.storage.cache_path();
    let store = FileStore::open(&path).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable session cache {}: {}", path.display(), e);
        FileStore::fresh(&path)
    });
    SessionCache::open(store)
}

fn connector(config: &ClientConfig) -> SocketConnector {
    SocketConnector::new(
        config.connection.resolved_addr(),
        config.connection.connect_timeout(),
    )
}

fn orphan_detector(config: &ClientConfig) -> Result<OrphanDetector<HttpOrphanBackend>> {
    let endpoint = config
        .orphans
        .endpoint
        .as_deref()
        .ok_or_else(|| CanonError::config("orphans.endpoint is not configured"))?;
    let backend = HttpOrphanBackend::new(endpoint, config.connection.connect_timeout())?;
    Ok(OrphanDetector::new(backend))
}

async fn run_sync(config: ClientConfig) -> Result<()> {
    let cache = open_cache(&config);
    let manager = ConnectionManager::new(
        config.reconnect.backoff(),
        FileAlarmScheduler::open(config.storage.alarm_path()),
        SystemClock,
    );
    let (client, handle, mut events) = SyncClient::new(&config, cache, manager, connector(&config));

    let refresher = match config.orphans.endpoint {
        Some(_) => match orphan_detector(&config) {
            Ok(detector) => Some(spawn_refresher(
                Arc::new(Mutex::new(detector.with_resync(handle.clone()))),
                handle.sessions(),
                config.orphans.refresh_interval(),
            )),
            Err(e) => {
                tracing::warn!("Orphan refresh disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let runtime = tokio::spawn(client.run());
    tracing::info!("Syncing with {}", config.connection.resolved_addr());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                handle.shutdown().await?;
                break;
            }
        }
    }

    if let Some(refresher) = refresher {
        refresher.abort();
    }
    runtime
        .await
        .map_err(|e| CanonError::internal(format!("sync runtime panicked: {}", e)))?
}

fn report_event(event: &SyncEvent) {
    match event {
        SyncEvent::SessionsChanged { sessions, current } => {
            tracing::info!(
                count = sessions.len(),
                current = current.as_deref().unwrap_or("-"),
                "Sessions changed"
            );
        }
        SyncEvent::ConnectionChanged(state) => {
            tracing::info!(phase = %state.phase, attempt = state.attempt, "Connection");
        }
        SyncEvent::ConnectionCount(count) => {
            tracing::debug!(count, "Backend observers");
        }
        SyncEvent::ReconnectExhausted { attempts } => {
            tracing::warn!(
                "Gave up reconnecting after {} attempts; restart canon to retry",
                attempts
            );
        }
    }
}

fn print_sessions(config: &ClientConfig) -> Result<()> {
    let cache = open_cache(config);
    if cache.is_empty() {
        println!("No cached sessions");
        return Ok(());
    }

    for session in cache.all() {
        let marker = if cache.current() == Some(session.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<28} {:<24} {:<10} {}",
            marker,
            session.id,
            session.display_name,
            session.status.as_str(),
            session.working_dir.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run_orphans(config: &ClientConfig, action: OrphanAction) -> Result<()> {
    let mut detector = orphan_detector(config)?;
    let mut cache = open_cache(config);
    detector.refresh_for(cache.all()).await?;

    match action {
        OrphanAction::List => {
            if detector.orphans().is_empty() {
                println!("No orphaned sessions");
            }
            for orphan in detector.orphans() {
                println!(
                    "{:<32} {}",
                    orphan.registry_name,
                    orphan.working_dir.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        OrphanAction::Reattach(targets) => {
            select_targets(&mut detector, &targets);
            let report = detector.reattach_selected().await;
            print_report("reattach", &report);

            if report.any_succeeded() {
                let outcome = resync_once(
                    config,
                    &mut cache,
                    &connector(config),
                    &SystemClock,
                    RESYNC_TIMEOUT,
                )
                .await?;
                println!("Resynced: {} added", outcome.added.len());
            }
            Ok(())
        }
        OrphanAction::Kill(targets) => {
            select_targets(&mut detector, &targets);
            let report = detector.kill_selected().await;
            print_report("kill", &report);

            detector.refresh_for(cache.all()).await?;
            println!("{} orphaned sessions remain", detector.orphans().len());
            Ok(())
        }
    }
}

fn select_targets(detector: &mut OrphanDetector<HttpOrphanBackend>, targets: &Targets) {
    if targets.all {
        detector.select_all();
        return;
    }
    for name in &targets.names {
        if !detector.toggle(name) {
            eprintln!("Not an orphan: {}", name);
        }
    }
}

fn print_report(operation: &str, report: &OperationReport) {
    let status = if report.success { "ok" } else { "failed" };
    if report.message.is_empty() {
        println!("{}: {}", operation, status);
    } else {
        println!("{}: {} ({})", operation, status, report.message);
    }
    for item in &report.items {
        println!(
            "  {:<32} {} {}",
            item.name,
            if item.success { "ok" } else { "failed" },
            item.message.as_deref().unwrap_or("")
        );
    }
}
