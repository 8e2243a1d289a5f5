use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use tokio_util::sync::CancellationToken;

use proxmox_monitor::alerts::Alerter;
use proxmox_monitor::cache::Cache;
use proxmox_monitor::collect::{self, Collector, PbsCollector, PveCollector};
use proxmox_monitor::config::{self, MonitorConfig};
use proxmox_monitor::notify::{NotificationProvider, NtfyProvider};
use proxmox_monitor::pool::WorkerPool;
use proxmox_monitor::store::{run_pruner, Store};

const DEFAULT_CONFIG_PATH: &str = "/etc/proxmox-monitor/config.json";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(-1);
    }
}

fn run() -> Result<(), Error> {
    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };
    if args.next().is_some() {
        bail!("usage: proxmox-monitor-daemon [<config-file>]");
    }

    let config = config::load(&config_path)?;
    if config.pve.is_empty() && config.pbs.is_empty() {
        bail!("no PVE or PBS instance configured in {:?}", config_path);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: MonitorConfig) -> Result<(), Error> {
    let listen: SocketAddr = config
        .listen_address
        .parse()
        .map_err(|err| format_err!("invalid listen address {} - {}", config.listen_address, err))?;

    let store = Arc::new(Store::open(&config.db_path)?);
    let cache = Arc::new(Cache::new());
    let pool = WorkerPool::new(config.worker_pool_size);
    let token = CancellationToken::new();

    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();
    for pve in &config.pve {
        collectors.push(Box::new(PveCollector::new(
            pve.clone(),
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
        )?));
    }
    for pbs in &config.pbs {
        collectors.push(Box::new(PbsCollector::new(
            pbs.clone(),
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
        )?));
    }

    let mut providers: Vec<Box<dyn NotificationProvider>> = Vec::new();
    for target in &config.notify {
        providers.push(Box::new(NtfyProvider::new(target)?));
    }

    spawn_signal_handler(token.clone())?;

    let mut tasks = Vec::new();

    for collector in collectors {
        let name = collector.name().to_string();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = collect::run_collector(collector, token).await {
                log::info!("collector task {} finished - {}", name, err);
            }
        }));
    }

    let alerter = Alerter::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        providers,
        config.alerts,
    );
    tasks.push(tokio::spawn(alerter.run(token.clone())));

    tasks.push(tokio::spawn(run_pruner(
        Arc::clone(&store),
        config.retention,
        token.clone(),
    )));

    {
        let cache = Arc::clone(&cache);
        let store = Arc::clone(&store);
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = proxmox_monitor::api::run_server(listen, cache, store, token).await {
                log::error!("http api failed - {}", err);
            }
        }));
    }

    token.cancelled().await;
    log::info!("shutting down");

    for task in tasks {
        let _ = task.await;
    }

    // all tasks are gone, this drops the last store reference and with it
    // the database connection
    drop(cache);
    drop(store);

    log::info!("done - exit monitor daemon");
    Ok(())
}

/// First SIGINT/SIGTERM requests the graceful shutdown, a second one
/// forces immediate exit.
fn spawn_signal_handler(token: CancellationToken) -> Result<(), Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
        log::info!("shutdown requested");
        token.cancel();

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
        log::warn!("second signal, forcing exit");
        std::process::exit(1);
    });

    Ok(())
}
