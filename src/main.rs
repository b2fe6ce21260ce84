//! devpool server - main entry point.
//!
//! Loads configuration, attaches workers, and serves the dispatch, pool and
//! metrics services over TCP+msgpack IPC until a shutdown signal arrives.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use devpool::ipc::IpcServer;
use devpool::kernel::{CleanupService, Kernel, RateLimitRule};
use devpool::pool::{DiscoveryTask, DnsDiscovery};
use devpool::worker::TcpConnector;
use devpool::{Config, Error, Result};

#[derive(Parser, Debug)]
#[command(name = "devpool")]
#[command(version, about = "Dispatch server over a pool of remote worker devices", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "DEVPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve IPC on (overrides server.listen_addr)
    #[arg(short, long, env = "DEVPOOL_LISTEN")]
    listen: Option<String>,

    /// Worker address as host:port; repeat for several workers
    #[arg(short, long = "worker")]
    workers: Vec<String>,

    /// Resolve workers from this DNS name instead of a static list
    #[arg(long)]
    discover: Option<String>,

    /// Worker port used with --discover
    #[arg(long)]
    discover_port: Option<u16>,

    /// Per-class rate limit as CLASS=CEILING/PERIOD, e.g. sign=2/1s
    #[arg(long = "rate-limit", value_parser = parse_rate_limit)]
    rate_limits: Vec<(String, RateLimitRule)>,

    /// Wait this long for a healthy worker instead of failing fast
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    wait_for_worker: Option<Duration>,

    /// Exactly one worker with no substitute: exit when it cannot be reattached
    #[arg(long)]
    single_device: bool,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

fn parse_rate_limit(s: &str) -> std::result::Result<(String, RateLimitRule), String> {
    let (class, rule) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=CEILING/PERIOD, got {:?}", s))?;
    if class.trim().is_empty() {
        return Err("call class cannot be empty".to_string());
    }
    Ok((class.trim().to_string(), rule.parse()?))
}

impl Args {
    fn into_config(self) -> Result<(Config, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        config.pool.workers.extend(self.workers);
        if let Some(name) = self.discover {
            config.discovery.name = Some(name);
        }
        if let Some(port) = self.discover_port {
            config.discovery.port = port;
        }
        config.rate_limits.extend(self.rate_limits);
        if self.wait_for_worker.is_some() {
            config.pool.wait_for_worker = self.wait_for_worker;
        }
        config.observability.json_logs |= self.json_logs;

        config.validate()?;
        if self.single_device && (config.pool.workers.len() != 1 || config.discovery.name.is_some()) {
            return Err(Error::config(
                "--single-device needs exactly one static worker and no discovery",
            ));
        }
        Ok((config, self.single_device))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let (config, single_device) = match Args::parse().into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("devpool: {}", e);
            return ExitCode::from(2);
        }
    };
    devpool::observability::init_tracing(&config.observability);

    match run(config, single_device).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "server_failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, single_device: bool) -> Result<ExitCode> {
    let addr = config
        .server
        .listen_addr
        .parse()
        .map_err(|e| Error::config(format!("server.listen_addr: {}", e)))?;
    let worker_lost = single_device.then(CancellationToken::new);

    let connector = Arc::new(TcpConnector::new(config.ipc.max_frame_bytes));
    let kernel = Arc::new(Kernel::from_config(&config, connector, worker_lost.clone()));

    let discovery = if let Some(name) = &config.discovery.name {
        Some(DiscoveryTask {
            source: Arc::new(DnsDiscovery::new(config.discovery.port)),
            name: name.clone(),
            interval: config.discovery.interval,
        })
    } else if single_device {
        // The only worker must attach before serving; reattach covers the rest.
        kernel.pool().add_address(&config.pool.workers[0]).await?;
        None
    } else {
        None
    };
    kernel.pool().start(discovery).await;
    if !single_device && config.discovery.name.is_none() {
        if config.pool.workers.is_empty() {
            tracing::warn!("no workers configured; add them through the pool service");
        } else {
            // Workers that fail to attach now are retried until they do.
            kernel
                .pool()
                .attach_static(config.pool.workers.clone(), config.discovery.interval)
                .await;
        }
    }

    let mut cleanup = CleanupService::new(kernel.clone(), config.cleanup.clone());
    let cleanup_handle = cleanup.start();

    let server = Arc::new(IpcServer::new(kernel.clone(), addr, config.ipc.clone()));
    let mut serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };
    tracing::info!(
        %addr,
        workers = config.pool.workers.len(),
        discovery = ?config.discovery.name,
        single_device,
        "devpool_started"
    );

    let lost = async {
        match &worker_lost {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let mut code = ExitCode::SUCCESS;
    let mut serve_finished = false;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown_signal_received"),
        _ = lost => {
            tracing::error!("worker_lost; shutting down");
            code = ExitCode::FAILURE;
        }
        result = &mut serve => {
            serve_finished = true;
            code = ExitCode::FAILURE;
            match result {
                Ok(Ok(())) => tracing::warn!("ipc_server_stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "ipc_server_failed"),
                Err(e) => tracing::error!(error = %e, "ipc_server_panicked"),
            }
        }
    }

    server.shutdown();
    kernel.shutdown(config.server.shutdown_grace).await;
    cleanup.stop();
    if let Err(e) = cleanup_handle.await {
        tracing::warn!(error = %e, "cleanup_join_failed");
    }
    if !serve_finished {
        if let Ok(Err(e)) = serve.await {
            tracing::warn!(error = %e, "ipc_server_error_during_shutdown");
        }
    }
    tracing::info!("devpool_stopped");
    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
