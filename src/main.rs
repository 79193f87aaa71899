mod backends;
mod collectors;
mod config;
mod http;
mod metrics;
mod model;
mod render;
mod session;

use axum::{serve, Router};
use backends::Backends;
use clap::Parser;
use config::Config;
use http::HttpAppState;
use metrics::Metrics;
use session::{InMemorySessionStore, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "vmdash")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let backends = match Backends::from_config(&cfg) {
        Ok(b) => Arc::new(b),
        Err(err) => {
            error!(error = %err, "не удалось подготовить клиентов бэкендов");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let sessions: Arc<dyn SessionStore> =
        Arc::new(InMemorySessionStore::new(cfg.session_idle_timeout()));

    info!(
        listen = %cfg.listen,
        metrics_listen = cfg.metrics_listen.as_deref().unwrap_or("-"),
        brokers = ?cfg.brokers.iter().map(|b| b.url.as_str()).collect::<Vec<_>>(),
        cluster_managers = ?cfg
            .cluster_managers
            .iter()
            .map(|m| format!("{}={}/{}", m.id, m.host, m.cluster))
            .collect::<Vec<_>>(),
        "запуск vmdash"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = spawn_server(
        "dashboard",
        cfg.listen.clone(),
        http::build_router(HttpAppState {
            backends: backends.clone(),
            sessions: sessions.clone(),
            metrics: metrics.clone(),
        }),
        shutdown_rx.clone(),
    );

    let metrics_task = cfg.metrics_listen.clone().map(|listen| {
        spawn_server(
            "metrics",
            listen,
            http::build_metrics_router(metrics.clone()),
            shutdown_rx.clone(),
        )
    });

    let sweeper_task = {
        let backends = backends.clone();
        let sessions = sessions.clone();
        let metrics = metrics.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(cfg.session_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки очистки сессий");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired =
                            collectors::sweep_idle_sessions(sessions.as_ref(), &backends).await;
                        metrics.add_expired_sessions(expired);
                        metrics.set_active_sessions(sessions.len().await);
                        metrics.update_uptime();
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");
    let _ = shutdown_tx.send(true);
    let _ = sweeper_task.await;
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn spawn_server(
    name: &'static str,
    listen: String,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr: SocketAddr = match listen.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(server = name, error = %err, listen = %listen, "некорректный адрес listen");
                return;
            }
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                error!(server = name, error = %err, "не удалось запустить HTTP-сервер");
                return;
            }
        };
        info!(server = name, addr = %addr, "HTTP-сервер слушает");

        let server = serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

        if let Err(err) = server.await {
            error!(server = name, error = %err, "ошибка HTTP-сервера");
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
