mod alerts;
mod collectors;
mod config;
mod control;
mod docker;
mod engine;
mod history;
mod http;
mod metrics;
mod notify;
mod registry;
mod sampler;
mod schema;
mod stream;
mod telegram;

use alerts::AlertEvaluator;
use axum::serve;
use clap::Parser;
use collectors::containers::ContainerPlugin;
use collectors::cpu::CpuPlugin;
use collectors::disk::DiskPlugin;
use collectors::gpu::{GpuPlugin, SystemGpuDiscovery};
use collectors::host::HostPlugin;
use collectors::memory::MemoryPlugin;
use collectors::network::NetworkPlugin;
use collectors::probe::{HostProbe, SysinfoProbe};
use collectors::processes::ProcessPlugin;
use collectors::{Plugin, PluginKind};
use config::Config;
use control::{Dispatcher, SysinfoProcessControl};
use docker::{ContainerRuntime, DockerClient};
use engine::Engine;
use history::HistoryWriter;
use http::{HttpAppState, TokenGate};
use metrics::Metrics;
use notify::{Notifier, WebhookSink};
use reqwest::Client;
use sampler::Sampler;
use std::net::SocketAddr;
use std::sync::Arc;
use teloxide::Bot;
use telegram::TelegramSink;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aegisd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
    /// Collect one snapshot, print it as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --listen override");
            std::process::exit(1);
        }
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let runtime = Arc::new(DockerClient::from_env_or(&cfg.docker.socket));
    let engine = build_engine(&cfg, runtime.clone()).with_metrics(metrics.clone());

    if cli.once {
        // The first cycle only primes the rate counters.
        engine.run_cycle(cfg.cycle_timeout()).await;
        tokio::time::sleep(cfg.interval()).await;
        let snapshot = engine.run_cycle(cfg.cycle_timeout()).await;
        match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "failed to encode snapshot");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_ms = cfg.interval_ms,
        cycle_timeout_ms = cfg.cycle_timeout_ms,
        docker_socket = %runtime.socket_path().display(),
        "starting aegisd"
    );

    let alerts = if cfg.alerts.enabled {
        let cooldown = match cfg.alerts.cooldown() {
            Ok(cooldown) => cooldown,
            Err(err) => {
                error!(error = %err, "invalid alert cooldown");
                std::process::exit(1);
            }
        };
        let notifier = match build_notifier(&cfg) {
            Ok(notifier) => notifier,
            Err(err) => {
                error!(error = %err, "failed to configure alert delivery");
                std::process::exit(1);
            }
        };
        if notifier.is_empty() {
            warn!("no alert sink configured, alerts will only be logged");
        }
        let sinks = notifier.sink_names();
        let evaluator = AlertEvaluator::new(cfg.alerts.rules.clone(), cooldown, Arc::new(notifier));
        for rule in evaluator.rules() {
            debug!(
                rule = %rule.id,
                metric = %rule.metric,
                threshold = rule.threshold,
                enabled = rule.enabled,
                "alert rule loaded"
            );
        }
        info!(
            rules = evaluator.rules().iter().filter(|r| r.enabled).count(),
            cooldown = %humantime::format_duration(cooldown),
            sinks = ?sinks,
            "alerting enabled"
        );
        Some(evaluator)
    } else {
        None
    };

    let (history, history_task) = if cfg.history.enabled {
        match HistoryWriter::open(&cfg.history.path).await {
            Ok((writer, task)) => (Some(writer), Some(task)),
            Err(err) => {
                warn!(error = %err, "history disabled");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let (sampler, feed) = Sampler::new(engine, cfg.interval(), cfg.cycle_timeout());
    let mut sampler = sampler.with_metrics(metrics.clone());
    if let Some(alerts) = alerts {
        sampler = sampler.with_alerts(alerts);
    }
    if let Some(history) = history {
        sampler = sampler.with_history(history);
    }

    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "invalid listen address");
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, listen = %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    let gate = TokenGate::new(cfg.auth.resolve_token());
    if !gate.is_enabled() {
        warn!("no stream token configured, /ws accepts any client");
    }
    let dispatcher = Dispatcher::new(runtime, Arc::new(SysinfoProcessControl::new()))
        .with_metrics(metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler_task = tokio::spawn(sampler.run(shutdown_rx.clone()));

    let http_task = {
        let mut shutdown_rx = shutdown_rx.clone();
        let app = http::build_router(HttpAppState {
            metrics: metrics.clone(),
            feed,
            dispatcher,
            gate,
        });
        tokio::spawn(async move {
            let server = serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = sampler_task.await;
    let _ = http_task.await;
    if let Some(task) = history_task {
        let _ = task.await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_engine(cfg: &Config, runtime: Arc<dyn ContainerRuntime>) -> Engine {
    let probe: Arc<dyn HostProbe> = Arc::new(SysinfoProbe::new());
    let mut engine = Engine::new();
    for kind in &cfg.plugins {
        let plugin: Arc<dyn Plugin> = match kind {
            PluginKind::Host => Arc::new(HostPlugin::new(probe.clone())),
            PluginKind::Cpu => Arc::new(CpuPlugin::new(probe.clone())),
            PluginKind::Memory => Arc::new(MemoryPlugin::new(probe.clone())),
            PluginKind::Disk => {
                Arc::new(DiskPlugin::new(probe.clone()).with_interval(cfg.interval()))
            }
            PluginKind::Network => {
                Arc::new(NetworkPlugin::new(probe.clone()).with_interval(cfg.interval()))
            }
            PluginKind::Processes => Arc::new(ProcessPlugin::new(probe.clone())),
            PluginKind::Docker => Arc::new(ContainerPlugin::new(
                runtime.clone(),
                cfg.docker.include_stopped,
            )),
            PluginKind::Gpu => Arc::new(GpuPlugin::new(Arc::new(SystemGpuDiscovery))),
        };
        engine.register(plugin);
    }
    engine
}

fn build_notifier(cfg: &Config) -> Result<Notifier, String> {
    let mut notifier = Notifier::new();

    if let Some(url) = cfg.alerts.webhook.resolve_url() {
        let client = Client::builder()
            .user_agent(concat!("aegisd/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        notifier = notifier.with_sink(Arc::new(WebhookSink::new(client, url)));
    }

    let telegram = &cfg.alerts.telegram;
    if telegram.enabled {
        let token = telegram.resolve_token().ok_or_else(|| {
            format!(
                "alerts.telegram is enabled but no bot token is set (bot_token or ${})",
                telegram.bot_token_env
            )
        })?;
        if telegram.chat_ids.is_empty() {
            return Err("alerts.telegram.chat_ids is empty: add at least one chat id".to_string());
        }
        notifier = notifier.with_sink(Arc::new(TelegramSink::new(
            Bot::new(token),
            telegram.chat_ids.clone(),
            telegram.rate_limit_per_minute,
        )));
    }

    Ok(notifier)
}
