use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::{error, info};

use hardware_exporter::config::Config;
use hardware_exporter::registry::Registry;
use hardware_exporter::types::MetricSpec;
use hardware_exporter::{collector, exposition};

#[derive(Parser, Debug)]
#[command(name = "hardware-exporter", about = "Prometheus exporter for hardware health")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hardware-exporter/config.toml")]
    config: String,

    /// Address on which to expose metrics (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// Enable IPMI sensor collector
    #[arg(long = "collector.ipmi_sensor")]
    enable_ipmi_sensor: bool,

    /// Enable IPMI SEL collector
    #[arg(long = "collector.ipmi_sel")]
    enable_ipmi_sel: bool,

    /// Enable IPMI DCMI collector
    #[arg(long = "collector.ipmi_dcmi")]
    enable_ipmi_dcmi: bool,

    /// Enable MegaRAID collector
    #[arg(long = "collector.mega_raid")]
    enable_mega_raid: bool,

    /// Enable PowerEdge RAID controller collector
    #[arg(long = "collector.poweredge_raid")]
    enable_poweredge_raid: bool,

    /// Enable LSI SAS-2 controller collector
    #[arg(long = "collector.lsi_sas_2")]
    enable_lsi_sas_2: bool,

    /// Enable LSI SAS-3 controller collector
    #[arg(long = "collector.lsi_sas_3")]
    enable_lsi_sas_3: bool,

    /// Enable HPE Smart Array collector
    #[arg(long = "collector.hpe_ssa")]
    enable_hpe_ssa: bool,

    /// Enable redfish collector
    #[arg(long = "collector.redfish")]
    enable_redfish: bool,

    /// Hostname for redfish collector
    #[arg(long)]
    redfish_host: Option<String>,

    /// BMC username for redfish collector
    #[arg(long)]
    redfish_username: Option<String>,

    /// BMC password for redfish collector
    #[arg(long)]
    redfish_password: Option<String>,
}

impl Cli {
    /// CLI switches layer on top of the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.exporter.bind = bind.clone();
        }
        let c = &mut config.collector;
        c.ipmi_sensor.enabled |= self.enable_ipmi_sensor;
        c.ipmi_sel.enabled |= self.enable_ipmi_sel;
        c.ipmi_dcmi.enabled |= self.enable_ipmi_dcmi;
        c.mega_raid.enabled |= self.enable_mega_raid;
        c.poweredge_raid.enabled |= self.enable_poweredge_raid;
        c.lsi_sas_2.enabled |= self.enable_lsi_sas_2;
        c.lsi_sas_3.enabled |= self.enable_lsi_sas_3;
        c.hpe_ssa.enabled |= self.enable_hpe_ssa;
        c.redfish.enabled |= self.enable_redfish;
        if let Some(host) = &self.redfish_host {
            c.redfish.host = host.clone();
        }
        if let Some(username) = &self.redfish_username {
            c.redfish.username = username.clone();
        }
        if let Some(password) = &self.redfish_password {
            c.redfish.password = password.clone();
        }
    }
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("hardware-exporter {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration; the config file is optional when collectors are
    // enabled from the command line.
    let mut config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    cli.apply(&mut config);
    config.validate()?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.exporter.hostname,
        collectors = ?config.enabled_collectors(),
        "Starting hardware exporter"
    );

    // Run the exporter
    if let Err(e) = run(config).await {
        error!(error = %e, "Exporter terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.exporter.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

struct AppState {
    registry: Registry,
    specs: HashMap<String, MetricSpec>,
}

async fn run(config: Config) -> Result<()> {
    let collectors = collector::create_collectors(&config)?;
    if collectors.is_empty() {
        info!("No collectors enabled; serving only registry meta-metrics");
    }

    let registry = Registry::new(
        collectors,
        Duration::from_secs(config.exporter.scrape_timeout_secs),
    );
    let specs = registry
        .specifications()
        .into_iter()
        .map(|spec| (spec.name.clone(), spec))
        .collect();
    let state = Arc::new(AppState { registry, specs });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.exporter.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.exporter.bind))?;
    info!(bind = %config.exporter.bind, "Serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to listen for shutdown signal");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(
        "<html><head><title>Hardware Exporter</title></head>\
         <body><h1>Hardware Exporter</h1><p><a href=\"/metrics\">Metrics</a></p></body></html>",
    )
}

/// A scrape always answers 200 with whatever was collected; 500 is reserved
/// for defects in the exposition encoding itself.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let samples = state.registry.collect_all().await;
    match exposition::render(&samples, &state.specs) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failure").into_response()
        }
    }
}
