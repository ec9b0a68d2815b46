use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use beacon_scan::config::{ConfigSnapshot, FileConfigSource};
use beacon_scan::host::SystemHostId;
use beacon_scan::manager::{Manager, ScanSettings};
use beacon_scan::messages::OutboundEvent;
use beacon_scan::mqtt::MqttSink;
use beacon_scan::scanner::BtleplugSource;
use beacon_scan::sink::ObserverSink;
use clap::Parser;
use log::{LevelFilter, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Args {
    /// Configuration file [default: ~/.ble/config.toml]
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Length of each discovery window, overrides scan.timeout_ms
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Pause between scan cycles, overrides scan.interscan_delay_ms
    #[arg(long, value_name = "MS")]
    interscan_delay_ms: Option<u64>,

    /// Print events only, do not publish them to the broker
    #[arg(long)]
    no_publish: bool,

    /// Debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_source =
        FileConfigSource::new(args.config.unwrap_or_else(FileConfigSource::default_path));
    let app_config = config_source
        .app_config()
        .with_context(|| format!("loading {}", config_source.path().display()))?;
    let snapshot = ConfigSnapshot::resolve(&app_config, |key| std::env::var(key).ok())?;
    info!("Broker: {}, topic: {}", snapshot.broker, snapshot.topic);

    let mut scan = app_config.scan.clone();
    scan.timeout_ms = args.timeout_ms.or(scan.timeout_ms);
    scan.interscan_delay_ms = args.interscan_delay_ms.or(scan.interscan_delay_ms);

    let source = BtleplugSource::first_adapter()
        .await
        .context("opening Bluetooth adapter")?;
    let host = SystemHostId::detect().await;

    let manager = Arc::new(Manager::new(
        source,
        Box::new(host),
        Box::new(config_source),
        snapshot,
        ScanSettings::from(&scan),
    ));

    manager.register_sink(Box::new(ObserverSink::new("stdout", print_event)));
    if !args.no_publish {
        manager.register_sink(Box::new(MqttSink::new(&app_config.broker)));
    }

    let mut runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    };
    let mut reload = ReloadSignal::new().context("installing SIGHUP handler")?;

    let result = loop {
        tokio::select! {
            result = &mut runner => break result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                manager.stop();
            }
            _ = reload.recv() => {
                if let Err(err) = manager.reload_config() {
                    warn!("Error reloading configuration: {}", err);
                }
            }
        }
    };

    let summary = result.context("scan task failed")??;
    info!(
        "Done: {} cycles, {} beacons, {} decode errors, {} sink errors",
        summary.cycles, summary.beacons, summary.decode_errors, summary.sink_errors
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) if verbose => builder.filter_level(LevelFilter::Debug),
        Err(_) => builder.filter_level(LevelFilter::Info),
    };
    builder.init();
}

fn print_event(_beacon_type: &str, event: &OutboundEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => error!("Error serializing event: {}", err),
    }
}

#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(ReloadSignal(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> std::io::Result<Self> {
        Ok(ReloadSignal)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
