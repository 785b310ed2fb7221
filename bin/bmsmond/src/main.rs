//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the bmsmon daemon."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
mod console;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bmsmon_common::{init_tracing_with_sink, AppConfig, ConfigOverrides, LogSink, Protocol};
use bmsmon_core::{DeviceSession, FleetCoordinator, TelemetryExport};
use bmsmon_metrics::{new_registry, FleetMetrics};
use bmsmon_net::{
    transport_for, DashboardHandle, DashboardPublisher, DashboardServerBuilder, DashboardStore,
    MqttPublisher,
};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use console::ConsolePublisher;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Battery monitor daemon", long_about = None)]
struct Cli {
    #[arg(
        short = 'c',
        long,
        global = true,
        value_name = "FILE",
        env = "BMSMON_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct OverrideArgs {
    #[arg(long, global = true, env = "EG4_BATTERY_NAME", help = "Name of the first battery")]
    battery_name: Option<String>,

    #[arg(long, global = true, env = "EG4_BATTERY_IP", help = "Address of the first battery")]
    battery_ip: Option<String>,

    #[arg(long, global = true, env = "EG4_BATTERY_PORT", help = "Modbus TCP port of the first battery")]
    battery_port: Option<u16>,

    #[arg(long, global = true, env = "EG4_DEVICE_ID", help = "Modbus unit id of the first battery")]
    device_id: Option<u8>,

    #[arg(long, global = true, env = "EG4_PROTOCOL", help = "Register layout: standard or alternate")]
    protocol: Option<Protocol>,

    #[arg(long, global = true, env = "EG4_MQTT_BROKER", help = "MQTT broker host")]
    mqtt_broker: Option<String>,

    #[arg(long, global = true, env = "EG4_MQTT_PORT", help = "MQTT broker port")]
    mqtt_port: Option<u16>,

    #[arg(long, global = true, env = "EG4_MQTT_USER", help = "MQTT username")]
    mqtt_user: Option<String>,

    #[arg(
        long,
        global = true,
        env = "EG4_MQTT_PASS",
        hide_env_values = true,
        help = "MQTT password"
    )]
    mqtt_pass: Option<String>,

    #[arg(long, global = true, env = "EG4_MQTT_TOPIC", help = "MQTT discovery base topic")]
    mqtt_topic: Option<String>,

    #[arg(
        long,
        alias = "interval",
        global = true,
        env = "EG4_POLL_INTERVAL",
        value_name = "SECS",
        help = "Seconds between polls"
    )]
    poll_interval: Option<u64>,

    #[arg(long, global = true, help = "Disable the terminal status lines")]
    no_ui: bool,

    #[arg(
        long,
        global = true,
        env = "EG4_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        help = "Enable debug logging"
    )]
    debug: bool,
}

impl From<&OverrideArgs> for ConfigOverrides {
    fn from(args: &OverrideArgs) -> Self {
        ConfigOverrides {
            battery_name: args.battery_name.clone(),
            battery_ip: args.battery_ip.clone(),
            battery_port: args.battery_port,
            device_id: args.device_id,
            protocol: args.protocol,
            mqtt_broker: args.mqtt_broker.clone(),
            mqtt_port: args.mqtt_port,
            mqtt_username: args.mqtt_user.clone(),
            mqtt_password: args.mqtt_pass.clone(),
            mqtt_base_topic: args.mqtt_topic.clone(),
            poll_interval_secs: args.poll_interval,
            no_ui: args.no_ui,
            debug: args.debug,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Poll continuously and publish every tick")]
    Run,
    #[command(about = "Poll every battery once and print the JSON export")]
    Once,
    #[command(about = "Print the effective configuration with secrets masked")]
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let loaded = AppConfig::resolve(cli.config.as_deref())?;
    let mut config = loaded.config;
    config.apply_overrides(&ConfigOverrides::from(&cli.overrides));

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::ShowConfig = command {
        config.validate()?;
        print!("{}", config.redacted().to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let sink = match command {
        Commands::Once => LogSink::Stderr,
        _ => LogSink::Stdout,
    };
    init_tracing_with_sink("bmsmond", &config.logging, config.monitor.debug, sink)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file; using defaults"),
    }
    config.validate().context("invalid configuration")?;

    match command {
        Commands::Once => run_once(config).await,
        _ => run_daemon(config).await.map(|()| ExitCode::SUCCESS),
    }
}

fn build_sessions(config: &AppConfig) -> Vec<DeviceSession> {
    let thresholds = Arc::new(config.thresholds.clone());
    config
        .batteries
        .iter()
        .map(|battery| {
            info!(
                device = %battery.slug(),
                protocol = %battery.protocol,
                endpoint = %battery.endpoint(),
                "configured battery"
            );
            DeviceSession::new(
                battery,
                transport_for(battery),
                thresholds.clone(),
                config.monitor.read_timeout,
            )
        })
        .collect()
}

async fn run_once(config: AppConfig) -> Result<ExitCode> {
    let mut fleet = FleetCoordinator::new(build_sessions(&config), config.monitor.interval);
    let batch = fleet.poll_all().await;
    fleet.shutdown().await;

    let exports: Vec<TelemetryExport> = batch.iter().map(|t| t.export()).collect();
    println!("{}", serde_json::to_string_pretty(&exports)?);
    if exports.iter().any(|e| e.online) {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("no battery answered");
        Ok(ExitCode::FAILURE)
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let mut fleet = FleetCoordinator::new(build_sessions(&config), config.monitor.interval);

    let registry = if config.metrics.enabled {
        let registry = new_registry();
        fleet = fleet.with_metrics(FleetMetrics::new(registry.clone())?);
        Some(registry)
    } else {
        info!("metrics disabled by configuration");
        None
    };

    if config.mqtt.enabled {
        let mqtt = MqttPublisher::new(config.mqtt.clone());
        info!(
            broker = %config.mqtt.broker,
            port = config.mqtt.port,
            client_id = %mqtt.client_id(),
            "mqtt publisher enabled"
        );
        fleet = fleet.with_publisher(Arc::new(mqtt));
    }

    let mut dashboard: Option<DashboardHandle> = None;
    if config.web.enabled {
        let store = DashboardStore::new();
        let mut builder = DashboardServerBuilder::new(config.web.listen()?, store.clone());
        if let Some(registry) = &registry {
            builder = builder.with_metrics_registry(registry.clone());
        }
        match builder.spawn().await {
            Ok(handle) => {
                fleet = fleet.with_publisher(Arc::new(DashboardPublisher::new(
                    store,
                    config.mqtt.enabled,
                )));
                dashboard = Some(handle);
            }
            Err(err) => warn!(error = %err, "failed to start dashboard; continuing without it"),
        }
    }

    if config.monitor.ui_enabled {
        fleet = fleet.with_publisher(Arc::new(ConsolePublisher::stdout(config.mqtt.enabled)));
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_task = tokio::spawn(fleet.run(shutdown_rx));

    info!(
        batteries = config.batteries.len(),
        interval_secs = config.monitor.interval.as_secs(),
        "monitor running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let _ = shutdown_tx.send(());
    if let Err(err) = loop_task.await {
        warn!(error = %err, "poll loop terminated abnormally");
    }

    if let Some(handle) = dashboard {
        handle.shutdown().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_overrides() {
        let cli = Cli::try_parse_from([
            "bmsmond",
            "--battery-ip",
            "10.0.0.9",
            "--protocol",
            "pace",
            "--poll-interval",
            "5",
            "--no-ui",
            "once",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Once)));

        let mut config = AppConfig::default();
        config.apply_overrides(&ConfigOverrides::from(&cli.overrides));
        assert_eq!(config.batteries[0].ip, "10.0.0.9");
        assert_eq!(config.batteries[0].protocol, Protocol::Alternate);
        assert_eq!(config.monitor.interval.as_secs(), 5);
        assert!(!config.monitor.ui_enabled);
    }

    #[test]
    fn legacy_flag_spellings_are_accepted() {
        let cli = Cli::try_parse_from([
            "bmsmond",
            "-c",
            "/etc/bmsmon/site.yaml",
            "--interval",
            "12",
            "show-config",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bmsmon/site.yaml")));
        assert_eq!(cli.overrides.poll_interval, Some(12));
        assert!(matches!(cli.command, Some(Commands::ShowConfig)));
    }
}
