/* wombatt: a wanna-be Swiss army knife for inverter and battery
 * monitoring. Polls BMSes and inverters over serial, HID-raw or TCP,
 * and republishes decoded registers to stdout, HTTP and MQTT. */

mod bms;
mod cmd;
mod error;
mod fields;
mod inverters;
mod modbus;
mod mqtt;
mod pi30;
mod transport;
mod web;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "wombatt",
    version,
    about = "A wanna-be Swiss army knife for inverter and battery monitoring."
)]
struct Cli {
    /// Set the logging level (debug|info|warn|error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Displays battery information.
    BatteryInfo(cmd::battery_info::BatteryInfoArgs),

    /// Forwards data between two devices.
    Forward(cmd::forward::ForwardArgs),

    /// Sends PI30 protocol commands to inverters.
    InverterQuery(cmd::inverter_query::InverterQueryArgs),

    /// Reads Modbus holding registers.
    ModbusRead(cmd::modbus_read::ModbusReadArgs),

    /// Monitors batteries state, MQTT publishing optional.
    MonitorBatteries(cmd::monitor_batteries::MonitorBatteriesArgs),

    /// Monitors inverters state, MQTT publishing optional.
    MonitorInverters(cmd::monitor_inverters::MonitorInvertersArgs),

    /// Queries a Solark inverter.
    SolarkQuery(cmd::solark_query::SolarkQueryArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        debug!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = match cli.command {
        Commands::BatteryInfo(args) => cmd::battery_info::run(args).await,
        Commands::Forward(args) => cmd::forward::run(args, shutdown_rx).await,
        Commands::InverterQuery(args) => cmd::inverter_query::run(args).await,
        Commands::ModbusRead(args) => cmd::modbus_read::run(args).await,
        Commands::MonitorBatteries(args) => cmd::monitor_batteries::run(args, shutdown_rx).await,
        Commands::MonitorInverters(args) => cmd::monitor_inverters::run(args, shutdown_rx).await,
        Commands::SolarkQuery(args) => cmd::solark_query::run(args).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "unable to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
