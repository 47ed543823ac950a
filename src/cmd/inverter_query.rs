/* One-shot inverter queries: PI30 protocol commands, or `RealtimeData`
 * for the Modbus inverter families. */

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use tracing::warn;

use crate::cmd::{parse_duration, write_record};
use crate::inverters::{self, InverterKind};
use crate::modbus::{Protocol, reader_for};
use crate::pi30;
use crate::transport::{DeviceType, Port, PortOptions};

#[derive(Args, Debug)]
pub struct InverterQueryArgs {
    /// Device addresses used for communication with the inverters.
    #[arg(long = "address", short = 'p', required = true, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Commands to send to the inverters.
    #[arg(long, short = 'c', required = true, value_delimiter = ',')]
    pub commands: Vec<String>,

    /// Baud rate.
    #[arg(long, short = 'B', default_value_t = 2400)]
    pub baud_rate: u32,

    /// Per inverter timeout for processing all the commands being sent.
    #[arg(long, short = 't', default_value = "5s", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Device type.
    #[arg(long, short = 'T', default_value = "serial")]
    pub device_type: DeviceType,

    /// Inverter family.
    #[arg(long, default_value = "PI30")]
    pub inverter_type: InverterKind,

    /// Wire protocol for the Modbus inverter families.
    #[arg(long, default_value = "auto")]
    pub protocol: Protocol,

    /// Modbus device ID for the Modbus inverter families.
    #[arg(long, default_value_t = 1)]
    pub id: u8,
}

pub async fn run(args: InverterQueryArgs) -> Result<()> {
    let mut errors = Vec::new();
    for address in &args.addresses {
        let opts = PortOptions::new(address, args.device_type, args.baud_rate);
        let port = match Port::open(opts).await {
            Ok(port) => std::sync::Arc::new(port),
            Err(e) => {
                warn!(%address, error = %e, "error opening device");
                errors.push(format!("{address}: {e}"));
                continue;
            }
        };

        let results = match args.inverter_type {
            InverterKind::Pi30 => {
                pi30::run_commands(&port, &args.commands, args.read_timeout).await
            }
            kind => {
                let reader = reader_for(port.clone(), args.protocol, "")?;
                inverters::run_commands(
                    kind,
                    reader.as_ref(),
                    args.id,
                    &args.commands,
                    args.read_timeout,
                )
                .await
            }
        };

        for (command, result) in args.commands.iter().zip(results) {
            match result {
                Ok(record) => {
                    println!("Device: {address}, Command: {command}\n{}", "=".repeat(40));
                    let mut stdout = std::io::stdout();
                    write_record(&mut stdout, &record);
                }
                Err(e) => {
                    warn!(%address, %command, error = %e, "error running command");
                    errors.push(format!("{address} {command}: {e}"));
                }
            }
        }
        port.close().await;
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("\n"));
    }
    Ok(())
}
