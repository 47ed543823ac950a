/* One-shot read of one or more batteries, printed to stdout. */

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use tracing::warn;

use crate::bms::{self, BmsKind};
use crate::cmd::{DeviceFlags, parse_duration, write_record};
use crate::modbus::{Protocol, reader_for};

#[derive(Args, Debug)]
pub struct BatteryInfoArgs {
    #[command(flatten)]
    pub device: DeviceFlags,

    /// IDs of the batteries to get info from. Default: 1 thru 64.
    #[arg(long = "battery-ids", short = 'i', value_delimiter = ',')]
    pub ids: Vec<u8>,

    /// Timeout when reading from serial ports.
    #[arg(long, short = 't', default_value = "500ms", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Battery type.
    #[arg(long, default_value = "EG4LLv2")]
    pub bms_type: BmsKind,

    /// Wire protocol; `auto` picks the battery type's default.
    #[arg(long, default_value = "auto")]
    pub protocol: Protocol,
}

pub async fn run(args: BatteryInfoArgs) -> Result<()> {
    let ids: Vec<u8> = if args.ids.is_empty() {
        (1..=64).collect()
    } else {
        args.ids.clone()
    };

    let battery = bms::instance(args.bms_type);
    let protocol = match args.protocol {
        Protocol::Auto => battery.default_protocol(args.device.device_type),
        p => p,
    };
    let port = args.device.open().await?;
    let reader = reader_for(port.clone(), protocol, args.bms_type.family())?;

    let mut errors = Vec::new();
    for id in ids {
        let info = match battery.read_info(reader.as_ref(), id, args.read_timeout).await {
            Ok(info) => info,
            Err(e) => {
                warn!(id, error = %e, "error getting battery info");
                errors.push(format!("battery #{id}: {e}"));
                port.reopen_with_backoff().await?;
                continue;
            }
        };
        let extra = match battery
            .read_extra_info(reader.as_ref(), id, args.read_timeout)
            .await
        {
            Ok(extra) => Some(extra),
            Err(e) => {
                warn!(id, error = %e, "error getting extra battery info");
                errors.push(format!("battery #{id} extra info: {e}"));
                port.reopen_with_backoff().await?;
                continue;
            }
        };

        println!("Battery #{id}\n===========");
        let mut stdout = std::io::stdout();
        write_record(&mut stdout, &info);
        if let Some(extra) = extra {
            write_record(&mut stdout, &extra);
        }
        println!();
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("\n"));
    }
    Ok(())
}
