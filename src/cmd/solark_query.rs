/* One-shot Solark dump: real-time running data plus the intrinsic
 * attributes (serial number). */

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use crate::cmd::{DeviceFlags, parse_duration, write_record};
use crate::inverters::solark;
use crate::modbus::{Protocol, reader_for};

#[derive(Args, Debug)]
pub struct SolarkQueryArgs {
    #[command(flatten)]
    pub device: DeviceFlags,

    /// Wire protocol; `auto` resolves from the device type.
    #[arg(long, default_value = "auto")]
    pub protocol: Protocol,

    /// Modbus device ID.
    #[arg(long, short = 'i', default_value_t = 1)]
    pub id: u8,

    /// Per request timeout.
    #[arg(long, short = 't', default_value = "5s", value_parser = parse_duration)]
    pub read_timeout: Duration,
}

pub async fn run(args: SolarkQueryArgs) -> Result<()> {
    let port = args.device.open().await?;
    let reader = reader_for(port.clone(), args.protocol, "")?;

    let realtime = tokio::time::timeout(
        args.read_timeout,
        solark::read_realtime_data(reader.as_ref(), args.id),
    )
    .await
    .map_err(|_| crate::error::Error::Timeout)?
    .context("reading realtime data")?;

    println!("--- Solark Real-time Data ---");
    let mut stdout = std::io::stdout();
    write_record(&mut stdout, &realtime);

    let serial = tokio::time::timeout(
        args.read_timeout,
        solark::read_serial_number(reader.as_ref(), args.id),
    )
    .await
    .map_err(|_| crate::error::Error::Timeout)?
    .context("reading intrinsic attributes")?;

    println!("\n--- Solark Intrinsic Attributes ---");
    println!("Serial Number: {serial}");
    port.close().await;
    Ok(())
}
