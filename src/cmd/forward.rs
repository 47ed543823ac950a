/* Pipe bytes between two transports. Used to sit between an RS-485
 * controller and a subordinate device and log the conversation. */

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::transport::{DeviceType, Port, PortOptions};

#[derive(Args, Debug)]
pub struct ForwardArgs {
    /// Serial port of the RS485 controller.
    #[arg(long = "controller-port", required = true)]
    pub controller: String,

    /// A subordinate device in the RS485 bus.
    #[arg(long = "subordinate-port", required = true)]
    pub subordinate: String,

    /// Baud rate.
    #[arg(long, short = 'B', default_value_t = 9600)]
    pub baud_rate: u32,

    /// Device type.
    #[arg(long, short = 'T', default_value = "serial")]
    pub device_type: DeviceType,
}

pub async fn run(args: ForwardArgs, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let controller = Arc::new(
        Port::open(PortOptions::new(
            &args.controller,
            args.device_type,
            args.baud_rate,
        ))
        .await
        .with_context(|| format!("opening {}", args.controller))?,
    );
    let subordinate = Arc::new(
        Port::open(PortOptions::new(
            &args.subordinate,
            args.device_type,
            args.baud_rate,
        ))
        .await
        .with_context(|| format!("opening {}", args.subordinate))?,
    );
    info!(
        controller = args.controller,
        subordinate = args.subordinate,
        "forwarding"
    );

    let c2s = tokio::spawn(pipe(
        Arc::clone(&controller),
        Arc::clone(&subordinate),
        args.controller.clone(),
    ));
    let s2c = tokio::spawn(pipe(
        Arc::clone(&subordinate),
        Arc::clone(&controller),
        args.subordinate.clone(),
    ));

    let _ = shutdown.changed().await;
    c2s.abort();
    s2c.abort();
    controller.close().await;
    subordinate.close().await;
    Ok(())
}

async fn pipe(from: Arc<Port>, to: Arc<Port>, from_name: String) {
    let mut buf = [0u8; 128];
    loop {
        let data = match from.read(&mut buf).await {
            Ok(n) => &buf[..n],
            Err(e) => {
                warn!(device = %from_name, error = %e, "error reading");
                if let Err(e) = from.reopen_with_backoff().await {
                    warn!(error = %e, "error reopening");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        info!("{}: {} {}", from_name, data.len(), hex::encode(data));
        if let Err(e) = to.write_all(data).await {
            warn!(error = %e, "error writing");
            if let Err(e) = to.reopen_with_backoff().await {
                warn!(error = %e, "error reopening");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
