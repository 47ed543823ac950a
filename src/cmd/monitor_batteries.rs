/* Periodic battery polling with MQTT and HTTP publishing.
 *
 * Batteries share one RS-485 bus, so reads are strictly sequential: one
 * initiator at a time. A failed read reopens the port and moves on to
 * the next ID; the tick is never aborted. */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::bms::{self, Bms, BmsKind};
use crate::cmd::{DeviceFlags, MqttFlags, parse_duration};
use crate::error::Error;
use crate::fields::Record;
use crate::modbus::{Protocol, RegisterReader, reader_for};
use crate::mqtt::MqttClient;
use crate::transport::{MAX_BACKOFF_INTERVAL, Port};
use crate::web::WebServer;

#[derive(Args, Debug)]
pub struct MonitorBatteriesArgs {
    #[command(flatten)]
    pub device: DeviceFlags,

    #[command(flatten)]
    pub mqtt: MqttFlags,

    /// IDs of the batteries to monitor.
    #[arg(long = "battery-ids", short = 'i', required = true, value_delimiter = ',')]
    pub ids: Vec<u8>,

    /// Time to wait between polling cycles.
    #[arg(long, short = 'P', default_value = "10s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Timeout when reading from serial ports.
    #[arg(long, short = 't', default_value = "500ms", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Battery type.
    #[arg(long, default_value = "EG4LLv2")]
    pub bms_type: BmsKind,

    /// Wire protocol; `auto` picks the battery type's default.
    #[arg(long, default_value = "auto")]
    pub protocol: Protocol,

    /// MQTT prefix for the fields published.
    #[arg(long, default_value = "eg4")]
    pub mqtt_prefix: String,

    /// Address to use for serving HTTP, e.g. 127.0.0.1:8080.
    #[arg(long, short = 'w', default_value = "")]
    pub web_server_address: String,
}

struct BatteryInfo {
    id: u8,
    info: Record,
}

pub async fn run(args: MonitorBatteriesArgs, shutdown: watch::Receiver<bool>) -> Result<()> {
    for id in &args.ids {
        if *id == 0 || *id >= 247 {
            bail!("id out of range: {id}");
        }
    }
    args.mqtt.validate()?;

    let web_server = if args.web_server_address.is_empty() {
        None
    } else {
        let server = WebServer::new("/battery");
        server.start(args.web_server_address.clone(), shutdown.clone());
        Some(server)
    };

    let battery = bms::instance(args.bms_type);
    let mqtt_channel = if args.mqtt.configured() {
        let client = MqttClient::connect(
            &args.mqtt.mqtt_broker,
            &args.mqtt.mqtt_user,
            &args.mqtt.mqtt_password,
        )
        .await
        .with_context(|| format!("connecting to MQTT broker at {}", args.mqtt.mqtt_broker))?;

        /* Retained discovery configs go out once, before any state. */
        for id in &args.ids {
            let tag = format!("{}_battery{}", args.mqtt_prefix, id);
            client
                .publish_discovery(
                    &args.mqtt.mqtt_topic_prefix,
                    &tag,
                    &format!("Battery {id}"),
                    battery.info_layout(),
                )
                .await
                .context("publishing MQTT discovery config")?;
        }

        let (tx, rx) = mpsc::channel::<BatteryInfo>(args.ids.len());
        spawn_state_publisher(
            client,
            rx,
            args.mqtt.mqtt_topic_prefix.clone(),
            args.mqtt_prefix.clone(),
        );
        Some(tx)
    } else {
        None
    };

    if web_server.is_none() && mqtt_channel.is_none() {
        bail!("need at least MQTT or web server argument to publish info to");
    }

    let protocol = match args.protocol {
        Protocol::Auto => battery.default_protocol(args.device.device_type),
        p => p,
    };
    /* A monitor should survive the device enumerating late at boot;
     * retry the initial open for a bounded while. */
    let port = Arc::new(
        Port::open_with_backoff(args.device.port_options(), Some(2 * MAX_BACKOFF_INTERVAL))
            .await
            .with_context(|| format!("opening {}", args.device.address))?,
    );
    let reader = reader_for(port.clone(), protocol, args.bms_type.family())?;

    monitor(
        &args,
        battery.as_ref(),
        port,
        reader.as_ref(),
        mqtt_channel,
        web_server,
        shutdown,
    )
    .await;
    Ok(())
}

async fn monitor(
    args: &MonitorBatteriesArgs,
    battery: &dyn Bms,
    port: Arc<Port>,
    reader: &dyn RegisterReader,
    mqtt_channel: Option<mpsc::Sender<BatteryInfo>>,
    web_server: Option<WebServer>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        info!(ids = ?args.ids, "fetching info from batteries");
        let mut success = Vec::new();
        for id in &args.ids {
            /* Shutdown cancels the outstanding read; the loop exits at
             * the next iteration boundary. */
            let result = tokio::select! {
                _ = shutdown.changed() => Err(Error::Canceled),
                r = battery.read_info(reader, *id, args.read_timeout) => r,
            };
            let info = match result {
                Ok(info) => info,
                Err(Error::Canceled) => return,
                Err(e) => {
                    warn!(id, error = %e, "error reading battery");
                    if let Err(e) = port.reopen_with_backoff().await {
                        warn!(error = %e, "error reopening");
                    }
                    continue;
                }
            };
            if let Some(server) = &web_server {
                server.publish(&id.to_string(), Some(&info)).await;
            }
            if let Some(tx) = &mqtt_channel {
                let _ = tx.send(BatteryInfo { id: *id, info }).await;
            }
            success.push(*id);
        }
        info!(ids = ?success, "published battery info");

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(args.poll_interval) => {}
        }
    }
}

/* Drain the bounded channel and push state objects to the broker.
 * Publish failures are logged; the poller never blocks on the broker
 * beyond the channel capacity. */
fn spawn_state_publisher(
    client: MqttClient,
    mut rx: mpsc::Receiver<BatteryInfo>,
    topic_prefix: String,
    mqtt_prefix: String,
) {
    tokio::spawn(async move {
        while let Some(bi) = rx.recv().await {
            let tag = format!("{}_battery{}", mqtt_prefix, bi.id);
            if let Err(e) = client
                .publish_state(&topic_prefix, &tag, &[&bi.info])
                .await
            {
                warn!(error = %e, "[mqtt] error publishing state");
            }
        }
    });
}
