/* Periodic PI30 inverter polling. Each monitored inverter lives on its
 * own transport, so one worker per device reads concurrently; the tick
 * joins all workers before publishing. */

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cmd::{MqttFlags, parse_duration, write_record};
use crate::error::Error;
use crate::fields::Record;
use crate::mqtt::MqttClient;
use crate::pi30;
use crate::transport::{DeviceType, Parity, Port, PortOptions};
use crate::web::WebServer;

#[derive(Args, Debug)]
pub struct MonitorInvertersArgs {
    #[command(flatten)]
    pub mqtt: MqttFlags,

    /// Device type.
    #[arg(long, short = 'T', default_value = "serial")]
    pub device_type: DeviceType,

    /// Baud rate for serial ports.
    #[arg(long, short = 'B', default_value_t = 2400)]
    pub baud_rate: u32,

    /// Time to wait between polling cycles.
    #[arg(long, short = 'P', default_value = "10s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Per inverter timeout for processing all the commands being sent.
    #[arg(long, short = 't', default_value = "5s", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Address to use for serving HTTP, e.g. 127.0.0.1:8080.
    #[arg(long, short = 'w', default_value = "")]
    pub web_server_address: String,

    /// <device>,<command1[:command2...]>[,<mqtt_prefix>].
    /// E.g. /dev/ttyS0,QPIRI:QPGS1,eg4_1
    #[arg(required = true)]
    pub monitors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Monitor {
    pub device: String,
    pub commands: Vec<String>,
    pub tag: String,
}

pub fn parse_monitors(specs: &[String]) -> Result<Vec<Monitor>> {
    let mut monitors = Vec::with_capacity(specs.len());
    for spec in specs {
        let parts: Vec<&str> = spec.splitn(3, ',').collect();
        if parts.len() < 2 {
            bail!("invalid inverter argument: '{spec}'");
        }
        let commands: Vec<String> = parts[1]
            .split(':')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            bail!("no inverter commands in '{spec}'");
        }
        monitors.push(Monitor {
            device: parts[0].to_string(),
            commands,
            tag: parts.get(2).unwrap_or(&"").to_string(),
        });
    }
    Ok(monitors)
}

pub async fn run(args: MonitorInvertersArgs, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    args.mqtt.validate()?;
    let monitors = parse_monitors(&args.monitors)?;

    let client = if args.mqtt.configured() {
        let client = MqttClient::connect(
            &args.mqtt.mqtt_broker,
            &args.mqtt.mqtt_user,
            &args.mqtt.mqtt_password,
        )
        .await
        .with_context(|| format!("connecting to MQTT broker at {}", args.mqtt.mqtt_broker))?;
        for m in &monitors {
            for command in &m.commands {
                let layout = pi30::layout_for_command(command);
                if layout.fields.len() < 2 {
                    /* Unknown commands have no stable schema. */
                    continue;
                }
                client
                    .publish_discovery(
                        &args.mqtt.mqtt_topic_prefix,
                        &m.tag,
                        &format!("Inverter {}", m.tag.replace('_', " ").trim()),
                        layout,
                    )
                    .await
                    .context("publishing MQTT discovery config")?;
            }
        }
        Some(client)
    } else {
        None
    };

    let web_server = if args.web_server_address.is_empty() {
        None
    } else {
        let server = WebServer::new("/inverter");
        server.start(args.web_server_address.clone(), shutdown.clone());
        Some(server)
    };

    loop {
        let mut tasks = JoinSet::new();
        for (i, m) in monitors.iter().enumerate() {
            let monitor = m.clone();
            let device_type = args.device_type;
            let baud_rate = args.baud_rate;
            let timeout = args.read_timeout;
            tasks.spawn(async move {
                let results = poll_inverter(&monitor, device_type, baud_rate, timeout).await;
                (i, results)
            });
        }

        /* Barrier: every worker finishes its tick before publishing. */
        let mut responses: Vec<Option<Vec<Result<Record, Error>>>> =
            (0..monitors.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((i, results)) = joined {
                responses[i] = Some(results);
            }
        }

        for (i, results) in responses.into_iter().enumerate() {
            let Some(results) = results else { continue };
            let m = &monitors[i];
            publish(m, i, &results, client.as_ref(), web_server.as_ref(), &args).await;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(args.poll_interval) => {}
        }
    }
    Ok(())
}

async fn poll_inverter(
    monitor: &Monitor,
    device_type: DeviceType,
    baud_rate: u32,
    timeout: Duration,
) -> Vec<Result<Record, Error>> {
    let mut opts = PortOptions::new(&monitor.device, device_type, baud_rate);
    opts.parity = Parity::None;
    let port = match Port::open(opts).await {
        Ok(port) => port,
        Err(e) => {
            warn!(device = %monitor.device, error = %e, "error opening inverter port");
            return monitor
                .commands
                .iter()
                .map(|_| Err(Error::Config(format!("error opening {}: {e}", monitor.device))))
                .collect();
        }
    };
    let results = pi30::run_commands(&port, &monitor.commands, timeout).await;
    port.close().await;
    results
}

async fn publish(
    monitor: &Monitor,
    index: usize,
    results: &[Result<Record, Error>],
    client: Option<&MqttClient>,
    web_server: Option<&WebServer>,
    args: &MonitorInvertersArgs,
) {
    if client.is_none() && web_server.is_none() {
        publish_to_stdout(monitor, results);
        return;
    }

    let mut valid = Vec::new();
    for (command, result) in monitor.commands.iter().zip(results) {
        match result {
            Ok(record) => {
                if !pi30::response_valid(command, record) {
                    warn!(device = %monitor.device, %command, "dropping invalid response");
                    continue;
                }
                valid.push((command, record));
            }
            Err(e) => {
                warn!(device = %monitor.device, %command, error = %e, "error running command");
            }
        }
    }

    if let Some(client) = client {
        let records: Vec<&Record> = valid.iter().map(|(_, r)| *r).collect();
        if !records.is_empty() {
            if let Err(e) = client
                .publish_state(&args.mqtt.mqtt_topic_prefix, &monitor.tag, &records)
                .await
            {
                warn!(error = %e, "[mqtt] error publishing state");
            }
        }
    }
    if let Some(server) = web_server {
        for (command, record) in &valid {
            server
                .publish(&format!("{}/{}", index + 1, command), Some(record))
                .await;
        }
    }
    info!(device = %monitor.device, published = valid.len(), "inverter tick done");
}

fn publish_to_stdout(monitor: &Monitor, results: &[Result<Record, Error>]) {
    for (command, result) in monitor.commands.iter().zip(results) {
        match result {
            Ok(record) => {
                println!("{} -> {}\n=======================", monitor.device, command);
                let mut stdout = std::io::stdout();
                write_record(&mut stdout, record);
                println!();
            }
            Err(e) => {
                warn!(device = %monitor.device, %command, error = %e, "error running command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_spec_parsing() {
        let monitors = parse_monitors(&[
            "/dev/ttyS0,QPIRI:QPGS1,eg4_1".to_string(),
            "/dev/ttyS1,QPIGS".to_string(),
        ])
        .unwrap();
        assert_eq!(
            monitors[0],
            Monitor {
                device: "/dev/ttyS0".into(),
                commands: vec!["QPIRI".into(), "QPGS1".into()],
                tag: "eg4_1".into(),
            }
        );
        assert_eq!(monitors[1].tag, "");
        assert_eq!(monitors[1].commands, vec!["QPIGS".to_string()]);

        assert!(parse_monitors(&["/dev/ttyS0".to_string()]).is_err());
        assert!(parse_monitors(&["/dev/ttyS0,,tag".to_string()]).is_err());
    }
}
