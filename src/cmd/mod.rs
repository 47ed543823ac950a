/* Subcommand implementations and the flag groups they share. */

pub mod battery_info;
pub mod forward;
pub mod inverter_query;
pub mod modbus_read;
pub mod monitor_batteries;
pub mod monitor_inverters;
pub mod solark_query;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;

use crate::fields::Record;
use crate::transport::{DeviceType, Parity, Port, PortOptions};

/* Flags shared by every command that opens a device. */
#[derive(Args, Debug, Clone)]
pub struct DeviceFlags {
    /// Device address: a serial/hidraw path or a host:port for TCP.
    #[arg(long, short = 'p')]
    pub address: String,

    /// Device type.
    #[arg(long, short = 'T', default_value = "serial")]
    pub device_type: DeviceType,

    /// Baud rate for serial ports.
    #[arg(long, short = 'B', default_value_t = 9600)]
    pub baud_rate: u32,

    /// Number of data bits for serial ports.
    #[arg(long, default_value_t = 8)]
    pub data_bits: u8,

    /// Number of stop bits for serial ports.
    #[arg(long, default_value_t = 1)]
    pub stop_bits: u8,

    /// Parity for serial ports (N, E, O).
    #[arg(long, default_value = "N")]
    pub parity: Parity,
}

impl DeviceFlags {
    pub fn port_options(&self) -> PortOptions {
        let mut opts = PortOptions::new(&self.address, self.device_type, self.baud_rate);
        opts.data_bits = self.data_bits;
        opts.stop_bits = self.stop_bits;
        opts.parity = self.parity;
        opts
    }

    pub async fn open(&self) -> Result<Arc<Port>> {
        let port = Port::open(self.port_options())
            .await
            .with_context(|| format!("opening {}", self.address))?;
        Ok(Arc::new(port))
    }
}

/* MQTT settings, also accepted from the environment. */
#[derive(Args, Debug, Clone)]
pub struct MqttFlags {
    /// The MQTT server to publish data to, e.g. tcp://127.0.0.1:1883.
    #[arg(long, env = "MQTT_BROKER", default_value = "")]
    pub mqtt_broker: String,

    /// User for the MQTT connection.
    #[arg(long, env = "MQTT_USER", default_value = "")]
    pub mqtt_user: String,

    /// Password for the MQTT connection.
    #[arg(long, env = "MQTT_PASSWORD", default_value = "")]
    pub mqtt_password: String,

    /// Prefix for all topics published to MQTT.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "homeassistant")]
    pub mqtt_topic_prefix: String,
}

impl MqttFlags {
    pub fn configured(&self) -> bool {
        !self.mqtt_broker.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let user = !self.mqtt_user.is_empty();
        let password = !self.mqtt_password.is_empty();
        if user && self.mqtt_broker.is_empty() {
            bail!("MQTT user provided but no MQTT broker");
        }
        if user != password {
            bail!("both MQTT user and password are needed");
        }
        Ok(())
    }
}

/* "500ms", "5s", "2m", "1h". Bare numbers are seconds. */
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration unit: {s}")),
    }
}

/* Human-readable rendering of one record: `name: value<unit>` lines. */
pub fn write_record(out: &mut impl Write, record: &Record) {
    for field in record.fields() {
        let name = field.info.name.replace('_', " ");
        let _ = writeln!(out, "{}: {}{}", name, field.value, field.info.unit);
    }
}

/* Classic offset | hex | ASCII dump. */
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", i * 16));
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{RawValue, u16_field};

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn mqtt_flag_validation() {
        let ok = MqttFlags {
            mqtt_broker: "tcp://localhost:1883".into(),
            mqtt_user: "u".into(),
            mqtt_password: "p".into(),
            mqtt_topic_prefix: "homeassistant".into(),
        };
        assert!(ok.validate().is_ok());

        let mut user_no_broker = ok.clone();
        user_no_broker.mqtt_broker.clear();
        assert!(user_no_broker.validate().is_err());

        let mut user_no_password = ok.clone();
        user_no_password.mqtt_password.clear();
        assert!(user_no_password.validate().is_err());

        let mut none = ok;
        none.mqtt_broker.clear();
        none.mqtt_user.clear();
        none.mqtt_password.clear();
        assert!(none.validate().is_ok());
        assert!(!none.configured());
    }

    #[test]
    fn record_rendering() {
        let mut rec = Record::empty();
        rec.push(
            u16_field("battery_voltage").unit("V").multiplier(0.01),
            RawValue::Uint(5366),
        );
        let mut out = Vec::new();
        write_record(&mut out, &rec);
        assert_eq!(String::from_utf8(out).unwrap(), "battery voltage: 53.66V\n");
    }

    #[test]
    fn hex_dump_format() {
        let dump = hex_dump(b"wombatt!ABCDEFGH\x01\x02");
        let mut lines = dump.lines();
        assert_eq!(
            lines.next().unwrap(),
            "00000000  77 6f 6d 62 61 74 74 21  41 42 43 44 45 46 47 48  |wombatt!ABCDEFGH|"
        );
        assert!(lines.next().unwrap().starts_with("00000010  01 02"));
    }
}
