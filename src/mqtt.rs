/* MQTT publisher speaking the home-automation discovery convention.
 *
 * Two emission modes: a one-shot retained discovery config per field
 * (so the broker-side automation learns the schema before any data),
 * and a non-retained state object per poll. Discovery keys use the
 * short aliases (`stat_t`, `uniq_id`, ...); nested maps such as the
 * device block are aliased recursively. */

use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{Map, Value as Json, json};
use tracing::{debug, warn};

use crate::error::Error;
use crate::fields::{FieldInfo, Layout, Record};

/* Full discovery key -> home-automation alias. */
static ALIASES: &[(&str, &str)] = &[
    ("device", "dev"),
    ("device_class", "dev_cla"),
    ("icon", "ic"),
    ("identifiers", "ids"),
    ("manufacturer", "mf"),
    ("model", "mdl"),
    ("object_id", "obj_id"),
    ("state_class", "stat_cla"),
    ("state_topic", "stat_t"),
    ("suggested_display_precision", "sug_dsp_prc"),
    ("unique_id", "uniq_id"),
    ("unit_of_measurement", "unit_of_meas"),
    ("value_template", "val_tpl"),
];

pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    /* Connect to `broker` ("tcp://host:port" or "host:port") and spawn
     * the event-loop driver task. */
    pub async fn connect(broker: &str, user: &str, password: &str) -> Result<MqttClient, Error> {
        let (host, port) = parse_broker(broker)?;
        let mut options = MqttOptions::new("wombatt", host, port);
        if !user.is_empty() {
            options.set_credentials(user, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => debug!(?event, "mqtt event"),
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(MqttClient { client })
    }

    pub async fn publish_json(&self, topic: &str, payload: &Json, retain: bool) -> Result<(), Error> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::Config(format!("error encoding payload: {e}")))?;
        self.client
            .publish(topic, QoS::AtMostOnce, retain, body)
            .await
            .map_err(|e| Error::Config(format!("error publishing to {topic}: {e}")))
    }

    /* One retained config message per published field. */
    pub async fn publish_discovery(
        &self,
        topic_prefix: &str,
        tag: &str,
        display_prefix: &str,
        layout: &Layout,
    ) -> Result<(), Error> {
        for info in layout.field_infos() {
            let config = discovery_config(&info, topic_prefix, tag, display_prefix);
            let topic = format!("{topic_prefix}/sensor/{tag}_{}/config", info.name);
            self.publish_json(&topic, &config, true).await?;
        }
        Ok(())
    }

    /* The cooked field stream collapsed into one flat JSON object. */
    pub async fn publish_state(&self, topic_prefix: &str, tag: &str, records: &[&Record]) -> Result<(), Error> {
        let payload = state_payload(records);
        if payload.as_object().is_some_and(Map::is_empty) {
            return Ok(());
        }
        let topic = format!("{topic_prefix}/sensor/{tag}_info/state");
        self.publish_json(&topic, &payload, false).await
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16), Error> {
    let trimmed = broker
        .strip_prefix("tcp://")
        .or_else(|| broker.strip_prefix("mqtt://"))
        .unwrap_or(broker);
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid MQTT broker address: {broker}")))?;
            (host, port)
        }
        None => (trimmed, 1883),
    };
    if host.is_empty() {
        return Err(Error::Config(format!("invalid MQTT broker address: {broker}")));
    }
    Ok((host.to_string(), port))
}

pub fn state_payload(records: &[&Record]) -> Json {
    let mut map = Map::new();
    for record in records {
        for field in record.fields() {
            map.insert(field.info.name.clone(), field.value.to_json());
        }
    }
    Json::Object(map)
}

pub fn discovery_config(
    info: &FieldInfo,
    topic_prefix: &str,
    tag: &str,
    display_prefix: &str,
) -> Json {
    let mut map = Map::new();
    map.insert(
        "name".to_string(),
        format!("{display_prefix} {}", info.name.replace('_', " ")).into(),
    );
    map.insert(
        "state_topic".to_string(),
        format!("{topic_prefix}/sensor/{tag}_info/state").into(),
    );
    map.insert("object_id".to_string(), format!("{tag}_{}", info.name).into());
    map.insert("unique_id".to_string(), format!("{tag}_{}", info.name).into());
    map.insert(
        "value_template".to_string(),
        format!("{{{{ value_json.{} }}}}", info.name).into(),
    );
    map.insert(
        "device".to_string(),
        json!({ "identifiers": [tag], "name": display_prefix }),
    );
    if !info.device_class.is_empty() {
        map.insert("device_class".to_string(), info.device_class.into());
    }
    if !info.unit.is_empty() {
        map.insert("unit_of_measurement".to_string(), info.unit.as_ref().into());
        map.insert("state_class".to_string(), "measurement".into());
    }
    if !info.icon.is_empty() {
        map.insert("icon".to_string(), info.icon.into());
    }
    if let Some(precision) = info.precision {
        map.insert("suggested_display_precision".to_string(), precision.into());
    }
    let mut config = Json::Object(map);
    alias_keys(&mut config);
    config
}

/* Rename discovery keys to their short aliases, recursing into nested
 * objects so the device identifiers are aliased too. */
fn alias_keys(value: &mut Json) {
    if let Json::Object(map) = value {
        let mut renamed = Map::with_capacity(map.len());
        for (key, mut val) in std::mem::take(map) {
            alias_keys(&mut val);
            let key = ALIASES
                .iter()
                .find(|(full, _)| *full == key)
                .map(|(_, short)| short.to_string())
                .unwrap_or(key);
            renamed.insert(key, val);
        }
        *map = renamed;
    } else if let Json::Array(items) = value {
        for item in items {
            alias_keys(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{RawValue, Record, i16_field, str_field, u16_field};

    #[test]
    fn broker_parsing() {
        assert_eq!(
            parse_broker("tcp://127.0.0.1:1883").unwrap(),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("mqtt://broker:8883").unwrap(),
            ("broker".to_string(), 8883)
        );
        assert!(parse_broker("tcp://:1883").is_err());
        assert!(parse_broker("tcp://host:notaport").is_err());
    }

    #[test]
    fn discovery_config_uses_aliases() {
        let info = crate::fields::FieldInfo {
            name: "battery_voltage".to_string(),
            unit: "V".into(),
            device_class: "voltage",
            icon: "",
            precision: Some(2),
        };
        let config = discovery_config(&info, "homeassistant", "eg4_battery1", "Battery 1");
        let map = config.as_object().unwrap();

        assert_eq!(map.get("name").unwrap(), "Battery 1 battery voltage");
        assert_eq!(
            map.get("stat_t").unwrap(),
            "homeassistant/sensor/eg4_battery1_info/state"
        );
        assert_eq!(map.get("uniq_id").unwrap(), "eg4_battery1_battery_voltage");
        assert_eq!(map.get("obj_id").unwrap(), "eg4_battery1_battery_voltage");
        assert_eq!(
            map.get("val_tpl").unwrap(),
            "{{ value_json.battery_voltage }}"
        );
        assert_eq!(map.get("dev_cla").unwrap(), "voltage");
        assert_eq!(map.get("unit_of_meas").unwrap(), "V");
        assert_eq!(map.get("stat_cla").unwrap(), "measurement");
        assert_eq!(map.get("sug_dsp_prc").unwrap(), 2);
        /* No unaliased keys survive. */
        assert!(!map.contains_key("state_topic"));
        assert!(!map.contains_key("unique_id"));

        /* The nested device block is aliased recursively. */
        let dev = map.get("dev").unwrap().as_object().unwrap();
        assert_eq!(dev.get("ids").unwrap(), &serde_json::json!(["eg4_battery1"]));
        assert!(!dev.contains_key("identifiers"));
    }

    #[test]
    fn state_payload_flattens_records() {
        let mut rec = Record::empty();
        rec.push(
            u16_field("battery_voltage").unit("V").multiplier(0.01),
            RawValue::Uint(5366),
        );
        rec.push(i16_field("current"), RawValue::Int(-120));
        let mut extra = Record::empty();
        extra.push(str_field("model"), RawValue::Text("LFP-51.2".into()));

        let payload = state_payload(&[&rec, &extra]);
        assert_eq!(
            payload,
            serde_json::json!({
                "battery_voltage": 53.66,
                "current": -120,
                "model": "LFP-51.2",
            })
        );
    }
}
