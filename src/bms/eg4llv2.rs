/* EG4-LLv2 BMS driver (also sold as Lifepower v2). Modbus, 39 holding
 * registers of live data at address 0 and 23 registers of identity
 * strings at address 105.
 *
 * Register map from the vendor's "EG4-LL MODBUS Communication Protocol"
 * PDF. */

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::bms::{Bms, append_voltage_stats, read_with_timeout, voltage_stat_specs};
use crate::error::Error;
use crate::fields::{
    Endianness, Layout, RawValue, Record, Scalar, array_field, i8_field, i16_field, string_field,
    u16_field, u32_field,
};
use crate::modbus::{Protocol, RegisterReader};
use crate::transport::DeviceType;

const BASIC_INFO_ADDRESS: u16 = 0;
const BASIC_INFO_REGISTER_COUNT: u8 = 39;

const EXTRA_INFO_ADDRESS: u16 = 105;
const EXTRA_INFO_REGISTER_COUNT: u8 = 23;

static STATUS_VALUES: &[(&str, &str)] = &[
    ("0", "inactive/stand by"),
    ("1", "inactive/charging"),
    ("2", "inactive/discharging"),
    ("4", "inactive/protect"),
    ("8", "inactive/charging limit"),
    ("32768", "active/stand by"),
    ("32769", "active/charging"),
    ("32770", "active/discharging"),
    ("32772", "active/protect"),
    ("32776", "active/charging limit"),
];

static WARNING_FLAGS: &[&str] = &[
    "0x8000",
    "0x4000",
    "float stopped",
    "low capacity",
    "discharge under temp",
    "charge under temp",
    "discharge over temp",
    "charge over temp",
    "MOS overheating",
    "abnormal ambient temp",
    "discharge overcurrent",
    "charge overcurrent",
    "cell undervoltage",
    "pack undervoltage",
    "cell overvoltage",
    "pack overvoltage",
];

static PROTECTION_FLAGS: &[&str] = &[
    "0x8000",
    "0x4000",
    "discharge short circuit",
    "low capacity",
    "discharge under temp",
    "charge under temp",
    "discharge over temp",
    "charge over temp",
    "MOS overheating",
    "abnormal ambient temp",
    "discharge overcurrent",
    "charge overcurrent",
    "cell undervoltage",
    "pack undervoltage",
    "cell overvoltage",
    "pack overvoltage",
];

static ERROR_CODE_FLAGS: &[&str] = &[
    "0x8000",
    "0x4000",
    "0x2000",
    "0x1000",
    "0x0800",
    "0x0400",
    "0x0200",
    "0x0100",
    "0x0080",
    "0x0040",
    "0x0020",
    "cell unbalance",
    "0x0008",
    "current flow error",
    "temperature error",
    "voltage error",
];

static CELL_BALANCE_FLAGS: &[&str] = &[
    "cell 16 unbalanced",
    "cell 15 unbalanced",
    "cell 14 unbalanced",
    "cell 13 unbalanced",
    "cell 12 unbalanced",
    "cell 11 unbalanced",
    "cell 10 unbalanced",
    "cell 9 unbalanced",
    "cell 8 unbalanced",
    "cell 7 unbalanced",
    "cell 6 unbalanced",
    "cell 5 unbalanced",
    "cell 4 unbalanced",
    "cell 3 unbalanced",
    "cell 2 unbalanced",
    "cell 1 unbalanced",
];

fn basic_fields() -> Vec<crate::fields::FieldSpec> {
    vec![
        u16_field("battery_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.01)
            .precision(2),
        i16_field("current")
            .device_class("current")
            .unit("A")
            .multiplier(0.01)
            .precision(2),
        array_field("cell_%d_voltage", Scalar::U16, 16)
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001)
            .precision(3),
        i16_field("pcb_temp").device_class("temperature").unit("°C"),
        /* max_temp and avg_temp appear swapped in the vendor PDF. */
        i16_field("max_temp").device_class("temperature").unit("°C"),
        i16_field("avg_temp")
            .device_class("temperature")
            .unit("°C")
            .precision(1),
        u16_field("cap_remaining").unit("%"),
        u16_field("max_charging_current")
            .device_class("current")
            .unit("A")
            .icon("mdi:current-dc"),
        u16_field("soh").unit("%"),
        u16_field("soc").device_class("battery").unit("%"),
        u16_field("status").values(STATUS_VALUES),
        u16_field("warning").flags(WARNING_FLAGS),
        u16_field("protection").flags(PROTECTION_FLAGS),
        u16_field("error_code").flags(ERROR_CODE_FLAGS),
        u32_field("cycle_counts").icon("mdi:battery-sync"),
        u32_field("full_capacity").unit("mAh"),
        i8_field("temp1")
            .device_class("temperature")
            .unit("°C")
            .precision(1),
        i8_field("temp2")
            .device_class("temperature")
            .unit("°C")
            .precision(1),
        i8_field("temp3")
            .device_class("temperature")
            .unit("°C")
            .precision(1),
        i8_field("temp4")
            .device_class("temperature")
            .unit("°C")
            .precision(1),
        i8_field("temp5"), /* always 0 */
        i8_field("temp6"), /* always 0 */
        u16_field("cell_num"),
        u16_field("designed_capacity")
            .unit("Ah")
            .multiplier(0.1)
            .precision(1),
        u16_field("cell_balance_status").flags(CELL_BALANCE_FLAGS),
    ]
}

static BASIC_LAYOUT: LazyLock<Layout> = LazyLock::new(|| Layout::new(basic_fields()));

static INFO_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    let mut fields = basic_fields();
    fields.extend(voltage_stat_specs());
    Layout::new(fields)
});

static EXTRA_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        string_field("model", 24),
        string_field("firmware_version", 6),
        string_field("serial", 16),
    ])
});

pub struct Eg4LLv2;

#[async_trait]
impl Bms for Eg4LLv2 {
    fn info_layout(&self) -> &'static Layout {
        &INFO_LAYOUT
    }

    fn default_protocol(&self, device_type: DeviceType) -> Protocol {
        match device_type {
            DeviceType::Tcp => Protocol::ModbusTcp,
            _ => Protocol::ModbusRtu,
        }
    }

    async fn read_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error> {
        let data = read_with_timeout(
            reader,
            timeout,
            id,
            BASIC_INFO_ADDRESS,
            BASIC_INFO_REGISTER_COUNT,
        )
        .await?;
        let mut record = BASIC_LAYOUT.decode(&data, Endianness::Big)?;

        /* full_capacity arrives in mAs; 3 600 000 == 100 Ah. */
        if let Some(cap) = record.get_u64("full_capacity") {
            record.set("full_capacity", RawValue::Uint(cap / 3600));
        }
        append_voltage_stats(&mut record, "cell_%d_voltage");
        Ok(record)
    }

    async fn read_extra_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error> {
        let data = read_with_timeout(
            reader,
            timeout,
            id,
            EXTRA_INFO_ADDRESS,
            EXTRA_INFO_REGISTER_COUNT,
        )
        .await?;
        EXTRA_LAYOUT.decode(&data, Endianness::Big).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Value;
    use crate::modbus::reader_for;
    use crate::transport::{DeviceType, Port};
    use std::sync::Arc;

    /* Response captured from a real EG4-LLv2 pack (ID #2). */
    const BASIC_RESPONSE: &str = "02034e14f600780d1a0d190d1b0d1b0d1a0d1b0d1a0d1b0d1a0d1b0d1a0d1a0d1a0d1b0d1a0d1a0019001b0018006100640064006100010000000000000000000b15752a00181818180000001003e800004e71";
    const EXTRA_RESPONSE: &str = "02032e4c46502d35312e325631303041682d56312e3000000000005a3032543034323032322d31302d32360000000000004818";

    fn reader_with(hex_data: &str) -> Box<dyn crate::modbus::RegisterReader> {
        let port = Arc::new(Port::test(hex::decode(hex_data).unwrap(), DeviceType::Test));
        reader_for(port, Protocol::ModbusRtu, "").unwrap()
    }

    #[tokio::test]
    async fn read_info_sample_frame() {
        let reader = reader_with(BASIC_RESPONSE);
        let info = Eg4LLv2
            .read_info(reader.as_ref(), 2, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(info.get_u64("battery_voltage"), Some(5366));
        assert_eq!(info.get_i64("current"), Some(120));
        assert_eq!(info.get_u64("cycle_counts"), Some(11));
        /* 360 000 000 mAs / 3600 == 100 Ah */
        assert_eq!(info.get_u64("full_capacity"), Some(100000));
        assert_eq!(info.get_u64("soc"), Some(97));
        assert_eq!(info.get_u64("soh"), Some(100));
        assert_eq!(info.get_u64("cell_num"), Some(16));
        assert_eq!(info.get_u64("designed_capacity"), Some(1000));
        assert_eq!(info.get_u64("max_cell_voltage"), Some(3355));
        assert_eq!(info.get_u64("min_cell_voltage"), Some(3353));
        assert_eq!(info.get_u64("mean_cell_voltage"), Some(3354));
        assert_eq!(info.get_u64("median_cell_voltage"), Some(3354));

        let fields = info.fields();
        let voltage = fields
            .iter()
            .find(|f| f.info.name == "battery_voltage")
            .unwrap();
        assert_eq!(voltage.value, Value::Float(53.66));
        assert_eq!(voltage.info.unit, "V");
        let cell1 = fields
            .iter()
            .find(|f| f.info.name == "cell_1_voltage")
            .unwrap();
        assert_eq!(cell1.value, Value::Float(3.354));
        let status = fields.iter().find(|f| f.info.name == "status").unwrap();
        assert_eq!(status.value, Value::Text("inactive/charging".into()));
    }

    #[tokio::test]
    async fn read_extra_info_sample_frame() {
        let reader = reader_with(EXTRA_RESPONSE);
        let extra = Eg4LLv2
            .read_extra_info(reader.as_ref(), 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            extra.get("model"),
            Some(&RawValue::Text("LFP-51.2V100Ah-V1.0".into()))
        );
        assert_eq!(
            extra.get("firmware_version"),
            Some(&RawValue::Text("Z02T04".into()))
        );
        assert_eq!(extra.get("serial"), Some(&RawValue::Text("2022-10-26".into())));
    }

    #[test]
    fn default_protocols() {
        assert_eq!(
            Eg4LLv2.default_protocol(DeviceType::Serial),
            Protocol::ModbusRtu
        );
        assert_eq!(Eg4LLv2.default_protocol(DeviceType::Tcp), Protocol::ModbusTcp);
    }

    #[test]
    fn info_schema_includes_derived_stats() {
        let names: Vec<String> = Eg4LLv2
            .info_layout()
            .field_infos()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert!(names.contains(&"cell_16_voltage".to_string()));
        assert!(names.contains(&"median_cell_voltage".to_string()));
        /* 24 basic fields with the cell array expanded to 16, plus the
         * four derived statistics. */
        assert_eq!(names.len(), 24 + 15 + 4);
    }
}
