/* PACE BMS driver. Modbus, 37 holding registers of live data at
 * address 0 and 30 registers of identity strings at address 150.
 *
 * Register map from "PACE-BMS-Modbus-Protocol-for-RS485-V1.3". One
 * firmware revision serves the identity block at address 120 instead;
 * the address documented in the vendor PDF is 150 and that is what this
 * driver reads. */

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::bms::{Bms, append_voltage_stats, read_with_timeout, voltage_stat_specs};
use crate::error::Error;
use crate::fields::{
    Endianness, Layout, Record, Scalar, array_field, i16_field, string_field, u16_field,
};
use crate::modbus::{Protocol, RegisterReader};
use crate::transport::DeviceType;

const BASIC_INFO_ADDRESS: u16 = 0;
const BASIC_INFO_REGISTER_COUNT: u8 = 37;

const EXTRA_INFO_ADDRESS: u16 = 150;
const EXTRA_INFO_REGISTER_COUNT: u8 = 30;

static WARNING_FLAGS: &[&str] = &[
    "SOC low",
    "MOSFET high temp",
    "environment low temp",
    "discharging low temp",
    "charging low temp",
    "discharging high temp",
    "discharging low temp",
    "0x80",
    "0x40",
    "discharging overcurrent",
    "charging overcurrent",
    "pack low voltage",
    "pack overvoltage",
    "cell low voltage",
    "cell overvoltage",
];

static PROTECTION_FLAGS: &[&str] = &[
    "0x8000",
    "environment low temp",
    "environment high temp",
    "MOSFET high temp",
    "discharging low temp",
    "charging low temp",
    "discharging high temp",
    "charging high temp",
    "charger overvoltage",
    "short circuit",
    "discharging over current",
    "charging over current",
    "pack low voltage",
    "pack overvoltage",
    "cell low voltage",
    "cell overvoltage",
];

static STATUS_FLAGS: &[&str] = &[
    "heater",
    "charger inversed",
    "0x2000",
    "charging limiter",
    "discharging MOSFET",
    "charging MOSFET",
    "discharge",
    "charge",
    "0x0080",
    "0x0040",
    "front end sampling comms fault",
    "battery cell fault",
    "0x0008",
    "temp sensor fault",
    "discharging MOSFET fault",
    "charging MOSFET fault",
];

fn basic_fields() -> Vec<crate::fields::FieldSpec> {
    vec![
        i16_field("current")
            .device_class("current")
            .unit("A")
            .multiplier(0.01)
            .precision(2)
            .icon("mdi:current-dc"),
        u16_field("battery_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.01)
            .precision(2),
        u16_field("soc").device_class("battery").unit("%"),
        u16_field("soh").unit("%"),
        u16_field("remaining_capacity")
            .unit("Ah")
            .multiplier(0.01)
            .precision(2),
        u16_field("full_capacity")
            .unit("Ah")
            .multiplier(0.01)
            .precision(2),
        u16_field("design_capacity")
            .unit("Ah")
            .multiplier(0.01)
            .precision(2),
        u16_field("cycle_counts").icon("mdi:battery-sync"),
        i16_field("reserved1").skip(),
        u16_field("warning_flag").flags(WARNING_FLAGS),
        u16_field("protection_flag").flags(PROTECTION_FLAGS),
        u16_field("status_flag").flags(STATUS_FLAGS),
        u16_field("balance_status"),
        i16_field("reserved2").skip(),
        i16_field("reserved3").skip(),
        array_field("cell_%d_voltage", Scalar::U16, 16)
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001)
            .precision(3),
        array_field("cell_temp_%d", Scalar::I16, 4)
            .device_class("temperature")
            .unit("°C")
            .multiplier(0.1)
            .precision(1),
        /* MOSFET and environment temperatures read 0 on some packs. */
        i16_field("mosfet_temp")
            .device_class("temperature")
            .unit("°C")
            .multiplier(0.1)
            .precision(1),
        i16_field("environment_temp")
            .device_class("temperature")
            .unit("°C")
            .multiplier(0.1)
            .precision(1),
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
        string_field("firmware_version", 20),
        string_field("model_sn", 20),
        string_field("pack_sn", 20),
    ])
});

pub struct Pace;

#[async_trait]
impl Bms for Pace {
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
    use crate::fields::RawValue;

    struct CannedReader(Vec<u8>);

    #[async_trait]
    impl RegisterReader for CannedReader {
        async fn read_holding(&self, _: u8, _: u16, _: u8) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }
        async fn read_input(&self, _: u8, _: u16, _: u8) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }
    }

    fn basic_payload() -> Vec<u8> {
        let mut b = Vec::new();
        let head: [u16; 15] = [
            1000, 5120, 80, 95, 5000, 6000, 6000, 100, 0, 0x01, 0x02, 0x04, 0x08, 0, 0,
        ];
        for v in head {
            b.extend_from_slice(&v.to_be_bytes());
        }
        for i in 0..16u16 {
            b.extend_from_slice(&(3200 + i).to_be_bytes());
        }
        for t in [250u16, 260, 270, 280] {
            b.extend_from_slice(&t.to_be_bytes());
        }
        b.extend_from_slice(&300u16.to_be_bytes());
        b.extend_from_slice(&200u16.to_be_bytes());
        b
    }

    #[tokio::test]
    async fn read_info_decodes_and_derives() {
        let payload = basic_payload();
        assert_eq!(payload.len(), BASIC_INFO_REGISTER_COUNT as usize * 2);

        let reader = CannedReader(payload);
        let info = Pace
            .read_info(&reader, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(info.get_i64("current"), Some(1000));
        assert_eq!(info.get_u64("battery_voltage"), Some(5120));
        assert_eq!(info.get_u64("soc"), Some(80));
        assert_eq!(info.get_u64("cycle_counts"), Some(100));
        assert_eq!(info.get_u64("balance_status"), Some(8));
        assert_eq!(info.get_u64("max_cell_voltage"), Some(3215));
        assert_eq!(info.get_u64("min_cell_voltage"), Some(3200));
        assert_eq!(info.get_u64("mean_cell_voltage"), Some(3207));
        assert_eq!(info.get_u64("median_cell_voltage"), Some(3207));
    }

    #[tokio::test]
    async fn short_payload_is_rejected() {
        let mut payload = basic_payload();
        payload.truncate(payload.len() - 2);
        let reader = CannedReader(payload);
        let err = Pace
            .read_info(&reader, 1, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unexpected data length"));
    }

    #[tokio::test]
    async fn read_extra_info_strings() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"PACE-FW-2.5\0\0\0\0\0\0\0\0\0");
        payload.extend_from_slice(b"P16S100A\0\0\0\0\0\0\0\0\0\0\0\0");
        payload.extend_from_slice(b"PK2301000042\0\0\0\0\0\0\0\0");
        assert_eq!(payload.len(), EXTRA_INFO_REGISTER_COUNT as usize * 2);

        let reader = CannedReader(payload);
        let extra = Pace
            .read_extra_info(&reader, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            extra.get("firmware_version"),
            Some(&RawValue::Text("PACE-FW-2.5".into()))
        );
        assert_eq!(extra.get("model_sn"), Some(&RawValue::Text("P16S100A".into())));
        assert_eq!(
            extra.get("pack_sn"),
            Some(&RawValue::Text("PK2301000042".into()))
        );
    }
}
