/* Lifepower4 BMS driver. Speaks the LFP4 ASCII frame rather than
 * Modbus: command 0x42 returns the analog values block, 0x44 the alarm
 * block. Field map from the vendor's communication protocol PDF. */

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::bms::{Bms, read_with_timeout};
use crate::error::Error;
use crate::fields::{
    Endianness, Layout, Record, Scalar, array_field, i16_field, u8_field, u16_field, u32_field,
};
use crate::modbus::{Protocol, RegisterReader};
use crate::transport::DeviceType;

const CMD_GET_ANALOG_VALUE: u8 = 0x42;
const CMD_GET_ALARM_INFO: u8 = 0x44;

static DATA_FLAGS: &[&str] = &[
    "0x80",
    "0x40",
    "0x20",
    "0x10",
    "0x08",
    "0x04",
    "no unread alarms",
    "unread alarms",
];

static LIMIT_ALARM_FLAGS: &[&str] = &[
    "0x80",
    "0x40",
    "0x20",
    "0x10",
    "0x08",
    "0x04",
    "upper limit alarm",
    "lower limit alarm",
];

static ANALOG_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        u8_field("alarm_flag").flags(DATA_FLAGS),
        u8_field("pack_group").skip(),
        /* 16 or 8; packs reporting 8 cells use a different layout. */
        u8_field("number_of_cells").skip(),
        array_field("cell_%d_voltage", Scalar::U16, 16)
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001),
        u8_field("temp_count").skip(), /* always 4 */
        array_field("cell_temp_%d", Scalar::U16, 4)
            .device_class("temperature")
            .unit("K")
            .multiplier(0.1),
        u16_field("environment_temp")
            .device_class("temperature")
            .unit("K")
            .multiplier(0.1),
        u16_field("mosfet_temp")
            .device_class("temperature")
            .unit("K")
            .multiplier(0.1),
        i16_field("pack_current")
            .device_class("current")
            .unit("A")
            .multiplier(0.01),
        i16_field("pack_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.01),
        u16_field("remaining_capacity").unit("Ah").multiplier(0.01),
        u16_field("full_capacity").unit("Ah").multiplier(0.01),
        u16_field("cycle_counts").icon("mdi:battery-sync"),
        u8_field("user_defined"),
        u16_field("soc").device_class("battery").unit("%"),
        u16_field("soh").unit("%"),
        u16_field("max_cell_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001),
        u16_field("min_cell_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001),
        u16_field("diff_cell_voltage")
            .device_class("voltage")
            .unit("V")
            .multiplier(0.001),
        u16_field("max_cell_temp")
            .device_class("temperature")
            .unit("K")
            .multiplier(0.1),
        u16_field("min_cell_temp")
            .device_class("temperature")
            .unit("K")
            .multiplier(0.1),
        u32_field("cumulative_charging_capacity")
            .device_class("current")
            .unit("A")
            .multiplier(0.01),
        u32_field("cumulative_discharge_capacity")
            .device_class("current")
            .unit("A")
            .multiplier(0.01),
        u32_field("cumulative_charging_power")
            .device_class("power")
            .unit("kW")
            .multiplier(0.001),
        u32_field("cumulative_discharge_power")
            .device_class("power")
            .unit("kW")
            .multiplier(0.001),
        u32_field("cumulative_charging_time").unit("h"),
        u32_field("cumulative_discharge_time").unit("h"),
        u16_field("cumulative_charging_times").unit("h"),
        u16_field("cumulative_discharge_times").unit("h"),
    ])
});

static BALANCE_EVENT_FLAGS: &[&str] = &[
    "0x80",
    "discharge MOS fault alarm",
    "charge MOS fault alarm",
    "cell voltage difference alarm",
    "0x08",
    "0x04",
    "0x02",
    "balance module",
];

static VOLTAGE_EVENT_FLAGS: &[&str] = &[
    "pack UV protection",
    "pack UV alarm",
    "pack OV protection",
    "pack OV alarm",
    "cell UV protection",
    "cell UV alarm",
    "cell OV protection",
    "cell OV alarm",
];

static TEMP_EVENT_FLAGS: &[&str] = &[
    "0x8000",
    "0x4000",
    "fire alarm event",
    "MOSFET high temperature protection",
    "environment low temperature protection",
    "environment low temperature alarm",
    "environment high temperature protection",
    "environment high temperature alarm",
    "discharge low temperature protection",
    "discharge low temperature alarm",
    "discharge high temperature protection",
    "discharge high temperature alarm",
    "charge low temperature protection",
    "charge low temperature alarm",
    "charge high temperature protection",
    "charge high temperature alarm",
];

static CURRENT_EVENT_FLAGS: &[&str] = &[
    "output SC lockout",
    "discharge level 2 OC lockout",
    "output SC protection",
    "discharge level 2 OC protection",
    "discharge OC protection",
    "discharge OC alarm",
    "charge OC protection",
    "charge OC alarm",
];

static REMAINING_CAPACITY_FLAGS: &[&str] =
    &["0x80", "0x40", "0x20", "0x10", "0x08", "0x04", "0x02", "SOC low alarm"];

static FET_STATUS_FLAGS: &[&str] = &[
    "0x80",
    "0x40",
    "0x20",
    "0x10",
    "heater",
    "charge current limiter",
    "charge MOS",
    "discharge MOS",
];

static SYSTEM_STATUS_FLAGS: &[&str] = &[
    "0x80",
    "0x40",
    "0x20",
    "0x10",
    "standby",
    "0x04",
    "charging",
    "discharging",
];

static BALANCE_STATUS_FLAGS: &[&str] = &[
    "0x80000000",
    "0x40000000",
    "0x20000000",
    "0x10000000",
    "0x08000000",
    "0x04000000",
    "0x02000000",
    "0x01000000",
    "0x00800000",
    "0x00400000",
    "0x00200000",
    "0x00100000",
    "0x00080000",
    "0x00040000",
    "0x00020000",
    "0x00010000",
    "cell 16 equalization on",
    "cell 15 equalization on",
    "cell 14 equalization on",
    "cell 13 equalization on",
    "cell 12 equalization on",
    "cell 11 equalization on",
    "cell 10 equalization on",
    "cell 9 equalization on",
    "cell 8 equalization on",
    "cell 7 equalization on",
    "cell 6 equalization on",
    "cell 5 equalization on",
    "cell 4 equalization on",
    "cell 3 equalization on",
    "cell 2 equalization on",
    "cell 1 equalization on",
];

static ALARM_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        u8_field("alarm_flag").flags(DATA_FLAGS),
        u8_field("pack_group").skip(),
        u8_field("number_of_cells").skip(),
        array_field("cell_%d_alarm_status", Scalar::U8, 16).flags(LIMIT_ALARM_FLAGS),
        u8_field("temp_count").skip(),
        array_field("cell_temp_%d", Scalar::U8, 4).flags(LIMIT_ALARM_FLAGS),
        u8_field("environment_temp_alarm_status").flags(LIMIT_ALARM_FLAGS),
        u8_field("mosfet_temp_alarm_status").flags(LIMIT_ALARM_FLAGS),
        u8_field("pack_current_alarm_status").flags(LIMIT_ALARM_FLAGS),
        u8_field("pack_voltage_alarm_status").flags(LIMIT_ALARM_FLAGS),
        u8_field("user_defined"),
        u8_field("balance_event_code").flags(BALANCE_EVENT_FLAGS),
        u8_field("voltage_event_code").flags(VOLTAGE_EVENT_FLAGS),
        u16_field("temperature_event_code").flags(TEMP_EVENT_FLAGS),
        u8_field("current_event_code").flags(CURRENT_EVENT_FLAGS),
        u8_field("remaining_capacity_alarm").flags(REMAINING_CAPACITY_FLAGS),
        u8_field("fet_status_code").flags(FET_STATUS_FLAGS),
        u8_field("system_status_code").flags(SYSTEM_STATUS_FLAGS),
        u32_field("balance_status_code").flags(BALANCE_STATUS_FLAGS),
        u8_field("reserved").skip(),
    ])
});

pub struct Lifepower4;

#[async_trait]
impl Bms for Lifepower4 {
    fn info_layout(&self) -> &'static Layout {
        &ANALOG_LAYOUT
    }

    fn default_protocol(&self, _device_type: DeviceType) -> Protocol {
        Protocol::Lifepower4
    }

    async fn read_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error> {
        let data = read_with_timeout(reader, timeout, id, 0, CMD_GET_ANALOG_VALUE).await?;
        /* The frame reports its own length; decode the declared prefix. */
        ANALOG_LAYOUT
            .decode_prefix(&data, Endianness::Big)
            .map_err(Error::from)
    }

    async fn read_extra_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error> {
        let data = read_with_timeout(reader, timeout, id, 0, CMD_GET_ALARM_INFO).await?;
        ALARM_LAYOUT
            .decode_prefix(&data, Endianness::Big)
            .map_err(Error::from)
    }
}
