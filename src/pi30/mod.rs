/* PI30 ASCII protocol for the EG4 6500/6000 class of off-grid
 * inverters. Commands go out with a CRC-16/CCITT-FALSE tail and a CR
 * terminator; responses are '('-prefixed, space-separated token lists
 * with the same CRC ahead of the terminator. */

use std::sync::LazyLock;
use std::time::Duration;

use crc::{CRC_16_IBM_3740, Crc};

use crate::error::Error;
use crate::fields::{
    Layout, Record, f32_field, i8_field, i16_field, i32_field, str_field, u8_field,
};
use crate::modbus::FrameError;
use crate::transport::Port;

const MAX_RESPONSE_LENGTH: usize = 4096;

const CRC16_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/* CRC with delimiter escaping: 0x28 ('('), 0x0D and 0x0A in either CRC
 * byte would be eaten by the device's framer, so those bytes are bumped
 * by one. */
pub fn crc(data: &[u8]) -> u16 {
    let mut crc = CRC16_CCITT_FALSE.checksum(data);
    if matches!(crc & 0xff, 0x28 | 0x0d | 0x0a) {
        crc += 1;
    }
    if matches!(crc >> 8, 0x28 | 0x0d | 0x0a) {
        crc += 256;
    }
    crc
}

pub async fn send_command(port: &Port, command: &str) -> Result<(), Error> {
    let mut b = Vec::with_capacity(command.len() + 3);
    b.extend_from_slice(command.as_bytes());
    let c = crc(command.as_bytes());
    b.push((c >> 8) as u8);
    b.push((c & 0xff) as u8);
    b.push(b'\r');
    port.write_all(&b).await?;
    Ok(())
}

/* Read one response line and return its space-separated tokens. */
pub async fn read_response(port: &Port) -> Result<Vec<String>, Error> {
    let mut b = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = port.read(&mut byte).await?;
        if n == 0 {
            return Err(crate::transport::TransportError::UnexpectedEof {
                got: b.len(),
                want: b.len() + 1,
            }
            .into());
        }
        b.push(byte[0]);
        if byte[0] == b'\r' {
            break;
        }
        if b.len() > MAX_RESPONSE_LENGTH {
            return Err(FrameError::OutOfBounds.into());
        }
    }

    if b[0] != b'(' {
        return Err(FrameError::BadSoi(b[0]).into());
    }
    /* A refusal can arrive with an arbitrary tail; report it before
     * bothering with the CRC. */
    if b.len() >= 4 && &b[1..4] == b"NAK" {
        return Err(Error::Nak);
    }
    if b.len() < 4 {
        return Err(FrameError::ShortResponse(b.len()).into());
    }

    let computed = crc(&b[..b.len() - 3]);
    let received = (b[b.len() - 3] as u16) << 8 | b[b.len() - 2] as u16;
    if received != computed {
        return Err(FrameError::Crc {
            got: received,
            want: computed,
        }
        .into());
    }

    let body = String::from_utf8_lossy(&b[1..b.len() - 3]).into_owned();
    Ok(body.split(' ').map(str::to_string).collect())
}

pub async fn run_command(port: &Port, command: &str) -> Result<Record, Error> {
    send_command(port, command).await?;
    let tokens = read_response(port).await?;
    let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    layout_for_command(command)
        .decode_tokens(&refs)
        .map_err(Error::from)
}

/* Run several commands back to back on one port, all bounded by a
 * single deadline. Each command gets its own result slot. */
pub async fn run_commands(
    port: &Port,
    commands: &[String],
    timeout: Duration,
) -> Vec<Result<Record, Error>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let result = if remaining.is_zero() {
            Err(Error::Timeout)
        } else {
            match tokio::time::timeout(remaining, run_command(port, command)).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout),
            }
        };
        results.push(result);
    }
    results
}

pub fn layout_for_command(command: &str) -> &'static Layout {
    match command {
        "Q1" => &Q1_LAYOUT,
        "QPIRI" => &QPIRI_LAYOUT,
        "QPIGS" => &QPIGS_LAYOUT,
        "QPIGS2" => &QPIGS2_LAYOUT,
        _ if command.len() > 4 && command.starts_with("QPGS") => &QPGS_LAYOUT,
        _ => &EMPTY_LAYOUT,
    }
}

/* A response that was read successfully but carries what looks like
 * invalid data. One of a pair of parallel inverters occasionally
 * reports all-zero grid figures in QPIGS; such a record is dropped by
 * the monitors. */
pub fn response_valid(command: &str, record: &Record) -> bool {
    if command != "QPIGS" {
        return true;
    }
    let nonzero = |name: &str| record.get_f64(name).is_some_and(|v| v != 0.0);
    (nonzero("grid_voltage") && nonzero("grid_frequency"))
        || (nonzero("ac_output_voltage") && nonzero("ac_output_frequency"))
}

static EMPTY_LAYOUT: LazyLock<Layout> =
    LazyLock::new(|| Layout::new(vec![str_field("response")]));

static Q1_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        i16_field("end_of_absorb_charging")
            .unit("s")
            .icon("mdi:clock-time-two-outline"),
        i16_field("end_of_float_charging")
            .unit("s")
            .icon("mdi:clock-time-two-outline"),
        i8_field("scc_flags").values(&[
            ("0", "Not communicating"),
            ("1", "Powered and communicating"),
        ]),
        str_field("unknown1").skip(),
        str_field("unknown2").skip(),
        i8_field("scc_pwm_temperature").unit("°C"),
        i8_field("inverter_temperature").unit("°C"),
        i8_field("battery_temperature").unit("°C"),
        i8_field("transformer_temperature").unit("°C"),
        i8_field("GPIO13"),
        i8_field("fan_lock_status").values(&[("0", "not locked"), ("1", "locked")]),
        str_field("unknown3").skip(),
        i8_field("fan_pwm_speed").unit("%"),
        i16_field("scc_charge_power").unit("W").icon("mdi:solar-power"),
        i8_field("parallel_warning"),
        f32_field("sync_frequency").unit("Hz"),
        i8_field("inverter_charge_status").values(&[
            ("10", "not charging"),
            ("11", "bulk stage"),
            ("12", "absorb"),
            ("13", "float"),
        ]),
        /* Remaining tokens in the response are ignored. */
    ])
});

static DEVICE_STATUS_FLAGS: &[&str] = &[
    "Add SBU priority version",
    "configuration changed",
    "SCC firmware updated",
    "Load on",
    "Battery voltage steady while charging",
    "Charging",
    "SCC charging",
    "AC charging",
];

static QPIGS_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        f32_field("grid_voltage").unit("V"),
        f32_field("grid_frequency").unit("Hz"),
        f32_field("ac_output_voltage").unit("V"),
        f32_field("ac_output_frequency").unit("Hz"),
        i16_field("ac_output_apparent_power").unit("VA"),
        i16_field("ac_output_active_power").unit("W"),
        i8_field("output_load_percentage").unit("%"),
        f32_field("bus_voltage").unit("V"),
        f32_field("battery_voltage").unit("V"),
        i16_field("battery_charging_current")
            .unit("A")
            .icon("mdi:current-dc"),
        i8_field("battery_capacity").unit("%"),
        i8_field("internal_heat_sink_temperature").unit("°C"),
        f32_field("pv1_input_voltage").unit("V"),
        f32_field("pv1_input_current").unit("A").icon("mdi:current-dc"),
        f32_field("battery_voltage_scc").unit("V"),
        i16_field("battery_discharge_current")
            .unit("A")
            .icon("mdi:current-dc"),
        u8_field("device_status").binary().flags(DEVICE_STATUS_FLAGS),
        f32_field("battery_voltage_offset").unit("mV"),
        i16_field("pv1_charging_power").unit("W"),
        i8_field("device_status_flags"),
        i8_field("solar_feed_to_grid").values(&[("0", "normal"), ("1", "solar feed the grid")]),
    ])
});

static QPIGS2_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        f32_field("pv2_input_current").unit("A").icon("mdi:current-dc"),
        f32_field("pv2_input_voltage").unit("V"),
        i16_field("pv2_charging_power").unit("W"),
    ])
});

static OUTPUT_MODE_VALUES: &[(&str, &str)] = &[
    ("0", "Single machine"),
    ("1", "Parallel output"),
    ("2", "Phase 1 of 3 phase output"),
    ("3", "Phase 2 of 3 phase output"),
    ("4", "Phase 3 of 3 phase output"),
    ("5", "Phase 1 of 2 phase output"),
    ("6", "Phase 2 of 2 phase output (120°)"),
    ("7", "Phase 2 of 2 phase output (180°)"),
];

static QPIRI_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        f32_field("grid_rating_voltage").unit("V"),
        f32_field("grid_rating_current").unit("A").icon("mdi:current-ac"),
        f32_field("ac_output_rating_voltage").unit("V"),
        f32_field("ac_output_rating_frequency").unit("Hz"),
        f32_field("ac_output_rating_current")
            .unit("A")
            .icon("mdi:current-ac"),
        i16_field("ac_output_rating_apparent_power").unit("VA"),
        i16_field("ac_output_rating_active_power").unit("W"),
        f32_field("battery_voltage").unit("V"),
        f32_field("battery_recharge_voltage").unit("V"),
        f32_field("battery_under_voltage").unit("V"),
        f32_field("battery_bulk_voltage").unit("V"),
        f32_field("battery_float_voltage").unit("V"),
        i8_field("battery_type").values(&[
            ("0", "AGM"),
            ("1", "Flooded"),
            ("2", "User"),
            ("3", "unknown"),
            ("4", "Pylontech"),
            ("5", "WECO"),
            ("6", "Soltaro"),
            ("7", "LIb-protocol compatible"),
            ("8", "3rd party lithium"),
        ]),
        i16_field("max_ac_charging_current")
            .unit("A")
            .icon("mdi:current-ac"),
        i16_field("max_charging_current").unit("A").icon("mdi:current-dc"),
        i8_field("input_voltage_range").values(&[("0", "Appliance"), ("1", "UPS")]),
        i8_field("output_source_priority").values(&[("0", "USB"), ("1", "SUB"), ("2", "SBU")]),
        i8_field("charger_source_priority").values(&[
            ("1", "Solar first"),
            ("2", "Solar + utility"),
            ("3", "Only solar"),
        ]),
        i8_field("parallel_max_num"),
        i8_field("machine_type").values(&[
            ("00", "grid tie"),
            ("01", "off-grid"),
            ("02", "hybrid"),
        ]),
        i8_field("topology").values(&[("0", "transformerless"), ("1", "transformer")]),
        i8_field("output_mode").values(OUTPUT_MODE_VALUES),
        f32_field("battery_redischarge_voltage").unit("V"),
        i8_field("pv_ok_condition").values(&[
            ("0", "one inverter connected to PV is enough"),
            ("1", "All inverters need to have PV for PV to be OK"),
        ]),
        i8_field("pv_power_balance").values(&[
            ("0", "PV input max current will be the max charged current"),
            ("1", "PV input max power will be the sum of the max charged power and loads power"),
        ]),
        i16_field("max_charging_time_at_cv").unit("m"),
        i8_field("operation_logic").values(&[
            ("0", "Automatic"),
            ("1", "On-line"),
            ("2", "ECO"),
        ]),
        i8_field("max_discharging_current").unit("A").icon("mdi:current-dc"),
    ])
});

static QPGS_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        i32_field("parallel_instance_number"),
        str_field("serial_number"),
        str_field("work_mode").values(&[
            ("P", "Power On"),
            ("S", "Standby"),
            ("L", "Line"),
            ("B", "Battery"),
            ("F", "Fault"),
            ("H", "Power Saving"),
            ("D", "Shutdown"),
        ]),
        i16_field("fault_code"),
        f32_field("grid_voltage").unit("V"),
        f32_field("grid_frequency").unit("Hz"),
        f32_field("ac_output_voltage").unit("V"),
        f32_field("ac_output_frequency").unit("Hz"),
        i16_field("ac_output_apparent_power").unit("VA"),
        i16_field("ac_output_active_power").unit("W"),
        i8_field("load_percentage").unit("%"),
        f32_field("battery_voltage").unit("V"),
        i16_field("battery_charging_current")
            .unit("A")
            .icon("mdi:current-dc"),
        i8_field("battery_capacity").unit("%"),
        f32_field("pv1_input_voltage").unit("V"),
        i16_field("total_charging_current").unit("A").icon("mdi:current-dc"),
        i16_field("total_ac_output_apparent_power").unit("VA"),
        i16_field("total_output_active_power").unit("W"),
        i8_field("total_ac_output_percentage").unit("%"),
        str_field("inverter_status").bitgroups(
            "SCC OK|AC charging|SCC charging|Battery over voltage,Battery under voltage|Line loss|Load on|Configuration changed",
        ),
        i8_field("output_mode").values(OUTPUT_MODE_VALUES),
        i8_field("charger_source_priority").values(&[
            ("0", "Utility first"),
            ("1", "Solar first"),
            ("2", "Solar + utility"),
            ("3", "Solar only"),
        ]),
        i16_field("max_charger_current").unit("A").icon("mdi:current-dc"),
        i16_field("max_charging_range").unit("A").icon("mdi:current-dc"),
        i16_field("max_ac_charger_current").unit("A").icon("mdi:current-ac"),
        f32_field("pv1_input_current").unit("A").icon("mdi:current-dc"),
        i16_field("battery_discharge_current")
            .unit("A")
            .icon("mdi:current-dc"),
        f32_field("pv2_input_voltage").unit("V"),
        i8_field("pv2_input_current").unit("A").icon("mdi:current-dc"),
    ])
});
