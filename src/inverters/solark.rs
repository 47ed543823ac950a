/* Solark hybrid inverter driver. Real-time running data is spread over
 * five non-contiguous holding-register blocks (function 0x03); the
 * intrinsic-attribute table carries the ASCII serial number in
 * registers 3-7. */

use std::sync::LazyLock;

use crate::error::Error;
use crate::fields::{Endianness, Layout, Record, i16_field, u16_field};
use crate::inverters::read_block;
use crate::modbus::RegisterReader;

static FAULT_WORD1_FLAGS: &[&str] = &[
    "GFDI_Relay_Failure",
    "Grid_Mode_changed",
    "DC_OverCurr_Fault",
    "SW_AC_OverCurr_Fault",
    "GFCI_Failure",
    "HW_Ac_OverCurr_Fault",
    "Tz_Dc_OverCurr_Fault",
    "Tz_EmergStop_Fault",
    "Tz_GFCI_OC_Fault",
    "DC_Insulation_ISO_Fault",
    "BusUnbalance_Fault",
    "Parallel_Fault",
    "AC_Overload_Fault",
    "AC_WU_OverVolt_Fault",
    "AC_VW_OverVolt_Fault",
    "AC_UV_OverVolt_Fault",
    "Parallel_Aux_Fault",
    "AC_OverFreq_Fault",
    "AC_UnderFreq_Fault",
    "DC_VoltHigh_Fault",
    "DC_VoltLow_Fault",
    "AC_U_GridCurr_High_Fault",
    "Button_Manual_OFF",
    "AC_B_InductCurr_High_Fault",
    "Arc_Fault",
    "Heatsink_HighTemp_Fault",
];

static REALTIME_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        i16_field("Day Active Power").at(60).unit("kWh").multiplier(0.1),
        u16_field("Total Active Power Low").at(63).unit("kWh").multiplier(0.1),
        u16_field("Total Active Power High").at(64).unit("kWh").multiplier(0.1),
        u16_field("Grid Frequency").at(79).unit("Hz").multiplier(0.01),
        i16_field("DC/DC Transformer Temperature").at(90).unit("°C").multiplier(0.1),
        i16_field("IGBT Heat Sink Temperature").at(91).unit("°C").multiplier(0.1),
        u16_field("Fault Information Word 1").at(103).flags(FAULT_WORD1_FLAGS),
        u16_field("Fault Information Word 2").at(104),
        u16_field("Fault Information Word 3").at(105),
        u16_field("Fault Information Word 4").at(106),
        u16_field("Corrected Battery Capacity").at(107).unit("AH"),
        u16_field("Daily PV Power").at(108).unit("kWh").multiplier(0.1),
        u16_field("DC Voltage 1").at(109).unit("V").multiplier(0.1),
        u16_field("DC Current 1").at(110).unit("A").multiplier(0.1),
        u16_field("DC Voltage 2").at(111).unit("V").multiplier(0.1),
        u16_field("DC Current 2").at(112).unit("A").multiplier(0.1),
        u16_field("Grid Side Voltage L1-N").at(150).unit("V").multiplier(0.1),
        u16_field("Grid Side Voltage L2-N").at(151).unit("V").multiplier(0.1),
        u16_field("Grid Side Voltage L1-L2").at(152).unit("V").multiplier(0.1),
        u16_field("Voltage at Middle Side of Relay L1-L2").at(153).unit("V").multiplier(0.1),
        u16_field("Inverter Output Voltage L1-N").at(154).unit("V").multiplier(0.1),
        u16_field("Inverter Output Voltage L2-N").at(155).unit("V").multiplier(0.1),
        u16_field("Inverter Output Voltage L1-L2").at(156).unit("V").multiplier(0.1),
        u16_field("Load Voltage L1").at(157).unit("V").multiplier(0.1),
        u16_field("Load Voltage L2").at(158).unit("V").multiplier(0.1),
        i16_field("Grid Side Current L1").at(160).unit("A").multiplier(0.01),
        i16_field("Grid Side Current L2").at(161).unit("A").multiplier(0.01),
        i16_field("Grid External Limiter Current L1").at(162).unit("A").multiplier(0.01),
        i16_field("Grid External Limiter Current L2").at(163).unit("A").multiplier(0.01),
        i16_field("Inverter Output Current L1").at(164).unit("A").multiplier(0.01),
        i16_field("Inverter Output Current L2").at(165).unit("A").multiplier(0.01),
        i16_field("Gen or AC Coupled Power Input").at(166).unit("W"),
        i16_field("Grid Side L1 Power").at(167).unit("W"),
        i16_field("Grid Side L2 Power").at(168).unit("W"),
        i16_field("Total Power of Grid Side L1-L2").at(169).unit("W"),
        i16_field("Grid External Limiter 1 Power (CT1)").at(170).unit("W"),
        i16_field("Grid External Limiter 2 Power (CT2)").at(171).unit("W"),
        i16_field("Grid External Total Power").at(172).unit("W"),
        i16_field("Inverter Outputs L1 Power").at(173).unit("W"),
        i16_field("Inverter Outputs L2 Power").at(174).unit("W"),
        i16_field("Inverter Output Total Power").at(175).unit("W"),
        i16_field("Load Side L1 Power").at(176).unit("W"),
        i16_field("Load Side L2 Power").at(177).unit("W"),
        i16_field("Load Side Total Power").at(178).unit("W"),
        u16_field("Load Current L1").at(179).unit("A").multiplier(0.01),
        u16_field("Load Current L2").at(180).unit("A").multiplier(0.01),
        u16_field("Gen Port Voltage L1-L2").at(181).unit("V"),
        i16_field("Battery Temperature").at(182).unit("°C").multiplier(0.1),
        u16_field("Battery Voltage").at(183).unit("V").multiplier(0.01),
        u16_field("Battery Capacity SOC").at(184).unit("%"),
        u16_field("PV1 Input Power").at(186).unit("W"),
        u16_field("PV2 Input Power").at(187).unit("W"),
        i16_field("Battery Output Power").at(190).unit("W"),
        i16_field("Battery Output Current").at(191).unit("A").multiplier(0.01),
        u16_field("Load Frequency").at(192).unit("Hz").multiplier(0.01),
        u16_field("Inverter Output Frequency").at(193).unit("Hz").multiplier(0.01),
        u16_field("Grid Side Relay Status")
            .at(194)
            .values(&[("1", "Open (Disconnect)"), ("2", "Closed")]),
        u16_field("Generator Side Relay Status").at(195).values(&[
            ("0", "Open"),
            ("1", "Closed"),
            ("2", "No Connection"),
            ("3", "Closed when Generator is on"),
        ]),
        u16_field("Generator Relay Frequency").at(196).unit("Hz").multiplier(0.01),
    ])
});

/* The blocks chosen to minimise request count while skipping the gaps
 * in the vendor register table. */
const BLOCKS: &[(u16, u8)] = &[(60, 5), (79, 13), (103, 10), (150, 35), (186, 11)];

pub async fn read_realtime_data(reader: &dyn RegisterReader, id: u8) -> Result<Record, Error> {
    let mut data = Vec::with_capacity(BLOCKS.len());
    for (start, count) in BLOCKS {
        data.push(read_block(reader, id, *start, *count, false).await?);
    }
    let blocks: Vec<(u16, &[u8])> = BLOCKS
        .iter()
        .zip(data.iter())
        .map(|((start, _), bytes)| (*start, bytes.as_slice()))
        .collect();
    REALTIME_LAYOUT
        .decode_blocks(&blocks, Endianness::Big)
        .map_err(Error::from)
}

/* Registers 3-7 carry the ten-character ASCII serial number, two
 * characters per register. */
pub async fn read_serial_number(reader: &dyn RegisterReader, id: u8) -> Result<String, Error> {
    let data = read_block(reader, id, 3, 5, false).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}
