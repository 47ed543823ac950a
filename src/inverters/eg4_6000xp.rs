/* EG4-6000XP off-grid inverter driver. Same command shape as the
 * 18KPV, but this family packs its registers little-endian, so it must
 * not share the generic big-endian decode path. Input registers are
 * read in five 40-register blocks. Register table from the vendor's
 * "6kXP Modbus" document. */

use std::sync::LazyLock;

use crate::error::Error;
use crate::fields::{Endianness, Layout, Record, i16_field, u16_field, u32_field};
use crate::inverters::read_block;
use crate::modbus::RegisterReader;

static STATE_VALUES: &[(&str, &str)] = &[
    ("0", "Standby"),
    ("1", "Fault"),
    ("2", "Programming"),
    ("4", "PV connected to grid"),
    ("8", "PV charging"),
    ("12", "PV charging connected to the grid"),
    ("16", "The battery connect to the grid"),
    ("20", "(PV+ battery) connected to the grid"),
    ("32", "AC charging"),
    ("40", "(PV+AC) charging"),
    ("64", "The battery is off-grid"),
    ("96", "Off-grid + battery charging"),
    ("128", "PV off-grid"),
    ("192", "(PV+ battery) off-grid"),
    ("136", "PV charging + off-grid"),
];

static REALTIME_LAYOUT: LazyLock<Layout> = LazyLock::new(|| {
    Layout::new(vec![
        u16_field("State").at(0).values(STATE_VALUES),
        u16_field("PV1 Voltage").at(1).unit("V").multiplier(0.1),
        u16_field("PV2 Voltage").at(2).unit("V").multiplier(0.1),
        u16_field("PV3 Voltage").at(3).unit("V").multiplier(0.1),
        u16_field("Battery Voltage").at(4).unit("V").multiplier(0.1),
        u16_field("Battery Capacity").at(5).unit("%"),
        u16_field("State of Health").at(6).unit("%"),
        u16_field("PV1 Power").at(7).unit("W"),
        u16_field("PV2 Power").at(8).unit("W"),
        u16_field("PV3 Power").at(9).unit("W"),
        u16_field("Charging Power").at(10).unit("W"),
        u16_field("Discharge Power").at(11).unit("W"),
        u16_field("R-phase Utility Grid Voltage").at(12).unit("V").multiplier(0.1),
        u16_field("S-phase Utility Grid Voltage").at(13).unit("V").multiplier(0.1),
        u16_field("T-phase Utility Grid Voltage").at(14).unit("V").multiplier(0.1),
        u16_field("Utility Grid Frequency").at(15).unit("Hz").multiplier(0.01),
        u16_field("On-grid Inverter Power").at(16).unit("W"),
        u16_field("AC Charging Rectification Power").at(17).unit("W"),
        u16_field("Inverter RMS Current Output").at(18).unit("A").multiplier(0.01),
        u16_field("Power Factor").at(19).multiplier(0.001),
        u16_field("R-phase Off-grid Output Voltage").at(20).unit("V").multiplier(0.1),
        u16_field("S-phase Off-grid Output Voltage").at(21).unit("V").multiplier(0.1),
        u16_field("T-phase Off-grid Output Voltage").at(22).unit("V").multiplier(0.1),
        u16_field("Off-grid Output Frequency").at(23).unit("Hz").multiplier(0.01),
        u16_field("Off-grid Inverter Power").at(24).unit("W"),
        u16_field("Off-grid Apparent Power").at(25).unit("VA"),
        u16_field("User On-grid Power").at(26).unit("W"),
        u16_field("Grid Power Capacity").at(27).unit("W"),
        u16_field("PV1 Power Generation Today").at(28).unit("kWh").multiplier(0.1),
        u16_field("PV2 Power Generation Today").at(29).unit("kWh").multiplier(0.1),
        u16_field("PV3 Power Generation Today").at(30).unit("kWh").multiplier(0.1),
        u16_field("Today's On-grid Inverter Output Energy").at(31).unit("kWh").multiplier(0.1),
        u16_field("Today's AC Charging Rectifier Energy").at(32).unit("kWh").multiplier(0.1),
        u16_field("Energy Charge Today").at(33).unit("kWh").multiplier(0.1),
        u16_field("Energy Discharge Today").at(34).unit("kWh").multiplier(0.1),
        u16_field("Today's Off-grid Output Energy").at(35).unit("kWh").multiplier(0.1),
        u16_field("Today's Export to Grid Energy").at(36).unit("kWh").multiplier(0.1),
        u16_field("Electricity Supplied to User from the Grid Today").at(37).unit("kWh").multiplier(0.1),
        u16_field("Voltage of Bus 1").at(38).unit("V").multiplier(0.1),
        u16_field("Voltage of Bus 2").at(39).unit("V").multiplier(0.1),
        u32_field("PV1 Cumulative Power Generation").at(40).unit("kWh").multiplier(0.1),
        u32_field("PV2 Cumulative Power Generation").at(42).unit("kWh").multiplier(0.1),
        u32_field("PV3 Cumulative Power Generation").at(44).unit("kWh").multiplier(0.1),
        u32_field("Inverter Output Accumulated Power").at(46).unit("kWh").multiplier(0.1),
        u32_field("AC Charging Accumulates Rectified Power").at(48).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Charge Energy").at(50).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Discharge Charge Energy").at(52).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Inverter Off-grid Output Energy").at(54).unit("kWh").multiplier(0.1),
        u32_field("Accumulate Export Energy").at(56).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Import Energy").at(58).unit("kWh").multiplier(0.1),
        u32_field("Fault Code").at(60),
        u32_field("Warning Code").at(62),
        u16_field("Internal Temperature").at(64).unit("°C"),
        u16_field("Radiator Temperature 1").at(65).unit("°C"),
        u16_field("Radiator Temperature 2").at(66).unit("°C"),
        u16_field("Battery Temperature").at(67).unit("°C"),
        u32_field("Runtime Duration").at(69).unit("s"),
        u16_field("Auto Test Info").at(71),
        u16_field("Auto Test Limit").at(72),
        u16_field("Auto Test Default Time").at(73),
        u16_field("Auto Test Trip Value").at(74),
        u16_field("Auto Test Trip Time").at(75),
        u16_field("AC Input Type").at(77),
        u16_field("Battery Type and Brand").at(80),
        u16_field("Max Charging Current (BMS)").at(81).unit("A").multiplier(0.01),
        u16_field("Max Discharging Current (BMS)").at(82).unit("A").multiplier(0.01),
        u16_field("Recommended Charging Voltage (BMS)").at(83).unit("V").multiplier(0.1),
        u16_field("Recommended Discharging Cut-off Voltage (BMS)").at(84).unit("V").multiplier(0.1),
        u16_field("BMS Status Information 0").at(85),
        u16_field("BMS Status Information 1").at(86),
        u16_field("BMS Status Information 2").at(87),
        u16_field("BMS Status Information 3").at(88),
        u16_field("BMS Status Information 4").at(89),
        u16_field("BMS Status Information 5").at(90),
        u16_field("BMS Status Information 6").at(91),
        u16_field("BMS Status Information 7").at(92),
        u16_field("BMS Status Information 8").at(93),
        u16_field("BMS Status Information 9").at(94),
        u16_field("Inverter Aggregates Lithium Battery Status").at(95),
        u16_field("Number of Batteries in Parallel").at(96),
        u16_field("Battery Capacity (Ah)").at(97).unit("Ah"),
        i16_field("Battery Current (BMS)").at(98).unit("A").multiplier(0.01),
        u16_field("BMS Fault Code").at(99),
        u16_field("BMS Warning Code").at(100),
        u16_field("Max Cell Voltage (BMS)").at(101).unit("V").multiplier(0.001),
        u16_field("Min Cell Voltage (BMS)").at(102).unit("V").multiplier(0.001),
        i16_field("Max Cell Temperature (BMS)").at(103).unit("°C").multiplier(0.1),
        i16_field("Min Cell Temperature (BMS)").at(104).unit("°C").multiplier(0.1),
        u16_field("BMS Firmware Update State").at(105),
        u16_field("BMS Cycle Count").at(106),
        u16_field("Inverter Samples the Battery Voltage").at(107).unit("V").multiplier(0.1),
        u16_field("Parallel Info").at(113),
        u16_field("Load Power of the 12k Inverter").at(114).unit("W"),
        u16_field("Half BUS Voltage").at(120).unit("V").multiplier(0.1),
        u16_field("Generator Voltage").at(121).unit("V").multiplier(0.1),
        u16_field("Generator Frequency").at(122).unit("Hz").multiplier(0.01),
        u16_field("Generator Power").at(123).unit("W"),
        u16_field("Energy of Generator Today").at(124).unit("kWh").multiplier(0.1),
        u32_field("Total Generator Energy").at(125).unit("kWh").multiplier(0.1),
        u16_field("Voltage of EPS L1N").at(127).unit("V").multiplier(0.1),
        u16_field("Voltage of EPS L2N").at(128).unit("V").multiplier(0.1),
        u16_field("Active Power of EPS L1N").at(129).unit("W"),
        u16_field("Active Power of EPS L2N").at(130).unit("W"),
        u16_field("Apparent Power of EPS L1N").at(131).unit("VA"),
        u16_field("Apparent Power of EPS L2N").at(132).unit("VA"),
        u16_field("Daily Energy of EPSL1N").at(133).unit("kWh").multiplier(0.1),
        u16_field("Daily Energy of EPSL2N").at(134).unit("kWh").multiplier(0.1),
        u32_field("Total EPSL1N Energy").at(135).unit("kWh").multiplier(0.1),
        u32_field("Total EPSL2N Energy").at(137).unit("kWh").multiplier(0.1),
        u16_field("AFCI Current CH1").at(140).unit("mA"),
        u16_field("AFCI Current CH2").at(141).unit("mA"),
        u16_field("AFCI Current CH3").at(142).unit("mA"),
        u16_field("AFCI Current CH4").at(143).unit("mA"),
        u16_field("AFCI Flag").at(144),
        u16_field("AFCI Arc CH1").at(145),
        u16_field("AFCI Arc CH2").at(146),
        u16_field("AFCI Arc CH3").at(147),
        u16_field("AFCI Arc CH4").at(148),
        u16_field("AFCI Max Arc CH1").at(149),
        u16_field("AFCI Max Arc CH2").at(150),
        u16_field("AFCI Max Arc CH3").at(151),
        u16_field("AFCI Max Arc CH4").at(152),
        u16_field("AC Coupled Inverter Power").at(153).unit("W"),
        u16_field("Pload").at(170).unit("W"),
        u16_field("Eload Day").at(171).unit("kWh").multiplier(0.1),
        u32_field("Eload All").at(172).unit("kWh").multiplier(0.1),
        u16_field("Switch State").at(174),
        u16_field("On-grid Inverter Power (S-phase)").at(180).unit("W"),
        u16_field("On-grid Inverter Power (T-phase)").at(181).unit("W"),
        u16_field("Charging Rectification Power (S-phase)").at(182).unit("W"),
        u16_field("Charging Rectification Power (T-phase)").at(183).unit("W"),
        u16_field("User On-grid Power (S-phase)").at(184).unit("W"),
        u16_field("User On-grid Power (T-phase)").at(185).unit("W"),
        u16_field("Grid Supply Power (S-phase)").at(186).unit("W"),
        u16_field("Grid Supply Power (T-phase)").at(187).unit("W"),
        u16_field("Generator Power (S-phase)").at(188).unit("W"),
        u16_field("Generator Power (T-phase)").at(189).unit("W"),
        u16_field("Inverter RMS Current (S-phase)").at(190).unit("A").multiplier(0.01),
        u16_field("Inverter RMS Current (T-phase)").at(191).unit("A").multiplier(0.01),
        u16_field("Power Factor (S-phase)").at(192).multiplier(0.001),
        u16_field("Power Factor (T-phase)").at(193).multiplier(0.001),
    ])
});

const BLOCKS: &[(u16, u8)] = &[(0, 40), (40, 40), (80, 40), (120, 40), (160, 40)];

pub async fn read_realtime_data(reader: &dyn RegisterReader, id: u8) -> Result<Record, Error> {
    let mut data = Vec::with_capacity(BLOCKS.len());
    for (start, count) in BLOCKS {
        data.push(read_block(reader, id, *start, *count, true).await?);
    }
    let blocks: Vec<(u16, &[u8])> = BLOCKS
        .iter()
        .zip(data.iter())
        .map(|((start, _), bytes)| (*start, bytes.as_slice()))
        .collect();
    REALTIME_LAYOUT
        .decode_blocks(&blocks, Endianness::Little)
        .map_err(Error::from)
}
