/* EG4-18KPV hybrid inverter driver. Real-time data lives in input
 * registers (function 0x04), read as three blocks and stitched by
 * register address. Big-endian fields, per the vendor's
 * "EG4-18KPV-12LV Modbus Protocol" register table. */

use std::sync::LazyLock;

use crate::error::Error;
use crate::fields::{Endianness, Layout, Record, i16_field, u16_field, u32_field};
use crate::inverters::read_block;
use crate::modbus::RegisterReader;

static STATE_VALUES: &[(&str, &str)] = &[
    ("0", "Standby"),
    ("1", "Fault"),
    ("2", "Programming"),
    ("4", "PV on-grid mode"),
    ("8", "PV Charge mode"),
    ("12", "PV Charge+on-grid mode"),
    ("16", "Battery on-grid mode"),
    ("20", "PV+Battery on-grid mode"),
    ("32", "AC Charge mode"),
    ("40", "PV+AC charge mode"),
    ("64", "Battery off-grid mode"),
    ("128", "PV off-grid mode"),
    ("192", "PV+battery off-grid mode"),
    ("136", "PV charge +off-grid mode"),
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
        u16_field("Internal Fault").at(7),
        u16_field("PV1 Power").at(8).unit("W"),
        u16_field("PV2 Power").at(9).unit("W"),
        u16_field("Charging Power").at(10).unit("W"),
        u16_field("Discharge Power").at(11).unit("W"),
        u16_field("R-phase Mains Voltage").at(12).unit("V").multiplier(0.1),
        u16_field("S-phase Mains Voltage").at(13).unit("V").multiplier(0.1),
        u16_field("T-phase Mains Voltage").at(14).unit("V").multiplier(0.1),
        u16_field("Mains Frequency").at(15).unit("Hz").multiplier(0.01),
        u16_field("Inverter Output Power (Grid Port)").at(16).unit("W"),
        u16_field("AC Charging Rectified Power").at(17).unit("W"),
        u16_field("Inverter Current RMS").at(18).unit("A").multiplier(0.01),
        u16_field("Power Factor").at(19).multiplier(0.001),
        u16_field("R-phase Off-grid Output Voltage").at(20).unit("V").multiplier(0.1),
        u16_field("S-phase Off-grid Output Voltage").at(21).unit("V").multiplier(0.1),
        u16_field("T-phase Off-grid Output Voltage").at(22).unit("V").multiplier(0.1),
        u16_field("Off-grid Output Frequency").at(23).unit("Hz").multiplier(0.01),
        u16_field("Off-grid Inverter Power").at(24).unit("W"),
        u16_field("Off-grid Apparent Power").at(25).unit("VA"),
        u16_field("Export Power to Grid").at(26).unit("W"),
        u16_field("Import Power from Grid").at(27).unit("W"),
        u16_field("PV1 Power Generation Today").at(28).unit("kWh").multiplier(0.1),
        u16_field("PV2 Power Generation Today").at(29).unit("kWh").multiplier(0.1),
        u16_field("PV3 Power Generation Today").at(30).unit("kWh").multiplier(0.1),
        u16_field("Today's Grid-connected Inverter Output Energy").at(31).unit("kWh").multiplier(0.1),
        u16_field("Today's AC Charging Rectified Energy").at(32).unit("kWh").multiplier(0.1),
        u16_field("Charged Energy Today").at(33).unit("kWh").multiplier(0.1),
        u16_field("Discharged Energy Today").at(34).unit("kWh").multiplier(0.1),
        u16_field("Off-grid Output Energy Today").at(35).unit("kWh").multiplier(0.1),
        u16_field("Today's Export Energy to Grid").at(36).unit("kWh").multiplier(0.1),
        u16_field("Today's Import Energy from Grid").at(37).unit("kWh").multiplier(0.1),
        u16_field("Bus 1 Voltage").at(38).unit("V").multiplier(0.1),
        u16_field("Bus 2 Voltage").at(39).unit("V").multiplier(0.1),
        u32_field("PV1 Cumulative Power Generation").at(40).unit("kWh").multiplier(0.1),
        u32_field("PV2 Cumulative Power Generation").at(42).unit("kWh").multiplier(0.1),
        u32_field("PV3 Cumulative Power Generation").at(44).unit("kWh").multiplier(0.1),
        u32_field("Inverter Accumulative Output Energy").at(46).unit("kWh").multiplier(0.1),
        u32_field("AC Charging Accumulative Rectified Energy").at(48).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Charge Energy Level").at(50).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Discharge Energy").at(52).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Off-grid Inverter Power").at(54).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Export Energy to Grid").at(56).unit("kWh").multiplier(0.1),
        u32_field("Cumulative Import Energy from Grid").at(58).unit("kWh").multiplier(0.1),
        u32_field("Fault Code").at(60),
        u32_field("Warning Code").at(62),
        u16_field("Internal Ring Temperature").at(64).unit("°C"),
        u16_field("Radiator Temperature 1").at(65).unit("°C"),
        u16_field("Radiator Temperature 2").at(66).unit("°C"),
        u16_field("Battery Temperature").at(67).unit("°C"),
        u32_field("Running Time").at(69).unit("s"),
        u16_field("Auto Test").at(71),
        u16_field("Auto Test Limit").at(72).unit("V/Hz").multiplier(0.1),
        u16_field("Auto Test Default Time").at(73).unit("ms"),
        u16_field("Auto Test Trip Value").at(74).unit("V/Hz").multiplier(0.1),
        u16_field("Auto Test Trip Time").at(75).unit("ms"),
        u16_field("AC Input Type").at(77),
        u16_field("BMS Limited Maximum Charging Current").at(81).unit("A").multiplier(0.01),
        u16_field("BMS Limited Maximum Discharge Current").at(82).unit("A").multiplier(0.01),
        u16_field("BMS Recommended Charging Voltage").at(83).unit("V").multiplier(0.1),
        u16_field("BMS Recommends Discharge Cut-off Voltage").at(84).unit("V").multiplier(0.1),
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
        u16_field("Inverter Summarizes Lithium Battery Status Information").at(95),
        u16_field("Number of Batteries in Parallel").at(96),
        u16_field("Battery Capacity (Ah)").at(97).unit("Ah"),
        i16_field("Battery Current (BMS)").at(98).unit("A").multiplier(0.01),
        u16_field("Fault Code (BMS)").at(99),
        u16_field("Warning Code (BMS)").at(100),
        u16_field("Maximum Cell Voltage (BMS)").at(101).unit("V").multiplier(0.001),
        u16_field("Minimum Cell Voltage (BMS)").at(102).unit("V").multiplier(0.001),
        i16_field("Maximum Monomer Temperature (BMS)").at(103).unit("°C").multiplier(0.1),
        i16_field("Minimum Monomer Temperature (BMS)").at(104).unit("°C").multiplier(0.1),
        u16_field("BMS Firmware Update State").at(105),
        u16_field("Number of Charge and Discharge Cycles (BMS)").at(106),
        u16_field("Inverter Battery Voltage Sampling").at(107).unit("V").multiplier(0.1),
        u16_field("12K BT Temperature").at(108).unit("°C").multiplier(0.1),
        u16_field("Reserved Temperature 2").at(109).unit("°C").multiplier(0.1),
        u16_field("Reserved Temperature 3").at(110).unit("°C").multiplier(0.1),
        u16_field("Reserved Temperature 4").at(111).unit("°C").multiplier(0.1),
        u16_field("Reserved Temperature 5").at(112).unit("°C").multiplier(0.1),
        u16_field("Parallel Information").at(113),
        u16_field("Half Bus Voltage").at(120).unit("V").multiplier(0.1),
        u16_field("Generator Voltage").at(121).unit("V").multiplier(0.1),
        u16_field("Generator Frequency").at(122).unit("Hz").multiplier(0.01),
        u16_field("Generator Power").at(123).unit("W"),
        u16_field("Daily Energy of Generator").at(124).unit("kWh").multiplier(0.1),
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
        u16_field("AFCI Real Time Arc CH1").at(145),
        u16_field("AFCI Real Time Arc CH2").at(146),
        u16_field("AFCI Real Time Arc CH3").at(147),
        u16_field("AFCI Real Time Arc CH4").at(148),
        u16_field("AFCI Max Arc CH1").at(149),
        u16_field("AFCI Max Arc CH2").at(150),
        u16_field("AFCI Max Arc CH3").at(151),
        u16_field("AFCI Max Arc CH4").at(152),
    ])
});

const BLOCKS: &[(u16, u8)] = &[(0, 69), (69, 52), (121, 32)];

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
        .decode_blocks(&blocks, Endianness::Big)
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct BlockReader(HashMap<u16, Vec<u8>>);

    #[async_trait]
    impl RegisterReader for BlockReader {
        async fn read_holding(&self, _: u8, start: u16, count: u8) -> Result<Vec<u8>, Error> {
            Ok(self
                .0
                .get(&start)
                .cloned()
                .unwrap_or_else(|| vec![0; count as usize * 2]))
        }
        async fn read_input(&self, _: u8, start: u16, count: u8) -> Result<Vec<u8>, Error> {
            self.read_holding(0, start, count).await
        }
    }

    #[tokio::test]
    async fn decodes_big_endian_blocks() {
        let mut block1 = vec![0u8; 69 * 2];
        block1[0..2].copy_from_slice(&20u16.to_be_bytes()); /* State */
        block1[8..10].copy_from_slice(&532u16.to_be_bytes()); /* Battery Voltage */
        block1[10..12].copy_from_slice(&81u16.to_be_bytes()); /* SOC */
        block1[80..84].copy_from_slice(&12345u32.to_be_bytes()); /* PV1 cumulative */

        let mut block2 = vec![0u8; 52 * 2];
        block2[0..4].copy_from_slice(&987654u32.to_be_bytes()); /* Running Time @69 */
        block2[102..104].copy_from_slice(&1912u16.to_be_bytes()); /* Half Bus Voltage @120 */

        let mut block3 = vec![0u8; 32 * 2];
        block3[0..2].copy_from_slice(&2403u16.to_be_bytes()); /* Generator Voltage @121 */
        block3[8..12].copy_from_slice(&777u32.to_be_bytes()); /* Total Generator Energy @125 */

        let mut blocks = HashMap::new();
        blocks.insert(0u16, block1);
        blocks.insert(69u16, block2);
        blocks.insert(121u16, block3);

        let rec = read_realtime_data(&BlockReader(blocks), 1).await.unwrap();
        assert_eq!(rec.get_u64("Battery Voltage"), Some(532));
        assert_eq!(rec.get_u64("Battery Capacity"), Some(81));
        assert_eq!(rec.get_u64("PV1 Cumulative Power Generation"), Some(12345));
        assert_eq!(rec.get_u64("Running Time"), Some(987654));
        assert_eq!(rec.get_u64("Half Bus Voltage"), Some(1912));
        assert_eq!(rec.get_u64("Generator Voltage"), Some(2403));
        assert_eq!(rec.get_u64("Total Generator Energy"), Some(777));

        let state = rec
            .fields()
            .into_iter()
            .find(|f| f.info.name == "State")
            .unwrap();
        assert_eq!(
            state.value,
            crate::fields::Value::Text("PV+Battery on-grid mode".into())
        );
    }
}
