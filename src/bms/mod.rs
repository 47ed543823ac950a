/* Battery Management System drivers. Each driver knows which register
 * ranges (or protocol commands) to read for its battery model and which
 * wire protocol the model speaks by default. */

pub mod eg4llv2;
pub mod lifepower4;
pub mod pace;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::fields::{FieldSpec, Layout, RawValue, Record, u16_field};
use crate::modbus::{Protocol, RegisterReader};
use crate::transport::DeviceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmsKind {
    Eg4LLv2,
    /* Same register map as the EG4-LLv2, sold under a different name. */
    LifepowerV2,
    Lifepower4,
    Pace,
}

impl FromStr for BmsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EG4LLv2" => Ok(BmsKind::Eg4LLv2),
            "lifepowerv2" => Ok(BmsKind::LifepowerV2),
            "lifepower4" => Ok(BmsKind::Lifepower4),
            "pacemodbus" => Ok(BmsKind::Pace),
            _ => Err(Error::Config(format!("unsupported BMS type: {s}"))),
        }
    }
}

impl BmsKind {
    /* The battery-family hint the framer factory needs for `auto`. */
    pub fn family(self) -> &'static str {
        match self {
            BmsKind::Lifepower4 => "lifepower4",
            _ => "",
        }
    }
}

#[async_trait]
pub trait Bms: Send + Sync {
    /* The published field schema, derived fields included. Used to emit
     * MQTT discovery configs before any data has been read. */
    fn info_layout(&self) -> &'static Layout;

    fn default_protocol(&self, device_type: DeviceType) -> Protocol;

    async fn read_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error>;

    async fn read_extra_info(
        &self,
        reader: &dyn RegisterReader,
        id: u8,
        timeout: Duration,
    ) -> Result<Record, Error>;
}

pub fn instance(kind: BmsKind) -> Box<dyn Bms> {
    match kind {
        BmsKind::Eg4LLv2 | BmsKind::LifepowerV2 => Box::new(eg4llv2::Eg4LLv2),
        BmsKind::Lifepower4 => Box::new(lifepower4::Lifepower4),
        BmsKind::Pace => Box::new(pace::Pace),
    }
}

/* Race a register read against the caller's timeout. After a timeout
 * the transport must be assumed corrupt; callers reopen before the next
 * read. */
pub(crate) async fn read_with_timeout(
    reader: &dyn RegisterReader,
    timeout: Duration,
    id: u8,
    start: u16,
    count: u8,
) -> Result<Vec<u8>, Error> {
    match tokio::time::timeout(timeout, reader.read_holding(id, start, count)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

pub(crate) fn voltage_stat_specs() -> Vec<FieldSpec> {
    ["max_cell_voltage", "min_cell_voltage", "mean_cell_voltage", "median_cell_voltage"]
        .iter()
        .map(|name| {
            u16_field(name)
                .device_class("voltage")
                .unit("V")
                .multiplier(0.001)
        })
        .collect()
}

/* Derive max/min/mean/median from the cell-voltage array and append
 * them to the record. Mean truncates; median is the mean of the two
 * middle values of the sorted array. */
pub(crate) fn append_voltage_stats(record: &mut Record, cell_field: &str) {
    let mut cells: Vec<u64> = match record.get(cell_field) {
        Some(RawValue::Array(items)) => items.iter().filter_map(|v| v.as_u64()).collect(),
        _ => Vec::new(),
    };

    let (max, min, mean, median) = if cells.is_empty() {
        (0, 0, 0, 0)
    } else {
        let max = *cells.iter().max().unwrap();
        let min = *cells.iter().min().unwrap();
        let mean = cells.iter().sum::<u64>() / cells.len() as u64;
        cells.sort_unstable();
        let mid = cells.len() / 2;
        let median = if cells.len() % 2 == 0 {
            (cells[mid - 1] + cells[mid]) / 2
        } else {
            cells[mid]
        };
        (max, min, mean, median)
    };

    for (spec, value) in voltage_stat_specs()
        .into_iter()
        .zip([max, min, mean, median])
    {
        record.push(spec, RawValue::Uint(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Endianness, Scalar, array_field};

    fn record_with_cells(cells: &[u16]) -> Record {
        let layout = Layout::new(vec![array_field(
            "cell_%d_voltage",
            Scalar::U16,
            cells.len(),
        )]);
        let mut bytes = Vec::new();
        for c in cells {
            bytes.extend_from_slice(&c.to_be_bytes());
        }
        layout.decode(&bytes, Endianness::Big).unwrap()
    }

    #[test]
    fn voltage_stats() {
        let mut rec = record_with_cells(&[
            3354, 3353, 3355, 3355, 3354, 3355, 3354, 3355, 3354, 3355, 3354, 3354, 3354, 3355,
            3354, 3354,
        ]);
        append_voltage_stats(&mut rec, "cell_%d_voltage");
        assert_eq!(rec.get_u64("max_cell_voltage"), Some(3355));
        assert_eq!(rec.get_u64("min_cell_voltage"), Some(3353));
        assert_eq!(rec.get_u64("mean_cell_voltage"), Some(3354));
        assert_eq!(rec.get_u64("median_cell_voltage"), Some(3354));
    }

    #[test]
    fn voltage_stats_empty_array() {
        let mut rec = record_with_cells(&[]);
        append_voltage_stats(&mut rec, "cell_%d_voltage");
        assert_eq!(rec.get_u64("max_cell_voltage"), Some(0));
        assert_eq!(rec.get_u64("median_cell_voltage"), Some(0));
    }

    #[test]
    fn bms_kind_parsing() {
        assert_eq!("EG4LLv2".parse::<BmsKind>().unwrap(), BmsKind::Eg4LLv2);
        assert_eq!(
            "lifepowerv2".parse::<BmsKind>().unwrap(),
            BmsKind::LifepowerV2
        );
        assert_eq!(
            "lifepower4".parse::<BmsKind>().unwrap(),
            BmsKind::Lifepower4
        );
        assert_eq!("pacemodbus".parse::<BmsKind>().unwrap(), BmsKind::Pace);
        assert!("tesla".parse::<BmsKind>().is_err());
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        struct SlowReader;
        #[async_trait]
        impl RegisterReader for SlowReader {
            async fn read_holding(&self, _: u8, _: u16, _: u8) -> Result<Vec<u8>, Error> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }
            async fn read_input(&self, _: u8, _: u16, _: u8) -> Result<Vec<u8>, Error> {
                Ok(Vec::new())
            }
        }
        let err = read_with_timeout(&SlowReader, Duration::from_millis(10), 1, 0, 1)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout));
    }
}
