/* Wire protocols: Modbus RTU, Modbus TCP, and the LFP4 ASCII frame used
 * by the Lifepower4 battery series. All three expose the same narrow
 * register-reader capability consumed by the device drivers. */

pub mod lfp4;
pub mod rtu;
pub mod tcp;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::transport::{DeviceType, Port};

pub use lfp4::Lfp4;
pub use rtu::Rtu;
pub use tcp::Tcp;

/* Modbus exception codes from an error response. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl From<u8> for ModbusException {
    fn from(code: u8) -> Self {
        match code & 0x7f {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            0x04 => ModbusException::ServerDeviceFailure,
            0x05 => ModbusException::Acknowledge,
            0x06 => ModbusException::ServerDeviceBusy,
            0x08 => ModbusException::MemoryParityError,
            0x0a => ModbusException::GatewayPathUnavailable,
            0x0b => ModbusException::GatewayTargetFailedToRespond,
            other => ModbusException::Unknown(other),
        }
    }
}

impl std::fmt::Display for ModbusException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModbusException::IllegalFunction => f.write_str("illegal function"),
            ModbusException::IllegalDataAddress => f.write_str("illegal data address"),
            ModbusException::IllegalDataValue => f.write_str("illegal data value"),
            ModbusException::ServerDeviceFailure => f.write_str("server device failure"),
            ModbusException::Acknowledge => f.write_str("acknowledge"),
            ModbusException::ServerDeviceBusy => f.write_str("server device busy"),
            ModbusException::MemoryParityError => f.write_str("memory parity error"),
            ModbusException::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            ModbusException::GatewayTargetFailedToRespond => {
                f.write_str("gateway target failed to respond")
            }
            ModbusException::Unknown(code) => write!(f, "unknown error code {code:02x}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid function code: {0:02x}")]
    InvalidFunction(u8),

    #[error("invalid data reading frame (out of bounds)")]
    OutOfBounds,

    #[error("invalid crc: got {got:x}, want {want:x}")]
    Crc { got: u16, want: u16 },

    #[error("protocol error: {0}")]
    Exception(ModbusException),

    #[error("protocol error: {exception} (in addition, invalid crc: got {got:x}, want {want:x})")]
    ExceptionWithCrc {
        exception: ModbusException,
        got: u16,
        want: u16,
    },

    #[error("unexpected transaction ID: got {got:#06x}; want {want:#06x}")]
    TransactionId { got: u16, want: u16 },

    #[error("wrong start of frame: got {0:#04x}")]
    BadSoi(u8),

    #[error("short response: {0} bytes")]
    ShortResponse(usize),

    #[error("LCHKSUM error")]
    Lchksum,

    #[error("CHKSUM error: got {got:X}, want {want:X}")]
    Chksum { got: u16, want: u16 },

    #[error("{0}")]
    Rtn(String),

    #[error("error decoding ascii data: {0}")]
    BadHex(String),
}

/* The capability device drivers consume: read a register range and get
 * the raw payload bytes back. Framers that have no holding/input split
 * answer both calls the same way. */
#[async_trait]
pub trait RegisterReader: Send + Sync {
    async fn read_holding(&self, id: u8, start: u16, count: u8) -> Result<Vec<u8>, Error>;
    async fn read_input(&self, id: u8, start: u16, count: u8) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Auto,
    ModbusRtu,
    ModbusTcp,
    Lifepower4,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Protocol::Auto),
            "modbusrtu" => Ok(Protocol::ModbusRtu),
            "modbustcp" => Ok(Protocol::ModbusTcp),
            "lifepower4" => Ok(Protocol::Lifepower4),
            _ => Err(Error::Config(format!("unknown protocol: {s}"))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Auto => "auto",
            Protocol::ModbusRtu => "ModbusRTU",
            Protocol::ModbusTcp => "ModbusTCP",
            Protocol::Lifepower4 => "lifepower4",
        };
        f.write_str(s)
    }
}

/* Pick a framer for a port. `auto` resolves from the battery family
 * first (LFP4 speaks its own frame on any transport), then from the
 * device type. */
pub fn reader_for(
    port: Arc<Port>,
    protocol: Protocol,
    battery_family: &str,
) -> Result<Box<dyn RegisterReader>, Error> {
    match protocol {
        Protocol::Auto => {
            if battery_family == "lifepower4" {
                return Ok(Box::new(Lfp4::new(port)));
            }
            match port.device_type() {
                DeviceType::Serial | DeviceType::HidRaw => Ok(Box::new(Rtu::new(port))),
                DeviceType::Tcp => Ok(Box::new(Tcp::new(port))),
                DeviceType::Test => Err(Error::Config("unable to guess a protocol".to_string())),
            }
        }
        Protocol::ModbusRtu => Ok(Box::new(Rtu::new(port))),
        Protocol::ModbusTcp => Ok(Box::new(Tcp::new(port))),
        Protocol::Lifepower4 => Ok(Box::new(Lfp4::new(port))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_port(device_type: DeviceType) -> Arc<Port> {
        Arc::new(Port::test(Vec::new(), device_type))
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("auto".parse::<Protocol>().unwrap(), Protocol::Auto);
        assert_eq!("ModbusRTU".parse::<Protocol>().unwrap(), Protocol::ModbusRtu);
        assert_eq!("ModbusTCP".parse::<Protocol>().unwrap(), Protocol::ModbusTcp);
        assert_eq!(
            "lifepower4".parse::<Protocol>().unwrap(),
            Protocol::Lifepower4
        );
        assert!("whatever".parse::<Protocol>().is_err());
    }

    #[tokio::test]
    async fn auto_resolution() {
        assert!(reader_for(test_port(DeviceType::Serial), Protocol::Auto, "").is_ok());
        assert!(reader_for(test_port(DeviceType::HidRaw), Protocol::Auto, "").is_ok());
        assert!(reader_for(test_port(DeviceType::Tcp), Protocol::Auto, "").is_ok());
        assert!(reader_for(test_port(DeviceType::Test), Protocol::Auto, "").is_err());
        assert!(reader_for(test_port(DeviceType::Test), Protocol::Auto, "lifepower4").is_ok());
    }

    #[test]
    fn exception_mapping() {
        assert_eq!(ModbusException::from(0x83), ModbusException::IllegalDataValue);
        assert_eq!(ModbusException::from(0x02), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::from(0x7f), ModbusException::Unknown(0x7f));
    }
}
