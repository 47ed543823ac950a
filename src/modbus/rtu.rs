/* Modbus RTU framing: 8-byte read requests, length-prefixed responses,
 * CRC-16/IBM tail, exception decoding. */

use std::sync::Arc;

use async_trait::async_trait;
use crc::{CRC_16_MODBUS, Crc};

use crate::error::Error;
use crate::modbus::{FrameError, ModbusException, RegisterReader};
use crate::transport::Port;

pub const MAX_RTU_FRAME_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtuFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0f,
    WriteMultipleRegisters = 0x10,
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/* CRC-16/IBM (poly 0xA001 reflected, init 0xFFFF, no xorout). */
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/* `[id][function][address BE][quantity BE][crc LE]`, 8 bytes. */
pub fn build_read_request(id: u8, function: RtuFunction, address: u16, quantity: u16) -> Vec<u8> {
    let mut b = Vec::with_capacity(8);
    b.push(id);
    b.push(function as u8);
    b.extend_from_slice(&address.to_be_bytes());
    b.extend_from_slice(&quantity.to_be_bytes());
    let checksum = crc16(&b);
    b.extend_from_slice(&checksum.to_le_bytes());
    b
}

#[derive(Debug, Clone)]
pub struct RtuFrame {
    raw: Vec<u8>,
}

impl RtuFrame {
    pub fn new(raw: Vec<u8>) -> RtuFrame {
        RtuFrame { raw }
    }

    pub fn id(&self) -> u8 {
        self.raw[0]
    }

    pub fn function(&self) -> u8 {
        self.raw[1]
    }

    /* The data bytes between the 3-byte header and the CRC. */
    pub fn data(&self) -> &[u8] {
        &self.raw[3..self.raw.len() - 2]
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /* The little-endian CRC carried in the frame tail. */
    pub fn crc(&self) -> u16 {
        let n = self.raw.len();
        u16::from_le_bytes([self.raw[n - 2], self.raw[n - 1]])
    }
}

/* Read one response frame.
 *
 * A protocol exception and a CRC mismatch can both be present; the
 * combined error names both rather than dropping one. */
pub async fn read_response(port: &Port) -> Result<RtuFrame, Error> {
    let mut b = vec![0u8; MAX_RTU_FRAME_LENGTH];
    port.read_exact(&mut b[0..3]).await?;

    let pending = expected_response_length(b[1], b[2])
        .ok_or(FrameError::InvalidFunction(b[1]))?
        + 2;
    if 3 + pending >= MAX_RTU_FRAME_LENGTH {
        return Err(FrameError::OutOfBounds.into());
    }
    port.read_exact(&mut b[3..3 + pending]).await?;

    let computed = crc16(&b[..3 + pending - 2]);
    b.truncate(3 + pending);
    let function = b[1];
    let frame = RtuFrame::new(b);

    let exception = if function & 0x80 != 0 {
        Some(ModbusException::from(function))
    } else {
        None
    };
    if frame.crc() != computed {
        let err = match exception {
            Some(exception) => FrameError::ExceptionWithCrc {
                exception,
                got: frame.crc(),
                want: computed,
            },
            None => FrameError::Crc {
                got: frame.crc(),
                want: computed,
            },
        };
        return Err(err.into());
    }
    if let Some(exception) = exception {
        return Err(FrameError::Exception(exception).into());
    }
    Ok(frame)
}

/* Read one request frame, the controller side of a bus conversation.
 * Used when decoding intercepted RS-485 traffic. */
#[allow(dead_code)]
pub async fn read_request(port: &Port) -> Result<RtuFrame, Error> {
    let mut b = vec![0u8; MAX_RTU_FRAME_LENGTH];
    /* Reading 8 covers every fixed-size request type. */
    port.read_exact(&mut b[0..8]).await?;

    let count = u16::from_be_bytes([b[5], b[6]]);
    let pending = expected_request_length(b[1], count)
        .ok_or(FrameError::InvalidFunction(b[1]))?
        + 2
        - 6;
    if 8 + pending >= MAX_RTU_FRAME_LENGTH {
        return Err(FrameError::OutOfBounds.into());
    }
    if pending > 0 {
        port.read_exact(&mut b[8..8 + pending]).await?;
    }

    let computed = crc16(&b[..8 + pending - 2]);
    b.truncate(8 + pending);
    let frame = RtuFrame::new(b);
    if frame.crc() != computed {
        return Err(FrameError::Crc {
            got: frame.crc(),
            want: computed,
        }
        .into());
    }
    Ok(frame)
}

fn expected_response_length(function: u8, received_length: u8) -> Option<usize> {
    match function {
        0x01..=0x04 => Some(received_length as usize),
        0x05 | 0x06 | 0x0f | 0x10 => Some(3),
        _ => {
            if function & 0x80 != 0 {
                match function & 0x7f {
                    /* One data byte carries the exception code. */
                    0x01..=0x06 | 0x0f | 0x10 => Some(1),
                    _ => None,
                }
            } else {
                None
            }
        }
    }
}

fn expected_request_length(function: u8, count: u16) -> Option<usize> {
    match function {
        0x01..=0x06 => Some(4),
        0x0f | 0x10 => Some(5 + count as usize),
        _ => None,
    }
}

/* RTU register reader over one port. */
pub struct Rtu {
    port: Arc<Port>,
}

impl Rtu {
    pub fn new(port: Arc<Port>) -> Rtu {
        Rtu { port }
    }

    async fn read_registers(
        &self,
        function: RtuFunction,
        id: u8,
        start: u16,
        count: u8,
    ) -> Result<Vec<u8>, Error> {
        let request = build_read_request(id, function, start, count as u16);
        self.port.write_all(&request).await?;
        let frame = read_response(&self.port).await?;
        Ok(frame.data().to_vec())
    }
}

#[async_trait]
impl RegisterReader for Rtu {
    async fn read_holding(&self, id: u8, start: u16, count: u8) -> Result<Vec<u8>, Error> {
        self.read_registers(RtuFunction::ReadHoldingRegisters, id, start, count)
            .await
    }

    async fn read_input(&self, id: u8, start: u16, count: u8) -> Result<Vec<u8>, Error> {
        self.read_registers(RtuFunction::ReadInputRegisters, id, start, count)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceType, TransportError};

    fn port_with(hex_data: &str) -> Port {
        Port::test(hex::decode(hex_data).unwrap(), DeviceType::Test)
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x13, 0x00, 0x10]), 0xc3b5);
    }

    #[test]
    fn request_builder_known_vector() {
        let frame = build_read_request(1, RtuFunction::ReadHoldingRegisters, 0x0013, 0x0010);
        assert_eq!(frame, hex::decode("010300130010b5c3").unwrap());
    }

    #[test]
    fn request_crc_survives_reencoding() {
        let frame = build_read_request(7, RtuFunction::ReadInputRegisters, 0x0069, 0x0034);
        let tail = u16::from_le_bytes([frame[6], frame[7]]);
        assert_eq!(crc16(&frame[..6]), tail);
    }

    #[tokio::test]
    async fn read_response_ok() {
        let port = port_with(
            "01032000670000006314d3ff10001f09c49ab09c400204000000060000000015e0000070c0",
        );
        let frame = read_response(&port).await.unwrap();
        assert_eq!(frame.id(), 1);
        assert_eq!(frame.function(), 0x03);
        assert_eq!(frame.data().len(), 0x20);
        assert_eq!(frame.crc(), 0xc070);
    }

    #[tokio::test]
    async fn read_response_errors() {
        let cases: &[(&str, &str)] = &[
            ("", "short read"),
            ("01", "short read"),
            ("010320", "short read"),
            ("01f320", "invalid function code"),
            (
                "01032000670000006314d3ff10001f09c49ab09c400204000000060000000015e0000070c1",
                "invalid crc",
            ),
            (
                "0103fd00670000006314d3ff10001f09c49ab09c400204000000060000000015e0000070c0",
                "out of bounds",
            ),
            ("018320012830", "illegal data value"),
            ("018320012831", "in addition, invalid crc"),
        ];
        for (resp, want) in cases {
            let port = port_with(resp);
            let err = read_response(&port).await.err().unwrap();
            let msg = err.to_string();
            assert!(msg.contains(want), "{resp}: got '{msg}', want '{want}'");
        }
    }

    #[tokio::test]
    async fn read_request_ok() {
        let port = port_with("010300130010b5c3");
        let frame = read_request(&port).await.unwrap();
        assert_eq!(frame.id(), 1);
        assert_eq!(frame.function(), 0x03);
        assert_eq!(frame.crc(), 0xc3b5);
    }

    #[tokio::test]
    async fn read_request_errors() {
        let cases: &[(&str, &str)] = &[
            ("018300130010b5c3", "invalid function code"),
            ("110300130010b5c3", "invalid crc"),
            ("01", "short read"),
            ("010300130010", "short read"),
        ];
        for (req, want) in cases {
            let port = port_with(req);
            let err = read_request(&port).await.err().unwrap();
            let msg = err.to_string();
            assert!(msg.contains(want), "{req}: got '{msg}', want '{want}'");
        }
    }

    #[tokio::test]
    async fn reader_returns_payload_window() {
        let port = Arc::new(port_with(
            "01032000670000006314d3ff10001f09c49ab09c400204000000060000000015e0000070c0",
        ));
        let rtu = Rtu::new(Arc::clone(&port));
        let data = rtu.read_holding(1, 16, 1).await.unwrap();
        assert_eq!(data.len(), 0x20);
        assert_eq!(&data[..4], &[0x00, 0x67, 0x00, 0x00]);
        /* The request went out on the wire before the canned response
         * was consumed. */
        assert_eq!(
            port.written().await,
            build_read_request(1, RtuFunction::ReadHoldingRegisters, 16, 1)
        );
    }

    #[tokio::test]
    async fn short_frame_is_never_truncated() {
        let port = port_with("0103");
        let rtu = Rtu::new(Arc::new(port));
        match rtu.read_holding(1, 16, 1).await {
            Err(Error::Transport(TransportError::UnexpectedEof { .. })) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
