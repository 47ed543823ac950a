/* Modbus TCP: the RTU application payload wrapped in a 7-byte MBAP
 * header, no CRC. Transaction IDs come from an atomic counter and are
 * verified on the way back. */

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;

use crate::error::Error;
use crate::modbus::rtu::{RtuFunction, build_read_request};
use crate::modbus::{FrameError, ModbusException, RegisterReader};
use crate::transport::Port;

pub struct Tcp {
    port: Arc<Port>,
    tid: AtomicU16,
}

impl Tcp {
    pub fn new(port: Arc<Port>) -> Tcp {
        Tcp {
            port,
            tid: AtomicU16::new(0),
        }
    }

    async fn read_registers(
        &self,
        function: RtuFunction,
        id: u8,
        start: u16,
        count: u8,
    ) -> Result<Vec<u8>, Error> {
        let rtu = build_read_request(id, function, start, count as u16);
        let tid = self.tid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        /* MBAP: [tid][pid=0][length][unit], then the RTU frame with its
         * own id and CRC stripped. */
        let mut buf = Vec::with_capacity(7 + rtu.len() - 3);
        buf.extend_from_slice(&tid.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&((rtu.len() as u16) - 2).to_be_bytes());
        buf.push(id);
        buf.extend_from_slice(&rtu[1..rtu.len() - 2]);

        self.port.write_all(&buf).await?;
        self.read_response(tid).await
    }

    async fn read_response(&self, tid: u16) -> Result<Vec<u8>, Error> {
        let mut mbap = [0u8; 6];
        self.port.read_exact(&mut mbap).await?;
        let got_tid = u16::from_be_bytes([mbap[0], mbap[1]]);
        let length = u16::from_be_bytes([mbap[4], mbap[5]]) as usize;
        if got_tid != tid {
            return Err(FrameError::TransactionId {
                got: got_tid,
                want: tid,
            }
            .into());
        }

        /* Two extra tail bytes keep the buffer shaped like an RTU frame
         * so the same payload window applies. */
        let mut rtu = vec![0u8; length + 2];
        self.port.read_exact(&mut rtu[..length]).await?;
        if rtu[1] & 0x80 != 0 {
            return Err(FrameError::Exception(ModbusException::from(rtu[1])).into());
        }
        Ok(rtu[3..rtu.len() - 2].to_vec())
    }
}

#[async_trait]
impl RegisterReader for Tcp {
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
    use crate::transport::DeviceType;

    fn tcp_with(hex_data: &str) -> Tcp {
        Tcp::new(Arc::new(Port::test(
            hex::decode(hex_data).unwrap(),
            DeviceType::Test,
        )))
    }

    #[tokio::test]
    async fn read_registers_ok() {
        let tcp = tcp_with(
            "00010000001001032000670000006314d3ff10001f09c49ab09c400204000000060000000015e00000",
        );
        let data = tcp.read_holding(1, 16, 1).await.unwrap();
        /* length = 0x10; the window starts after [unit][function][count]
         * and excludes the 2-byte RTU-compatible tail */
        assert_eq!(data.len(), 0x10 - 3);
        assert_eq!(&data[..2], &[0x00, 0x67]);
    }

    #[tokio::test]
    async fn transaction_id_mismatch() {
        let tcp = tcp_with(
            "00990000001001032000670000006314d3ff10001f09c49ab09c400204000000060000000015e00000",
        );
        let err = tcp.read_holding(1, 16, 1).await.err().unwrap();
        assert!(err.to_string().contains("unexpected transaction ID"));
    }

    #[tokio::test]
    async fn short_mbap_and_body() {
        let tcp = tcp_with("000103040506");
        /* The canned response only has 6 bytes total and tid 1 matches,
         * so the body read comes up short. */
        assert!(tcp.read_holding(1, 16, 1).await.is_err());

        let tcp = tcp_with("0001030405");
        assert!(tcp.read_holding(1, 16, 1).await.is_err());
    }

    #[tokio::test]
    async fn mbap_request_shape() {
        let port = Arc::new(Port::test(Vec::new(), DeviceType::Test));
        let tcp = Tcp::new(Arc::clone(&port));
        let _ = tcp.read_holding(1, 0x0013, 0x10).await;
        let written = port.written().await;
        assert_eq!(
            written,
            hex::decode("000100000006010300130010").unwrap()
        );
    }

    #[tokio::test]
    async fn exception_response() {
        /* MBAP length 3: [unit][0x83][code] */
        let tcp = tcp_with("000100000003018303");
        let err = tcp.read_holding(1, 16, 1).await.err().unwrap();
        assert!(err.to_string().contains("illegal data value"));
    }
}
