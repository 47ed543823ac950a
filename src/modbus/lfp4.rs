/* The ASCII-hex frame spoken by the Lifepower4 LiFePO4 battery series.
 * Described in the vendor's communication protocol PDF; it is NOT
 * Modbus. Register addresses and counts are conventions the battery
 * driver interprets; the frame itself carries a command byte (CID2). */

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Error;
use crate::modbus::{FrameError, RegisterReader};
use crate::transport::Port;

const SOI: u8 = 0x7e;
const EOI: u8 = 0x0d;

/* VER 0x20, CID1 0x4A (LiFePO4 battery BMS). */
const VERSION: &str = "20";
const CID1: &str = "4A";

pub struct Lfp4 {
    port: Arc<Port>,
}

impl Lfp4 {
    pub fn new(port: Arc<Port>) -> Lfp4 {
        Lfp4 { port }
    }

    /* Send the CID2 command to unit `id` and return the hex-decoded
     * data region of the response. */
    pub async fn read_registers(&self, id: u8, cid2: u8) -> Result<Vec<u8>, Error> {
        let frame = build_read_request(id, cid2);
        self.port.write_all(&frame).await?;
        let ascii = self.read_response().await?;
        /* Strip the 13-byte header and the 4 CHKSUM chars + EOI. */
        let data = &ascii[13..ascii.len() - 5];
        hex::decode(data)
            .map_err(|_| FrameError::BadHex(String::from_utf8_lossy(data).into_owned()).into())
    }

    /* Read one full response frame, CHKSUM verified, as raw ASCII. */
    pub async fn read_response(&self) -> Result<Vec<u8>, Error> {
        let (header, length) = self.read_header().await?;
        let mut ascii = vec![0u8; 13 + length as usize + 5];
        ascii[..13].copy_from_slice(&header);
        self.port.read_exact(&mut ascii[13..]).await?;

        verify_checksum(&ascii)?;
        if ascii[ascii.len() - 1] != EOI {
            warn!("EOI missing in response");
        }
        Ok(ascii)
    }

    /* SOI + 2 chars each of VER, ADR, CID1, RTN + 4 chars of LENGTH. */
    async fn read_header(&self) -> Result<([u8; 13], u16), Error> {
        let mut header = [0u8; 13];
        self.port.read_exact(&mut header).await?;
        if header[0] != SOI {
            return Err(FrameError::BadSoi(header[0]).into());
        }
        let rtn = ascii_to_bin(&header[7..9])? as u8;
        if rtn != 0 {
            return Err(FrameError::Rtn(return_code_string(rtn)).into());
        }
        let mut length = ascii_to_bin(&header[9..13])? as u16;
        check_length_checksum(length)?;
        length &= 0x0fff;
        Ok((header, length))
    }
}

#[async_trait]
impl RegisterReader for Lfp4 {
    /* The protocol has no holding/input split: `count` carries the
     * CID2 command byte and the start address is ignored. */
    async fn read_holding(&self, id: u8, _start: u16, cid2: u8) -> Result<Vec<u8>, Error> {
        self.read_registers(id, cid2).await
    }

    async fn read_input(&self, id: u8, _start: u16, cid2: u8) -> Result<Vec<u8>, Error> {
        self.read_registers(id, cid2).await
    }
}

pub fn build_read_request(id: u8, cid2: u8) -> Vec<u8> {
    let mut b = Vec::with_capacity(18);
    b.push(SOI);
    b.extend_from_slice(VERSION.as_bytes());
    b.extend_from_slice(format!("{id:02X}").as_bytes());
    b.extend_from_slice(CID1.as_bytes());
    b.extend_from_slice(format!("{cid2:02X}").as_bytes());
    b.extend_from_slice(b"0000");
    let chksum = checksum(&b);
    b.extend_from_slice(format!("{chksum:04X}").as_bytes());
    b.push(EOI);
    b
}

/* Two's complement of the byte sum, reduced mod 2^16 only once at the
 * end. Covers every byte after the SOI. */
fn checksum(frame: &[u8]) -> u16 {
    let sum: u32 = frame[1..].iter().map(|&c| c as u32).sum();
    ((!sum).wrapping_add(1) & 0xffff) as u16
}

fn verify_checksum(ascii: &[u8]) -> Result<(), FrameError> {
    let want = ascii_to_bin(&ascii[ascii.len() - 5..ascii.len() - 1])? as u16;
    let got = checksum(&ascii[..ascii.len() - 5]);
    if got != want {
        return Err(FrameError::Chksum { got, want });
    }
    Ok(())
}

/* LENGTH is <LCHKSUM:4><LENGTH:12>; the nibble checksum is the two's
 * complement of the sum of the length's three nibbles. */
fn check_length_checksum(length: u16) -> Result<(), FrameError> {
    let chksum = length >> 12;
    let d11 = (length & 0x0f00) >> 8;
    let d7 = (length & 0x00f0) >> 4;
    let d3 = length & 0x000f;
    let sum = (!(d11 + d7 + d3)).wrapping_add(1) & 0xf;
    if chksum != sum {
        return Err(FrameError::Lchksum);
    }
    Ok(())
}

fn ascii_to_bin(ascii: &[u8]) -> Result<u32, FrameError> {
    let decoded = hex::decode(ascii)
        .map_err(|_| FrameError::BadHex(String::from_utf8_lossy(ascii).into_owned()))?;
    let mut result = 0u32;
    for b in decoded {
        result = (result << 8) | b as u32;
    }
    Ok(result)
}

fn return_code_string(code: u8) -> String {
    match code {
        0x01 => "version error".to_string(),
        0x02 => "CHKSUM error".to_string(),
        0x03 => "LCHKSUM error".to_string(),
        0x04 => "invalid CID2".to_string(),
        0x05 => "format error".to_string(),
        0x06 => "invalid data".to_string(),
        other => format!("unknown error code 0x{other:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceType;

    /* Canned frames from the vendor protocol PDF examples. */
    const ANALOG_RESPONSE: &str = "7e32303031344130304130434130313031313030433534304338313043383130433832304338313043383130433831304338313043383230433832304338323043383230433832304338323043383230433745303430424344304243443042434430424344304244373042443730303030313346443030303032373130303030303046303030303030363430433832304335343030324530424344304243443030303030303135303030303030334330303030303030413030303030303144303030303030303030303030303030303030303230303144443330300d";
    const ALARM_RESPONSE: &str = "7e323030313441303037303534303130313130303030303030303030303030303030303030303030303030303030303030303030343030303030303030303030303030303030393030303030303030303030313033303030303030303030303030454443340d";

    fn lfp4_with(hex_data: &str) -> Lfp4 {
        Lfp4::new(Arc::new(Port::test(
            hex::decode(hex_data).unwrap(),
            DeviceType::Test,
        )))
    }

    #[test]
    fn request_builder_known_vectors() {
        assert_eq!(
            build_read_request(1, 0x42),
            hex::decode("7e323030313441343230303030464441320d").unwrap()
        );
        assert_eq!(
            build_read_request(1, 0x44),
            hex::decode("7e323030313441343430303030464441300d").unwrap()
        );
    }

    #[test]
    fn checksum_reduces_once_at_the_end() {
        /* The sum accumulates unmasked; only the final value is taken
         * mod 2^16. */
        let frame = b"\x7e20014A420000";
        assert_eq!(checksum(frame), 0xfda2);
    }

    #[test]
    fn length_checksum() {
        assert!(check_length_checksum(0xd300 | 0x0ca).is_err());
        /* 0x0CA: d11=0, d7=0xC, d3=0xA; ~(0x16)+1 & 0xF = 0xA */
        assert!(check_length_checksum(0xa0ca).is_ok());
        assert!(check_length_checksum(0x0000).is_ok());
        assert!(check_length_checksum(0x1001).is_err());
    }

    #[tokio::test]
    async fn read_response_round_trip() {
        for fixture in [ANALOG_RESPONSE, ALARM_RESPONSE] {
            let lfp4 = lfp4_with(fixture);
            let frame = lfp4.read_response().await.unwrap();
            assert_eq!(frame, hex::decode(fixture).unwrap());
        }
    }

    #[tokio::test]
    async fn read_registers_decodes_data_region() {
        let lfp4 = lfp4_with(ANALOG_RESPONSE);
        let data = lfp4.read_registers(1, 0x42).await.unwrap();
        /* Data region starts with DataFlag=0x01, pack group, cell
         * count 0x10, then cell 1 voltage 0x0C54 = 3156 mV. */
        assert_eq!(&data[..5], &[0x01, 0x01, 0x10, 0x0c, 0x54]);

        let lfp4 = lfp4_with(ALARM_RESPONSE);
        let data = lfp4.read_registers(1, 0x44).await.unwrap();
        assert_eq!(&data[..3], &[0x01, 0x01, 0x10]);
    }

    #[tokio::test]
    async fn error_return_code() {
        /* RTN = 04: invalid CID2. Header only, length 0. */
        let mut frame = b"~20014A04".to_vec();
        frame.extend_from_slice(b"0000");
        let chk = checksum(&frame);
        frame.extend_from_slice(format!("{chk:04X}").as_bytes());
        frame.push(0x0d);
        let lfp4 = Lfp4::new(Arc::new(Port::test(frame, DeviceType::Test)));
        let err = lfp4.read_registers(1, 0x42).await.err().unwrap();
        assert!(err.to_string().contains("invalid CID2"));
    }

    #[tokio::test]
    async fn bad_soi_rejected() {
        let lfp4 = Lfp4::new(Arc::new(Port::test(
            b"X20014A000000????\r".to_vec(),
            DeviceType::Test,
        )));
        let err = lfp4.read_registers(1, 0x42).await.err().unwrap();
        assert!(err.to_string().contains("wrong start of frame"));
    }

    #[tokio::test]
    async fn corrupted_chksum_detected() {
        let mut raw = hex::decode(ALARM_RESPONSE).unwrap();
        let n = raw.len();
        raw[n - 2] = b'0'; /* clobber the last CHKSUM char */
        let lfp4 = Lfp4::new(Arc::new(Port::test(raw, DeviceType::Test)));
        let err = lfp4.read_registers(1, 0x44).await.err().unwrap();
        assert!(err.to_string().contains("CHKSUM error"));
    }
}
