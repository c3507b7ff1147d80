//! QDL message codec.
//!
//! All records are packed little-endian. Everything except the unframed
//! write request travels inside an HDLC frame; the helpers here deal only
//! with the unframed payloads.

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::constants::*;
use super::hdlc::crc16;
use crate::error::{Error, Result};

/// Human readable strings for the QDL error codes (1..=26).
const QDL_ERROR_STRINGS: [&str; 26] = [
    "reserved",
    "invalid destination address",
    "invalid length",
    "unexpected end of packet",
    "invalid command",
    "reserved",
    "operation failed",
    "invalid flash intelligent ID",
    "invalid programming voltage",
    "write verify failed",
    "reserved",
    "invalid security code",
    "power-down failed",
    "NAND flash programming not supported",
    "command out of sequence",
    "close failed",
    "invalid feature bits",
    "out of space",
    "invalid security mode",
    "multi-image NAND not supported",
    "power-off command not supported",
    "command not supported",
    "invalid CRC",
    "command received in invalid state",
    "receive timeout",
    "image authentication error",
];

pub const QDL_ERROR_CMD_UNSUPPORTED: u32 = 22;

/// String for a QDL error code, `"unknown"` outside the table.
pub fn qdl_error_string(code: u32) -> &'static str {
    match code {
        1..=26 => QDL_ERROR_STRINGS[code as usize - 1],
        _ => "unknown",
    }
}

fn truncated(what: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |_| Error::protocol(format!("truncated {what}"))
}

fn expect_len(payload: &[u8], len: usize, what: &'static str) -> Result<()> {
    if payload.len() < len {
        return Err(Error::protocol(format!(
            "{what} too short: {} bytes, need {len}",
            payload.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Requests
// ============================================================================

/// `Hello` with `maxver == minver == version`.
pub fn build_hello(version: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 1 + QDL_HELLO_MAGIC_LEN + 3];
    buf[0] = QDL_CMD_HELLO_REQ;
    buf[1..1 + QDL_HELLO_MAGIC_REQ.len()].copy_from_slice(QDL_HELLO_MAGIC_REQ);
    let tail = 1 + QDL_HELLO_MAGIC_LEN;
    buf[tail] = version;
    buf[tail + 1] = version;
    buf[tail + 2] = QDL_HELLO_FEATURES;
    buf
}

/// Unframed-open request for an image of `header.len() + data_size` bytes.
pub fn build_ufopen(image_type: u8, header: &[u8], data_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 13];
    buf[0] = QDL_CMD_OPEN_UNFRAMED_REQ;
    buf[1] = image_type;
    LittleEndian::write_u32(&mut buf[2..6], header.len() as u32 + data_size);
    buf[6] = QDL_WINDOW_SIZE;
    LittleEndian::write_u32(&mut buf[7..11], data_size);
    // buf[11..13]: reserved
    buf.extend_from_slice(header);
    buf
}

/// Header of an unframed write, CRC included. The chunk follows it raw.
pub fn build_ufwrite_header(sequence: u16, chunk_size: u32) -> [u8; QDL_WRITE_HEADER_LEN] {
    let mut buf = [0u8; QDL_WRITE_HEADER_LEN];
    buf[0] = QDL_CMD_WRITE_UNFRAMED_REQ;
    LittleEndian::write_u16(&mut buf[1..3], sequence);
    // buf[3..7]: reserved
    LittleEndian::write_u32(&mut buf[7..11], chunk_size);
    let crc = crc16(&buf[..QDL_WRITE_HEADER_CRC_SPAN]);
    LittleEndian::write_u16(&mut buf[11..13], crc);
    buf
}

/// Complete unframed write: header followed by `chunk`.
pub fn build_ufwrite(sequence: u16, chunk: &[u8]) -> Vec<u8> {
    let header = build_ufwrite_header(sequence, chunk.len() as u32);
    let mut buf = Vec::with_capacity(header.len() + chunk.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(chunk);
    buf
}

pub fn build_ufclose() -> Vec<u8> {
    vec![QDL_CMD_SESSION_DONE_REQ]
}

pub fn build_reset() -> Vec<u8> {
    vec![QDL_CMD_DOWNLOAD_REQ]
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloResponse {
    pub magic: [u8; QDL_HELLO_MAGIC_RSP_LEN],
    pub boot_major: u16,
    pub boot_minor: u16,
    pub features: u8,
}

impl HelloResponse {
    pub const SIZE: usize = 1 + QDL_HELLO_MAGIC_RSP_LEN + 4 + 2 + 2 + 1;

    pub fn magic_str(&self) -> String {
        String::from_utf8_lossy(&self.magic)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Device-side error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QdlErrorResponse {
    pub code: u32,
    pub text: u8,
}

impl QdlErrorResponse {
    pub const SIZE: usize = 6;

    pub fn description(&self) -> &'static str {
        qdl_error_string(self.code)
    }

    /// `CMD_UNSUPPORTED` becomes an unsupported-feature error so callers can
    /// fall back; anything else is a protocol error.
    pub fn into_error(self) -> Error {
        if self.code == QDL_ERROR_CMD_UNSUPPORTED {
            Error::unsupported(format!("QDL: {}", self.description()))
        } else {
            Error::protocol(format!(
                "QDL error {}: {}",
                self.code,
                self.description()
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UfOpenResponse {
    pub status: u16,
    pub window_size: u8,
    pub chunk_size: u32,
}

impl UfOpenResponse {
    pub const SIZE: usize = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UfWriteResponse {
    pub sequence: u16,
    pub status: u16,
}

impl UfWriteResponse {
    pub const SIZE: usize = 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UfCloseResponse {
    pub status: u16,
    pub image_type: u8,
    pub error_text: u8,
}

impl UfCloseResponse {
    pub const SIZE: usize = 5;
}

/// Any response the device may send in QDL mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QdlResponse {
    Hello(HelloResponse),
    Error(QdlErrorResponse),
    UfOpen(UfOpenResponse),
    UfWrite(UfWriteResponse),
    UfClose(UfCloseResponse),
}

impl QdlResponse {
    /// Decode an unframed response payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let Some(&cmd) = payload.first() else {
            return Err(Error::protocol("empty QDL response"));
        };
        let mut cur = Cursor::new(&payload[1..]);
        match cmd {
            QDL_CMD_HELLO_RSP => {
                expect_len(payload, HelloResponse::SIZE, "hello response")?;
                let mut magic = [0u8; QDL_HELLO_MAGIC_RSP_LEN];
                magic.copy_from_slice(&payload[1..1 + QDL_HELLO_MAGIC_RSP_LEN]);
                cur.set_position(QDL_HELLO_MAGIC_RSP_LEN as u64 + 4);
                Ok(QdlResponse::Hello(HelloResponse {
                    magic,
                    boot_major: cur.read_u16::<LittleEndian>().map_err(truncated("hello"))?,
                    boot_minor: cur.read_u16::<LittleEndian>().map_err(truncated("hello"))?,
                    features: cur.read_u8().map_err(truncated("hello"))?,
                }))
            }
            QDL_CMD_ERROR => {
                expect_len(payload, QdlErrorResponse::SIZE, "error response")?;
                Ok(QdlResponse::Error(QdlErrorResponse {
                    code: cur.read_u32::<LittleEndian>().map_err(truncated("error"))?,
                    text: cur.read_u8().map_err(truncated("error"))?,
                }))
            }
            QDL_CMD_OPEN_UNFRAMED_RSP => {
                expect_len(payload, UfOpenResponse::SIZE, "open response")?;
                Ok(QdlResponse::UfOpen(UfOpenResponse {
                    status: cur.read_u16::<LittleEndian>().map_err(truncated("open"))?,
                    window_size: cur.read_u8().map_err(truncated("open"))?,
                    chunk_size: cur.read_u32::<LittleEndian>().map_err(truncated("open"))?,
                }))
            }
            QDL_CMD_WRITE_UNFRAMED_RSP => {
                expect_len(payload, UfWriteResponse::SIZE, "write response")?;
                let sequence = cur.read_u16::<LittleEndian>().map_err(truncated("write"))?;
                cur.set_position(cur.position() + 4);
                Ok(QdlResponse::UfWrite(UfWriteResponse {
                    sequence,
                    status: cur.read_u16::<LittleEndian>().map_err(truncated("write"))?,
                }))
            }
            QDL_CMD_SESSION_DONE_RSP => {
                expect_len(payload, UfCloseResponse::SIZE, "session done response")?;
                Ok(QdlResponse::UfClose(UfCloseResponse {
                    status: cur.read_u16::<LittleEndian>().map_err(truncated("close"))?,
                    image_type: cur.read_u8().map_err(truncated("close"))?,
                    error_text: cur.read_u8().map_err(truncated("close"))?,
                }))
            }
            other => Err(Error::protocol(format!(
                "unexpected QDL response command 0x{other:02x}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QdlResponse::Hello(_) => "hello",
            QdlResponse::Error(_) => "error",
            QdlResponse::UfOpen(_) => "open",
            QdlResponse::UfWrite(_) => "write",
            QdlResponse::UfClose(_) => "session done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_hello_layout() {
        let req = build_hello(5);
        assert_eq!(req.len(), 36);
        assert_eq!(req[0], QDL_CMD_HELLO_REQ);
        assert_eq!(&req[1..29], QDL_HELLO_MAGIC_REQ);
        assert!(req[29..33].iter().all(|&b| b == 0));
        assert_eq!(&req[33..], &[5, 5, QDL_HELLO_FEATURES]);
    }

    #[test]
    fn test_parse_hello_response() {
        let mut rsp = vec![QDL_CMD_HELLO_RSP];
        let mut magic = [0u8; 24];
        magic[..4].copy_from_slice(b"QCOM");
        rsp.extend_from_slice(&magic);
        rsp.extend_from_slice(&[0, 0, 0, 0]);
        rsp.extend_from_slice(&3u16.to_le_bytes());
        rsp.extend_from_slice(&7u16.to_le_bytes());
        rsp.push(0x30);

        let QdlResponse::Hello(hello) = QdlResponse::parse(&rsp).unwrap() else {
            panic!("not a hello");
        };
        assert_eq!(hello.magic_str(), "QCOM");
        assert_eq!(hello.boot_major, 3);
        assert_eq!(hello.boot_minor, 7);
        assert_eq!(hello.features, 0x30);
    }

    #[test]
    fn test_ufopen_layout() {
        let req = build_ufopen(0x80, &[0xAA; 4], 1000);
        assert_eq!(req[0], QDL_CMD_OPEN_UNFRAMED_REQ);
        assert_eq!(req[1], 0x80);
        assert_eq!(LittleEndian::read_u32(&req[2..6]), 1004);
        assert_eq!(req[6], 1);
        assert_eq!(LittleEndian::read_u32(&req[7..11]), 1000);
        assert_eq!(&req[13..], &[0xAA; 4]);
    }

    #[test]
    fn test_ufwrite_header_crc() {
        let hdr = build_ufwrite_header(0x0102, 0x100000);
        assert_eq!(hdr[0], QDL_CMD_WRITE_UNFRAMED_REQ);
        assert_eq!(&hdr[1..3], &[0x02, 0x01]);
        assert_eq!(LittleEndian::read_u32(&hdr[7..11]), 0x100000);
        assert_eq!(LittleEndian::read_u16(&hdr[11..13]), crc16(&hdr[..11]));
    }

    #[test]
    fn test_parse_write_response() {
        let rsp = [QDL_CMD_WRITE_UNFRAMED_RSP, 0x05, 0x00, 0, 0, 0, 0, 0x00, 0x00];
        assert_eq!(
            QdlResponse::parse(&rsp).unwrap(),
            QdlResponse::UfWrite(UfWriteResponse {
                sequence: 5,
                status: 0
            })
        );
    }

    #[test]
    fn test_error_mapping() {
        let unsupported = QdlErrorResponse { code: 22, text: 0 };
        assert_eq!(unsupported.into_error().kind(), ErrorKind::UnsupportedFeature);

        let crc = QdlErrorResponse { code: 23, text: 0 };
        let err = crc.into_error();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(err.to_string().contains("invalid CRC"));
    }

    #[test]
    fn test_error_strings_bounds() {
        assert_eq!(qdl_error_string(1), "reserved");
        assert_eq!(qdl_error_string(26), "image authentication error");
        assert_eq!(qdl_error_string(0), "unknown");
        assert_eq!(qdl_error_string(27), "unknown");
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(QdlResponse::parse(&[]).is_err());
        assert!(QdlResponse::parse(&[QDL_CMD_OPEN_UNFRAMED_RSP, 0]).is_err());
        assert!(QdlResponse::parse(&[0x55, 0, 0]).is_err());
    }
}
