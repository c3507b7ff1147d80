//! Sahara packet codec.
//!
//! Every packet starts with `cmd u32 | length u32` (little-endian), where
//! `length` covers the whole packet including the header.

use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::constants::*;
use crate::error::{Error, Result};

const SAHARA_STATUS_STRINGS: [&str; 0x27] = [
    "success",
    "invalid command",
    "protocol mismatch",
    "invalid target protocol",
    "invalid host protocol",
    "invalid packet size",
    "unexpected image id",
    "invalid header size",
    "invalid data size",
    "invalid image type",
    "invalid transmit length",
    "invalid receive length",
    "general transmit/receive error",
    "read data error",
    "unsupported number of program headers",
    "invalid program header size",
    "multiple shared segments",
    "uninitialized program header location",
    "invalid destination address",
    "invalid image header data size",
    "invalid ELF header",
    "unknown host error",
    "timeout on receive",
    "timeout on transmit",
    "invalid host mode",
    "invalid memory read",
    "invalid data size request",
    "memory debug not supported",
    "invalid mode switch",
    "failed to execute command",
    "invalid parameter",
    "unsupported client command",
    "invalid client command response",
    "hash table authentication failure",
    "hash verification failure",
    "hash table not found",
    "target failed to initialize",
    "image authentication failure",
    "invalid ELF hash table size",
];

pub fn sahara_status_string(status: u32) -> &'static str {
    SAHARA_STATUS_STRINGS
        .get(status as usize)
        .copied()
        .unwrap_or("unknown")
}

/// Decoded device-to-host packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaharaPacket {
    HelloRequest {
        version: u32,
        compatible: u32,
        max_length: u32,
        mode: u32,
    },
    EndImageTransfer {
        image_id: u32,
        status: u32,
    },
    CommandReady,
    ExecuteResponse {
        execute: u32,
        response_length: u32,
    },
    Other {
        command: u32,
        length: u32,
    },
}

impl SaharaPacket {
    pub fn name(&self) -> &'static str {
        match self {
            SaharaPacket::HelloRequest { .. } => "hello request",
            SaharaPacket::EndImageTransfer { .. } => "end of image transfer",
            SaharaPacket::CommandReady => "command ready",
            SaharaPacket::ExecuteResponse { .. } => "command execute response",
            SaharaPacket::Other { .. } => "unknown",
        }
    }
}

/// Total packet length announced by an 8-byte header.
pub fn packet_length(header: &[u8]) -> Result<usize> {
    if header.len() < SAHARA_HEADER_LEN {
        return Err(Error::protocol("truncated Sahara header"));
    }
    let length = LittleEndian::read_u32(&header[4..8]) as usize;
    if length < SAHARA_HEADER_LEN {
        return Err(Error::protocol(format!(
            "invalid Sahara packet length {length}"
        )));
    }
    Ok(length)
}

fn truncated(_: std::io::Error) -> Error {
    Error::protocol("truncated Sahara packet")
}

pub fn parse_packet(buf: &[u8]) -> Result<SaharaPacket> {
    let length = packet_length(buf)?;
    if buf.len() < length {
        return Err(Error::protocol(format!(
            "Sahara packet shorter than announced: {} < {length}",
            buf.len()
        )));
    }
    let mut cur = Cursor::new(&buf[..length]);
    let command = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    cur.set_position(SAHARA_HEADER_LEN as u64);

    let packet = match command {
        SAHARA_HELLO_REQ => SaharaPacket::HelloRequest {
            version: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            compatible: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            max_length: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            mode: cur.read_u32::<LittleEndian>().map_err(truncated)?,
        },
        SAHARA_END_IMAGE_TRANSFER => SaharaPacket::EndImageTransfer {
            image_id: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            status: cur.read_u32::<LittleEndian>().map_err(truncated)?,
        },
        SAHARA_COMMAND_READY => SaharaPacket::CommandReady,
        SAHARA_COMMAND_EXECUTE_RSP => SaharaPacket::ExecuteResponse {
            execute: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            response_length: cur.read_u32::<LittleEndian>().map_err(truncated)?,
        },
        command => SaharaPacket::Other {
            command,
            length: length as u32,
        },
    };
    Ok(packet)
}

fn header(buf: &mut [u8], command: u32) {
    let len = buf.len() as u32;
    LittleEndian::write_u32(&mut buf[0..4], command);
    LittleEndian::write_u32(&mut buf[4..8], len);
}

/// Hello response asking for command mode.
pub fn build_hello_response() -> Vec<u8> {
    let mut buf = vec![0u8; SAHARA_HELLO_RSP_LEN];
    header(&mut buf, SAHARA_HELLO_RSP);
    LittleEndian::write_u32(&mut buf[8..12], SAHARA_VERSION);
    LittleEndian::write_u32(&mut buf[12..16], SAHARA_VERSION_COMPATIBLE);
    // status
    LittleEndian::write_u32(&mut buf[16..20], 0);
    LittleEndian::write_u32(&mut buf[20..24], SAHARA_MODE_COMMAND);
    buf
}

pub fn build_execute_request(execute: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SAHARA_HEADER_LEN + 4];
    header(&mut buf, SAHARA_COMMAND_EXECUTE_REQ);
    LittleEndian::write_u32(&mut buf[8..12], execute);
    buf
}

pub fn build_execute_data(execute: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SAHARA_HEADER_LEN + 4];
    header(&mut buf, SAHARA_COMMAND_EXECUTE_DATA);
    LittleEndian::write_u32(&mut buf[8..12], execute);
    buf
}

/// Turn an end-of-transfer packet into the error it always is.
pub fn end_of_transfer_error(image_id: u32, status: u32) -> Error {
    Error::protocol(format!(
        "Sahara transfer ended for image {image_id}: {} (0x{status:02x})",
        sahara_status_string(status)
    ))
}

/// Validate the raw text sent after the execute-data step.
pub fn check_confirmation(data: &[u8]) -> Result<String> {
    let text = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|end| &data[..=end])
        .unwrap_or_default();
    if text.is_empty() {
        return Err(Error::protocol("empty Firehose switch confirmation"));
    }
    if !text
        .iter()
        .all(|&b| b.is_ascii_graphic() || b.is_ascii_whitespace())
    {
        return Err(Error::protocol("Firehose switch confirmation is not printable"));
    }
    Ok(String::from_utf8_lossy(text).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_request() -> Vec<u8> {
        let mut buf = vec![0u8; 48];
        LittleEndian::write_u32(&mut buf[0..4], SAHARA_HELLO_REQ);
        LittleEndian::write_u32(&mut buf[4..8], 48);
        LittleEndian::write_u32(&mut buf[8..12], 2);
        LittleEndian::write_u32(&mut buf[12..16], 1);
        LittleEndian::write_u32(&mut buf[16..20], 0x400);
        LittleEndian::write_u32(&mut buf[20..24], 0);
        buf
    }

    #[test]
    fn test_parse_hello_request() {
        assert_eq!(
            parse_packet(&hello_request()).unwrap(),
            SaharaPacket::HelloRequest {
                version: 2,
                compatible: 1,
                max_length: 0x400,
                mode: 0
            }
        );
    }

    #[test]
    fn test_hello_response_layout() {
        let rsp = build_hello_response();
        assert_eq!(rsp.len(), 48);
        assert_eq!(LittleEndian::read_u32(&rsp[0..4]), SAHARA_HELLO_RSP);
        assert_eq!(LittleEndian::read_u32(&rsp[4..8]), 48);
        assert_eq!(LittleEndian::read_u32(&rsp[8..12]), 2);
        assert_eq!(LittleEndian::read_u32(&rsp[12..16]), 1);
        assert_eq!(LittleEndian::read_u32(&rsp[20..24]), SAHARA_MODE_COMMAND);
        assert!(rsp[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_execute_packets() {
        let req = build_execute_request(SAHARA_EXEC_SWITCH_FIREHOSE);
        assert_eq!(req.len(), 12);
        assert_eq!(LittleEndian::read_u32(&req[0..4]), SAHARA_COMMAND_EXECUTE_REQ);
        assert_eq!(LittleEndian::read_u32(&req[8..12]), SAHARA_EXEC_SWITCH_FIREHOSE);

        let data = build_execute_data(SAHARA_EXEC_SWITCH_FIREHOSE);
        assert_eq!(LittleEndian::read_u32(&data[0..4]), SAHARA_COMMAND_EXECUTE_DATA);
    }

    #[test]
    fn test_end_of_transfer_status() {
        let mut buf = vec![0u8; 16];
        LittleEndian::write_u32(&mut buf[0..4], SAHARA_END_IMAGE_TRANSFER);
        LittleEndian::write_u32(&mut buf[4..8], 16);
        LittleEndian::write_u32(&mut buf[8..12], 13);
        LittleEndian::write_u32(&mut buf[12..16], 0x25);
        let SaharaPacket::EndImageTransfer { image_id, status } = parse_packet(&buf).unwrap()
        else {
            panic!("wrong packet");
        };
        let err = end_of_transfer_error(image_id, status);
        assert!(err.to_string().contains("image authentication failure"));
        assert_eq!(sahara_status_string(0x99), "unknown");
    }

    #[test]
    fn test_bad_length() {
        let mut buf = hello_request();
        LittleEndian::write_u32(&mut buf[4..8], 4);
        assert!(parse_packet(&buf).is_err());
        LittleEndian::write_u32(&mut buf[4..8], 64);
        assert!(parse_packet(&buf).is_err());
    }

    #[test]
    fn test_confirmation() {
        assert_eq!(check_confirmation(b"SAHARA switched\0\0").unwrap(), "SAHARA switched");
        assert!(check_confirmation(b"").is_err());
        assert!(check_confirmation(b"\0\0").is_err());
        assert!(check_confirmation(&[0x01, 0x02]).is_err());
    }
}
