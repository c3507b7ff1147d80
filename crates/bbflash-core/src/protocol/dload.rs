//! DLOAD mode switch: one request that asks a modem to enter SDP/QDL mode.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{DLOAD_CMD_ACK, DLOAD_CMD_SDP, QDL_CMD_ERROR};
use super::qdl::QdlResponse;
use crate::error::{Error, Result};

/// `cmd | reserved u16`
pub fn build_sdp_request() -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    buf[0] = DLOAD_CMD_SDP;
    LittleEndian::write_u16(&mut buf[1..3], 0);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DloadReply {
    /// The modem acknowledged the switch.
    Switched,
    /// The modem is already talking QDL and rejected the DLOAD command.
    AlreadyInSdp,
}

/// Interpret the reply to [`build_sdp_request`].
pub fn parse_sdp_reply(payload: &[u8]) -> Result<DloadReply> {
    match payload.first() {
        Some(&DLOAD_CMD_ACK) if payload.len() >= 3 => Ok(DloadReply::Switched),
        Some(&DLOAD_CMD_ACK) => Err(Error::protocol("truncated DLOAD response")),
        Some(&QDL_CMD_ERROR) => match QdlResponse::parse(payload)? {
            // Usually CMD_UNSUPPORTED, but any QDL error means QDL is already up.
            QdlResponse::Error(err) => {
                tracing::debug!(code = err.code, "DLOAD rejected: {}", err.description());
                Ok(DloadReply::AlreadyInSdp)
            }
            other => Err(Error::protocol(format!(
                "unexpected {} response to DLOAD",
                other.name()
            ))),
        },
        Some(other) => Err(Error::protocol(format!(
            "unexpected DLOAD response command 0x{other:02x}"
        ))),
        None => Err(Error::protocol("empty DLOAD response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        assert_eq!(build_sdp_request(), vec![0x70, 0x00, 0x00]);
    }

    #[test]
    fn test_ack() {
        assert_eq!(parse_sdp_reply(&[0x2A, 0, 0]).unwrap(), DloadReply::Switched);
    }

    #[test]
    fn test_unsupported_is_swallowed() {
        let mut rsp = vec![QDL_CMD_ERROR];
        rsp.extend_from_slice(&22u32.to_le_bytes());
        rsp.push(0);
        assert_eq!(parse_sdp_reply(&rsp).unwrap(), DloadReply::AlreadyInSdp);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_sdp_reply(&[0x13, 0x00]).is_err());
        assert!(parse_sdp_reply(&[]).is_err());
        assert!(parse_sdp_reply(&[0x2A]).is_err());
    }
}
