//! HDLC-like framing with CRC16, as used by QDL and DLOAD.
//!
//! Frame layout on the wire:
//!
//! ```text
//! 0x7E | stuffed(payload) | stuffed(crc16(payload) as LE) | 0x7E
//! ```
//!
//! Stuffing escapes `0x7E` and `0x7D` as `0x7D, byte ^ 0x20`.

use crc::{CRC_16_IBM_SDLC, Crc};
use thiserror::Error;

/// Frame delimiter.
pub const HDLC_FLAG: u8 = 0x7E;
/// Escape marker.
pub const HDLC_ESCAPE: u8 = 0x7D;
/// XOR mask applied to escaped bytes.
pub const HDLC_ESCAPE_MASK: u8 = 0x20;

/// Table-driven CRC-CCITT: seed 0xFFFF, reflected byte-wise table lookup
/// (`crc = table[(crc ^ b) & 0xFF] ^ (crc >> 8)`), complemented result.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HdlcError {
    #[error("frame too short: {0} bytes after unstuffing")]
    TooShort(usize),
    #[error("dangling escape byte at end of frame")]
    DanglingEscape,
    #[error("unescaped flag inside frame at offset {0}")]
    UnexpectedFlag(usize),
    #[error("frame CRC mismatch: frame says 0x{expected:04X}, computed 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

/// CRC16 of `buffer`.
pub fn crc16(buffer: &[u8]) -> u16 {
    CRC16.checksum(buffer)
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == HDLC_FLAG || byte == HDLC_ESCAPE {
        out.push(HDLC_ESCAPE);
        out.push(byte ^ HDLC_ESCAPE_MASK);
    } else {
        out.push(byte);
    }
}

/// Frame `payload` for the wire.
pub fn hdlc_frame(payload: &[u8]) -> Vec<u8> {
    let crc = crc16(payload);
    // Worst case every byte needs escaping.
    let mut out = Vec::with_capacity(payload.len() * 2 + 6);
    out.push(HDLC_FLAG);
    for &b in payload.iter().chain(crc.to_le_bytes().iter()) {
        push_escaped(&mut out, b);
    }
    out.push(HDLC_FLAG);
    out
}

/// Undo [`hdlc_frame`], verifying the CRC.
pub fn hdlc_unframe(frame: &[u8]) -> Result<Vec<u8>, HdlcError> {
    let mut body = frame;
    if let [HDLC_FLAG, rest @ ..] = body {
        body = rest;
    }
    if let [rest @ .., HDLC_FLAG] = body {
        body = rest;
    }

    let mut unstuffed = Vec::with_capacity(body.len());
    let mut escaped = false;
    for (i, &b) in body.iter().enumerate() {
        if escaped {
            unstuffed.push(b ^ HDLC_ESCAPE_MASK);
            escaped = false;
        } else if b == HDLC_ESCAPE {
            escaped = true;
        } else if b == HDLC_FLAG {
            return Err(HdlcError::UnexpectedFlag(i));
        } else {
            unstuffed.push(b);
        }
    }
    if escaped {
        return Err(HdlcError::DanglingEscape);
    }
    if unstuffed.len() < 2 {
        return Err(HdlcError::TooShort(unstuffed.len()));
    }

    let crc_at = unstuffed.len() - 2;
    let expected = u16::from_le_bytes([unstuffed[crc_at], unstuffed[crc_at + 1]]);
    unstuffed.truncate(crc_at);
    let actual = crc16(&unstuffed);
    if expected != actual {
        return Err(HdlcError::ChecksumMismatch { expected, actual });
    }
    Ok(unstuffed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x906E);
    }

    #[test]
    fn test_crc16_empty() {
        // ~0xFFFF
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn test_roundtrip_lengths() {
        for len in 0..64usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + 0x70) as u8).collect();
            let framed = hdlc_frame(&payload);
            assert_eq!(hdlc_unframe(&framed).unwrap(), payload, "len {len}");
        }
    }

    #[test]
    fn test_roundtrip_special_bytes() {
        let payload = [HDLC_FLAG, HDLC_ESCAPE, 0x00, HDLC_FLAG, HDLC_FLAG, 0x5E, 0x5D];
        let framed = hdlc_frame(&payload);
        assert_eq!(hdlc_unframe(&framed).unwrap(), payload);
    }

    #[test]
    fn test_no_unescaped_flag_inside() {
        let payload = [0x01, HDLC_FLAG, 0x02, HDLC_ESCAPE, HDLC_FLAG];
        let framed = hdlc_frame(&payload);
        assert_eq!(framed[0], HDLC_FLAG);
        assert_eq!(framed[framed.len() - 1], HDLC_FLAG);
        let inner = &framed[1..framed.len() - 1];
        assert!(!inner.contains(&HDLC_FLAG));
        assert_eq!(&inner[..3], &[0x01, HDLC_ESCAPE, 0x5E]);
    }

    #[test]
    fn test_unframe_without_flags() {
        let payload = b"\x02abc";
        let framed = hdlc_frame(payload);
        let bare = &framed[1..framed.len() - 1];
        assert_eq!(hdlc_unframe(bare).unwrap(), payload);
    }

    #[test]
    fn test_corrupted_payload_byte_fails() {
        // No byte of the payload needs escaping, so offsets line up.
        let payload: Vec<u8> = (0x10..0x30).collect();
        let framed = hdlc_frame(&payload);
        for pos in 1..=payload.len() {
            let mut corrupted = framed.clone();
            corrupted[pos] ^= 0x01;
            assert!(
                matches!(
                    hdlc_unframe(&corrupted),
                    Err(HdlcError::ChecksumMismatch { .. })
                ),
                "corruption at {pos} not detected"
            );
        }
    }

    #[test]
    fn test_too_short() {
        assert_eq!(hdlc_unframe(&[HDLC_FLAG, 0x01, HDLC_FLAG]), Err(HdlcError::TooShort(1)));
        assert_eq!(hdlc_unframe(&[]), Err(HdlcError::TooShort(0)));
    }

    #[test]
    fn test_dangling_escape() {
        assert_eq!(
            hdlc_unframe(&[HDLC_FLAG, 0x01, 0x02, HDLC_ESCAPE, HDLC_FLAG]),
            Err(HdlcError::DanglingEscape)
        );
    }
}
