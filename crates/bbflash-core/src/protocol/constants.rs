//! Wire constants for the QDL, DLOAD, Sahara and Firehose protocols.

use std::time::Duration;

// ============================================================================
// QDL (Qualcomm download) commands
// ============================================================================

pub const QDL_CMD_HELLO_REQ: u8 = 0x01;
pub const QDL_CMD_HELLO_RSP: u8 = 0x02;
pub const QDL_CMD_ERROR: u8 = 0x0d;
pub const QDL_CMD_OPEN_UNFRAMED_REQ: u8 = 0x25;
pub const QDL_CMD_OPEN_UNFRAMED_RSP: u8 = 0x26;
pub const QDL_CMD_WRITE_UNFRAMED_REQ: u8 = 0x27;
pub const QDL_CMD_WRITE_UNFRAMED_RSP: u8 = 0x28;
pub const QDL_CMD_SESSION_DONE_REQ: u8 = 0x29;
pub const QDL_CMD_SESSION_DONE_RSP: u8 = 0x2a;
pub const QDL_CMD_DOWNLOAD_REQ: u8 = 0x2d;

/// Magic carried in the hello request (32 bytes, NUL padded).
pub const QDL_HELLO_MAGIC_REQ: &[u8] = b"QCOM high speed protocol hst";
pub const QDL_HELLO_MAGIC_LEN: usize = 32;
/// Magic carried in the hello response (24 bytes).
pub const QDL_HELLO_MAGIC_RSP_LEN: usize = 24;
pub const QDL_HELLO_FEATURES: u8 = 0x30;
/// Protocol versions tried in order during the hello probe.
pub const QDL_PROTOCOL_VERSIONS: &[u8] = &[4, 5, 6];

/// Unframed write header: cmd|seq u16|reserved u32|chunk u32|crc u16.
pub const QDL_WRITE_HEADER_LEN: usize = 13;
/// The header CRC covers everything before the CRC field.
pub const QDL_WRITE_HEADER_CRC_SPAN: usize = 11;

pub const QDL_WINDOW_SIZE: u8 = 1;

// ============================================================================
// DLOAD (boot/download mode switch)
// ============================================================================

pub const DLOAD_CMD_SDP: u8 = 0x70;
pub const DLOAD_CMD_ACK: u8 = 0x2a;

// ============================================================================
// Sahara
// ============================================================================

pub const SAHARA_HELLO_REQ: u32 = 0x01;
pub const SAHARA_HELLO_RSP: u32 = 0x02;
pub const SAHARA_END_IMAGE_TRANSFER: u32 = 0x04;
pub const SAHARA_COMMAND_READY: u32 = 0x0b;
pub const SAHARA_COMMAND_EXECUTE_REQ: u32 = 0x0d;
pub const SAHARA_COMMAND_EXECUTE_RSP: u32 = 0x0e;
pub const SAHARA_COMMAND_EXECUTE_DATA: u32 = 0x0f;

pub const SAHARA_VERSION: u32 = 2;
pub const SAHARA_VERSION_COMPATIBLE: u32 = 1;
pub const SAHARA_MODE_COMMAND: u32 = 3;
/// Vendor execute command that moves the device to Firehose.
pub const SAHARA_EXEC_SWITCH_FIREHOSE: u32 = 0xFF00;

pub const SAHARA_HEADER_LEN: usize = 8;
pub const SAHARA_HELLO_RSP_LEN: usize = 48;
pub const SAHARA_MAX_ATTEMPTS: u32 = 5;
pub const SAHARA_PACKET_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Firehose
// ============================================================================

pub const FIREHOSE_XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>"#;
/// Payload size the host proposes in `configure`.
pub const FIREHOSE_MAX_PAYLOAD_PROPOSED: u32 = 1024 * 1024;
pub const FIREHOSE_MEMORY_NAME: &str = "nand";
pub const FIREHOSE_EOT_PACKET_LEN: usize = 512;
/// Bytes buffered without a complete document before the target is
/// considered to be talking garbage.
pub const FIREHOSE_MAX_RESPONSE: usize = 4096;

pub const FIREHOSE_PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const FIREHOSE_CONFIGURE_TIMEOUT: Duration = Duration::from_secs(3);
pub const FIREHOSE_STORAGE_INFO_TIMEOUT: Duration = Duration::from_secs(3);
pub const FIREHOSE_SETUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const FIREHOSE_BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const FIREHOSE_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(300);
pub const FIREHOSE_RESET_TIMEOUT: Duration = Duration::from_secs(10);
pub const FIREHOSE_RESET_RETRIES: u32 = 10;
pub const FIREHOSE_OP_RETRIES: u32 = 3;

// ============================================================================
// QDL timing
// ============================================================================

pub const QDL_HELLO_TIMEOUT: Duration = Duration::from_secs(1);
pub const DLOAD_TIMEOUT: Duration = Duration::from_secs(1);
pub const QDL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
pub const QDL_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);
/// The device flashes everything after the final chunk before answering.
pub const QDL_LAST_CHUNK_TIMEOUT: Duration = Duration::from_secs(120);
pub const QDL_SESSION_DONE_TIMEOUT: Duration = Duration::from_secs(120);
pub const QDL_RESET_TIMEOUT: Duration = Duration::from_secs(1);

/// Size of an image chunk sent in one unframed write.
pub const QDL_CHUNK_SIZE: usize = 1024 * 1024;
