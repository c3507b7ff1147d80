//! Protocol module - wire codecs for every download protocol.

pub mod constants;
pub mod dload;
pub mod firehose;
pub mod hdlc;
pub mod qdl;
pub mod sahara;

pub use constants::*;
pub use firehose::{FirehoseMessage, FirehoseResponse};
pub use hdlc::{HdlcError, crc16, hdlc_frame, hdlc_unframe};
pub use qdl::QdlResponse;
pub use sahara::SaharaPacket;
