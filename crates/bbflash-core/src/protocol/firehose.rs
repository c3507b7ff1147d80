//! Firehose XML messages.
//!
//! Only the handful of fixed message shapes the update flow needs are
//! produced and understood; attribute lookup is a plain substring scan.

use super::constants::{FIREHOSE_MEMORY_NAME, FIREHOSE_XML_HEADER};

const DOC_START: &str = "<?xml";

fn document(body: &str) -> String {
    format!("{FIREHOSE_XML_HEADER}<data>{body}</data>")
}

pub fn build_ping() -> String {
    document(r#"<nop value="ping"/>"#)
}

pub fn build_configure(max_payload_to_target: u32) -> String {
    document(&format!(
        "<configure MemoryName=\"{FIREHOSE_MEMORY_NAME}\" Verbose=\"0\" AlwaysValidate=\"0\" \
         MaxPayloadSizeToTargetInBytes=\"{max_payload_to_target}\" ZlpAwareHost=\"0\" \
         SkipStorageInit=\"0\"/>"
    ))
}

pub fn build_get_storage_info() -> String {
    document(r#"<getstorageinfo physical_partition_number="0"/>"#)
}

pub fn build_program(pages_per_block: u32, sector_size: u32, num_partition_sectors: u32) -> String {
    document(&format!(
        "<program PAGES_PER_BLOCK=\"{pages_per_block}\" SECTOR_SIZE_IN_BYTES=\"{sector_size}\" \
         num_partition_sectors=\"{num_partition_sectors}\" physical_partition_number=\"0\" \
         start_sector=\"0\" filename=\"\"/>"
    ))
}

pub fn build_reset() -> String {
    document(r#"<power value="reset"/>"#)
}

/// A `<response …/>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirehoseResponse {
    pub ack: bool,
    pub rawmode: Option<bool>,
    pub max_payload_size_to_target_in_bytes: Option<u32>,
}

/// One element of interest inside a Firehose document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirehoseMessage {
    Response(FirehoseResponse),
    Log(String),
}

/// Split a read buffer into `<?xml …` documents. Bytes before the first
/// document start are dropped.
pub fn split_documents(buf: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let mut docs = Vec::new();
    let mut rest = match text.find(DOC_START) {
        Some(start) => &text[start..],
        None => return docs,
    };
    loop {
        match rest[DOC_START.len()..].find(DOC_START) {
            Some(next) => {
                let end = next + DOC_START.len();
                docs.push(rest[..end].to_string());
                rest = &rest[end..];
            }
            None => {
                docs.push(rest.to_string());
                return docs;
            }
        }
    }
}

/// Extract every `<response>` and `<log>` element from one document.
pub fn parse_document(doc: &str) -> Vec<FirehoseMessage> {
    let mut messages = Vec::new();
    let mut rest = doc;
    while let Some(start) = rest.find('<') {
        let tail = &rest[start + 1..];
        let end = tail.find('>').unwrap_or(tail.len());
        let element = &tail[..end];
        if let Some(attrs) = element.strip_prefix("response ") {
            messages.push(FirehoseMessage::Response(parse_response(attrs)));
        } else if let Some(attrs) = element.strip_prefix("log ") {
            if let Some(value) = attribute(attrs, "value") {
                messages.push(FirehoseMessage::Log(value));
            }
        }
        rest = &tail[end..];
    }
    messages
}

fn parse_response(attrs: &str) -> FirehoseResponse {
    FirehoseResponse {
        ack: attribute(attrs, "value").is_some_and(|v| v.eq_ignore_ascii_case("ACK")),
        rawmode: attribute(attrs, "rawmode").map(|v| v.eq_ignore_ascii_case("true")),
        max_payload_size_to_target_in_bytes: attribute(attrs, "MaxPayloadSizeToTargetInBytes")
            .and_then(|v| v.trim().parse().ok()),
    }
}

/// Value of `name="…"` within an element's attribute text, entity-decoded.
pub fn attribute(attrs: &str, name: &str) -> Option<String> {
    let mut search = attrs;
    loop {
        let at = search.find(name)?;
        let preceded_ok = at == 0 || search.as_bytes()[at - 1].is_ascii_whitespace();
        let after = &search[at + name.len()..];
        if preceded_ok {
            if let Some(value) = after.trim_start().strip_prefix('=') {
                let value = value.trim_start().strip_prefix('"')?;
                let close = value.find('"')?;
                return Some(decode_entities(&value[..close]));
            }
        }
        search = after;
    }
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Numeric `key=value` (or `"key": value`) embedded in a log line.
pub fn log_value_u32(log: &str, key: &str) -> Option<u32> {
    let at = log.to_ascii_lowercase().find(&key.to_ascii_lowercase())?;
    let rest = log[at + key.len()..].trim_start_matches(['"', ' ']);
    let rest = rest.strip_prefix(['=', ':'])?;
    let digits: String = rest
        .trim_start_matches(['"', ' '])
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Largest multiple of `sector_size` not above `max_payload`.
pub fn transfer_block_size(max_payload: u32, sector_size: u32) -> Option<u32> {
    if sector_size == 0 {
        return None;
    }
    let size = (max_payload / sector_size) * sector_size;
    (size > 0).then_some(size)
}
