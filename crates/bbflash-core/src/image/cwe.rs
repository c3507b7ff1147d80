//! CWE container parsing.
//!
//! A CWE file is a 400-byte big-endian header followed by `imgsize` bytes of
//! payload. Container types (`SPKG`, `APPL`, `MODM`, `BOOT`) may hold a
//! sequence of further CWE images in their payload. The tree is kept in a
//! flat arena; node 0 is the root and every other node records the index of
//! its parent.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::{debug, warn};

use super::version::parse_version_string;
use crate::error::{Error, Result};

pub const CWE_HEADER_SIZE: usize = 400;
/// Container payloads are not expanded below this depth.
pub const CWE_MAX_DEPTH: usize = 8;

const CONTAINER_TYPES: &[&str] = &["SPKG", "APPL", "MODM", "BOOT"];
const VERSION_SOURCE_TYPES: &[&str] = &["BOOT", "NVUP"];

/// One parsed CWE header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CweHeader {
    pub reserved_crc: u32,
    pub revision: u32,
    pub crc_valid: u32,
    pub image_type: [u8; 4],
    pub product: [u8; 4],
    pub image_size: u32,
    pub image_crc: u32,
    pub version: String,
    pub date: String,
    pub compat: u32,
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

fn printable(field: &[u8; 4]) -> bool {
    field[0].is_ascii_graphic() && field.iter().all(|&b| b.is_ascii_graphic() || b == b' ')
}

impl CweHeader {
    pub fn parse(buf: &[u8; CWE_HEADER_SIZE]) -> Result<Self> {
        let mut cur = Cursor::new(&buf[256..]);
        let reserved_crc = cur.read_u32::<BigEndian>()?;
        let revision = cur.read_u32::<BigEndian>()?;
        let crc_valid = cur.read_u32::<BigEndian>()?;
        let mut image_type = [0u8; 4];
        cur.read_exact(&mut image_type)?;
        let mut product = [0u8; 4];
        cur.read_exact(&mut product)?;
        let image_size = cur.read_u32::<BigEndian>()?;
        let image_crc = cur.read_u32::<BigEndian>()?;
        let mut version = [0u8; 84];
        cur.read_exact(&mut version)?;
        let mut date = [0u8; 8];
        cur.read_exact(&mut date)?;
        let compat = cur.read_u32::<BigEndian>()?;

        Ok(Self {
            reserved_crc,
            revision,
            crc_valid,
            image_type,
            product,
            image_size,
            image_crc,
            version: ascii_field(&version),
            date: ascii_field(&date),
            compat,
        })
    }

    pub fn type_str(&self) -> String {
        ascii_field(&self.image_type)
    }

    pub fn product_str(&self) -> String {
        ascii_field(&self.product)
    }

    /// Whether type and product look like real header fields.
    pub fn is_printable(&self) -> bool {
        printable(&self.image_type) && printable(&self.product)
    }

    pub fn is_container(&self) -> bool {
        CONTAINER_TYPES.contains(&self.type_str().as_str())
    }
}

/// A node in the CWE tree.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub header: CweHeader,
    /// Byte offset of the header in the file.
    pub offset: u64,
    pub parent_index: Option<usize>,
    pub depth: usize,
}

impl ImageInfo {
    pub fn data_offset(&self) -> u64 {
        self.offset + CWE_HEADER_SIZE as u64
    }

    pub fn end(&self) -> u64 {
        self.data_offset() + self.header.image_size as u64
    }
}

/// Parsed CWE container with the versions it advertises.
#[derive(Debug, Clone)]
pub struct CweInfo {
    pub nodes: Vec<ImageInfo>,
    pub firmware_version: Option<String>,
    pub config_version: Option<String>,
    pub carrier: Option<String>,
}

impl CweInfo {
    pub fn root(&self) -> &ImageInfo {
        &self.nodes[0]
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = (usize, &ImageInfo)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.parent_index == Some(index))
    }

    /// Indented one-line-per-node rendering of the tree.
    pub fn tree_text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&format!(
                "{:indent$}{} {} size={} offset=0x{:X} version={}\n",
                "",
                node.header.type_str(),
                node.header.product_str(),
                node.header.image_size,
                node.offset,
                node.header.version,
                indent = node.depth * 2
            ));
        }
        out
    }
}

fn read_header_at<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<CweHeader> {
    let mut buf = [0u8; CWE_HEADER_SIZE];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buf)?;
    CweHeader::parse(&buf)
}

/// Parse a CWE file of `file_size` bytes.
///
/// `display_name` is the file name, used as a version source after the root
/// header's version string.
pub fn parse_cwe<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
    display_name: &str,
    ignore_version_errors: bool,
) -> Result<CweInfo> {
    if file_size < CWE_HEADER_SIZE as u64 {
        return Err(Error::invalid_image(format!(
            "{file_size} bytes is too small for a CWE header"
        )));
    }
    let root = read_header_at(reader, 0)?;
    if file_size - CWE_HEADER_SIZE as u64 != root.image_size as u64 {
        return Err(Error::invalid_image(format!(
            "CWE size mismatch: header says {} payload bytes, file holds {}",
            root.image_size,
            file_size - CWE_HEADER_SIZE as u64
        )));
    }

    let mut nodes = vec![ImageInfo {
        header: root,
        offset: 0,
        parent_index: None,
        depth: 0,
    }];
    let mut stack = vec![0usize];

    while let Some(index) = stack.pop() {
        let parent = &nodes[index];
        if !parent.header.is_container() {
            continue;
        }
        if parent.depth + 1 >= CWE_MAX_DEPTH {
            warn!(offset = parent.offset, "CWE nesting too deep, not descending");
            continue;
        }
        let (start, end, depth) = (parent.data_offset(), parent.end(), parent.depth + 1);
        let children = scan_region(reader, start, end, index, depth)?;
        let first = nodes.len();
        nodes.extend(children);
        stack.extend((first..nodes.len()).rev());
    }

    let mut info = CweInfo {
        nodes,
        firmware_version: None,
        config_version: None,
        carrier: None,
    };
    derive_versions(&mut info, display_name, ignore_version_errors)?;
    debug!(
        nodes = info.nodes.len(),
        firmware = ?info.firmware_version,
        config = ?info.config_version,
        carrier = ?info.carrier,
        "Parsed CWE image"
    );
    Ok(info)
}

/// Sub-images packed into `[start, end)`, or none if the region doesn't
/// start with a plausible header.
fn scan_region<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    end: u64,
    parent_index: usize,
    depth: usize,
) -> Result<Vec<ImageInfo>> {
    let mut children = Vec::new();
    if end - start < CWE_HEADER_SIZE as u64 {
        return Ok(children);
    }
    let mut offset = start;
    while offset < end {
        if end - offset < CWE_HEADER_SIZE as u64 {
            return Err(Error::invalid_image(format!(
                "CWE sub-image header at 0x{offset:X} runs past its parent (ends 0x{end:X})"
            )));
        }
        let header = read_header_at(reader, offset)?;
        if !header.is_printable() {
            if children.is_empty() {
                // Opaque payload.
                return Ok(children);
            }
            return Err(Error::invalid_image(format!(
                "corrupt CWE sub-image header at 0x{offset:X}"
            )));
        }
        let child = ImageInfo {
            header,
            offset,
            parent_index: Some(parent_index),
            depth,
        };
        if child.end() > end {
            return Err(Error::invalid_image(format!(
                "CWE sub-image {} at 0x{offset:X} ends at 0x{:X}, past its parent (ends 0x{end:X})",
                child.header.type_str(),
                child.end()
            )));
        }
        offset = child.end();
        children.push(child);
    }
    Ok(children)
}

/// Fill `slot` from `value`; a differing later value is a mismatch.
pub(crate) fn merge_field(
    slot: &mut Option<String>,
    value: Option<String>,
    what: &str,
    source: &str,
    ignore_version_errors: bool,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    match slot {
        None => *slot = Some(value),
        Some(existing) if *existing == value => {}
        Some(existing) => {
            let msg = format!("{what} {value} from {source} differs from {existing}");
            if ignore_version_errors {
                warn!("{msg}");
            } else {
                return Err(Error::VersionMismatch(msg));
            }
        }
    }
    Ok(())
}

fn derive_versions(info: &mut CweInfo, display_name: &str, ignore: bool) -> Result<()> {
    let mut sources: Vec<(String, String)> = vec![
        ("CWE header".to_string(), info.root().header.version.clone()),
        ("file name".to_string(), display_name.to_string()),
    ];
    for node in &info.nodes[1..] {
        let kind = node.header.type_str();
        if VERSION_SOURCE_TYPES.contains(&kind.as_str()) {
            sources.push((format!("{kind} image"), node.header.version.clone()));
        }
    }

    for (source, text) in sources {
        let Some(parsed) = parse_version_string(&text) else {
            continue;
        };
        let firmware = Some(parsed.firmware);
        merge_field(&mut info.firmware_version, firmware, "firmware version", &source, ignore)?;
        merge_field(&mut info.config_version, parsed.config, "config version", &source, ignore)?;
        merge_field(&mut info.carrier, parsed.carrier, "carrier", &source, ignore)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// A 400-byte header with the given fields.
    pub(crate) fn header(kind: &str, product: &str, size: u32, version: &str) -> Vec<u8> {
        let mut buf = vec![0u8; CWE_HEADER_SIZE];
        buf[268..272].copy_from_slice(kind.as_bytes());
        buf[272..276].copy_from_slice(product.as_bytes());
        buf[276..280].copy_from_slice(&size.to_be_bytes());
        buf[284..284 + version.len()].copy_from_slice(version.as_bytes());
        buf[368..376].copy_from_slice(b"01/02/20");
        buf
    }

    /// Container of the given type wrapping `payload`.
    pub(crate) fn container(kind: &str, version: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = header(kind, "9X30", payload.len() as u32, version);
        buf.extend_from_slice(payload);
        buf
    }

    fn parse(buf: &[u8], name: &str, ignore: bool) -> Result<CweInfo> {
        parse_cwe(&mut Cursor::new(buf), buf.len() as u64, name, ignore)
    }

    #[test]
    fn test_header_fields() {
        let buf = header("MODM", "9X30", 1234, "SWI9X30C_02.24.05.06");
        let arr: &[u8; CWE_HEADER_SIZE] = buf.as_slice().try_into().unwrap();
        let hdr = CweHeader::parse(arr).unwrap();
        assert_eq!(hdr.type_str(), "MODM");
        assert_eq!(hdr.product_str(), "9X30");
        assert_eq!(hdr.image_size, 1234);
        assert_eq!(hdr.version, "SWI9X30C_02.24.05.06");
        assert_eq!(hdr.date, "01/02/20");
        assert!(hdr.is_container());
    }

    #[test]
    fn test_root_size_must_match() {
        let file = container("FILE", "", &[0xAB; 100]);
        assert!(parse(&file, "x.cwe", false).is_ok());

        let short = &file[..file.len() - 1];
        let err = parse(short, "x.cwe", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);

        assert!(parse(&file[..10], "x.cwe", false).is_err());
    }

    #[test]
    fn test_nested_tree() {
        let boot = container("BOOT", "SWI9X30C_02.24.05.06_GENERIC_002.026_000", &[1; 16]);
        let modm = container("MODM", "", &[0xFF; 32]);
        let mut appl_payload = boot.clone();
        appl_payload.extend_from_slice(&modm);
        let appl = container("APPL", "", &appl_payload);
        let spkg = container("SPKG", "", &appl);

        let info = parse(&spkg, "update.cwe", false).unwrap();
        let kinds: Vec<String> = info.nodes.iter().map(|n| n.header.type_str()).collect();
        assert_eq!(kinds, vec!["SPKG", "APPL", "BOOT", "MODM"]);
        assert_eq!(info.nodes[1].parent_index, Some(0));
        assert_eq!(info.nodes[2].parent_index, Some(1));
        assert_eq!(info.nodes[3].parent_index, Some(1));
        assert_eq!(info.nodes[3].offset, 400 + 400 + boot.len() as u64);
        assert_eq!(info.children(1).count(), 2);

        assert_eq!(info.firmware_version.as_deref(), Some("02.24.05.06"));
        assert_eq!(info.config_version.as_deref(), Some("002.026_000"));
        assert_eq!(info.carrier.as_deref(), Some("GENERIC"));
    }

    #[test]
    fn test_opaque_container_payload() {
        // MODM with raw (non-header) payload has no children.
        let modm = container("MODM", "", &[0u8; 512]);
        let info = parse(&modm, "m.cwe", false).unwrap();
        assert_eq!(info.nodes.len(), 1);
    }

    #[test]
    fn test_child_overrunning_parent() {
        let mut child = header("BOOT", "9X30", 1000, "");
        child.extend_from_slice(&[0u8; 10]);
        let spkg = container("SPKG", "", &child);
        let err = parse(&spkg, "bad.cwe", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert!(err.to_string().contains("past its parent"));
    }

    #[test]
    fn test_version_conflict() {
        let boot = container("BOOT", "X_02.24.05.06", &[]);
        let spkg = container("SPKG", "X_02.24.09.01", &boot);

        let err = parse(&spkg, "plain.cwe", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);

        let info = parse(&spkg, "plain.cwe", true).unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("02.24.09.01"));
    }

    #[test]
    fn test_file_name_supplies_missing_fields() {
        let file = container("FILE", "", &[0; 8]);
        let info = parse(&file, "SWI9X30C_02.24.05.06_GENERIC_002.026_000.nvu", false).unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("02.24.05.06"));
        assert_eq!(info.carrier.as_deref(), Some("GENERIC"));
    }
}
