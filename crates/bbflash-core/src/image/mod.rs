//! Firmware image model.
//!
//! An [`Image`] is a read-only view of one firmware file: its type, how it
//! splits into header and data, and chunked access to the data. CWE files
//! additionally carry their parsed container tree.

pub mod cwe;
pub mod version;

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::protocol::QDL_CHUNK_SIZE;

pub use cwe::{CWE_HEADER_SIZE, CweHeader, CweInfo, ImageInfo};
pub use version::{ParsedVersion, parse_version_string};

/// Trailing bytes of an AMSS modem image that are never sent.
const AMSS_MODEM_TRAILER: u64 = 8;

/// Firmware file type, detected from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    AmssModem,
    AmssApplication,
    AmssUqcn,
    Dbl,
    Osbl,
    Cwe,
    Unknown,
}

impl ImageType {
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match name.as_str() {
            "amss.mbn" => ImageType::AmssModem,
            "apps.mbn" => ImageType::AmssApplication,
            "uqcn.mbn" => ImageType::AmssUqcn,
            "dbl.mbn" => ImageType::Dbl,
            "osbl.mbn" => ImageType::Osbl,
            n if n.ends_with(".cwe") || n.ends_with(".nvu") || n.ends_with(".spk") => {
                ImageType::Cwe
            }
            _ => ImageType::Unknown,
        }
    }

    /// Image type code used in the QDL open request.
    pub fn qdl_code(self) -> Option<u8> {
        match self {
            ImageType::AmssModem => Some(0x05),
            ImageType::AmssApplication => Some(0x06),
            ImageType::AmssUqcn => Some(0x0d),
            ImageType::Dbl => Some(0x0f),
            ImageType::Osbl => Some(0x10),
            ImageType::Cwe => Some(0x80),
            ImageType::Unknown => None,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::AmssModem => write!(f, "AMSS modem"),
            ImageType::AmssApplication => write!(f, "AMSS application"),
            ImageType::AmssUqcn => write!(f, "AMSS UQCN"),
            ImageType::Dbl => write!(f, "DBL"),
            ImageType::Osbl => write!(f, "OSBL"),
            ImageType::Cwe => write!(f, "CWE"),
            ImageType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Type-specific contents.
#[derive(Debug, Clone)]
pub enum ImageKind {
    Generic,
    Cwe(CweInfo),
}

/// One firmware file opened for transfer.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    display_name: String,
    file: File,
    /// Current file offset, so sequential reads skip the seek.
    position: u64,
    image_type: ImageType,
    size: u64,
    header_size: u64,
    data_size: u64,
    chunk_size: u64,
    kind: ImageKind,
}

impl Image {
    /// Open and classify `path`.
    pub fn open(path: &Path, ignore_version_errors: bool) -> Result<Self> {
        let mut file = File::open(path).context(format!("couldn't open {}", path.display()))?;
        let size = file.metadata()?.len();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let image_type = ImageType::from_path(path);

        let (kind, header_size) = match image_type {
            ImageType::Cwe => {
                let info = cwe::parse_cwe(&mut file, size, &display_name, ignore_version_errors)
                    .context(format!("couldn't parse {display_name}"))?;
                (ImageKind::Cwe(info), CWE_HEADER_SIZE as u64)
            }
            _ => (ImageKind::Generic, 0),
        };

        let mut data_size = size - header_size;
        if image_type == ImageType::AmssModem {
            data_size = data_size.checked_sub(AMSS_MODEM_TRAILER).ok_or_else(|| {
                Error::invalid_image(format!("{display_name} is too small for an AMSS image"))
            })?;
        }

        debug!(
            path = %path.display(),
            image_type = %image_type,
            size,
            header_size,
            data_size,
            "Image opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            display_name,
            file,
            position: u64::MAX,
            image_type,
            size,
            header_size,
            data_size,
            chunk_size: QDL_CHUNK_SIZE as u64,
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn n_chunks(&self) -> usize {
        self.data_size.div_ceil(self.chunk_size) as usize
    }

    pub fn kind(&self) -> &ImageKind {
        &self.kind
    }

    pub fn cwe(&self) -> Option<&CweInfo> {
        match &self.kind {
            ImageKind::Cwe(info) => Some(info),
            ImageKind::Generic => None,
        }
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.cwe().and_then(|c| c.firmware_version.as_deref())
    }

    pub fn config_version(&self) -> Option<&str> {
        self.cwe().and_then(|c| c.config_version.as_deref())
    }

    pub fn carrier(&self) -> Option<&str> {
        self.cwe().and_then(|c| c.carrier.as_deref())
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at end of file.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.position != offset {
            self.file.seek(SeekFrom::Start(offset))?;
            self.position = offset;
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.position = u64::MAX;
                    return Err(e.into());
                }
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_at(offset, &mut buf)?;
        if n != len {
            return Err(Error::invalid_image(format!(
                "{}: short read at offset {offset} ({n} of {len} bytes)",
                self.display_name
            )));
        }
        Ok(buf)
    }

    /// The header bytes sent with the open request (empty for generic images).
    pub fn read_header(&mut self) -> Result<Vec<u8>> {
        self.read_exact_at(0, self.header_size as usize)
    }

    /// Data chunk `index` (the last one may be short).
    pub fn read_chunk(&mut self, index: usize) -> Result<Vec<u8>> {
        if index >= self.n_chunks() {
            return Err(Error::invalid_image(format!(
                "{}: chunk {index} out of range ({} chunks)",
                self.display_name,
                self.n_chunks()
            )));
        }
        let start = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.data_size - start) as usize;
        self.read_exact_at(self.header_size + start, len)
    }
}

/// Open every path, sorted largest first.
pub fn open_images(paths: &[PathBuf], ignore_version_errors: bool) -> Result<Vec<Image>> {
    let mut images = paths
        .iter()
        .map(|p| Image::open(p, ignore_version_errors))
        .collect::<Result<Vec<_>>>()?;
    images.sort_by(|a, b| b.size.cmp(&a.size));
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_type_detection() {
        let cases = [
            ("amss.mbn", ImageType::AmssModem),
            ("APPS.MBN", ImageType::AmssApplication),
            ("uqcn.mbn", ImageType::AmssUqcn),
            ("dbl.mbn", ImageType::Dbl),
            ("osbl.mbn", ImageType::Osbl),
            ("SWI9X30C_02.24.05.06.cwe", ImageType::Cwe),
            ("x.nvu", ImageType::Cwe),
            ("x.spk", ImageType::Cwe),
            ("random.bin", ImageType::Unknown),
        ];
        for (name, expected) in cases {
            assert_eq!(ImageType::from_path(Path::new(name)), expected, "{name}");
        }
        assert_eq!(ImageType::Cwe.qdl_code(), Some(0x80));
        assert_eq!(ImageType::Unknown.qdl_code(), None);
    }

    #[test]
    fn test_generic_chunks() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(QDL_CHUNK_SIZE * 2 + 10)).map(|i| i as u8).collect();
        let path = write_file(&dir, "dbl.mbn", &data);

        let mut image = Image::open(&path, false).unwrap();
        assert_eq!(image.header_size(), 0);
        assert_eq!(image.data_size(), data.len() as u64);
        assert_eq!(image.n_chunks(), 3);
        assert!(image.read_header().unwrap().is_empty());

        let last = image.read_chunk(2).unwrap();
        assert_eq!(last, &data[QDL_CHUNK_SIZE * 2..]);
        let first = image.read_chunk(0).unwrap();
        assert_eq!(first.len(), QDL_CHUNK_SIZE);
        assert_eq!(first[..4], data[..4]);
        assert!(image.read_chunk(3).is_err());
    }

    #[test]
    fn test_amss_modem_trailer() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "amss.mbn", &[0u8; 100]);
        let image = Image::open(&path, false).unwrap();
        assert_eq!(image.data_size(), 92);

        let tiny = write_file(&dir, "amss.mbn", &[0u8; 4]);
        assert!(Image::open(&tiny, false).is_err());
    }

    #[test]
    fn test_cwe_image() {
        let dir = TempDir::new().unwrap();
        let file = cwe::tests::container("FILE", "SWI9X30C_02.24.05.06", &[7u8; 64]);
        let path = write_file(&dir, "fw.cwe", &file);

        let mut image = Image::open(&path, false).unwrap();
        assert_eq!(image.image_type(), ImageType::Cwe);
        assert_eq!(image.header_size(), 400);
        assert_eq!(image.data_size(), 64);
        assert_eq!(image.n_chunks(), 1);
        assert_eq!(image.firmware_version(), Some("02.24.05.06"));
        assert_eq!(image.read_header().unwrap(), &file[..400]);
        assert_eq!(image.read_chunk(0).unwrap(), vec![7u8; 64]);
    }

    #[test]
    fn test_open_images_sorted_largest_first() {
        let dir = TempDir::new().unwrap();
        let small = write_file(&dir, "dbl.mbn", &[0u8; 10]);
        let big = write_file(&dir, "osbl.mbn", &[0u8; 1000]);
        let mid = write_file(&dir, "apps.mbn", &[0u8; 100]);

        let images = open_images(&[small, big, mid], false).unwrap();
        let sizes: Vec<u64> = images.iter().map(|i| i.size()).collect();
        assert_eq!(sizes, vec![1000, 100, 10]);
    }
}
