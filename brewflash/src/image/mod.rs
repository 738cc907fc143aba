//! Firmware images.

pub mod hex;

use {
    crate::error::{Error, Result},
    log::debug,
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Encoding of an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw binary, sent as is.
    Binary,
    /// Intel HEX text.
    IntelHex,
}

/// A firmware image loaded into memory.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: String,
    path: Option<PathBuf>,
    format: ImageFormat,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from disk. A `.hex` extension selects Intel HEX.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let data = fs::read(path)?;
        let format = match path
            .extension()
            .and_then(|e| e.to_str())
        {
            Some(ext) if ext.eq_ignore_ascii_case("hex") => ImageFormat::IntelHex,
            _ => ImageFormat::Binary,
        };
        let name = path
            .file_name()
            .map_or_else(|| "firmware".to_string(), |n| n.to_string_lossy().into_owned());

        let mut image = Self::from_bytes(name, format, data)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Wrap bytes already in memory.
    pub fn from_bytes(name: impl Into<String>, format: ImageFormat, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        Ok(Self {
            name: name.into(),
            path: None,
            format,
            data,
        })
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the image was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path
            .as_deref()
    }

    /// File encoding.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// File contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes that end up in the device's program memory.
    pub fn program_size(&self) -> Result<usize> {
        match self.format {
            ImageFormat::Binary => Ok(self
                .data
                .len()),
            ImageFormat::IntelHex => hex::data_size(&String::from_utf8_lossy(&self.data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_detects_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("brewpi.HEX");
        fs::write(&path, ":0400000001020304F2\n:00000001FF\n").unwrap();

        let image = FirmwareImage::from_file(&path).unwrap();
        assert_eq!(image.format(), ImageFormat::IntelHex);
        assert_eq!(image.name(), "brewpi.HEX");
        assert_eq!(image.program_size().unwrap(), 4);
        assert_eq!(image.path(), Some(path.as_path()));
    }

    #[test]
    fn test_binary_size_is_file_size() {
        let image = FirmwareImage::from_bytes("spark.bin", ImageFormat::Binary, vec![0; 3000]).unwrap();
        assert_eq!(image.program_size().unwrap(), 3000);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(FirmwareImage::from_bytes("x.bin", ImageFormat::Binary, Vec::new()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/brewpi.bin"),
            Err(Error::Io(_))
        ));
    }
}
