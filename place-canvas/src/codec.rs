//! Chunk image codecs.
//!
//! Converts a chunk [`Raster`] to and from its on-disk representation.
//!
//! | Kind  | Extension | Notes                                     |
//! |-------|-----------|-------------------------------------------|
//! | `qoi` | `.qoi`    | Lossless, fast. Default save format.      |
//! | `png` | `.png`    | Lossless, viewable in any browser.        |
//! | `lz4` | `.lz4`    | Raw RGBA behind a small header, LZ4 block |
//!
//! Snapshots are decoded by file extension, so switching `saveFormat` keeps
//! older snapshots loadable.

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raster::Raster;

/// Magic bytes at the head of an `.lz4` chunk file.
const LZ4_MAGIC: &[u8; 4] = b"PLZ4";
/// Magic + width + height.
const LZ4_HEADER_LEN: usize = 12;
/// Upper bound on how far one LZ4 block byte can expand.
const LZ4_MAX_RATIO: u64 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Corrupt image data: {0}")]
    CorruptData(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("No codec for file extension {0:?}")]
    UnknownFormat(String),
}

/// Identifier of a chunk codec, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Qoi,
    Png,
    Lz4,
}

impl CodecKind {
    pub fn extension(self) -> &'static str {
        match self {
            CodecKind::Qoi => "qoi",
            CodecKind::Png => "png",
            CodecKind::Lz4 => "lz4",
        }
    }

    /// Codec instance for this kind.
    pub fn codec(self) -> Box<dyn ChunkCodec> {
        match self {
            CodecKind::Qoi => Box::new(QoiCodec),
            CodecKind::Png => Box::new(PngCodec),
            CodecKind::Lz4 => Box::new(Lz4Codec),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "qoi" => Some(CodecKind::Qoi),
            "png" => Some(CodecKind::Png),
            "lz4" => Some(CodecKind::Lz4),
            _ => None,
        }
    }

    /// Pick the codec matching a snapshot file's extension.
    pub fn for_path(path: &Path) -> Result<Self, CodecError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| CodecError::UnknownFormat(ext.to_string()))
    }
}

/// Encodes and decodes chunk rasters.
pub trait ChunkCodec: Send + Sync {
    fn kind(&self) -> CodecKind;

    fn extension(&self) -> &'static str {
        self.kind().extension()
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Raster, CodecError>;
}

/// Shared path for the formats the `image` crate handles.
fn encode_with_image(raster: &Raster, format: ImageFormat) -> Result<Vec<u8>, CodecError> {
    let img = RgbaImage::from_raw(raster.width(), raster.height(), raster.pixels().to_vec())
        .ok_or_else(|| CodecError::Encode("raster size does not match dimensions".into()))?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

fn decode_with_image(bytes: &[u8], format: ImageFormat) -> Result<Raster, CodecError> {
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| CodecError::CorruptData(e.to_string()))?
        .into_rgba8();
    let (width, height) = img.dimensions();
    Raster::from_pixels(width, height, img.into_raw())
        .map_err(|e| CodecError::CorruptData(e.to_string()))
}

/// Quite OK Image format.
#[derive(Debug, Clone, Copy, Default)]
pub struct QoiCodec;

impl ChunkCodec for QoiCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Qoi
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        encode_with_image(raster, ImageFormat::Qoi)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Raster, CodecError> {
        decode_with_image(bytes, ImageFormat::Qoi)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl ChunkCodec for PngCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Png
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        encode_with_image(raster, ImageFormat::Png)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Raster, CodecError> {
        decode_with_image(bytes, ImageFormat::Png)
    }
}

/// Raw RGBA behind a `PLZ4 | width u32 LE | height u32 LE` header,
/// LZ4 block compressed with a prepended size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl ChunkCodec for Lz4Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Lz4
    }

    fn encode(&self, raster: &Raster) -> Result<Vec<u8>, CodecError> {
        let compressed = lz4_flex::compress_prepend_size(raster.pixels());
        let mut out = Vec::with_capacity(LZ4_HEADER_LEN + compressed.len());
        out.extend_from_slice(LZ4_MAGIC);
        out.extend_from_slice(&raster.width().to_le_bytes());
        out.extend_from_slice(&raster.height().to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Raster, CodecError> {
        if bytes.len() < LZ4_HEADER_LEN || &bytes[..4] != LZ4_MAGIC {
            return Err(CodecError::CorruptData("missing lz4 chunk header".into()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[4..8]);
        let width = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..12]);
        let height = u32::from_le_bytes(word);

        let payload = &bytes[LZ4_HEADER_LEN..];
        if payload.len() < 4 {
            return Err(CodecError::CorruptData("missing lz4 size prefix".into()));
        }
        word.copy_from_slice(&payload[..4]);
        let declared = u64::from(u32::from_le_bytes(word));
        let expected = u64::from(width) * u64::from(height) * 4;
        if declared != expected {
            return Err(CodecError::CorruptData(format!(
                "lz4 payload claims {declared} bytes, {width}x{height} needs {expected}"
            )));
        }
        // Check before allocating: a block cannot expand past the LZ4 ratio.
        let block = &payload[4..];
        let ceiling = (block.len() as u64)
            .saturating_mul(LZ4_MAX_RATIO)
            .saturating_add(64);
        if expected > ceiling {
            return Err(CodecError::CorruptData(format!(
                "{}-byte lz4 block cannot hold {expected} bytes",
                block.len()
            )));
        }

        let pixels = lz4_flex::decompress(block, expected as usize)
            .map_err(|e| CodecError::CorruptData(e.to_string()))?;
        Raster::from_pixels(width, height, pixels)
            .map_err(|e| CodecError::CorruptData(e.to_string()))
    }
}
