//! RGBA rasters and colour parsing.
//!
//! Pixel order is row-major, top-to-bottom, left-to-right, 4 bytes per pixel.
//! Every codec and every chunk buffer agrees on this layout.

use thiserror::Error;

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A single RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);

    pub fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ColorError {
    #[error("Invalid colour string: {0:?}")]
    InvalidColor(String),
}

/// Parse a 6-hex-digit colour (`#rrggbb` or `rrggbb`) into an opaque RGBA value.
///
/// Painted pixels are always fully opaque; there is no alpha syntax.
pub fn parse_hex_color(input: &str) -> Result<Rgba, ColorError> {
    let hex = input.strip_prefix('#').unwrap_or(input);
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ColorError::InvalidColor(input.to_string()));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| ColorError::InvalidColor(input.to_string()))
    };
    Ok(Rgba::opaque(channel(0)?, channel(2)?, channel(4)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("Pixel buffer has {actual} bytes, expected {expected} for {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// An owned RGBA pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Raster {
    /// Allocate a fully transparent raster.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; Self::byte_len(width, height)],
        }
    }

    /// Wrap an existing pixel buffer, checking its length.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, RasterError> {
        let expected = Self::byte_len(width, height);
        if pixels.len() != expected {
            return Err(RasterError::SizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
    }

    /// Write one pixel. Returns `false` if the coordinate is outside the raster.
    pub fn put(&mut self, x: u32, y: u32, color: Rgba) -> bool {
        match self.offset(x, y) {
            Some(at) => {
                self.pixels[at..at + BYTES_PER_PIXEL].copy_from_slice(&color.0);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgba> {
        let at = self.offset(x, y)?;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[at..at + BYTES_PER_PIXEL]);
        Some(Rgba(px))
    }

    /// Reset every byte to zero.
    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    /// Whether every byte is zero.
    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_color_with_and_without_hash() {
        assert_eq!(parse_hex_color("#123456").unwrap(), Rgba([0x12, 0x34, 0x56, 255]));
        assert_eq!(parse_hex_color("ffA800").unwrap(), Rgba([0xff, 0xa8, 0x00, 255]));
    }

    #[test]
    fn test_parse_hex_color_rejects_garbage() {
        assert!(parse_hex_color("#12345").is_err());
        assert!(parse_hex_color("#1234567").is_err());
        assert!(parse_hex_color("#zzzzzz").is_err());
        assert!(parse_hex_color("").is_err());
        assert!(parse_hex_color("#ééé").is_err());
    }

    #[test]
    fn test_raster_put_get_row_major() {
        let mut raster = Raster::new(4, 2);
        assert!(raster.put(1, 1, Rgba::opaque(9, 8, 7)));
        // Row 1, column 1 → pixel index 5 → byte offset 20.
        assert_eq!(&raster.pixels()[20..24], &[9, 8, 7, 255]);
        assert_eq!(raster.get(1, 1), Some(Rgba([9, 8, 7, 255])));
        assert_eq!(raster.get(0, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn test_raster_put_out_of_bounds() {
        let mut raster = Raster::new(2, 2);
        assert!(!raster.put(2, 0, Rgba::opaque(1, 1, 1)));
        assert!(raster.get(0, 2).is_none());
        assert!(raster.is_blank());
    }

    #[test]
    fn test_raster_clear() {
        let mut raster = Raster::new(3, 3);
        raster.put(2, 2, Rgba::opaque(1, 2, 3));
        assert!(!raster.is_blank());
        raster.clear();
        assert!(raster.is_blank());
    }

    #[test]
    fn test_from_pixels_checks_length() {
        assert!(Raster::from_pixels(2, 2, vec![0; 16]).is_ok());
        let err = Raster::from_pixels(2, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(err, RasterError::SizeMismatch { expected: 16, actual: 15, .. }));
    }
}
