//! Decoded image attachments

use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, ImageReader, Limits};
use thiserror::Error;

/// Base64 inflates payloads by ~4/3; allow a little headroom for padding and headers.
const BASE64_OVERHEAD: f64 = 1.35;

/// Largest accepted bitmap, in pixels. Matches the usual decompression-bomb threshold.
pub const MAX_IMAGE_PIXELS: u64 = 89_478_485;

/// Longest accepted side in pixels
const MAX_IMAGE_SIDE: u32 = 16_384;

/// Worst case bytes per decoded pixel (16-bit RGBA)
const MAX_BYTES_PER_PIXEL: u64 = 8;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image payload too large before decoding ({size} bytes encoded, max {max} bytes)")]
    EncodedTooLarge { size: usize, max: usize },

    #[error("decoded image exceeds the {max} byte limit ({size} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("empty image payload")]
    Empty,

    #[error("image dimensions {width}x{height} exceed the {max} pixel limit")]
    Dimensions { width: u32, height: u32, max: u64 },

    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid image format: {0}")]
    Decode(String),
}

/// An attachment owned by a single request.
///
/// The bytes are fully decoded once to prove they are a real image, then only
/// the original encoded bytes are kept; that is what the runtimes receive.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    encoded: Vec<u8>,
    format: ImageFormat,
    width: u32,
    height: u32,
}

impl ImagePayload {
    /// Decode raw image bytes, enforcing `max_bytes` and the pixel limit.
    pub fn from_bytes(bytes: Vec<u8>, max_bytes: usize) -> Result<Self, ImageError> {
        Self::decode(bytes, max_bytes, MAX_IMAGE_PIXELS)
    }

    fn decode(bytes: Vec<u8>, max_bytes: usize, max_pixels: u64) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                max: max_bytes,
            });
        }

        // Header first: reject oversized bitmaps before allocating them.
        let (width, height) = open_reader(&bytes)?
            .into_dimensions()
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        let too_big = ImageError::Dimensions {
            width,
            height,
            max: max_pixels,
        };
        if u64::from(width) * u64::from(height) > max_pixels {
            return Err(too_big);
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_IMAGE_SIDE);
        limits.max_image_height = Some(MAX_IMAGE_SIDE);
        limits.max_alloc = Some(max_pixels.saturating_mul(MAX_BYTES_PER_PIXEL));

        let mut reader = open_reader(&bytes)?;
        let format = reader
            .format()
            .ok_or_else(|| ImageError::Decode("unrecognized image format".to_string()))?;
        reader.limits(limits);
        reader.decode().map_err(|e| match e {
            image::ImageError::Limits(_) => too_big,
            other => ImageError::Decode(other.to_string()),
        })?;

        Ok(Self {
            encoded: bytes,
            format,
            width,
            height,
        })
    }

    /// Decode a base64 string or `data:` URL, checking the size both before and after decoding.
    pub fn from_base64(data: &str, max_bytes: usize) -> Result<Self, ImageError> {
        let encoded = match data.split_once(',') {
            Some((header, payload)) if header.starts_with("data:") => payload,
            _ => data,
        }
        .trim();

        let max_encoded = (max_bytes as f64 * BASE64_OVERHEAD) as usize;
        if encoded.len() > max_encoded {
            return Err(ImageError::EncodedTooLarge {
                size: encoded.len(),
                max: max_encoded,
            });
        }

        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Self::from_bytes(bytes, max_bytes)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Size of the original encoded image in bytes
    pub fn byte_size(&self) -> usize {
        self.encoded.len()
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// Plain base64 of the original bytes
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.encoded)
    }

    /// `data:<mime>;base64,...` URL of the original bytes
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }
}

fn open_reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ImageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageError::Decode(e.to_string()))
}
