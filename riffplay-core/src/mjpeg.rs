//! MJPEG video decoder
//!
//! Every AVI `00dc` chunk of an MJPEG stream is a complete JPEG image, so
//! decoding is stateless per frame. Output is packed RGB24.

use image::ImageFormat;

use crate::decode::{DecodeError, Picture, VideoDecoder};

pub struct MjpegDecoder {
    rgb: Vec<u8>,
    width: u32,
    height: u32,
    frames_decoded: u64,
}

impl MjpegDecoder {
    pub fn new() -> Self {
        Self {
            rgb: Vec::new(),
            width: 0,
            height: 0,
            frames_decoded: 0,
        }
    }

    /// Whether a container codec FourCC is handled here.
    pub fn supports(codec: Option<&str>) -> bool {
        matches!(
            codec.map(|c| c.to_ascii_uppercase()).as_deref(),
            Some("MJPG") | Some("AVRN") | Some("LJPG") | Some("JPEG")
        )
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl Default for MjpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for MjpegDecoder {
    fn decode(&mut self, compressed: &[u8]) -> Result<Picture<'_>, DecodeError> {
        // SOI marker
        if compressed.len() < 4 || compressed[0] != 0xFF || compressed[1] != 0xD8 {
            return Err(DecodeError::Video("missing JPEG SOI marker".into()));
        }

        let image = image::load_from_memory_with_format(compressed, ImageFormat::Jpeg)
            .map_err(|e| DecodeError::Video(format!("JPEG decode: {}", e)))?
            .into_rgb8();

        let (width, height) = image.dimensions();
        if width != self.width || height != self.height {
            tracing::debug!("MJPEG frame size {}x{}", width, height);
            self.width = width;
            self.height = height;
        }
        self.rgb = image.into_raw();
        self.frames_decoded += 1;

        Ok(Picture {
            data: &self.rgb,
            width,
            height,
        })
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8 * 8, y as u8 * 8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_to_rgb24() {
        let mut decoder = MjpegDecoder::new();
        let picture = decoder.decode(&jpeg(16, 8)).unwrap();
        assert_eq!((picture.width, picture.height), (16, 8));
        assert_eq!(picture.data.len(), 16 * 8 * 3);
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn test_garbage_is_video_error() {
        let mut decoder = MjpegDecoder::new();
        assert!(matches!(decoder.decode(&[0, 1, 2, 3, 4]), Err(DecodeError::Video(_))));

        let mut truncated = jpeg(16, 16);
        truncated.truncate(20);
        assert!(matches!(decoder.decode(&truncated), Err(DecodeError::Video(_))));
        assert_eq!(decoder.frames_decoded(), 0);
    }

    #[test]
    fn test_supported_codecs() {
        assert!(MjpegDecoder::supports(Some("MJPG")));
        assert!(MjpegDecoder::supports(Some("mjpg")));
        assert!(!MjpegDecoder::supports(Some("H264")));
        assert!(!MjpegDecoder::supports(None));
    }
}
