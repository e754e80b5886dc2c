//! Decoded frame wrapper around an RGB byte buffer.

use fp_domain::geometry::Rect;
use fp_domain::{Error, Result};
use image::{DynamicImage, ImageFormat, RgbImage};

/// A decoded video frame. Pipelines crop, warp and annotate copies of it;
/// the original compressed bytes are kept by the caller for persistence.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    /// Decode from compressed bytes (JPEG/PNG/BMP/PPM/TIFF).
    pub fn decode(data: &[u8]) -> Result<Frame> {
        let image = image::load_from_memory(data)
            .map_err(|e| Error::bad_request(format!("failed to decode image: {e}")))?;
        Ok(Frame {
            image: image.into_rgb8(),
        })
    }

    pub fn from_rgb(image: RgbImage) -> Frame {
        Frame { image }
    }

    pub fn width(&self) -> i32 {
        self.image.width() as i32
    }

    pub fn height(&self) -> i32 {
        self.image.height() as i32
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width(), self.height())
    }

    /// Crop a sub-image; the rect is clipped to the frame first.
    pub fn crop(&self, rect: &Rect) -> Frame {
        let r = rect.intersect(&self.bounds());
        if r.is_empty() {
            return Frame {
                image: RgbImage::new(1, 1),
            };
        }
        let cropped = image::imageops::crop_imm(
            &self.image,
            r.x as u32,
            r.y as u32,
            r.width as u32,
            r.height as u32,
        )
        .to_image();
        Frame { image: cropped }
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.image.clone())
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .map_err(|e| Error::internal(format!("failed to encode image: {e}")))?;
        Ok(buffer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encode_decode_round_trip() {
        let mut image = RgbImage::new(32, 16);
        for p in image.pixels_mut() {
            *p = Rgb([200, 40, 10]);
        }
        let frame = Frame::from_rgb(image);
        let bytes = frame.encode_jpeg().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn crop_clips_to_bounds() {
        let frame = Frame::from_rgb(RgbImage::new(10, 10));
        let cropped = frame.crop(&Rect::new(5, 5, 20, 20));
        assert_eq!(cropped.width(), 5);
        assert_eq!(cropped.height(), 5);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Frame::decode(b"not an image").is_err());
    }
}
