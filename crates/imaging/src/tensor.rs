//! Model-input preprocessing: letterbox resizing and CHW FP32 tensor
//! construction with the normalization schemes the models expect.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};

use crate::frame::Frame;

/// Pixel normalization applied while packing the CHW buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `(px - 127.5) / 128` — face detector and non-arcface recognizers.
    Centered128,
    /// `px / 127.5 - 1` — arcface recognizers.
    ArcFace,
    /// `px / 255` — YOLO-style vehicle/plate/char detectors.
    Unit,
    /// `(px / 255 - mean[c]) / std[c]` per channel.
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization::MeanStd {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
    pub const HALF: Normalization = Normalization::MeanStd {
        mean: [0.5, 0.5, 0.5],
        std: [0.5, 0.5, 0.5],
    };

    fn apply(&self, value: u8, channel: usize) -> f32 {
        let v = value as f32;
        match self {
            Normalization::Centered128 => (v - 127.5) / 128.0,
            Normalization::ArcFace => v / 127.5 - 1.0,
            Normalization::Unit => v / 255.0,
            Normalization::MeanStd { mean, std } => (v / 255.0 - mean[channel]) / std[channel],
        }
    }
}

/// Result of fitting a frame into a fixed model input while preserving the
/// aspect ratio. `scale` maps original coordinates to input coordinates;
/// `shift` is the padding offset of the resized content inside the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f64,
    pub shift_x: f32,
    pub shift_y: f32,
}

impl Letterbox {
    /// Map an input-space coordinate back to the original frame.
    pub fn unmap_x(&self, x: f32) -> f32 {
        (x - self.shift_x) / self.scale as f32
    }

    pub fn unmap_y(&self, y: f32) -> f32 {
        (y - self.shift_y) / self.scale as f32
    }
}

/// Aspect-preserving resize anchored at the top-left corner, black padding.
/// Used by the face detector.
pub fn letterbox_top_left(frame: &Frame, width: i32, height: i32) -> (RgbImage, Letterbox) {
    let (w, h);
    let r_w = width as f64 / frame.width() as f64;
    let r_h = height as f64 / frame.height() as f64;
    let scale;
    if r_h > r_w {
        w = width;
        h = (r_w * frame.height() as f64) as i32;
        scale = r_w;
    } else {
        w = (r_h * frame.width() as f64) as i32;
        h = height;
        scale = r_h;
    }
    let resized = image::imageops::resize(&frame.image, w as u32, h as u32, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(width as u32, height as u32, Rgb([0, 0, 0]));
    image::imageops::overlay(&mut canvas, &resized, 0, 0);
    (
        canvas,
        Letterbox {
            scale,
            shift_x: 0.0,
            shift_y: 0.0,
        },
    )
}

/// Aspect-preserving resize centered in the canvas with gray (114) padding.
/// Used by the YOLO-style detectors.
pub fn letterbox_centered(frame: &Frame, width: i32, height: i32) -> (RgbImage, Letterbox) {
    let r_w = width as f64 / frame.width() as f64;
    let r_h = height as f64 / frame.height() as f64;
    let scale = r_w.min(r_h);
    let w = (scale * frame.width() as f64).round() as i32;
    let h = (scale * frame.height() as f64).round() as i32;
    let shift_x = ((width - w) / 2) as f32;
    let shift_y = ((height - h) / 2) as f32;
    let resized = image::imageops::resize(&frame.image, w as u32, h as u32, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(width as u32, height as u32, Rgb([114, 114, 114]));
    image::imageops::overlay(&mut canvas, &resized, shift_x as i64, shift_y as i64);
    (
        canvas,
        Letterbox {
            scale,
            shift_x,
            shift_y,
        },
    )
}

/// Plain (non-letterboxed) resize, used by the classifiers whose inputs do
/// not need coordinate recovery.
pub fn resize_exact(image: &RgbImage, width: i32, height: i32) -> RgbImage {
    image::imageops::resize(image, width as u32, height as u32, FilterType::CatmullRom)
}

/// Pack an image into a `1×3×H×W` FP32 buffer, planes in R, G, B order.
pub fn to_chw(image: &RgbImage, normalization: Normalization) -> Vec<f32> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut buffer = vec![0.0f32; 3 * width * height];
    for (x, y, pixel) in image.enumerate_pixels() {
        let base = y as usize * width + x as usize;
        for c in 0..3 {
            buffer[c * height * width + base] = normalization.apply(pixel[c], c);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::from_rgb(RgbImage::from_pixel(width, height, Rgb([value; 3])))
    }

    #[test]
    fn top_left_letterbox_scale() {
        // 640x360 into 320x320 — width-bound, scale 0.5.
        let frame = solid_frame(640, 360, 128);
        let (canvas, lb) = letterbox_top_left(&frame, 320, 320);
        assert_eq!(canvas.dimensions(), (320, 320));
        assert!((lb.scale - 0.5).abs() < 1e-9);
        assert_eq!(lb.shift_x, 0.0);
        // Bottom rows are padding.
        assert_eq!(canvas.get_pixel(0, 319), &Rgb([0, 0, 0]));
    }

    #[test]
    fn centered_letterbox_round_trip() {
        let frame = solid_frame(400, 200, 128);
        let (canvas, lb) = letterbox_centered(&frame, 640, 640);
        assert_eq!(canvas.dimensions(), (640, 640));
        // A point at the frame center maps to the canvas center and back.
        let cx = 200.0 * lb.scale as f32 + lb.shift_x;
        let cy = 100.0 * lb.scale as f32 + lb.shift_y;
        assert!((lb.unmap_x(cx) - 200.0).abs() < 0.5);
        assert!((lb.unmap_y(cy) - 100.0).abs() < 0.5);
        // Padding is gray.
        assert_eq!(canvas.get_pixel(0, 0), &Rgb([114, 114, 114]));
    }

    #[test]
    fn bbox_recovery_through_letterbox() {
        // A box in original coordinates survives map + unmap within rounding.
        let frame = solid_frame(1280, 720, 50);
        let (_, lb) = letterbox_centered(&frame, 640, 640);
        let (x1, y1, x2, y2) = (100.0f32, 200.0f32, 400.0f32, 600.0f32);
        let mapped = (
            x1 * lb.scale as f32 + lb.shift_x,
            y1 * lb.scale as f32 + lb.shift_y,
            x2 * lb.scale as f32 + lb.shift_x,
            y2 * lb.scale as f32 + lb.shift_y,
        );
        assert!((lb.unmap_x(mapped.0) - x1).abs() < 0.01);
        assert!((lb.unmap_y(mapped.1) - y1).abs() < 0.01);
        assert!((lb.unmap_x(mapped.2) - x2).abs() < 0.01);
        assert!((lb.unmap_y(mapped.3) - y2).abs() < 0.01);
    }

    #[test]
    fn chw_layout_and_normalization() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 127]));
        image.put_pixel(1, 0, Rgb([0, 255, 127]));
        let chw = to_chw(&image, Normalization::Unit);
        // R plane then G plane then B plane.
        assert_eq!(chw.len(), 6);
        assert!((chw[0] - 1.0).abs() < 1e-6);
        assert!((chw[1] - 0.0).abs() < 1e-6);
        assert!((chw[2] - 0.0).abs() < 1e-6);
        assert!((chw[3] - 1.0).abs() < 1e-6);

        let centered = to_chw(&image, Normalization::Centered128);
        assert!((centered[0] - (255.0 - 127.5) / 128.0).abs() < 1e-6);

        let arc = to_chw(&image, Normalization::ArcFace);
        assert!((arc[0] - 1.0).abs() < 1e-6);
    }
}
