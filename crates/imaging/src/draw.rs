//! Frame annotation: OSD text with an outline, and polygon/rect overlays
//! used for failed-plate artifacts and the test task.

use ab_glyph::{FontVec, PxScale};
use fp_domain::geometry::{Point2f, Rect};
use image::{Rgb, RgbImage};
use imageproc::drawing;

/// OSD font loaded once at boot. When the configured font file is absent the
/// overlay is skipped entirely and a warning is logged by the caller.
pub struct OsdFont {
    font: FontVec,
}

impl OsdFont {
    pub fn load(path: &str) -> Option<OsdFont> {
        let data = std::fs::read(path).ok()?;
        let font = FontVec::try_from_vec(data).ok()?;
        Some(OsdFont { font })
    }

    /// Draw `text` with a black outline and white fill, baseline anchored at
    /// `(x, y)`; `height` is the glyph height in pixels.
    pub fn draw_outlined(&self, frame: &mut RgbImage, text: &str, x: i32, y: i32, height: f32) {
        let scale = PxScale::from(height.max(8.0));
        for (dx, dy) in [(-2, 0), (2, 0), (0, -2), (0, 2), (-1, -1), (1, 1), (-1, 1), (1, -1)] {
            drawing::draw_text_mut(frame, Rgb([0, 0, 0]), x + dx, y + dy, scale, &self.font, text);
        }
        drawing::draw_text_mut(frame, Rgb([255, 255, 255]), x, y, scale, &self.font, text);
    }
}

pub fn draw_polygon(frame: &mut RgbImage, points: &[Point2f], color: Rgb<u8>) {
    if points.len() < 2 {
        return;
    }
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        drawing::draw_line_segment_mut(frame, (a.x, a.y), (b.x, b.y), color);
    }
}

pub fn draw_rect(frame: &mut RgbImage, rect: &Rect, color: Rgb<u8>) {
    if rect.is_empty() {
        return;
    }
    let r = imageproc::rect::Rect::at(rect.x, rect.y).of_size(rect.width as u32, rect.height as u32);
    drawing::draw_hollow_rect_mut(frame, r, color);
}

pub fn draw_marker(frame: &mut RgbImage, point: Point2f, color: Rgb<u8>) {
    drawing::draw_filled_circle_mut(frame, (point.x as i32, point.y as i32), 2, color);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_outline_touches_pixels() {
        let mut frame = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        let quad = [
            Point2f::new(2.0, 2.0),
            Point2f::new(17.0, 2.0),
            Point2f::new(17.0, 17.0),
            Point2f::new(2.0, 17.0),
        ];
        draw_polygon(&mut frame, &quad, Rgb([0, 200, 0]));
        assert_eq!(frame.get_pixel(10, 2), &Rgb([0, 200, 0]));
        assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn missing_font_is_none() {
        assert!(OsdFont::load("/definitely/not/a/font.ttf").is_none());
    }
}
