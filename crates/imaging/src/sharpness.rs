//! Variance-of-Laplacian focus measure (Pech-Pacheco 2000).

use image::RgbImage;

/// Laplacian variance of the luma plane with a 3-pixel border cropped.
/// Higher values mean a sharper image; the pipeline keeps faces inside a
/// configured `[blur, blur_max]` band.
pub fn variance_of_laplacian(image: &RgbImage) -> f64 {
    const MARGIN: u32 = 3;
    let width = image.width();
    let height = image.height();
    if width <= 2 * MARGIN + 1 || height <= 2 * MARGIN + 1 {
        return 0.0;
    }

    let luma = |x: u32, y: u32| -> f64 {
        let p = image.get_pixel(x, y);
        0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
    };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in MARGIN..height - MARGIN {
        for x in MARGIN..width - MARGIN {
            let lap = luma(x + 1, y) + luma(x - 1, y) + luma(x, y + 1) + luma(x, y - 1)
                - 4.0 * luma(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    sum_sq / count as f64 - mean * mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn flat_image_has_zero_variance() {
        let image = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        assert!(variance_of_laplacian(&image) < 1e-9);
    }

    #[test]
    fn checkerboard_sharper_than_gradient() {
        let mut checker = RgbImage::new(32, 32);
        for (x, y, p) in checker.enumerate_pixels_mut() {
            let v = if (x + y) % 2 == 0 { 255 } else { 0 };
            *p = Rgb([v, v, v]);
        }
        let mut gradient = RgbImage::new(32, 32);
        for (x, _, p) in gradient.enumerate_pixels_mut() {
            let v = (x * 8) as u8;
            *p = Rgb([v, v, v]);
        }
        assert!(variance_of_laplacian(&checker) > variance_of_laplacian(&gradient));
    }

    #[test]
    fn tiny_image_is_zero() {
        let image = RgbImage::new(4, 4);
        assert_eq!(variance_of_laplacian(&image), 0.0);
    }
}
