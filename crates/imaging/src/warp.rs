//! Landmark-driven warps: robust similarity estimation for face alignment
//! and 4-point perspective rectification for license plates.

use fp_domain::geometry::Point2f;
use fp_domain::{Error, Result};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Canonical 5-point face template (ArcFace, 112×112 base) scaled to the
/// recognizer input size: right eye, left eye, nose, right mouth, left mouth.
pub fn canonical_face_template(width: i32, height: i32) -> [Point2f; 5] {
    const BASE: [(f32, f32); 5] = [
        (38.2946, 51.6963),
        (73.5318, 51.5014),
        (56.0252, 71.7366),
        (41.5493, 92.3655),
        (70.7299, 92.2041),
    ];
    let sx = width as f32 / 112.0;
    let sy = height as f32 / 112.0;
    BASE.map(|(x, y)| Point2f::new(x * sx, y * sy))
}

/// A 4-DOF similarity transform `q = s·R·p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    /// `s·cos θ`
    pub a: f32,
    /// `s·sin θ`
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub fn apply(&self, p: Point2f) -> Point2f {
        Point2f::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    fn residual_sq(&self, p: Point2f, q: Point2f) -> f32 {
        let m = self.apply(p);
        (m.x - q.x).powi(2) + (m.y - q.y).powi(2)
    }

    fn to_projection(self) -> Option<Projection> {
        Projection::from_matrix([self.a, -self.b, self.tx, self.b, self.a, self.ty, 0.0, 0.0, 1.0])
    }
}

/// Least-squares similarity fit over point pairs (complex-linear form of the
/// Umeyama estimate for the 4-DOF case).
fn fit_similarity(src: &[Point2f], dst: &[Point2f]) -> Option<Similarity> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }
    let n = src.len() as f32;
    let (mpx, mpy) = (
        src.iter().map(|p| p.x).sum::<f32>() / n,
        src.iter().map(|p| p.y).sum::<f32>() / n,
    );
    let (mqx, mqy) = (
        dst.iter().map(|p| p.x).sum::<f32>() / n,
        dst.iter().map(|p| p.y).sum::<f32>() / n,
    );
    let mut num_re = 0.0f32;
    let mut num_im = 0.0f32;
    let mut den = 0.0f32;
    for (p, q) in src.iter().zip(dst) {
        let px = p.x - mpx;
        let py = p.y - mpy;
        let qx = q.x - mqx;
        let qy = q.y - mqy;
        // conj(p) * q accumulated over pairs
        num_re += px * qx + py * qy;
        num_im += px * qy - py * qx;
        den += px * px + py * py;
    }
    if den <= f32::EPSILON {
        return None;
    }
    let a = num_re / den;
    let b = num_im / den;
    Some(Similarity {
        a,
        b,
        tx: mqx - (a * mpx - b * mpy),
        ty: mqy - (b * mpx + a * mpy),
    })
}

/// Robust similarity estimate in the least-median-of-squares style: exact
/// two-point models are scored by the median squared residual over all
/// pairs, the winner selects inliers for a final least-squares refit.
pub fn estimate_similarity_lmeds(src: &[Point2f], dst: &[Point2f]) -> Option<Similarity> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }

    let median_residual = |model: &Similarity| -> f32 {
        let mut residuals: Vec<f32> = src
            .iter()
            .zip(dst)
            .map(|(p, q)| model.residual_sq(*p, *q))
            .collect();
        residuals.sort_by(|x, y| x.total_cmp(y));
        residuals[residuals.len() / 2]
    };

    let mut best: Option<(f32, Similarity)> = fit_similarity(src, dst).map(|m| (median_residual(&m), m));
    for i in 0..src.len() {
        for j in i + 1..src.len() {
            let pair_src = [src[i], src[j]];
            let pair_dst = [dst[i], dst[j]];
            if let Some(model) = fit_similarity(&pair_src, &pair_dst) {
                let med = median_residual(&model);
                if best.as_ref().map(|(m, _)| med < *m).unwrap_or(true) {
                    best = Some((med, model));
                }
            }
        }
    }

    let (med, model) = best?;
    // Refit on inliers of the winning model.
    let threshold = (med.max(1e-6)) * 6.25; // 2.5 sigma equivalent
    let mut in_src = Vec::new();
    let mut in_dst = Vec::new();
    for (p, q) in src.iter().zip(dst) {
        if model.residual_sq(*p, *q) <= threshold {
            in_src.push(*p);
            in_dst.push(*q);
        }
    }
    if in_src.len() >= 2 {
        fit_similarity(&in_src, &in_dst).or(Some(model))
    } else {
        Some(model)
    }
}

/// Warp the frame so the detected landmarks land on the canonical template.
pub fn align_face(
    frame: &RgbImage,
    landmarks: &[Point2f; 5],
    width: i32,
    height: i32,
) -> Result<RgbImage> {
    let template = canonical_face_template(width, height);
    let similarity = estimate_similarity_lmeds(landmarks, &template)
        .ok_or_else(|| Error::internal("degenerate landmark configuration"))?;
    let projection = similarity
        .to_projection()
        .ok_or_else(|| Error::internal("non-invertible alignment transform"))?;
    let mut out = RgbImage::new(width as u32, height as u32);
    warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Ok(out)
}

/// Perspective-rectify a quadrilateral (four keypoints, clockwise from
/// top-left) into a `width × height` canvas.
pub fn warp_quad(frame: &RgbImage, quad: &[Point2f; 4], width: i32, height: i32) -> Result<RgbImage> {
    let from = [
        (quad[0].x, quad[0].y),
        (quad[1].x, quad[1].y),
        (quad[2].x, quad[2].y),
        (quad[3].x, quad[3].y),
    ];
    let to = [
        (0.0, 0.0),
        ((width - 1) as f32, 0.0),
        ((width - 1) as f32, (height - 1) as f32),
        (0.0, (height - 1) as f32),
    ];
    let projection = Projection::from_control_points(from, to)
        .ok_or_else(|| Error::internal("degenerate plate quadrilateral"))?;
    let mut out = RgbImage::new(width as u32, height as u32);
    warp_into(frame, &projection, Interpolation::Bilinear, Rgb([114, 114, 114]), &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_fit_recovers_known_transform() {
        // s = 2, θ = 90°, t = (10, -5)
        let truth = Similarity {
            a: 0.0,
            b: 2.0,
            tx: 10.0,
            ty: -5.0,
        };
        let src = [
            Point2f::new(0.0, 0.0),
            Point2f::new(4.0, 0.0),
            Point2f::new(4.0, 3.0),
            Point2f::new(0.0, 3.0),
            Point2f::new(2.0, 1.5),
        ];
        let dst: Vec<Point2f> = src.iter().map(|p| truth.apply(*p)).collect();
        let fit = estimate_similarity_lmeds(&src, &dst).unwrap();
        assert!((fit.a - truth.a).abs() < 1e-4);
        assert!((fit.b - truth.b).abs() < 1e-4);
        assert!((fit.tx - truth.tx).abs() < 1e-3);
        assert!((fit.ty - truth.ty).abs() < 1e-3);
    }

    #[test]
    fn lmeds_ignores_single_outlier() {
        let truth = Similarity {
            a: 1.5,
            b: 0.0,
            tx: 3.0,
            ty: 7.0,
        };
        let src = [
            Point2f::new(0.0, 0.0),
            Point2f::new(10.0, 0.0),
            Point2f::new(10.0, 10.0),
            Point2f::new(0.0, 10.0),
            Point2f::new(5.0, 5.0),
        ];
        let mut dst: Vec<Point2f> = src.iter().map(|p| truth.apply(*p)).collect();
        dst[4] = Point2f::new(500.0, -400.0); // gross outlier
        let fit = estimate_similarity_lmeds(&src, &dst).unwrap();
        assert!((fit.a - truth.a).abs() < 1e-2);
        assert!((fit.b - truth.b).abs() < 1e-2);
    }

    #[test]
    fn canonical_template_scales() {
        let t112 = canonical_face_template(112, 112);
        assert!((t112[2].x - 56.0252).abs() < 1e-4);
        let t224 = canonical_face_template(224, 224);
        assert!((t224[2].x - 2.0 * 56.0252).abs() < 1e-3);
    }

    #[test]
    fn warp_quad_produces_requested_size() {
        let frame = RgbImage::from_pixel(100, 100, Rgb([10, 20, 30]));
        let quad = [
            Point2f::new(10.0, 10.0),
            Point2f::new(90.0, 12.0),
            Point2f::new(88.0, 40.0),
            Point2f::new(12.0, 38.0),
        ];
        let out = warp_quad(&frame, &quad, 160, 34).unwrap();
        assert_eq!(out.dimensions(), (160, 34));
    }
}
