//! Face detector output decoding, non-maximum suppression, the softmax
//! classifier head, and the landmark frontality predicate.

use fp_domain::geometry::{dist, iou_corners, Point2f};
use fp_imaging::Letterbox;

/// Output tensor names of the face detector: three score maps, three bbox
/// maps and three keypoint maps, one per stride.
pub const FD_OUTPUT_TENSORS: [&str; 9] = [
    "448", "471", "494", "451", "474", "497", "454", "477", "500",
];

pub const FD_STRIDES: [usize; 3] = [8, 16, 32];

const NMS_THRESHOLD: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct FaceDetection {
    /// `[x1, y1, x2, y2]` in original frame coordinates.
    pub bbox: [f32; 4],
    pub confidence: f32,
    /// right eye, left eye, nose, right mouth, left mouth
    pub landmarks: [Point2f; 5],
}

/// Decode one stride of detector output. Each spatial cell carries two
/// anchors; scores are `[2·cells]`, bbox deltas `[2·cells × 4]` and keypoint
/// deltas `[2·cells × 10]`, all pre-multiplied by the stride.
pub fn decode_stride(
    stride: usize,
    input_width: i32,
    input_height: i32,
    scores: &[f32],
    bbox_preds: &[f32],
    kps_preds: &[f32],
    confidence_threshold: f32,
    letterbox: &Letterbox,
    out: &mut Vec<FaceDetection>,
) {
    let height = input_height as usize / stride;
    let width = input_width as usize / stride;
    let cells = height * width;
    if scores.len() < 2 * cells || bbox_preds.len() < 8 * cells || kps_preds.len() < 20 * cells {
        return;
    }
    for k in 0..cells {
        let px = (stride * (k % height)) as f32;
        let py = (stride * (k / height)) as f32;
        for anchor in 0..2 {
            let index = 2 * k + anchor;
            let score = scores[index];
            if score < confidence_threshold {
                continue;
            }
            let b = &bbox_preds[index * 4..index * 4 + 4];
            let kp = &kps_preds[index * 10..index * 10 + 10];
            let s = stride as f32;
            let mut landmarks = [Point2f::default(); 5];
            for j in 0..5 {
                landmarks[j] = Point2f::new(
                    letterbox.unmap_x(px + kp[2 * j] * s),
                    letterbox.unmap_y(py + kp[2 * j + 1] * s),
                );
            }
            out.push(FaceDetection {
                bbox: [
                    letterbox.unmap_x(px - b[0] * s),
                    letterbox.unmap_y(py - b[1] * s),
                    letterbox.unmap_x(px + b[2] * s),
                    letterbox.unmap_y(py + b[3] * s),
                ],
                confidence: score,
                landmarks,
            });
        }
    }
}

/// Greedy NMS at IoU 0.4, strongest detection first.
pub fn nms(detections: &mut Vec<FaceDetection>) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut m = 0;
    while m < detections.len() {
        let keep = detections[m].bbox;
        let mut n = m + 1;
        while n < detections.len() {
            if iou_corners(&keep, &detections[n].bbox) > NMS_THRESHOLD {
                detections.remove(n);
            } else {
                n += 1;
            }
        }
        m += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceClass {
    pub class_index: i32,
    pub score: f32,
}

/// Softmax over classifier logits, strongest class first.
pub fn softmax(logits: &[f32]) -> Vec<FaceClass> {
    let sum: f32 = logits.iter().map(|v| v.exp()).sum();
    let mut classes: Vec<FaceClass> = logits
        .iter()
        .enumerate()
        .map(|(i, v)| FaceClass {
            class_index: i as i32,
            score: v.exp() / sum,
        })
        .collect();
    classes.sort_by(|a, b| b.score.total_cmp(&a.score));
    classes
}

/// Landmark-based frontality check: the nose sits between and below the
/// eyes, the eyes are not crossed over the mouth corners, and six
/// inter-landmark distance ratios all exceed the equality threshold.
pub fn is_frontal_face(landmarks: &[Point2f; 5]) -> bool {
    const EQUAL_THRESHOLD: f64 = 0.62;

    let [right_eye, left_eye, nose, right_mouth, left_mouth] = *landmarks;

    // Nose between the eyes, below both.
    if nose.x <= right_eye.x || nose.x >= left_eye.x || nose.y <= right_eye.y || nose.y <= left_eye.y
    {
        return false;
    }

    // The right eye must not be to the right of the left lip tip and vice versa.
    if right_eye.x >= left_mouth.x || left_eye.x <= right_mouth.x {
        return false;
    }

    let ratio = |d1: f64, d2: f64| d1.min(d2) / d1.max(d2);
    let d = |a: Point2f, b: Point2f| dist(a.x as f64, a.y as f64, b.x as f64, b.y as f64);

    // Eye-to-nose symmetry.
    if ratio(d(right_eye, nose), d(left_eye, nose)) <= EQUAL_THRESHOLD {
        return false;
    }
    // Mouth-to-nose symmetry.
    if ratio(d(right_mouth, nose), d(left_mouth, nose)) <= EQUAL_THRESHOLD {
        return false;
    }
    // Mouth-to-eye symmetry.
    if ratio(d(right_mouth, right_eye), d(left_mouth, left_eye)) <= EQUAL_THRESHOLD {
        return false;
    }
    // Horizontal gaps vs vertical gaps.
    let horizontal = d(right_eye, left_eye).max(d(right_mouth, left_mouth));
    let vertical = d(right_eye, right_mouth).max(d(left_eye, left_mouth));
    ratio(horizontal, vertical) > EQUAL_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A well-proportioned frontal landmark set.
    fn frontal_landmarks() -> [Point2f; 5] {
        [
            Point2f::new(38.0, 52.0),
            Point2f::new(74.0, 52.0),
            Point2f::new(56.0, 72.0),
            Point2f::new(42.0, 92.0),
            Point2f::new(71.0, 92.0),
        ]
    }

    #[test]
    fn frontal_face_accepted() {
        assert!(is_frontal_face(&frontal_landmarks()));
    }

    #[test]
    fn frontality_invariant_under_scale_and_translation() {
        let base = frontal_landmarks();
        for (scale, dx, dy) in [(0.5f32, 100.0f32, -40.0f32), (3.0, -10.0, 250.0), (17.0, 0.0, 0.0)] {
            let moved = base.map(|p| Point2f::new(p.x * scale + dx, p.y * scale + dy));
            assert!(is_frontal_face(&moved), "scale {scale} shift ({dx},{dy})");
        }
    }

    #[test]
    fn profile_face_rejected() {
        // Nose shifted far toward the right eye: asymmetric eye-to-nose.
        let mut landmarks = frontal_landmarks();
        landmarks[2] = Point2f::new(40.0, 72.0);
        assert!(!is_frontal_face(&landmarks));
    }

    #[test]
    fn nose_above_eyes_rejected() {
        let mut landmarks = frontal_landmarks();
        landmarks[2] = Point2f::new(56.0, 40.0);
        assert!(!is_frontal_face(&landmarks));
    }

    #[test]
    fn softmax_orders_and_sums_to_one() {
        let classes = softmax(&[0.2, 3.0, -1.0]);
        assert_eq!(classes[0].class_index, 1);
        let total: f32 = classes.iter().map(|c| c.score).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(classes[0].score > classes[1].score);
    }

    #[test]
    fn nms_removes_overlapping_weaker_boxes() {
        let mk = |x: f32, conf: f32| FaceDetection {
            bbox: [x, 0.0, x + 10.0, 10.0],
            confidence: conf,
            landmarks: [Point2f::default(); 5],
        };
        let mut detections = vec![mk(0.0, 0.8), mk(1.0, 0.9), mk(50.0, 0.7)];
        nms(&mut detections);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[1].confidence, 0.7);
    }

    #[test]
    fn decode_recovers_original_coordinates() {
        // One 8-stride cell grid for a 16x16 input; plant a detection in
        // anchor 0 of cell 0.
        let letterbox = Letterbox {
            scale: 0.5,
            shift_x: 0.0,
            shift_y: 0.0,
        };
        let cells = (16 / 8) * (16 / 8);
        let mut scores = vec![0.0f32; 2 * cells];
        let mut bbox = vec![0.0f32; 8 * cells];
        let mut kps = vec![0.0f32; 20 * cells];
        scores[0] = 0.95;
        bbox[0..4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]); // ±4 px around the cell origin
        for j in 0..5 {
            kps[2 * j] = 0.25; // +2 px
            kps[2 * j + 1] = 0.25;
        }
        let mut out = Vec::new();
        decode_stride(8, 16, 16, &scores, &bbox, &kps, 0.5, &letterbox, &mut out);
        assert_eq!(out.len(), 1);
        // (0 - 4) / 0.5 = -8, (0 + 4) / 0.5 = 8
        assert_eq!(out[0].bbox, [-8.0, -8.0, 8.0, 8.0]);
        assert_eq!(out[0].landmarks[0], Point2f::new(4.0, 4.0));
    }

    #[test]
    fn decode_skips_below_threshold() {
        let letterbox = Letterbox {
            scale: 1.0,
            shift_x: 0.0,
            shift_y: 0.0,
        };
        let cells = 4;
        let scores = vec![0.1f32; 2 * cells];
        let bbox = vec![0.0f32; 8 * cells];
        let kps = vec![0.0f32; 20 * cells];
        let mut out = Vec::new();
        decode_stride(8, 16, 16, &scores, &bbox, &kps, 0.5, &letterbox, &mut out);
        assert!(out.is_empty());
    }
}
