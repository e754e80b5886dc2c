//! Decoding of the vehicle and plate detector outputs, non-maximum
//! suppression, and the geometric filters applied before recognition.

use fp_domain::geometry::{boxes_intersect, intersection_area, polygon_area, Point2f, RectF};
use fp_domain::lprs::StreamConfig;
use fp_imaging::Letterbox;

use super::{LicensePlate, Vehicle};

/// Detector outputs are row-major `[rows × columns]` tensors; YOLO heads
/// emit one candidate per column.
fn at(data: &[f32], cols: usize, row: usize, col: usize) -> f32 {
    data[row * cols + col]
}

fn rect_of(bbox: &[f32; 4]) -> RectF {
    RectF::from_corners(bbox[0], bbox[1], bbox[2], bbox[3])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vehicle detector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rows of the vehicle head: cx, cy, w, h and the class confidences.
const VD_ROWS: usize = 7;
const BBOX_ROWS: usize = 4;

/// Decode vehicle candidates: xywh → corner boxes mapped back through the
/// letterbox, clamped to the frame, with tiny detections dropped by the
/// area-ratio threshold.
pub fn decode_vehicles(
    data: &[f32],
    config: &StreamConfig,
    letterbox: &Letterbox,
    frame_width: i32,
    frame_height: i32,
) -> Vec<Vehicle> {
    let cols = data.len() / VD_ROWS;
    let mut vehicles = Vec::new();
    if cols == 0 {
        return vehicles;
    }
    let screen_area = (frame_width * frame_height) as f32;
    for j in 0..cols {
        let confidence = at(data, cols, BBOX_ROWS, j);
        if confidence <= config.vehicle_confidence {
            continue;
        }
        let cx = at(data, cols, 0, j);
        let cy = at(data, cols, 1, j);
        let w = at(data, cols, 2, j);
        let h = at(data, cols, 3, j);
        let xmin = letterbox.unmap_x(cx - w / 2.0).max(0.0);
        let ymin = letterbox.unmap_y(cy - h / 2.0).max(0.0);
        let xmax = letterbox.unmap_x(cx + w / 2.0).min((frame_width - 1) as f32);
        let ymax = letterbox.unmap_y(cy + h / 2.0).min((frame_height - 1) as f32);

        let vehicle_area = (xmax - xmin + 1.0) * (ymax - ymin + 1.0);
        if vehicle_area / screen_area < config.vehicle_area_ratio_threshold {
            continue;
        }
        vehicles.push(Vehicle {
            bbox: [xmin, ymin, xmax, ymax],
            confidence,
            is_special: false,
            plates: Vec::new(),
        });
    }
    nms_vehicles(&mut vehicles, config.vehicle_iou_threshold);
    vehicles
}

pub fn nms_vehicles(vehicles: &mut Vec<Vehicle>, threshold: f32) {
    vehicles.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut m = 0;
    while m < vehicles.len() {
        let keep = rect_of(&vehicles[m].bbox);
        let mut n = m + 1;
        while n < vehicles.len() {
            if keep.iou(&rect_of(&vehicles[n].bbox)) > threshold {
                vehicles.remove(n);
            } else {
                n += 1;
            }
        }
        m += 1;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plate detector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const KPT_COUNT: usize = 8;

/// Decode plate candidates from a per-vehicle crop. Rows: 4 bbox, one
/// confidence per plate class, then four keypoint coordinate pairs.
/// Coordinates come back in absolute frame space (vehicle offset applied).
pub fn decode_plates(
    data: &[f32],
    plate_class_count: usize,
    config: &StreamConfig,
    letterbox: &Letterbox,
    vehicle_bbox: &[f32; 4],
) -> Vec<LicensePlate> {
    let rows = BBOX_ROWS + plate_class_count + KPT_COUNT;
    let cols = data.len() / rows;
    let kpts_start = BBOX_ROWS + plate_class_count;
    let mut plates = Vec::new();
    if cols == 0 {
        return plates;
    }
    for j in 0..cols {
        for k in 0..plate_class_count {
            let confidence = at(data, cols, BBOX_ROWS + k, j);
            if confidence <= config.plate_confidence {
                continue;
            }
            let cx = at(data, cols, 0, j);
            let cy = at(data, cols, 1, j);
            let w = at(data, cols, 2, j);
            let h = at(data, cols, 3, j);
            let mut kpts = [0.0f32; 8];
            for (l, kpt) in kpts.iter_mut().enumerate() {
                let value = at(data, cols, kpts_start + l, j);
                *kpt = if l % 2 == 0 {
                    vehicle_bbox[0] + letterbox.unmap_x(value)
                } else {
                    vehicle_bbox[1] + letterbox.unmap_y(value)
                };
            }
            plates.push(LicensePlate {
                bbox: [
                    vehicle_bbox[0] + letterbox.unmap_x(cx - w / 2.0),
                    vehicle_bbox[1] + letterbox.unmap_y(cy - h / 2.0),
                    vehicle_bbox[0] + letterbox.unmap_x(cx + w / 2.0),
                    vehicle_bbox[1] + letterbox.unmap_y(cy + h / 2.0),
                ],
                confidence,
                kpts,
                plate_class: k as i32,
                numbers: Vec::new(),
            });
        }
    }
    nms_plates(&mut plates);
    plates
}

/// Plates of the same class suppress each other on any overlap at all.
pub fn nms_plates(plates: &mut Vec<LicensePlate>) {
    plates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut m = 0;
    while m < plates.len() {
        let keep_bbox = plates[m].bbox;
        let keep_class = plates[m].plate_class;
        let mut n = m + 1;
        while n < plates.len() {
            if plates[n].plate_class == keep_class && boxes_intersect(&keep_bbox, &plates[n].bbox) {
                plates.remove(n);
            } else {
                n += 1;
            }
        }
        m += 1;
    }
}

fn plate_quad(plate: &LicensePlate) -> Vec<Point2f> {
    vec![
        Point2f::new(plate.kpts[0], plate.kpts[1]),
        Point2f::new(plate.kpts[2], plate.kpts[3]),
        Point2f::new(plate.kpts[4], plate.kpts[5]),
        Point2f::new(plate.kpts[6], plate.kpts[7]),
    ]
}

fn plate_height(plate: &LicensePlate) -> f32 {
    let left = ((plate.kpts[0] - plate.kpts[6]).powi(2) + (plate.kpts[1] - plate.kpts[7]).powi(2)).sqrt();
    let right = ((plate.kpts[2] - plate.kpts[4]).powi(2) + (plate.kpts[3] - plate.kpts[5]).powi(2)).sqrt();
    left.min(right)
}

/// Drop plates that do not lie fully inside any work-area polygon, and
/// plates smaller than the minimum height.
pub fn filter_plates(
    plates: &mut Vec<LicensePlate>,
    config: &StreamConfig,
    frame_width: i32,
    frame_height: i32,
) {
    if config.work_area.is_empty() && config.min_plate_height <= 0 {
        return;
    }
    let work_area = config.work_area_absolute(frame_width, frame_height);
    plates.retain(|plate| {
        if !config.work_area.is_empty() {
            const CONTAINMENT: f32 = 0.999;
            let quad = plate_quad(plate);
            let quad_area = polygon_area(&quad);
            let contained = work_area.iter().any(|polygon| {
                let inter = intersection_area(polygon, &quad);
                let max = quad_area.max(inter);
                max > 0.0 && inter.min(quad_area) / max > CONTAINMENT
            });
            if !contained {
                return false;
            }
        }
        config.min_plate_height <= 0 || plate_height(plate) >= config.min_plate_height as f32
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-vehicle dedup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DUPLICATE_PLATE_IOU: f32 = 0.7;

/// The same physical plate can land on two overlapping vehicle boxes; keep
/// the copy on the smaller-area (or smaller plate-count) vehicle. Vehicles
/// left with no plates and no special mark are dropped, as are vehicles
/// outside every work-area polygon.
pub fn remove_duplicate_plates(
    vehicles: &mut Vec<Vehicle>,
    config: &StreamConfig,
    frame_width: i32,
    frame_height: i32,
) {
    for i in 0..vehicles.len() {
        for j in i + 1..vehicles.len() {
            if !boxes_intersect(&vehicles[i].bbox, &vehicles[j].bbox) {
                continue;
            }
            let mut m = 0;
            'outer: while m < vehicles[i].plates.len() {
                let mut n = 0;
                while n < vehicles[j].plates.len() {
                    let r1 = rect_of(&vehicles[i].plates[m].bbox);
                    let r2 = rect_of(&vehicles[j].plates[n].bbox);
                    if r1.iou(&r2) > DUPLICATE_PLATE_IOU {
                        let drop_i = if vehicles[i].plates.len() == vehicles[j].plates.len() {
                            rect_of(&vehicles[i].bbox).area() > rect_of(&vehicles[j].bbox).area()
                        } else {
                            vehicles[i].plates.len() > vehicles[j].plates.len()
                        };
                        if drop_i {
                            vehicles[i].plates.remove(m);
                            continue 'outer;
                        } else {
                            vehicles[j].plates.remove(n);
                            continue;
                        }
                    }
                    n += 1;
                }
                m += 1;
            }
        }
    }

    let work_area = config.work_area_absolute(frame_width, frame_height);
    vehicles.retain(|vehicle| {
        if vehicle.plates.is_empty() && !vehicle.is_special {
            return false;
        }
        if work_area.is_empty() {
            return true;
        }
        let polygon = vec![
            Point2f::new(vehicle.bbox[0], vehicle.bbox[1]),
            Point2f::new(vehicle.bbox[2], vehicle.bbox[1]),
            Point2f::new(vehicle.bbox[2], vehicle.bbox[3]),
            Point2f::new(vehicle.bbox[0], vehicle.bbox[3]),
        ];
        work_area
            .iter()
            .any(|wa| intersection_area(wa, &polygon) > 0.0)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plate(bbox: [f32; 4], class: i32, numbers: usize) -> LicensePlate {
        LicensePlate {
            bbox,
            confidence: 0.9,
            kpts: [
                bbox[0], bbox[1], bbox[2], bbox[1], bbox[2], bbox[3], bbox[0], bbox[3],
            ],
            plate_class: class,
            numbers: (0..numbers)
                .map(|i| super::super::PlateNumber {
                    number: format!("A{i:03}BC77"),
                    score: 0.9,
                })
                .collect(),
        }
    }

    fn vehicle(bbox: [f32; 4], plates: Vec<LicensePlate>) -> Vehicle {
        Vehicle {
            bbox,
            confidence: 0.8,
            is_special: false,
            plates,
        }
    }

    #[test]
    fn decode_vehicles_filters_small_and_low_confidence() {
        let config = StreamConfig::default();
        let letterbox = Letterbox {
            scale: 1.0,
            shift_x: 0.0,
            shift_y: 0.0,
        };
        // Two columns: one confident large vehicle, one confident speck.
        let cols = 2;
        let mut data = vec![0.0f32; VD_ROWS * cols];
        // column 0: center (320, 320), 500x400, conf 0.9
        data[cols * 0 + 0] = 320.0;
        data[cols * 1 + 0] = 320.0;
        data[cols * 2 + 0] = 500.0;
        data[cols * 3 + 0] = 400.0;
        data[cols * 4 + 0] = 0.9;
        // column 1: 4x4 speck, conf 0.9
        data[cols * 0 + 1] = 10.0;
        data[cols * 1 + 1] = 10.0;
        data[cols * 2 + 1] = 4.0;
        data[cols * 3 + 1] = 4.0;
        data[cols * 4 + 1] = 0.9;

        let vehicles = decode_vehicles(&data, &config, &letterbox, 640, 640);
        assert_eq!(vehicles.len(), 1);
        assert!((vehicles[0].bbox[0] - 70.0).abs() < 1e-3);
    }

    #[test]
    fn plate_nms_same_class_only() {
        let mut plates = vec![
            plate([0.0, 0.0, 100.0, 40.0], 0, 0),
            plate([10.0, 5.0, 105.0, 42.0], 0, 0),
            plate([12.0, 6.0, 104.0, 41.0], 1, 0),
        ];
        nms_plates(&mut plates);
        assert_eq!(plates.len(), 2);
        assert!(plates.iter().any(|p| p.plate_class == 1));
    }

    #[test]
    fn duplicate_plate_kept_on_smaller_vehicle() {
        let shared = [100.0, 100.0, 200.0, 140.0];
        let mut vehicles = vec![
            vehicle([0.0, 0.0, 600.0, 400.0], vec![plate(shared, 0, 1)]),
            vehicle([80.0, 80.0, 260.0, 220.0], vec![plate(shared, 0, 1)]),
        ];
        let config = StreamConfig::default();
        remove_duplicate_plates(&mut vehicles, &config, 640, 480);
        // The large vehicle lost its plate and was dropped.
        assert_eq!(vehicles.len(), 1);
        assert!((vehicles[0].bbox[2] - 260.0).abs() < 1e-6);
        assert_eq!(vehicles[0].plates.len(), 1);
    }

    #[test]
    fn plateless_non_special_vehicles_dropped() {
        let mut vehicles = vec![
            vehicle([0.0, 0.0, 100.0, 100.0], vec![]),
            Vehicle {
                is_special: true,
                ..vehicle([200.0, 0.0, 300.0, 100.0], vec![])
            },
        ];
        let config = StreamConfig::default();
        remove_duplicate_plates(&mut vehicles, &config, 640, 480);
        assert_eq!(vehicles.len(), 1);
        assert!(vehicles[0].is_special);
    }

    #[test]
    fn work_area_filter_keeps_contained_plates() {
        let mut config = StreamConfig::default();
        config.apply(&json!({
            "work-area": [[[0.0, 0.0], [50.0, 0.0], [50.0, 100.0], [0.0, 100.0]]]
        }));
        // Frame 1000x1000: the work polygon covers x in [0, 500].
        let mut plates = vec![
            plate([10.0, 10.0, 110.0, 50.0], 0, 0),
            plate([700.0, 10.0, 800.0, 50.0], 0, 0),
        ];
        filter_plates(&mut plates, &config, 1000, 1000);
        assert_eq!(plates.len(), 1);
        assert!((plates[0].bbox[0] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn min_height_filter() {
        let mut config = StreamConfig::default();
        config.apply(&json!({"min-plate-height": 30}));
        let mut plates = vec![
            plate([0.0, 0.0, 100.0, 40.0], 0, 0),
            plate([0.0, 100.0, 100.0, 110.0], 0, 0),
        ];
        filter_plates(&mut plates, &config, 1000, 1000);
        assert_eq!(plates.len(), 1);
        assert!((plates[0].bbox[3] - 40.0).abs() < 1e-6);
    }
}
