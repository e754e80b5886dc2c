//! Character decoding: grouping overlapping character detections into
//! alternatives, candidate expansion, and plate-number validation.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::LazyLock;

use fp_domain::geometry::RectF;
use fp_domain::lprs::StreamConfig;
use fp_imaging::Letterbox;
use regex::Regex;

use super::{CharDetection, PlateNumber, PLATE_CLASS_RU_1, PLATE_CLASS_RU_1A};

/// Character classes of the recognizer head, in class-index order. The last
/// entry is the blank class.
pub const CHAR_LABELS: [&str; 37] = [
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "A", "B", "C", "D", "E", "F", "G", "H", "I",
    "J", "K", "L", "M", "N", "O", "P", "Q", "R", "S", "T", "U", "V", "W", "X", "Y", "Z", "",
];

const CHAR_ROWS: usize = 40;
const BBOX_ROWS: usize = 4;

// Russian civil plates: a letter, three digits, two letters, a 2-3 digit
// region code; letters restricted to the Cyrillic-lookalike alphabet.
static RU_PLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ABCEHKMOPTXY]\d{3}[ABCEHKMOPTXY]{2}\d{2,3}$").expect("static plate regex")
});

pub fn is_valid_plate_number(number: &str, plate_class: i32) -> bool {
    if plate_class == PLATE_CLASS_RU_1 || plate_class == PLATE_CLASS_RU_1A {
        return RU_PLATE.is_match(number);
    }
    true
}

fn rect_of(bbox: &[f32; 4]) -> RectF {
    RectF::from_corners(bbox[0], bbox[1], bbox[2], bbox[3])
}

/// Decode character candidates from the recognizer output (`[40 × cells]`:
/// 4 bbox rows, 36 class rows). Coordinates are mapped back into the
/// rectified plate image.
pub fn decode_chars(
    data: &[f32],
    plate_class: i32,
    config: &StreamConfig,
    letterbox: &Letterbox,
) -> Vec<CharDetection> {
    let cols = data.len() / CHAR_ROWS;
    let mut chars = Vec::new();
    for j in 0..cols {
        for k in BBOX_ROWS..CHAR_ROWS {
            let confidence = data[k * cols + j];
            if confidence <= config.char_score {
                continue;
            }
            let cx = data[j];
            let cy = data[cols + j];
            let w = data[2 * cols + j];
            let h = data[3 * cols + j];
            chars.push(CharDetection {
                bbox: [
                    letterbox.unmap_x(cx - w / 2.0),
                    letterbox.unmap_y(cy - h / 2.0),
                    letterbox.unmap_x(cx + w / 2.0),
                    letterbox.unmap_y(cy + h / 2.0),
                ],
                confidence,
                char_class: (k - BBOX_ROWS) as i32,
                plate_class,
            });
        }
    }
    chars
}

/// Per-class NMS: identical character classes suppress each other above the
/// IoU threshold; distinct classes survive as alternatives.
pub fn nms_chars(chars: &mut Vec<CharDetection>, threshold: f32) {
    chars.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut m = 0;
    while m < chars.len() {
        let keep_bbox = chars[m].bbox;
        let keep_class = chars[m].char_class;
        let mut n = m + 1;
        while n < chars.len() {
            if chars[n].char_class == keep_class
                && rect_of(&keep_bbox).iou(&rect_of(&chars[n].bbox)) > threshold
            {
                chars.remove(n);
            } else {
                n += 1;
            }
        }
        m += 1;
    }
}

/// Reading order: single-line plates sort by x; double-line plates sort by
/// row first (using the vertical midpoint when boxes overlap), then by x.
pub fn cmp_chars_position(a: &CharDetection, b: &CharDetection) -> Ordering {
    if a.plate_class == PLATE_CLASS_RU_1A {
        if a.bbox[3] < b.bbox[1] {
            return Ordering::Less;
        }
        if a.bbox[1] > b.bbox[3] {
            return Ordering::Greater;
        }
        let y = a.bbox[1] + 0.5 * (a.bbox[3] - a.bbox[1]);
        if y < b.bbox[1] {
            return Ordering::Less;
        }
        if y > b.bbox[3] {
            return Ordering::Greater;
        }
    }
    a.bbox[0].total_cmp(&b.bbox[0])
}

/// Assemble candidate numbers from positioned characters. Characters whose
/// boxes overlap above the IoU threshold are alternatives for the same
/// position and expand the candidate set multiplicatively; candidates are
/// then filtered by the plate-class validator and sorted by score.
pub fn assemble_numbers(
    chars: &mut Vec<CharDetection>,
    plate_class: i32,
    char_iou_threshold: f32,
) -> Vec<PlateNumber> {
    chars.sort_by(cmp_chars_position);

    let mut numbers = vec![PlateNumber {
        number: String::new(),
        score: 1.0,
    }];
    let mut used: HashSet<usize> = HashSet::new();
    for i in 0..chars.len() {
        if used.contains(&i) {
            continue;
        }
        let mut alternatives = vec![i];
        for j in i + 1..chars.len() {
            if used.contains(&j) {
                continue;
            }
            if rect_of(&chars[i].bbox).iou(&rect_of(&chars[j].bbox)) > char_iou_threshold {
                alternatives.push(j);
                used.insert(j);
            }
        }
        if alternatives.len() > 1 {
            let copies = numbers.clone();
            for _ in 1..alternatives.len() {
                numbers.extend(copies.iter().cloned());
            }
        }
        let total = numbers.len();
        for (k, number) in numbers.iter_mut().enumerate() {
            let m = k * alternatives.len() / total;
            let ch = &chars[alternatives[m]];
            number.number += CHAR_LABELS[ch.char_class as usize];
            number.score *= ch.confidence;
        }
    }

    numbers.retain(|n| is_valid_plate_number(&n.number, plate_class));
    numbers.sort_by(|a, b| b.score.total_cmp(&a.score));
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(x: f32, class: i32, confidence: f32) -> CharDetection {
        CharDetection {
            bbox: [x, 0.0, x + 10.0, 20.0],
            confidence,
            char_class: class,
            plate_class: PLATE_CLASS_RU_1,
        }
    }

    fn class_of(label: &str) -> i32 {
        CHAR_LABELS.iter().position(|l| *l == label).unwrap() as i32
    }

    #[test]
    fn plate_validation() {
        assert!(is_valid_plate_number("A123BC77", PLATE_CLASS_RU_1));
        assert!(is_valid_plate_number("X001YE777", PLATE_CLASS_RU_1A));
        // Wrong letter alphabet (D is not in the lookalike set).
        assert!(!is_valid_plate_number("D123BC77", PLATE_CLASS_RU_1));
        // Digit/letter positions swapped.
        assert!(!is_valid_plate_number("1A23BC77", PLATE_CLASS_RU_1));
        // Too short / too long.
        assert!(!is_valid_plate_number("A123BC7", PLATE_CLASS_RU_1));
        assert!(!is_valid_plate_number("A123BC7777", PLATE_CLASS_RU_1));
    }

    #[test]
    fn assemble_simple_number() {
        let labels = ["A", "1", "2", "3", "B", "C", "7", "7"];
        let mut chars: Vec<CharDetection> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| ch(i as f32 * 15.0, class_of(l), 0.9))
            .collect();
        let numbers = assemble_numbers(&mut chars, PLATE_CLASS_RU_1, 0.7);
        assert_eq!(numbers.len(), 1);
        assert_eq!(numbers[0].number, "A123BC77");
    }

    #[test]
    fn overlapping_alternatives_expand_candidates() {
        // Position 0 is ambiguous between A and M; only A yields a valid plate.
        let labels = ["1", "2", "3", "B", "C", "7", "7"];
        let mut chars: Vec<CharDetection> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| ch((i + 1) as f32 * 15.0, class_of(l), 0.9))
            .collect();
        chars.push(ch(0.0, class_of("A"), 0.8));
        let mut alt = ch(0.5, class_of("M"), 0.7);
        alt.bbox = [0.5, 0.0, 10.5, 20.0];
        chars.push(alt);
        let numbers = assemble_numbers(&mut chars, PLATE_CLASS_RU_1, 0.7);
        assert_eq!(numbers.len(), 2);
        let set: HashSet<&str> = numbers.iter().map(|n| n.number.as_str()).collect();
        assert!(set.contains("A123BC77"));
        assert!(set.contains("M123BC77"));
        // Higher-confidence alternative sorts first.
        assert_eq!(numbers[0].number, "A123BC77");
    }

    #[test]
    fn invalid_candidates_filtered_out() {
        let labels = ["Z", "Z", "Z"];
        let mut chars: Vec<CharDetection> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| ch(i as f32 * 15.0, class_of(l), 0.9))
            .collect();
        let numbers = assemble_numbers(&mut chars, PLATE_CLASS_RU_1, 0.7);
        assert!(numbers.is_empty());
    }

    #[test]
    fn double_line_reading_order() {
        // Two rows: "A1" on top, "23" below; expect A-1-2-3 order.
        let mk = |x: f32, y: f32, label: &str| CharDetection {
            bbox: [x, y, x + 10.0, y + 18.0],
            confidence: 0.9,
            char_class: class_of(label),
            plate_class: PLATE_CLASS_RU_1A,
        };
        let mut chars = vec![
            mk(20.0, 40.0, "3"),
            mk(0.0, 0.0, "A"),
            mk(0.0, 40.0, "2"),
            mk(20.0, 0.0, "1"),
        ];
        chars.sort_by(cmp_chars_position);
        let text: String = chars
            .iter()
            .map(|c| CHAR_LABELS[c.char_class as usize])
            .collect();
        assert_eq!(text, "A123");
    }

    #[test]
    fn char_nms_same_class_suppresses() {
        let mut chars = vec![ch(0.0, 5, 0.9), ch(0.5, 5, 0.8), ch(0.5, 6, 0.7)];
        chars[1].bbox = [0.5, 0.0, 10.5, 20.0];
        chars[2].bbox = [0.5, 0.0, 10.5, 20.0];
        nms_chars(&mut chars, 0.7);
        assert_eq!(chars.len(), 2);
        assert!(chars.iter().any(|c| c.char_class == 6));
    }
}
