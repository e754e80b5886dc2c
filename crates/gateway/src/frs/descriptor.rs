//! Descriptor vector math and the binary event-data record format.

use fp_domain::{Error, Result};

/// Length of the ASCII event id in a binary record: a uuid with the dashes
/// stripped.
pub const EVENT_ID_LEN: usize = 32;

/// Reinterpret raw little-endian bytes as a float vector.
pub fn floats_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn bytes_from_floats(floats: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(floats.len() * 4);
    for value in floats {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// L2-normalize in place. A zero norm is substituted with 1 so the null
/// vector stays null instead of becoming NaN.
pub fn normalize_l2(v: &mut [f32]) {
    let mut norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm <= 0.0 {
        norm = 1.0;
    }
    for value in v.iter_mut() {
        *value = (*value as f64 / norm) as f32;
    }
}

/// Dot product; equals the cosine similarity when both inputs are
/// L2-normalized (the cached-gallery case).
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum()
}

/// Full cosine similarity for raw (unnormalized) descriptors, as read back
/// from binary event data.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }
    let mut num = 0.0f64;
    let mut den_a = 0.0f64;
    let mut den_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        num += *x as f64 * *y as f64;
        den_a += *x as f64 * *x as f64;
        den_b += *y as f64 * *y as f64;
    }
    num / den_a.sqrt() / den_b.sqrt()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Binary event-data records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One record of a `.dat` event file: 32 ASCII bytes of event id, an int32
/// LE face position, and the raw descriptor floats. Files are plain
/// concatenations of records; readers chunk by the fixed record size.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub position: i32,
    pub descriptor: Vec<f32>,
}

pub fn record_size(descriptor_len: usize) -> usize {
    EVENT_ID_LEN + 4 + descriptor_len * 4
}

pub fn encode_record(record: &EventRecord) -> Result<Vec<u8>> {
    if record.event_id.len() != EVENT_ID_LEN {
        return Err(Error::internal(format!(
            "event id must be {EVENT_ID_LEN} chars, got {}",
            record.event_id.len()
        )));
    }
    let mut bytes = Vec::with_capacity(record_size(record.descriptor.len()));
    bytes.extend_from_slice(record.event_id.as_bytes());
    bytes.extend_from_slice(&record.position.to_le_bytes());
    bytes.extend_from_slice(&bytes_from_floats(&record.descriptor));
    Ok(bytes)
}

/// Split a `.dat` file into records of the given descriptor length; a
/// trailing partial record is dropped.
pub fn decode_records(bytes: &[u8], descriptor_len: usize) -> Vec<EventRecord> {
    let size = record_size(descriptor_len);
    bytes
        .chunks_exact(size)
        .map(|chunk| EventRecord {
            event_id: String::from_utf8_lossy(&chunk[..EVENT_ID_LEN]).into_owned(),
            position: i32::from_le_bytes([
                chunk[EVENT_ID_LEN],
                chunk[EVENT_ID_LEN + 1],
                chunk[EVENT_ID_LEN + 2],
                chunk[EVENT_ID_LEN + 3],
            ]),
            descriptor: floats_from_bytes(&chunk[EVENT_ID_LEN + 4..]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_makes_unit_vector() {
        let mut v = vec![3.0, 4.0];
        normalize_l2(&mut v);
        let norm: f64 = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_keeps_zero_vector() {
        let mut v = vec![0.0; 8];
        normalize_l2(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_self_is_one() {
        let v: Vec<f32> = (0..512).map(|i| (i as f32).sin()).collect();
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_symmetric_and_bounded() {
        let a: Vec<f32> = (0..512).map(|i| (i as f32 * 0.1).sin()).collect();
        let b: Vec<f32> = (0..512).map(|i| (i as f32 * 0.2).cos()).collect();
        let ab = cosine(&a, &b);
        let ba = cosine(&b, &a);
        assert!((ab - ba).abs() < 1e-9);
        assert!(ab <= 1.0 + 1e-9);
    }

    #[test]
    fn dot_equals_cosine_for_normalized() {
        let mut a: Vec<f32> = (0..128).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut b: Vec<f32> = (0..128).map(|i| (i as f32 * 0.7).cos()).collect();
        let full = cosine(&a, &b);
        normalize_l2(&mut a);
        normalize_l2(&mut b);
        assert!((dot(&a, &b) - full).abs() < 1e-5);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        assert_eq!(dot(&[1.0], &[1.0, 2.0]), -1.0);
        assert_eq!(cosine(&[], &[]), -1.0);
    }

    #[test]
    fn bytes_round_trip() {
        let floats = vec![1.5f32, -2.25, 0.0, 1e-7];
        assert_eq!(floats_from_bytes(&bytes_from_floats(&floats)), floats);
    }

    #[test]
    fn record_encode_decode_chunking() {
        let descriptor: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
        let r1 = EventRecord {
            event_id: "0123456789abcdef0123456789abcdef".into(),
            position: 0,
            descriptor: descriptor.clone(),
        };
        let r2 = EventRecord {
            event_id: "fedcba9876543210fedcba9876543210".into(),
            position: 3,
            descriptor,
        };
        let mut bytes = encode_record(&r1).unwrap();
        bytes.extend(encode_record(&r2).unwrap());
        // Trailing garbage shorter than a record is ignored.
        bytes.extend_from_slice(&[0u8; 7]);

        let decoded = decode_records(&bytes, 512);
        assert_eq!(decoded, vec![r1, r2]);
    }

    #[test]
    fn record_rejects_bad_event_id() {
        let record = EventRecord {
            event_id: "short".into(),
            position: 0,
            descriptor: vec![0.0],
        };
        assert!(encode_record(&record).is_err());
    }
}
