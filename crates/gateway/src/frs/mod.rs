//! Face recognition service: caches, the per-frame pipeline, event
//! emission, descriptor search and maintenance.

pub mod caches;
pub mod descriptor;
pub mod detect;
pub mod events;
pub mod maintenance;
pub mod pipeline;
pub mod search;
pub mod stats;

use std::collections::HashMap;
use std::time::Instant;

use fp_domain::geometry::{Point2f, Rect};

pub const MIME_IMAGE: &str = "image/jpeg";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATA_FILE_SUFFIX: &str = ".dat";
pub const JSON_SUFFIX: &str = ".json";

pub const FACE_CLASS_NONE: i32 = -1;
pub const FACE_CLASS_NORMAL: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Recognize,
    RegisterDescriptor,
    ProcessFrame,
    Test,
}

/// One unit of pipeline work, either scheduled (RECOGNIZE) or synchronous
/// (everything else).
#[derive(Debug, Clone)]
pub struct TaskData {
    pub id_group: i32,
    pub vstream_key: String,
    pub task_type: TaskType,
    pub frame_url: String,
    /// Face search hint for registration, zero when absent.
    pub face_hint: Rect,
    pub id_sgroup: i32,
}

impl TaskData {
    pub fn new(id_group: i32, vstream_key: String, task_type: TaskType) -> TaskData {
        TaskData {
            id_group,
            vstream_key,
            task_type,
            frame_url: String::new(),
            face_hint: Rect::default(),
            id_sgroup: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SGroupFaceData {
    pub cosine_distance: f64,
    pub id_descriptor: i32,
}

/// Everything learned about one detected face while walking the cascade.
#[derive(Debug, Clone)]
pub struct FaceData {
    pub face_rect: Rect,
    pub is_work_area: bool,
    pub is_frontal: bool,
    pub is_non_blurry: bool,
    pub face_class_index: i32,
    pub face_class_confidence: f32,
    pub cosine_distance: f64,
    pub descriptor: Vec<f32>,
    pub landmarks: Option<[Point2f; 5]>,
    pub laplacian: f64,
    pub ioa: f64,
    pub id_descriptor: i32,
    pub sg_descriptors: HashMap<i32, SGroupFaceData>,
}

impl FaceData {
    pub fn new(face_rect: Rect) -> FaceData {
        FaceData {
            face_rect,
            is_work_area: false,
            is_frontal: false,
            is_non_blurry: false,
            face_class_index: FACE_CLASS_NONE,
            face_class_confidence: 0.0,
            cosine_distance: -2.0,
            descriptor: Vec::new(),
            landmarks: None,
            laplacian: 0.0,
            ioa: 0.0,
            id_descriptor: 0,
            sg_descriptors: HashMap::new(),
        }
    }
}

/// Result returned to synchronous pipeline callers.
#[derive(Debug, Default)]
pub struct PipelineResult {
    pub id_descriptor: i32,
    pub comments: String,
    /// JPEG bytes of the registered face crop.
    pub face_image: Option<Vec<u8>>,
    pub face_rect: Rect,
    /// Recognized descriptors in detection order (PROCESS_FRAME).
    pub id_descriptors: Vec<i32>,
}

/// Unrecognized face remembered for spawned-descriptor matching; expires by
/// TTL and is pruned on every access.
#[derive(Debug, Clone)]
pub struct UnknownDescriptor {
    pub expires_at: Instant,
    pub descriptor: Vec<f32>,
    /// JPEG of the enlarged face crop.
    pub face_image: Vec<u8>,
}

/// Ring size cap; the upstream data structure was TTL-bounded only.
pub const UNKNOWN_DESCRIPTOR_CAP: usize = 1000;

pub fn prune_unknown(ring: &mut Vec<UnknownDescriptor>) {
    let now = Instant::now();
    ring.retain(|item| item.expires_at > now);
    if ring.len() > UNKNOWN_DESCRIPTOR_CAP {
        let excess = ring.len() - UNKNOWN_DESCRIPTOR_CAP;
        ring.drain(..excess);
    }
}

/// Per-stream inference counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnnStats {
    pub fd_count: i32,
    pub fc_count: i32,
    pub fr_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_ring_prunes_expired_and_caps() {
        let now = Instant::now();
        let mut ring = Vec::new();
        ring.push(UnknownDescriptor {
            expires_at: now - Duration::from_secs(1),
            descriptor: vec![0.0],
            face_image: Vec::new(),
        });
        for _ in 0..UNKNOWN_DESCRIPTOR_CAP + 5 {
            ring.push(UnknownDescriptor {
                expires_at: now + Duration::from_secs(60),
                descriptor: vec![0.0],
                face_image: Vec::new(),
            });
        }
        prune_unknown(&mut ring);
        assert_eq!(ring.len(), UNKNOWN_DESCRIPTOR_CAP);
    }
}
