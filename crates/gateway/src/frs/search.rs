//! Descriptor search over the binary event data trees (`sgSearchFaces`).
//!
//! Scans the durable events tree (per-group daily aggregates) and the
//! screenshot tree (per-event `.dat` files), comparing stored descriptors
//! against the probes by full cosine similarity. Log hits that already
//! appeared as events are dropped; results sort by event date, newest first.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use fp_domain::config::FrsLocalConfig;

use super::descriptor::{cosine, decode_records};
use super::events::path_suffix;
use super::{DATA_FILE_SUFFIX, DATE_FORMAT, JSON_SUFFIX};

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub event_date: String,
    pub event_id: String,
    pub uuid: String,
    pub url_image: String,
    pub id_descriptor: i32,
    pub similarity: f64,
}

pub struct SearchRequest {
    pub id_group: i32,
    /// Probe descriptors, raw (unnormalized) floats.
    pub descriptors: HashMap<i32, Vec<f32>>,
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub similarity_threshold: f64,
    pub use_logs: bool,
    pub use_events: bool,
    pub descriptor_len: usize,
}

pub fn search(local: &FrsLocalConfig, request: &SearchRequest) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let mut event_ids = HashSet::new();

    if request.use_events {
        search_events(local, request, &mut hits, &mut event_ids);
    }
    if request.use_logs {
        search_logs(local, request, &event_ids, &mut hits);
    }
    hits.sort_by(|a, b| b.event_date.cmp(&a.event_date));
    hits
}

fn walk(root: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

fn search_events(
    local: &FrsLocalConfig,
    request: &SearchRequest,
    hits: &mut Vec<SearchHit>,
    event_ids: &mut HashSet<String>,
) {
    let root = format!("{}group_{}/", local.events_path, request.id_group);
    if !Path::new(&root).exists() {
        return;
    }
    let start_name = format!("{}{}", request.date_start.format(DATE_FORMAT), DATA_FILE_SUFFIX);
    let end_name = format!("{}{}", request.date_end.format(DATE_FORMAT), DATA_FILE_SUFFIX);

    walk(Path::new(&root), &mut |path| {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return };
        if !name.ends_with(DATA_FILE_SUFFIX) || name < start_name.as_str() || name > end_name.as_str()
        {
            return;
        }
        let Ok(bytes) = std::fs::read(path) else { return };
        for record in decode_records(&bytes, request.descriptor_len) {
            for (id_descriptor, probe) in &request.descriptors {
                let similarity = cosine(probe, &record.descriptor);
                if similarity <= request.similarity_threshold {
                    continue;
                }
                event_ids.insert(record.event_id.clone());

                let json_path = format!(
                    "{}{}{}{}",
                    local.events_path,
                    path_suffix(request.id_group, &record.event_id),
                    record.event_id,
                    JSON_SUFFIX
                );
                let Ok(json_bytes) = std::fs::read(&json_path) else { continue };
                let Ok(event_json) = serde_json::from_slice::<serde_json::Value>(&json_bytes) else {
                    continue;
                };
                let uuid = event_json
                    .get("event_uuid")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                // An event without a host uuid is addressable only by its
                // screenshot URL.
                let url_image = if uuid.is_empty() {
                    format!(
                        "{}{}{}.jpg",
                        local.screenshots_url_prefix,
                        path_suffix(request.id_group, &record.event_id),
                        record.event_id
                    )
                } else {
                    String::new()
                };
                let fallback_date = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let event_date = event_json
                    .get("event_date")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or(fallback_date);
                hits.push(SearchHit {
                    event_date,
                    event_id: record.event_id.clone(),
                    uuid,
                    url_image,
                    id_descriptor: *id_descriptor,
                    similarity,
                });
            }
        }
    });
}

fn search_logs(
    local: &FrsLocalConfig,
    request: &SearchRequest,
    event_ids: &HashSet<String>,
    hits: &mut Vec<SearchHit>,
) {
    let root = format!("{}group_{}/", local.screenshots_path, request.id_group);
    if !Path::new(&root).exists() {
        return;
    }
    let start: SystemTime = request.date_start.into();
    let end: SystemTime = request.date_end.into();

    walk(Path::new(&root), &mut |path| {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return };
        if !name.ends_with(DATA_FILE_SUFFIX) {
            return;
        }
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return,
        };
        if modified < start || modified >= end {
            return;
        }
        let Ok(bytes) = std::fs::read(path) else { return };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        for record in decode_records(&bytes, request.descriptor_len) {
            for (id_descriptor, probe) in &request.descriptors {
                let similarity = cosine(probe, &record.descriptor);
                if similarity <= request.similarity_threshold {
                    continue;
                }
                // Already surfaced from the events tree.
                if event_ids.contains(&record.event_id) {
                    continue;
                }
                let json_path = path.with_extension("json");
                let Ok(json_bytes) = std::fs::read(&json_path) else { continue };
                let Ok(event_json) = serde_json::from_slice::<serde_json::Value>(&json_bytes) else {
                    continue;
                };
                let Some(event_date) = event_json.get("event_date").and_then(|v| v.as_str()) else {
                    continue;
                };
                hits.push(SearchHit {
                    event_date: event_date.to_string(),
                    event_id: record.event_id.clone(),
                    uuid: String::new(),
                    url_image: format!(
                        "{}{}{}.jpg",
                        local.screenshots_url_prefix,
                        path_suffix(request.id_group, &stem),
                        stem
                    ),
                    id_descriptor: *id_descriptor,
                    similarity,
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frs::descriptor::{encode_record, EventRecord};

    fn local(dir: &Path) -> FrsLocalConfig {
        FrsLocalConfig {
            screenshots_path: format!("{}/screenshots/", dir.display()),
            screenshots_url_prefix: "http://host/frs/screenshots/".into(),
            events_path: format!("{}/events/", dir.display()),
            ..Default::default()
        }
    }

    fn descriptor(seed: f32) -> Vec<f32> {
        (0..512).map(|i| ((i as f32) * seed).sin()).collect()
    }

    #[test]
    fn finds_matching_descriptor_in_log_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = local(dir.path());
        let event_id = "aabb0000000000000000000000000001".to_string();
        let face = descriptor(0.37);

        let suffix = path_suffix(1, &event_id);
        let directory = format!("{}{}", cfg.screenshots_path, suffix);
        std::fs::create_dir_all(&directory).unwrap();
        let record = EventRecord {
            event_id: event_id.clone(),
            position: 0,
            descriptor: face.clone(),
        };
        std::fs::write(
            format!("{directory}{event_id}.dat"),
            encode_record(&record).unwrap(),
        )
        .unwrap();
        std::fs::write(
            format!("{directory}{event_id}.json"),
            serde_json::json!({"event_date": "2024-01-01T10:00:00Z", "id_vstream": 1}).to_string(),
        )
        .unwrap();

        let now = Utc::now();
        let request = SearchRequest {
            id_group: 1,
            descriptors: HashMap::from([(5, face)]),
            date_start: now - chrono::Duration::hours(1),
            date_end: now + chrono::Duration::hours(1),
            similarity_threshold: 0.6,
            use_logs: true,
            use_events: true,
            descriptor_len: 512,
        };
        let hits = search(&cfg, &request);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id_descriptor, 5);
        assert!(hits[0].similarity > 0.99);
        assert!(hits[0].url_image.contains(&event_id));
    }

    #[test]
    fn dissimilar_descriptor_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = local(dir.path());
        let event_id = "aabb0000000000000000000000000002".to_string();

        let suffix = path_suffix(1, &event_id);
        let directory = format!("{}{}", cfg.screenshots_path, suffix);
        std::fs::create_dir_all(&directory).unwrap();
        let record = EventRecord {
            event_id: event_id.clone(),
            position: 0,
            descriptor: descriptor(0.37),
        };
        std::fs::write(
            format!("{directory}{event_id}.dat"),
            encode_record(&record).unwrap(),
        )
        .unwrap();

        // Orthogonal-ish probe: sin vs alternating signs.
        let probe: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let now = Utc::now();
        let request = SearchRequest {
            id_group: 1,
            descriptors: HashMap::from([(9, probe)]),
            date_start: now - chrono::Duration::hours(1),
            date_end: now + chrono::Duration::hours(1),
            similarity_threshold: 0.6,
            use_logs: true,
            use_events: false,
            descriptor_len: 512,
        };
        assert!(search(&cfg, &request).is_empty());
    }
}
