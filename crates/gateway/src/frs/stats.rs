//! Inference statistics persisted across restarts as
//! `dnn_stats_data.json` in the working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::DnnStats;

fn stats_path() -> PathBuf {
    Path::new("dnn_stats_data.json").to_path_buf()
}

pub fn load(stats: &parking_lot::Mutex<HashMap<i32, DnnStats>>) {
    let path = stats_path();
    if !path.exists() {
        return;
    }
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "failed to read dnn stats");
            return;
        }
    };
    let json: serde_json::Value = match serde_json::from_str(&data) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse dnn stats");
            return;
        }
    };
    let mut guard = stats.lock();
    guard.clear();
    if let Some(items) = json.get("data").and_then(|d| d.as_array()) {
        for item in items {
            let id_vstream = item.get("id_vstream").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
            guard.insert(
                id_vstream,
                DnnStats {
                    fd_count: item.get("fd_count").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    fc_count: item.get("fc_count").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    fr_count: item.get("fr_count").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                },
            );
        }
    }
}

pub fn save(stats: &parking_lot::Mutex<HashMap<i32, DnnStats>>) {
    let mut all = DnnStats::default();
    let mut items = Vec::new();
    {
        let guard = stats.lock();
        for (id_vstream, entry) in guard.iter() {
            all.fd_count += entry.fd_count;
            all.fc_count += entry.fc_count;
            all.fr_count += entry.fr_count;
            items.push(json!({
                "id_vstream": id_vstream,
                "fd_count": entry.fd_count,
                "fc_count": entry.fc_count,
                "fr_count": entry.fr_count,
            }));
        }
    }
    let data = json!({
        "all": {
            "fd_count": all.fd_count,
            "fc_count": all.fc_count,
            "fr_count": all.fr_count,
        },
        "data": items,
    });
    if let Err(e) = std::fs::write(stats_path(), data.to_string()) {
        tracing::error!(error = %e, "failed to write dnn stats");
    }
}
