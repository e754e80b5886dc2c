//! LPRS periodic maintenance: ban-map pruning and the events-log TTL sweep
//! over the database and the screenshot/failed artifact trees.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use fp_domain::config::LprsLocalConfig;
use fp_store::lprs::LprsStore;

use crate::lprs::ban::BanRegistry;

const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".bmp", ".ppm", ".tiff"];

fn has_image_extension(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    IMAGE_EXTENSIONS
        .iter()
        .any(|ext| name.len() > ext.len() && name.ends_with(ext))
}

fn sweep_images(root: &Path, cutoff: SystemTime) {
    let Ok(entries) = std::fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_images(&path, cutoff);
            continue;
        }
        if !has_image_extension(&path) {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::error!(path = %path.display(), error = %e, "failed to remove file");
                }
            }
        }
    }
}

pub fn ban_maintenance(bans: &BanRegistry) {
    tracing::debug!("ban maintenance");
    bans.maintain();
}

pub async fn events_log_maintenance(store: &LprsStore, local: &LprsLocalConfig) {
    tracing::debug!("events log maintenance");
    let cutoff = Utc::now() - chrono::Duration::from_std(local.events_log_ttl).unwrap_or_default();
    if let Err(e) = store.remove_old_events(cutoff).await {
        tracing::error!(error = %e, "events log sweep failed");
        return;
    }

    let screenshots = PathBuf::from(&local.screenshots_path);
    let screenshots_cutoff = SystemTime::now()
        .checked_sub(local.events_log_ttl)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let failed = PathBuf::from(&local.failed_path);
    let failed_cutoff = SystemTime::now()
        .checked_sub(local.failed_ttl)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    tokio::task::spawn_blocking(move || {
        sweep_images(&screenshots, screenshots_cutoff);
        sweep_images(&failed, failed_cutoff);
    })
    .await
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn dat_and_json_survive_image_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let jpg = dir.path().join("a.jpg");
        let dat = dir.path().join("a.dat");
        std::fs::write(&jpg, b"x").unwrap();
        std::fs::write(&dat, b"x").unwrap();
        let cutoff = SystemTime::now() + Duration::from_secs(60);
        sweep_images(dir.path(), cutoff);
        assert!(!jpg.exists());
        assert!(dat.exists());
    }
}
