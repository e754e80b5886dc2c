//! FRS periodic maintenance: old log rows and screenshots, flag-deleted
//! rows, copy-events materialization, and old copied events.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use fp_domain::config::FrsLocalConfig;
use fp_store::frs::FrsStore;

use super::events::path_suffix;
use super::{DATA_FILE_SUFFIX, DATE_FORMAT, JSON_SUFFIX};

/// File extensions eligible for TTL deletion in the artifact trees.
pub const SWEEP_EXTENSIONS: [&str; 8] = [
    ".png", ".jpg", ".jpeg", ".bmp", ".ppm", ".tiff", ".dat", ".json",
];

pub fn has_sweep_extension(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    SWEEP_EXTENSIONS
        .iter()
        .any(|ext| name.len() > ext.len() && name.ends_with(ext))
}

/// Walk a tree and delete matching regular files whose mtime precedes the
/// cutoff. IO errors on individual entries are logged and skipped.
pub fn sweep_tree(root: &Path, cutoff: SystemTime, extensions_only: bool) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_tree(&path, cutoff, extensions_only);
            continue;
        }
        if extensions_only && !has_sweep_extension(&path) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::error!(path = %path.display(), error = %e, "failed to remove file");
                }
            }
        }
    }
}

fn system_cutoff(ttl: std::time::Duration) -> SystemTime {
    SystemTime::now().checked_sub(ttl).unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Remove log rows and screenshot-tree files older than `log_faces_ttl`.
pub async fn old_logs(store: &FrsStore, local: &FrsLocalConfig) {
    tracing::info!("removing obsolete entries from the log_faces table");
    let cutoff = Utc::now() - chrono::Duration::from_std(local.log_faces_ttl).unwrap_or_default();
    if let Err(e) = store.remove_old_log_faces(cutoff).await {
        tracing::error!(error = %e, "old log faces sweep failed");
        return;
    }

    tracing::info!("removing outdated screenshots");
    let root = PathBuf::from(&local.screenshots_path);
    let cutoff = system_cutoff(local.log_faces_ttl);
    tokio::task::spawn_blocking(move || sweep_tree(&root, cutoff, true))
        .await
        .ok();
}

/// Hard-delete rows that have carried the deleted flag past the TTL.
pub async fn flag_deleted(store: &FrsStore, local: &FrsLocalConfig) {
    tracing::debug!("deleting marked records from the database");
    let cutoff = Utc::now() - chrono::Duration::from_std(local.flag_deleted_ttl).unwrap_or_default();
    if let Err(e) = store.flag_deleted_sweep(cutoff).await {
        tracing::error!(error = %e, "flag deleted sweep failed");
    }
}

/// Remove files under the events tree older than `events_ttl`.
pub async fn old_events(local: &FrsLocalConfig) {
    tracing::info!("removing outdated events");
    let root = PathBuf::from(&local.events_path);
    let cutoff = system_cutoff(local.events_ttl);
    tokio::task::spawn_blocking(move || sweep_tree(&root, cutoff, true))
        .await
        .ok();
}

/// Materialize scheduled log rows into the durable events tree: copy the
/// event JSON with the external uuid appended, append the binary records to
/// the per-group daily file, and flip the row to DONE. A failing row is
/// skipped; the next sweep retries it.
pub async fn copy_events(store: &FrsStore, local: &FrsLocalConfig) {
    tracing::debug!("copying event data");
    let rows = match store.copy_data_rows().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "copy events query failed");
            return;
        }
    };
    for row in rows {
        let s_uuid = row.log_uuid.simple().to_string();
        let suffix = path_suffix(row.id_group, &s_uuid);
        let source_dir = format!("{}{}", local.screenshots_path, suffix);
        let source_json = format!("{source_dir}{s_uuid}{JSON_SUFFIX}");
        let source_dat = format!("{source_dir}{s_uuid}{DATA_FILE_SUFFIX}");
        if !Path::new(&source_json).exists() {
            continue;
        }

        let target_dir = format!("{}{}", local.events_path, suffix);
        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            tracing::error!(error = %e, "failed to create event directory");
            continue;
        }

        // Copy the JSON with the external event uuid added.
        let copied = async {
            let data = tokio::fs::read(&source_json).await?;
            let mut json: serde_json::Value = serde_json::from_slice(&data)?;
            json["event_uuid"] = serde_json::Value::String(row.ext_event_uuid.clone());
            tokio::fs::write(
                format!("{target_dir}{s_uuid}{JSON_SUFFIX}"),
                json.to_string(),
            )
            .await?;
            Ok::<(), fp_domain::Error>(())
        }
        .await;
        if let Err(e) = copied {
            tracing::error!(id_log = row.id_log, error = %e, "failed to copy event json");
            continue;
        }

        // Append the descriptor records to the per-group daily aggregate.
        match tokio::fs::read(&source_dat).await {
            Ok(data) if !data.is_empty() => {
                let daily = format!(
                    "{}group_{}/{}{}",
                    local.events_path,
                    row.id_group,
                    row.log_date.format(DATE_FORMAT),
                    DATA_FILE_SUFFIX
                );
                let appended = append_file(&daily, &data).await;
                if let Err(e) = appended {
                    tracing::error!(id_log = row.id_log, error = %e, "failed to append event data");
                    continue;
                }
                if let Err(e) = store.mark_copy_done(row.id_log).await {
                    tracing::error!(id_log = row.id_log, error = %e, "failed to mark copy done");
                }
            }
            _ => {}
        }
    }
}

async fn append_file(path: &str, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn extension_filter() {
        assert!(has_sweep_extension(Path::new("/x/a.jpg")));
        assert!(has_sweep_extension(Path::new("/x/a.json")));
        assert!(has_sweep_extension(Path::new("/x/a.dat")));
        assert!(!has_sweep_extension(Path::new("/x/a.txt")));
        assert!(!has_sweep_extension(Path::new("/x/.jpg"))); // bare extension
    }

    #[test]
    fn sweep_removes_only_matching_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("group_1/a");
        std::fs::create_dir_all(&nested).unwrap();
        let old_jpg = nested.join("old.jpg");
        let old_txt = nested.join("old.txt");
        std::fs::write(&old_jpg, b"x").unwrap();
        std::fs::write(&old_txt, b"x").unwrap();

        // Everything just written is "old" relative to a future cutoff.
        let cutoff = SystemTime::now() + Duration::from_secs(60);
        sweep_tree(dir.path(), cutoff, true);

        assert!(!old_jpg.exists());
        assert!(old_txt.exists());
    }

    #[test]
    fn sweep_keeps_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("fresh.jpg");
        std::fs::write(&file, b"x").unwrap();
        let cutoff = SystemTime::now() - Duration::from_secs(3600);
        sweep_tree(dir.path(), cutoff, true);
        assert!(file.exists());
    }
}
