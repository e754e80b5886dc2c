//! Event side effects of the recognition pipeline: screenshot artifacts,
//! log rows, tenant callbacks and the `.json`/`.dat` event files.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fp_domain::frs::{CommonConfig, StreamConfig};
use fp_domain::Result;
use serde_json::json;
use uuid::Uuid;

use super::descriptor::{encode_record, EventRecord};
use super::FaceData;
use crate::state::AppState;
use fp_store::frs::{COPY_DATA_DISABLED, COPY_DATA_NONE};

/// `group_<gid>/<u0>/<u1>/<u2>/<u3>/` — events and screenshots shard by the
/// first four hex characters of the uuid.
pub fn path_suffix(id_group: i32, s_uuid: &str) -> String {
    let mut chars = s_uuid.chars();
    let (u0, u1, u2, u3) = (
        chars.next().unwrap_or('0'),
        chars.next().unwrap_or('0'),
        chars.next().unwrap_or('0'),
        chars.next().unwrap_or('0'),
    );
    format!("group_{id_group}/{u0}/{u1}/{u2}/{u3}/")
}

/// Uuid as 32 hex characters, no separators — the on-disk event id.
pub fn simple_uuid(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// Create directories, write the file, open permissions to rw for owner and
/// others (the static file handler runs under a different user).
pub async fn write_artifact(directory: &str, filename: &str, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(directory).await?;
    let path = Path::new(directory).join(filename);
    tokio::fs::write(&path, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).await?;
    }
    Ok(())
}

/// POST a JSON event to a tenant callback. Success is 200 or 204; anything
/// else is logged as a warning and swallowed — delivery failures never
/// interrupt the pipeline.
pub async fn post_callback(
    http: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    timeout: Duration,
) -> bool {
    let result = http
        .post(url)
        .header("Content-Type", "application/json")
        .json(body)
        .timeout(timeout)
        .send()
        .await;
    match result {
        Ok(response)
            if response.status() == reqwest::StatusCode::OK
                || response.status() == reqwest::StatusCode::NO_CONTENT =>
        {
            true
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "error sending event data to callback");
            false
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "error sending event data to callback");
            false
        }
    }
}

fn face_json(face: &FaceData) -> serde_json::Value {
    let landmarks: Vec<f32> = face
        .landmarks
        .map(|l| l.iter().flat_map(|p| [p.x, p.y]).collect())
        .unwrap_or_default();
    json!({
        "left": face.face_rect.x,
        "top": face.face_rect.y,
        "width": face.face_rect.width,
        "height": face.face_rect.height,
        "laplacian": face.laplacian,
        "landmarks5": landmarks,
        "face_class_index": face.face_class_index,
        "id_descriptor": face.id_descriptor,
        "face_class_confidence": face.face_class_confidence,
        "is_frontal": face.is_frontal,
        "is_non_blurry": face.is_non_blurry,
        "is_work_area": face.is_work_area,
    })
}

/// Write the `<uuid>.json` event record and the `<uuid>.dat` descriptor
/// records for every face that produced a descriptor.
pub async fn write_event_files(
    directory: &str,
    s_uuid: &str,
    id_vstream: i32,
    event_date: DateTime<Utc>,
    best_face_index: i32,
    faces: &[FaceData],
    fr_output_size: usize,
) -> Result<()> {
    let mut dat = Vec::new();
    let mut json_faces = Vec::with_capacity(faces.len());
    for (index, face) in faces.iter().enumerate() {
        json_faces.push(face_json(face));
        if !face.descriptor.is_empty() {
            let mut descriptor = face.descriptor.clone();
            descriptor.resize(fr_output_size, 0.0);
            dat.extend(encode_record(&EventRecord {
                event_id: s_uuid.to_string(),
                position: index as i32,
                descriptor,
            })?);
        }
    }
    let event = json!({
        "id_vstream": id_vstream,
        "event_date": event_date.to_rfc3339(),
        "best_face_index": best_face_index,
        "faces": json_faces,
    });
    write_artifact(directory, &format!("{s_uuid}.json"), event.to_string().as_bytes()).await?;
    write_artifact(directory, &format!("{s_uuid}.dat"), &dat).await?;
    Ok(())
}

/// Emit the recognition event for the best face: log row, screenshot,
/// optional callback, and the event files.
pub async fn emit_recognize_event(
    state: &AppState,
    config: &StreamConfig,
    common: &CommonConfig,
    faces: &[FaceData],
    best_face_index: usize,
    image_data: &[u8],
) {
    let best = &faces[best_face_index];
    let log_uuid = Uuid::new_v4();
    let s_uuid = simple_uuid(&log_uuid);
    let suffix = path_suffix(config.id_group, &s_uuid);
    let screenshot_url = format!(
        "{}{}{}.jpg",
        state.config.frs.screenshots_url_prefix, suffix, s_uuid
    );
    let log_date = Utc::now();

    let id_descriptor = (best.id_descriptor > 0).then_some(best.id_descriptor);
    let id_log = match state
        .frs
        .store
        .add_log_face(
            config.id_vstream,
            log_date,
            id_descriptor,
            best.laplacian,
            &best.face_rect,
            &screenshot_url,
            log_uuid,
            COPY_DATA_NONE,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(vstream_key = %config.vstream_ext, error = %e, "failed to insert log row");
            -1
        }
    };

    let directory = format!("{}{}", state.config.frs.screenshots_path, suffix);
    if let Err(e) = write_artifact(&directory, &format!("{s_uuid}.jpg"), image_data).await {
        tracing::error!(error = %e, "failed to write screenshot");
    }

    if id_log > 0 && best.id_descriptor > 0 && !config.callback_url.is_empty() {
        let body = json!({"faceId": best.id_descriptor, "eventId": id_log});
        if post_callback(&state.http, &config.callback_url, &body, common.callback_timeout).await {
            tracing::info!(
                id_vstream = config.id_vstream,
                id_descriptor = best.id_descriptor,
                "facial recognition event sent"
            );
        }
    }

    if let Err(e) = write_event_files(
        &directory,
        &s_uuid,
        config.id_vstream,
        log_date,
        best_face_index as i32,
        faces,
        common.dnn_fr_output_size as usize,
    )
    .await
    {
        tracing::error!(error = %e, "failed to write event files");
    }
}

/// Emit one event per special-group hit: a log row with copy disabled, the
/// shared screenshot, and a POST to the group's callback.
pub async fn emit_sgroup_events(
    state: &AppState,
    config: &StreamConfig,
    common: &CommonConfig,
    faces: &[FaceData],
    image_data: &[u8],
) {
    for face in faces {
        for (id_sgroup, hit) in &face.sg_descriptors {
            let log_uuid = Uuid::new_v4();
            let s_uuid = simple_uuid(&log_uuid);
            let suffix = path_suffix(config.id_group, &s_uuid);
            let screenshot_url = format!(
                "{}{}{}.jpg",
                state.config.frs.screenshots_url_prefix, suffix, s_uuid
            );
            let log_date = Utc::now();

            let id_log = match state
                .frs
                .store
                .add_log_face(
                    config.id_vstream,
                    log_date,
                    Some(hit.id_descriptor),
                    face.laplacian,
                    &face.face_rect,
                    &screenshot_url,
                    log_uuid,
                    COPY_DATA_DISABLED,
                )
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(error = %e, "failed to insert special group log row");
                    continue;
                }
            };

            let directory = format!("{}{}", state.config.frs.screenshots_path, suffix);
            if let Err(e) = write_artifact(&directory, &format!("{s_uuid}.jpg"), image_data).await {
                tracing::error!(error = %e, "failed to write special group screenshot");
            }

            let callback_url = state
                .frs
                .caches
                .sg_configs
                .load()
                .by_id(*id_sgroup)
                .map(|c| c.callback_url.clone())
                .unwrap_or_default();
            if id_log > 0 && !callback_url.is_empty() {
                let body = json!({
                    "faceId": hit.id_descriptor,
                    "screenshotUrl": screenshot_url,
                    "date": log_date.to_rfc3339(),
                });
                if post_callback(&state.http, &callback_url, &body, common.callback_timeout).await {
                    tracing::info!(
                        id_sgroup,
                        id_vstream = config.id_vstream,
                        id_descriptor = hit.id_descriptor,
                        "special group recognition event sent"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_suffix_shards_by_uuid_prefix() {
        let suffix = path_suffix(7, "ab12cdef00000000000000000000dead");
        assert_eq!(suffix, "group_7/a/b/1/2/");
    }

    #[test]
    fn simple_uuid_is_32_hex_chars() {
        let uuid = Uuid::new_v4();
        let s = simple_uuid(&uuid);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn artifact_write_creates_dirs_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = format!("{}/group_1/a/b/c/d", dir.path().display());
        write_artifact(&nested, "x.jpg", b"bytes").await.unwrap();
        let path = Path::new(&nested).join("x.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o666);
        }
    }
}
