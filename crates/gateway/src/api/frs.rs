//! FRS admin API: method-name dispatch with tenant bearer auth, plus the
//! `sg`-prefixed namespace authenticated by special-group tokens.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use fp_domain::geometry::Rect;
use fp_domain::{Error, Result};
use serde_json::{json, Value};

use super::{bearer_token, int_array, require_array, require_member, wrap, ApiError};
use crate::frs::pipeline::{process_pipeline, start_workflow, stop_workflow};
use crate::frs::search::{self, SearchRequest};
use crate::frs::{descriptor, stats, TaskData, TaskType, DATE_FORMAT, MIME_IMAGE};
use crate::state::AppState;
use fp_store::frs::COPY_DATA_NONE;

const MESSAGE_REQUEST_COMPLETED: &str = "Request completed successfully";

pub async fn handle(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let json: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return ApiError(Error::bad_request(format!("invalid JSON body: {e}")))
                    .into_response()
            }
        }
    };
    tracing::info!(method = %method, "API call");

    let result = if method.starts_with("sg") {
        dispatch_sg(&state, &method, &headers, &json).await
    } else {
        dispatch(&state, &method, &headers, &json).await
    };
    match result {
        Ok(data) => wrap(data, MESSAGE_REQUEST_COMPLETED),
        Err(e) => ApiError(e).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth + dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<i32> {
    let id_group = match bearer_token(headers) {
        Some(token) => state.frs.caches.token_to_group(token).unwrap_or(-1),
        None => state.config.frs.allow_group_id_without_auth,
    };
    if id_group <= 0 {
        return Err(Error::Unauthorized);
    }
    Ok(id_group)
}

fn authorize_sg(state: &AppState, headers: &HeaderMap) -> Result<i32> {
    let token = bearer_token(headers).ok_or(Error::Unauthorized)?;
    state.frs.caches.sg_token_to_id(token).ok_or(Error::Unauthorized)
}

async fn dispatch(
    state: &AppState,
    method: &str,
    headers: &HeaderMap,
    json: &Value,
) -> Result<Option<Value>> {
    let id_group = authorize(state, headers)?;
    match method {
        "addStream" => add_stream(state, id_group, json).await.map(|_| None),
        "motionDetection" => motion_detection(state, id_group, json).map(|_| None),
        "doorIsOpen" => door_is_open(state, id_group, json).map(|_| None),
        "bestQuality" => best_quality(state, id_group, json).await,
        "getEvents" => get_events(state, id_group, json).await.map(Some),
        "registerFace" => register_face(state, id_group, json).await.map(Some),
        "addFaces" => add_faces(state, id_group, json).await.map(|_| None),
        "removeFaces" => remove_faces(state, id_group, json).await.map(|_| None),
        "listStreams" => list_streams(state, id_group).await.map(Some),
        "removeStream" => remove_stream(state, id_group, json).await.map(|_| None),
        "listAllFaces" => list_all_faces(state, id_group).await.map(Some),
        "deleteFaces" => delete_faces(state, id_group, json).await.map(|_| None),
        "testImage" => test_image(state, id_group, json).await.map(|_| None),
        "processFrame" => process_frame(state, id_group, json).await.map(Some),
        "addSpecialGroup" => add_special_group(state, id_group, json).await.map(Some),
        "updateSpecialGroup" => update_special_group(state, id_group, json).await.map(|_| None),
        "deleteSpecialGroup" => delete_special_group(state, id_group, json).await.map(|_| None),
        "listSpecialGroups" => list_special_groups(state, id_group).await.map(Some),
        "saveDnnStatsData" => {
            stats::save(&state.frs.dnn_stats);
            Ok(None)
        }
        "setCommonConfig" => set_common_config(state, id_group, json).await.map(|_| None),
        "getCommonConfig" => state
            .frs
            .store
            .get_common_config(id_group)
            .await
            .map(|c| Some(c.unwrap_or_else(|| json!({})))),
        "setStreamDefaultConfig" => set_default_config(state, id_group, json).await.map(|_| None),
        "getStreamDefaultConfig" => state
            .frs
            .store
            .get_default_config(id_group)
            .await
            .map(|c| Some(c.unwrap_or_else(|| json!({})))),
        _ => Err(Error::NotFound),
    }
}

async fn dispatch_sg(
    state: &AppState,
    method: &str,
    headers: &HeaderMap,
    json: &Value,
) -> Result<Option<Value>> {
    let id_sgroup = authorize_sg(state, headers)?;
    match method {
        "sgRegisterFace" => sg_register_face(state, id_sgroup, json).await.map(Some),
        "sgDeleteFaces" => sg_delete_faces(state, id_sgroup, json).await.map(|_| None),
        "sgListFaces" => sg_list_faces(state, id_sgroup).await.map(Some),
        "sgUpdateGroup" => sg_update_group(state, id_sgroup, json).await.map(|_| None),
        "sgRenewToken" => sg_renew_token(state, id_sgroup).await.map(Some),
        "sgSearchFaces" => sg_search_faces(state, id_sgroup, json).await.map(Some),
        _ => Err(Error::NotFound),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn member_string(json: &Value, member: &str) -> String {
    json.get(member)
        .and_then(fp_domain::convert::as_string)
        .unwrap_or_default()
}

fn opt_string(json: &Value, member: &str) -> Option<String> {
    json.get(member).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn opt_i64(json: &Value, member: &str) -> Option<i64> {
    match json.get(member) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn vstream_key(id_group: i32, ext: &str) -> String {
    format!("{id_group}_{ext}")
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(value, DATE_FORMAT) {
        if let Some(start) = parsed.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&start));
        }
    }
    Err(Error::bad_request(format!("Invalid date value: {value}")))
}

async fn resolve_vstream_id(state: &AppState, id_group: i32, json: &Value) -> Result<i32> {
    let ext = member_string(json, "streamId");
    state
        .frs
        .store
        .vstream_id(id_group, &ext)
        .await?
        .ok_or_else(|| Error::bad_request(format!("Unknown video stream: {ext}")))
}

fn face_image_data_uri(bytes: &[u8]) -> String {
    format!(
        "data:{MIME_IMAGE};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed conversion for the legacy `params` list of `{paramName,
/// paramValue}` pairs (numbers-as-seconds become duration strings).
fn legacy_params_to_config(params: &[Value]) -> Result<Option<Value>> {
    use fp_domain::frs::keys;

    const INT_PARAMS: [&str; 1] = [keys::MAX_CAPTURE_ERROR_COUNT];
    const FLOAT_PARAMS: [&str; 8] = [
        keys::BLUR,
        keys::BLUR_MAX,
        keys::TOLERANCE,
        keys::TITLE_HEIGHT_RATIO,
        keys::FACE_CONFIDENCE,
        keys::FACE_ENLARGE_SCALE,
        keys::FACE_CLASS_CONFIDENCE,
        keys::MARGIN,
    ];
    const STRING_PARAMS: [&str; 5] = [
        keys::OSD_DATETIME_FORMAT,
        keys::DNN_FD_INFERENCE_SERVER,
        keys::DNN_FC_INFERENCE_SERVER,
        keys::DNN_FR_INFERENCE_SERVER,
        keys::TITLE,
    ];
    const TIME_PARAMS: [&str; 8] = [
        keys::BEST_QUALITY_INTERVAL_AFTER,
        keys::BEST_QUALITY_INTERVAL_BEFORE,
        keys::CAPTURE_TIMEOUT,
        keys::DELAY_AFTER_ERROR,
        keys::DELAY_BETWEEN_FRAMES,
        keys::OPEN_DOOR_DURATION,
        keys::WORKFLOW_TIMEOUT,
        keys::UNKNOWN_DESCRIPTOR_TTL,
    ];
    const BOOL_PARAMS: [&str; 1] = [keys::FLAG_SPAWNED_DESCRIPTORS];

    let mut config = serde_json::Map::new();
    for param in params {
        let name = param.get("paramName").and_then(|v| v.as_str()).unwrap_or_default();
        let value = param.get("paramValue").cloned().unwrap_or(Value::Null);
        let invalid = || Error::bad_request(format!("Invalid value for param `{name}`."));

        if INT_PARAMS.contains(&name) {
            config.insert(name.into(), json!(value.as_i64().ok_or_else(invalid)?));
        } else if FLOAT_PARAMS.contains(&name) {
            config.insert(name.into(), json!(value.as_f64().ok_or_else(invalid)?));
        } else if STRING_PARAMS.contains(&name) {
            config.insert(name.into(), json!(value.as_str().ok_or_else(invalid)?));
        } else if TIME_PARAMS.contains(&name) {
            let seconds = value.as_f64().ok_or_else(invalid)?;
            config.insert(name.into(), json!(format!("{}ms", (seconds * 1000.0).round() as i64)));
        } else if BOOL_PARAMS.contains(&name) {
            config.insert(name.into(), json!(value.as_bool().ok_or_else(invalid)?));
        } else if name == keys::LOGS_LEVEL {
            let level = match value.as_i64() {
                Some(0) => "error",
                Some(2) => "trace",
                _ => "info",
            };
            config.insert(name.into(), json!(level));
        }
    }
    Ok((!config.is_empty()).then(|| Value::Object(config)))
}

async fn add_stream(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    let vstream_ext = member_string(json, "streamId");
    let url = opt_string(json, "url");
    let callback_url = opt_string(json, "callback");
    let faces = int_array(json, "faces")?;

    let mut config = None;
    if let Some(params) = json.get("params").and_then(|v| v.as_array()) {
        config = legacy_params_to_config(params)?;
    }
    if let Some(object) = json.get("config").filter(|v| v.is_object()) {
        config = Some(object.clone());
    }

    state
        .frs
        .store
        .upsert_stream(id_group, &vstream_ext, url, callback_url, config, &faces)
        .await
}

fn motion_detection(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    require_member(json, "start")?;
    let key = vstream_key(id_group, &member_string(json, "streamId"));
    let start = match json.get("start") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "t",
        _ => false,
    };
    if start {
        start_workflow(state, key);
    } else {
        stop_workflow(state, &key, false);
    }
    Ok(())
}

fn door_is_open(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    let key = vstream_key(id_group, &member_string(json, "streamId"));
    stop_workflow(state, &key, false);
    Ok(())
}

async fn list_streams(state: &AppState, id_group: i32) -> Result<Value> {
    let (streams, faces) = state.frs.store.list_streams(id_group).await?;
    let mut data = Vec::with_capacity(streams.len());
    for stream in streams {
        let bound: Vec<i32> = faces
            .iter()
            .filter(|(ext, _)| *ext == stream.vstream_ext)
            .map(|(_, id)| *id)
            .collect();
        let mut entry = serde_json::Map::new();
        entry.insert("streamId".into(), json!(stream.vstream_ext));
        if let Some(url) = stream.url {
            entry.insert("url".into(), json!(url));
        }
        if let Some(callback) = stream.callback_url {
            entry.insert("callback".into(), json!(callback));
        }
        if let Some(config) = stream.config {
            entry.insert("config".into(), config);
        }
        if !bound.is_empty() {
            entry.insert("faces".into(), json!(bound));
        }
        data.push(Value::Object(entry));
    }
    Ok(Value::Array(data))
}

async fn remove_stream(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    let Ok(id_vstream) = resolve_vstream_id(state, id_group, json).await else {
        return Ok(());
    };
    state.frs.store.remove_stream(id_group, id_vstream).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Face management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn add_faces(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    require_array(json, "faces")?;
    let faces = int_array(json, "faces")?;
    // An unknown stream is a silent no-op, matching the other bind calls.
    let Ok(id_vstream) = resolve_vstream_id(state, id_group, json).await else {
        return Ok(());
    };
    state.frs.store.add_faces(id_group, id_vstream, &faces).await
}

async fn remove_faces(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    require_array(json, "faces")?;
    let faces = int_array(json, "faces")?;
    let Ok(id_vstream) = resolve_vstream_id(state, id_group, json).await else {
        return Ok(());
    };
    state.frs.store.remove_faces(id_vstream, &faces).await
}

async fn list_all_faces(state: &AppState, id_group: i32) -> Result<Value> {
    let faces = state.frs.store.list_all_faces(id_group).await?;
    Ok(json!(faces))
}

async fn delete_faces(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_array(json, "faces")?;
    let faces = int_array(json, "faces")?;
    state.frs.store.delete_faces(id_group, &faces).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & quality
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn best_quality(state: &AppState, id_group: i32, json: &Value) -> Result<Option<Value>> {
    let id_log = opt_i64(json, "eventId");
    let has_stream_date = json.get("streamId").map(|v| !v.is_null()).unwrap_or(false)
        && json.get("date").map(|v| !v.is_null()).unwrap_or(false);
    if id_log.is_none() && !has_stream_date {
        return Err(Error::bad_request(
            "Required members `eventId` or `streamId` and `date` not found or invalid.",
        ));
    }
    let ext_event_uuid = member_string(json, "uuid");
    let do_copy_event_data = state
        .frs
        .caches
        .configs
        .load()
        .common
        .get(&id_group)
        .map(|c| c.flag_copy_event_data)
        .unwrap_or(false);

    let row = match id_log {
        Some(id_log) => state.frs.store.log_face_by_id(id_group, id_log).await?,
        None => {
            let key = vstream_key(id_group, &member_string(json, "streamId"));
            let (before, after) = {
                let streams = state.frs.caches.streams.load();
                let Some(config) = streams.get(&key) else {
                    return Ok(None);
                };
                (
                    config.best_quality_interval_before,
                    config.best_quality_interval_after,
                )
            };
            let Ok(id_vstream) = resolve_vstream_id(state, id_group, json).await else {
                return Ok(None);
            };
            let date = parse_datetime(&member_string(json, "date"))?;
            state
                .frs
                .store
                .log_face_best_quality(
                    id_vstream,
                    date,
                    chrono::Duration::from_std(before).unwrap_or_default(),
                    chrono::Duration::from_std(after).unwrap_or_default(),
                )
                .await?
        }
    };

    let Some(row) = row else {
        return Ok(None);
    };
    if do_copy_event_data && row.copy_data == COPY_DATA_NONE && !ext_event_uuid.is_empty() {
        state.frs.store.schedule_copy_data(row.id_log, &ext_event_uuid).await?;
    }
    Ok(Some(json!({
        "screenshot": row.screenshot_url,
        "left": row.face_left,
        "top": row.face_top,
        "width": row.face_width,
        "height": row.face_height,
    })))
}

async fn get_events(state: &AppState, id_group: i32, json: &Value) -> Result<Value> {
    require_member(json, "streamId")?;
    require_member(json, "dateStart")?;
    require_member(json, "dateEnd")?;
    let Ok(id_vstream) = resolve_vstream_id(state, id_group, json).await else {
        return Ok(Value::Array(Vec::new()));
    };
    let date_start = parse_datetime(&member_string(json, "dateStart"))?;
    let date_end = parse_datetime(&member_string(json, "dateEnd"))?;
    let rows = state
        .frs
        .store
        .log_faces_in_interval(id_vstream, date_start, date_end)
        .await?;
    let data: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let mut entry = serde_json::Map::new();
            entry.insert("date".into(), json!(row.log_date.to_rfc3339()));
            if let Some(id_descriptor) = row.id_descriptor {
                entry.insert("faceId".into(), json!(id_descriptor));
            }
            entry.insert("quality".into(), json!(row.quality));
            entry.insert("screenshot".into(), json!(row.screenshot_url));
            entry.insert("left".into(), json!(row.face_left));
            entry.insert("top".into(), json!(row.face_top));
            entry.insert("width".into(), json!(row.face_width));
            entry.insert("height".into(), json!(row.face_height));
            Value::Object(entry)
        })
        .collect();
    Ok(Value::Array(data))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Synchronous pipeline methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hint_rect(json: &Value) -> Rect {
    Rect::new(
        opt_i64(json, "left").unwrap_or(0) as i32,
        opt_i64(json, "top").unwrap_or(0) as i32,
        opt_i64(json, "width").unwrap_or(0) as i32,
        opt_i64(json, "height").unwrap_or(0) as i32,
    )
}

async fn register_face(state: &AppState, id_group: i32, json: &Value) -> Result<Value> {
    require_member(json, "streamId")?;
    require_member(json, "url")?;
    let mut task = TaskData::new(
        id_group,
        vstream_key(id_group, &member_string(json, "streamId")),
        TaskType::RegisterDescriptor,
    );
    task.frame_url = member_string(json, "url");
    task.face_hint = hint_rect(json);

    let result = process_pipeline(state.clone(), task).await;
    if result.id_descriptor <= 0 {
        return Err(Error::bad_request(result.comments));
    }
    let face_image = result.face_image.as_deref().unwrap_or_default();
    Ok(json!({
        "faceId": result.id_descriptor,
        "left": result.face_rect.x,
        "top": result.face_rect.y,
        "width": result.face_rect.width,
        "height": result.face_rect.height,
        "faceImage": face_image_data_uri(face_image),
        "comments": result.comments,
    }))
}

async fn test_image(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    require_member(json, "url")?;
    let mut task = TaskData::new(
        id_group,
        vstream_key(id_group, &member_string(json, "streamId")),
        TaskType::Test,
    );
    task.frame_url = member_string(json, "url");
    process_pipeline(state.clone(), task).await;
    Ok(())
}

async fn process_frame(state: &AppState, id_group: i32, json: &Value) -> Result<Value> {
    let has_stream = json.get("streamId").map(|v| !v.is_null()).unwrap_or(false);
    let sgroup = opt_i64(json, "groupId");
    if !has_stream && sgroup.is_none() {
        return Err(Error::bad_request(
            "Required members `streamId` or `groupId` not found or invalid.",
        ));
    }
    require_member(json, "url")?;

    let key = if has_stream {
        vstream_key(id_group, &member_string(json, "streamId"))
    } else {
        String::new()
    };
    let mut task = TaskData::new(id_group, key, TaskType::ProcessFrame);
    task.frame_url = member_string(json, "url");
    if !has_stream {
        task.id_sgroup = sgroup.unwrap_or(0) as i32;
    }
    let result = process_pipeline(state.clone(), task).await;
    Ok(json!(result.id_descriptors))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Special groups (tenant-side)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn add_special_group(state: &AppState, id_group: i32, json: &Value) -> Result<Value> {
    require_member(json, "groupName")?;
    let group_name = member_string(json, "groupName");
    let limit = state
        .frs
        .caches
        .configs
        .load()
        .common
        .get(&id_group)
        .map(|c| c.sg_max_descriptor_count)
        .unwrap_or(1);
    let mut max_descriptor_count = limit;
    if let Some(requested) = json.get("maxDescriptorCount") {
        let requested = requested
            .as_i64()
            .ok_or_else(|| Error::bad_request("Member `maxDescriptorCount` is invalid."))?;
        max_descriptor_count = (requested as i32).clamp(1, limit);
    }
    let (id_sgroup, token) = state
        .frs
        .store
        .add_special_group(id_group, &group_name, max_descriptor_count)
        .await?;
    Ok(json!({"groupId": id_sgroup, "accessApiToken": token}))
}

async fn update_special_group(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "groupId")?;
    let id_sgroup = opt_i64(json, "groupId")
        .ok_or_else(|| Error::bad_request("Member `groupId` is invalid."))? as i32;
    let group_name = match json.get("groupName") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(Error::bad_request("Member `groupName` is invalid.")),
    };
    let max_descriptor_count = match json.get("maxDescriptorCount") {
        None => None,
        Some(value) => Some(
            value
                .as_i64()
                .ok_or_else(|| Error::bad_request("Member `maxDescriptorCount` is invalid."))?
                as i32,
        ),
    };
    state
        .frs
        .store
        .update_special_group(id_group, id_sgroup, group_name, max_descriptor_count)
        .await
}

async fn delete_special_group(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "groupId")?;
    let id_sgroup = opt_i64(json, "groupId")
        .ok_or_else(|| Error::bad_request("Member `groupId` is invalid."))? as i32;
    state.frs.store.delete_special_group(id_group, id_sgroup).await
}

async fn list_special_groups(state: &AppState, id_group: i32) -> Result<Value> {
    let rows = state.frs.store.list_special_groups(id_group).await?;
    let data: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let mut entry = serde_json::Map::new();
            entry.insert("groupId".into(), json!(row.id_special_group));
            entry.insert("groupName".into(), json!(row.group_name));
            entry.insert("accessApiToken".into(), json!(row.sg_api_token));
            if let Some(callback) = row.callback_url {
                entry.insert("callback".into(), json!(callback));
            }
            entry.insert("maxDescriptorCount".into(), json!(row.max_descriptor_count));
            Value::Object(entry)
        })
        .collect();
    Ok(Value::Array(data))
}

async fn set_common_config(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    if !json.is_object() {
        return Err(Error::bad_request("Body is not a valid JSON object."));
    }
    state.frs.store.set_common_config(id_group, json).await
}

async fn set_default_config(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    if !json.is_object() {
        return Err(Error::bad_request("Body is not a valid JSON object."));
    }
    state.frs.store.set_default_config(id_group, json).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Special-group namespace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sg_group_of(state: &AppState, id_sgroup: i32) -> Result<i32> {
    state
        .frs
        .caches
        .sg_configs
        .load()
        .by_id(id_sgroup)
        .map(|c| c.id_group)
        .filter(|id| *id > 0)
        .ok_or_else(|| Error::internal("special group is not mapped to a tenant"))
}

async fn sg_register_face(state: &AppState, id_sgroup: i32, json: &Value) -> Result<Value> {
    require_member(json, "url")?;
    let id_group = sg_group_of(state, id_sgroup)?;
    let mut task = TaskData::new(id_group, String::new(), TaskType::RegisterDescriptor);
    task.frame_url = member_string(json, "url");
    task.face_hint = hint_rect(json);
    task.id_sgroup = id_sgroup;

    let result = process_pipeline(state.clone(), task).await;
    if result.id_descriptor <= 0 {
        return Err(Error::bad_request(result.comments));
    }
    let face_image = result.face_image.as_deref().unwrap_or_default();
    Ok(json!({
        "faceId": result.id_descriptor,
        "left": result.face_rect.x,
        "top": result.face_rect.y,
        "width": result.face_rect.width,
        "height": result.face_rect.height,
        "faceImage": face_image_data_uri(face_image),
        "comments": result.comments,
    }))
}

async fn sg_delete_faces(state: &AppState, id_sgroup: i32, json: &Value) -> Result<()> {
    require_array(json, "faces")?;
    let faces = int_array(json, "faces")?;
    state.frs.store.sg_delete_faces(id_sgroup, &faces).await
}

async fn sg_list_faces(state: &AppState, id_sgroup: i32) -> Result<Value> {
    let rows = state.frs.store.sg_list_faces(id_sgroup).await?;
    let data: Vec<Value> = rows
        .into_iter()
        .map(|(id, image)| json!({"faceId": id, "faceImage": image}))
        .collect();
    Ok(Value::Array(data))
}

async fn sg_update_group(state: &AppState, id_sgroup: i32, json: &Value) -> Result<()> {
    require_member(json, "callback")?;
    let callback_url = member_string(json, "callback");
    state.frs.store.sg_update_callback(id_sgroup, &callback_url).await
}

async fn sg_renew_token(state: &AppState, id_sgroup: i32) -> Result<Value> {
    let token = state.frs.store.sg_renew_token(id_sgroup).await?;
    Ok(json!({"accessApiToken": token}))
}

async fn sg_search_faces(state: &AppState, id_sgroup: i32, json: &Value) -> Result<Value> {
    let id_group = sg_group_of(state, id_sgroup)?;
    require_array(json, "faces")?;
    require_member(json, "dateStart")?;
    require_member(json, "dateEnd")?;
    require_member(json, "similarityThreshold")?;

    let use_logs = json.get("useLogs").and_then(|v| v.as_bool()).unwrap_or(true);
    let use_events = json.get("useEvents").and_then(|v| v.as_bool()).unwrap_or(true);
    if !use_logs && !use_events {
        return Err(Error::bad_request(
            "At least one of the members `useLogs` or `useEvents` must be true.",
        ));
    }

    let date_start = NaiveDate::parse_from_str(&member_string(json, "dateStart"), DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
        .ok_or_else(|| Error::bad_request("Required member `dateStart` is invalid."))?;
    let date_end = NaiveDate::parse_from_str(&member_string(json, "dateEnd"), DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n) + chrono::Duration::hours(24))
        .ok_or_else(|| Error::bad_request("Required member `dateEnd` is invalid."))?;

    let faces = int_array(json, "faces")?;
    let similarity_threshold = json
        .get("similarityThreshold")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5);

    let rows = state.frs.store.sg_descriptors(id_sgroup, &faces).await?;
    let descriptor_len = state
        .frs
        .caches
        .configs
        .load()
        .common
        .get(&id_group)
        .map(|c| c.dnn_fr_output_size as usize)
        .unwrap_or(512);
    let descriptors = rows
        .into_iter()
        .map(|(id, bytes)| (id, descriptor::floats_from_bytes(&bytes)))
        .collect();

    let request = SearchRequest {
        id_group,
        descriptors,
        date_start,
        date_end,
        similarity_threshold,
        use_logs,
        use_events,
        descriptor_len,
    };
    let local = state.config.frs.clone();
    let hits = tokio::task::spawn_blocking(move || search::search(&local, &request))
        .await
        .map_err(|e| Error::internal(format!("search task failed: {e}")))?;

    let data: Vec<Value> = hits
        .into_iter()
        .map(|hit| {
            json!({
                "date": hit.event_date,
                "uuid": hit.uuid,
                "eventId": hit.event_id,
                "url": hit.url_image,
                "faceId": hit.id_descriptor,
                "similarity": hit.similarity,
            })
        })
        .collect();
    Ok(Value::Array(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vstream_key_format() {
        assert_eq!(vstream_key(3, "cam1"), "3_cam1");
    }

    #[test]
    fn datetime_parsing_variants() {
        assert!(parse_datetime("2024-01-01T10:00:00Z").is_ok());
        assert!(parse_datetime("2024-01-01 10:00:00").is_ok());
        assert!(parse_datetime("2024-01-01").is_ok());
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn legacy_params_conversion() {
        let params = vec![
            json!({"paramName": "tolerance", "paramValue": 0.6}),
            json!({"paramName": "delay-between-frames", "paramValue": 0.25}),
            json!({"paramName": "logs-level", "paramValue": 2}),
            json!({"paramName": "title", "paramValue": "entrance"}),
            json!({"paramName": "unknown-param", "paramValue": 1}),
        ];
        let config = legacy_params_to_config(&params).unwrap().unwrap();
        assert_eq!(config["tolerance"], json!(0.6));
        assert_eq!(config["delay-between-frames"], json!("250ms"));
        assert_eq!(config["logs-level"], json!("trace"));
        assert_eq!(config["title"], json!("entrance"));
        assert!(config.get("unknown-param").is_none());
    }

    #[test]
    fn legacy_params_empty_is_none() {
        assert!(legacy_params_to_config(&[]).unwrap().is_none());
    }

    #[test]
    fn hint_rect_defaults_to_zero() {
        let rect = hint_rect(&json!({"left": 5, "width": 100}));
        assert_eq!(rect, Rect::new(5, 0, 100, 0));
    }
}
