//! LPRS admin API: stream CRUD, workflow control and event retrieval.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use fp_domain::{Error, Result};
use serde_json::{json, Value};

use super::{bearer_token, require_member, wrap, ApiError};
use crate::lprs::pipeline::{start_workflow, stop_workflow};
use crate::state::AppState;

const MESSAGE_OK: &str = "Ok";

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

    match dispatch(&state, &method, &headers, &json).await {
        Ok(data) => wrap(data, MESSAGE_OK),
        Err(e) => ApiError(e).into_response(),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<i32> {
    let id_group = match bearer_token(headers) {
        Some(token) => state.lprs.caches.token_to_group(token).unwrap_or(-1),
        None => state.config.lprs.allow_group_id_without_auth,
    };
    if id_group <= 0 {
        return Err(Error::Unauthorized);
    }
    Ok(id_group)
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
        "removeStream" => remove_stream(state, id_group, json).await.map(|_| None),
        "listStreams" => list_streams(state, id_group).await.map(Some),
        "startWorkflow" => workflow_control(state, id_group, json, true).map(|_| None),
        "stopWorkflow" => workflow_control(state, id_group, json, false).map(|_| None),
        "getEventData" => get_event_data(state, id_group, json).await,
        "setStreamDefaultConfig" => set_default_config(state, id_group, json).await.map(|_| None),
        "getStreamDefaultConfig" => state
            .lprs
            .store
            .get_default_config(id_group)
            .await
            .map(|c| Some(c.unwrap_or_else(|| json!({})))),
        _ => Err(Error::NotFound),
    }
}

fn member_string(json: &Value, member: &str) -> String {
    json.get(member)
        .and_then(fp_domain::convert::as_string)
        .unwrap_or_default()
}

fn vstream_key(id_group: i32, ext: &str) -> String {
    format!("{id_group}_{ext}")
}

async fn add_stream(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    let ext_id = member_string(json, "streamId");
    let config = json.get("config").filter(|v| v.is_object()).cloned();
    state.lprs.store.upsert_stream(id_group, &ext_id, config).await
}

async fn remove_stream(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    require_member(json, "streamId")?;
    let ext_id = member_string(json, "streamId");
    // Wind the workflow down before the row disappears.
    stop_workflow(state, &vstream_key(id_group, &ext_id), false);
    state.lprs.store.remove_stream(id_group, &ext_id).await
}

async fn list_streams(state: &AppState, id_group: i32) -> Result<Value> {
    let rows = state.lprs.store.list_streams(id_group).await?;
    let data: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let mut entry = serde_json::Map::new();
            entry.insert("streamId".into(), json!(row.ext_id));
            if let Some(config) = row.config {
                entry.insert("config".into(), config);
            }
            Value::Object(entry)
        })
        .collect();
    Ok(Value::Array(data))
}

fn workflow_control(state: &AppState, id_group: i32, json: &Value, start: bool) -> Result<()> {
    require_member(json, "streamId")?;
    let key = vstream_key(id_group, &member_string(json, "streamId"));
    if start {
        start_workflow(state, key);
    } else {
        stop_workflow(state, &key, false);
    }
    Ok(())
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    Err(Error::bad_request(format!("Invalid date value: {value}")))
}

/// Tenant ownership check: the stream cache maps every known stream to its
/// group.
fn stream_belongs_to_group(state: &AppState, id_vstream: i32, id_group: i32) -> bool {
    state
        .lprs
        .caches
        .streams
        .load()
        .values()
        .any(|config| config.id_vstream == id_vstream && config.id_group == id_group)
}

async fn get_event_data(state: &AppState, id_group: i32, json: &Value) -> Result<Option<Value>> {
    if let Some(id_event) = json.get("eventId").and_then(|v| v.as_i64()) {
        let Some((log_date, info, id_vstream)) = state.lprs.store.event_by_id(id_event).await? else {
            return Ok(None);
        };
        if !stream_belongs_to_group(state, id_vstream, id_group) {
            return Err(Error::Unauthorized);
        }
        let mut data = info;
        data["date"] = json!(log_date.to_rfc3339());
        return Ok(Some(data));
    }

    require_member(json, "streamId")?;
    require_member(json, "date")?;
    let key = vstream_key(id_group, &member_string(json, "streamId"));
    let (id_vstream, before, after) = {
        let streams = state.lprs.caches.streams.load();
        let Some(config) = streams.get(&key) else {
            return Ok(None);
        };
        (config.id_vstream, config.event_log_before, config.event_log_after)
    };
    let date = parse_datetime(&member_string(json, "date"))?;
    let event = state
        .lprs
        .store
        .nearest_event(
            id_vstream,
            date,
            chrono::Duration::from_std(before).unwrap_or_default(),
            chrono::Duration::from_std(after).unwrap_or_default(),
        )
        .await?;
    Ok(event.map(|row| {
        let mut data = row.info;
        data["date"] = json!(row.log_date.to_rfc3339());
        data
    }))
}

async fn set_default_config(state: &AppState, id_group: i32, json: &Value) -> Result<()> {
    if !json.is_object() {
        return Err(Error::bad_request("Body is not a valid JSON object."));
    }
    state.lprs.store.set_default_config(id_group, json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(vstream_key(2, "gate"), "2_gate");
    }

    #[test]
    fn datetime_accepts_rfc3339_and_naive() {
        assert!(parse_datetime("2024-05-01T12:00:00+03:00").is_ok());
        assert!(parse_datetime("2024-05-01 12:00:00").is_ok());
        assert!(parse_datetime("noon").is_err());
    }
}
