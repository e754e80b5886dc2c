//! The per-frame license plate recognition pipeline: vehicles → optional
//! special-vehicle classification → per-vehicle plate detection →
//! perspective-rectified character recognition → ban filtering → event
//! emission.

use std::time::Duration;

use fp_domain::frs::LogLevel;
use fp_domain::geometry::{Point2f, RectF};
use fp_domain::lprs::StreamConfig;
use fp_domain::{Error, Result};
use fp_imaging::tensor::{self, Normalization};
use fp_imaging::{warp, Frame};
use fp_infer::InputTensor;
use futures_util::future::join_all;
use image::Rgb;
use serde_json::json;
use uuid::Uuid;

use super::detect;
use super::plates::{assemble_numbers, decode_chars, nms_chars};
use super::{LicensePlate, Vehicle, PLATE_ASPECT, PLATE_CLASSES};
use crate::frs::events::{post_callback, write_artifact};
use crate::state::AppState;
use crate::workflow::Continuation;

const INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn start_workflow(state: &AppState, vstream_key: String) {
    let workflow_timeout = {
        let streams = state.lprs.caches.streams.load();
        match streams.get(&vstream_key) {
            Some(config) => config.workflow_timeout,
            None => return,
        }
    };
    if state.lprs.workflows.begin(&vstream_key, workflow_timeout) {
        spawn_iteration(state.clone(), vstream_key);
    }
}

pub fn stop_workflow(state: &AppState, vstream_key: &str, is_internal: bool) {
    state.lprs.workflows.stop(vstream_key, is_internal);
}

fn spawn_iteration(state: AppState, vstream_key: String) {
    let tracker = state.tracker.clone();
    tracker.spawn(async move {
        process_pipeline(state, vstream_key).await;
    });
}

async fn next_pipeline(state: AppState, vstream_key: String, delay: Duration) {
    tokio::select! {
        _ = state.shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    match state.lprs.workflows.next(&vstream_key) {
        Continuation::Continue => spawn_iteration(state.clone(), vstream_key),
        Continuation::Timeout => {
            tracing::info!(vstream_key = %vstream_key, "Stopping a workflow by timeout")
        }
        Continuation::Stop => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn process_pipeline(state: AppState, vstream_key: String) {
    let config = {
        let streams = state.lprs.caches.streams.load();
        match streams.get(&vstream_key) {
            Some(config) => config.clone(),
            None => {
                stop_workflow(&state, &vstream_key, true);
                return;
            }
        }
    };
    if config.screenshot_url.is_empty() {
        stop_workflow(&state, &vstream_key, true);
        return;
    }

    if config.logs_level <= LogLevel::Debug {
        tracing::debug!(vstream_key = %vstream_key, frame_url = %config.screenshot_url, "start processPipeline");
    }

    match run_iteration(&state, &vstream_key, &config).await {
        Ok(()) => {
            if config.logs_level <= LogLevel::Debug {
                tracing::debug!(vstream_key = %vstream_key, "end processPipeline");
            }
            next_pipeline(state.clone(), vstream_key, config.delay_between_frames).await;
        }
        Err(e) => {
            if config.logs_level <= LogLevel::Error {
                tracing::error!(vstream_key = %vstream_key, error = %e, "pipeline iteration failed");
            }
            if config.delay_after_error > Duration::ZERO {
                if config.logs_level <= LogLevel::Error {
                    tracing::error!(
                        vstream_key = %vstream_key,
                        delay_ms = config.delay_after_error.as_millis() as u64,
                        "delay after pipeline error"
                    );
                }
                next_pipeline(state.clone(), vstream_key, config.delay_after_error).await;
            } else {
                stop_workflow(&state, &vstream_key, true);
            }
        }
    }
}

async fn run_iteration(state: &AppState, vstream_key: &str, config: &StreamConfig) -> Result<()> {
    let image_data = crate::fetch::fetch_frame(
        &state.http,
        &config.screenshot_url,
        config.max_capture_error_count,
        config.capture_timeout,
    )
    .await?;
    let frame = Frame::decode(&image_data)?;

    let mut vehicles = detect_vehicles(state, config, &frame).await?;

    if config.flag_process_special && !vehicles.is_empty() {
        classify_vehicles(state, config, &frame, &mut vehicles).await;
    }
    if config.logs_level <= LogLevel::Trace {
        for (index, vehicle) in vehicles.iter().enumerate() {
            tracing::trace!(vstream_key, index, confidence = vehicle.confidence, "vehicle detected");
        }
    }

    let is_special_banned = state.lprs.bans.is_special_banned(vstream_key);

    detect_vehicle_plates(state, config, &frame, &mut vehicles).await;
    detect::remove_duplicate_plates(&mut vehicles, config, frame.width(), frame.height());

    recognize_plates(state, config, &frame, &mut vehicles).await;

    emit_event(
        state,
        vstream_key,
        config,
        &frame,
        &image_data,
        &vehicles,
        is_special_banned,
    )
    .await;

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inference stages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn detect_vehicles(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
) -> Result<Vec<Vehicle>> {
    let (canvas, letterbox) =
        tensor::letterbox_centered(frame, config.vd_net_input_width, config.vd_net_input_height);
    let chw = tensor::to_chw(&canvas, Normalization::Unit);
    let input = InputTensor::chw(
        &config.vd_net_input_tensor_name,
        config.vd_net_input_height,
        config.vd_net_input_width,
        chw,
    );
    let outputs = state
        .infer
        .infer(
            &config.vd_net_inference_server,
            &config.vd_net_model_name,
            &input,
            &[&config.vd_net_output_tensor_name],
            INFERENCE_TIMEOUT,
        )
        .await?;
    let data = outputs.floats(&config.vd_net_output_tensor_name)?;
    Ok(detect::decode_vehicles(
        data,
        config,
        &letterbox,
        frame.width(),
        frame.height(),
    ))
}

/// Classify each vehicle crop as special/ordinary, concurrently.
async fn classify_vehicles(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
    vehicles: &mut [Vehicle],
) {
    let futures = vehicles.iter().map(|vehicle| {
        let crop = frame.crop(&bbox_rect(&vehicle.bbox));
        async move {
            let resized =
                tensor::resize_exact(&crop.image, config.vc_net_input_width, config.vc_net_input_height);
            let chw = tensor::to_chw(&resized, Normalization::HALF);
            let input = InputTensor::chw(
                &config.vc_net_input_tensor_name,
                config.vc_net_input_height,
                config.vc_net_input_width,
                chw,
            );
            state
                .infer
                .infer(
                    &config.vc_net_inference_server,
                    &config.vc_net_model_name,
                    &input,
                    &[&config.vc_net_output_tensor_name],
                    INFERENCE_TIMEOUT,
                )
                .await
        }
    });
    let results = join_all(futures).await;
    for (vehicle, result) in vehicles.iter_mut().zip(results) {
        match result {
            Ok(outputs) => {
                let Ok(logits) = outputs.floats(&config.vc_net_output_tensor_name) else { continue };
                if logits.len() < 2 {
                    continue;
                }
                let scores = softmax2(logits[0], logits[1]);
                vehicle.is_special = scores[1] > scores[0] && scores[1] > config.special_confidence;
            }
            Err(e) => {
                tracing::error!(error = %e, "vehicle class inference failed");
            }
        }
    }
}

fn softmax2(a: f32, b: f32) -> [f32; 2] {
    let ea = a.exp();
    let eb = b.exp();
    [ea / (ea + eb), eb / (ea + eb)]
}

/// Detect plates in each vehicle crop, concurrently; results come back in
/// absolute frame coordinates and are filtered per the work area and
/// minimum plate height.
async fn detect_vehicle_plates(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
    vehicles: &mut [Vehicle],
) {
    let futures = vehicles.iter().map(|vehicle| {
        let crop = frame.crop(&bbox_rect(&vehicle.bbox));
        async move {
            let (canvas, letterbox) = tensor::letterbox_centered(
                &crop,
                config.lpd_net_input_width,
                config.lpd_net_input_height,
            );
            let chw = tensor::to_chw(&canvas, Normalization::Unit);
            let input = InputTensor::chw(
                &config.lpd_net_input_tensor_name,
                config.lpd_net_input_height,
                config.lpd_net_input_width,
                chw,
            );
            let outputs = state
                .infer
                .infer(
                    &config.lpd_net_inference_server,
                    &config.lpd_net_model_name,
                    &input,
                    &[&config.lpd_net_output_tensor_name],
                    INFERENCE_TIMEOUT,
                )
                .await?;
            Ok::<_, Error>((outputs, letterbox))
        }
    });
    let results = join_all(futures).await;
    for (vehicle, result) in vehicles.iter_mut().zip(results) {
        match result {
            Ok((outputs, letterbox)) => {
                let Ok(data) = outputs.floats(&config.lpd_net_output_tensor_name) else { continue };
                let mut plates = detect::decode_plates(
                    data,
                    PLATE_CLASSES.len(),
                    config,
                    &letterbox,
                    &vehicle.bbox,
                );
                detect::filter_plates(&mut plates, config, frame.width(), frame.height());
                vehicle.plates = plates;
            }
            Err(e) => {
                tracing::error!(error = %e, "plate detection inference failed");
            }
        }
    }
}

/// Rectify each plate quadrilateral and run character recognition,
/// concurrently over all plates of all vehicles.
async fn recognize_plates(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
    vehicles: &mut [Vehicle],
) {
    let mut plate_refs: Vec<&mut LicensePlate> = vehicles
        .iter_mut()
        .flat_map(|vehicle| vehicle.plates.iter_mut())
        .collect();
    if plate_refs.is_empty() {
        return;
    }

    let futures = plate_refs.iter().map(|plate| {
        let quad = [
            Point2f::new(plate.kpts[0], plate.kpts[1]),
            Point2f::new(plate.kpts[2], plate.kpts[3]),
            Point2f::new(plate.kpts[4], plate.kpts[5]),
            Point2f::new(plate.kpts[6], plate.kpts[7]),
        ];
        let aspect = PLATE_ASPECT[plate.plate_class as usize];
        async move {
            let height = (config.lpr_net_input_width as f32 * aspect) as i32;
            let rectified = warp::warp_quad(&frame.image, &quad, config.lpr_net_input_width, height)?;
            let (canvas, letterbox) = tensor::letterbox_centered(
                &Frame::from_rgb(rectified),
                config.lpr_net_input_width,
                config.lpr_net_input_height,
            );
            let chw = tensor::to_chw(&canvas, Normalization::Unit);
            let input = InputTensor::chw(
                &config.lpr_net_input_tensor_name,
                config.lpr_net_input_height,
                config.lpr_net_input_width,
                chw,
            );
            let outputs = state
                .infer
                .infer(
                    &config.lpr_net_inference_server,
                    &config.lpr_net_model_name,
                    &input,
                    &[&config.lpr_net_output_tensor_name],
                    INFERENCE_TIMEOUT,
                )
                .await?;
            Ok::<_, Error>((outputs, letterbox))
        }
    });
    let results = join_all(futures).await;

    for (plate, result) in plate_refs.iter_mut().zip(results) {
        match result {
            Ok((outputs, letterbox)) => {
                let Ok(data) = outputs.floats(&config.lpr_net_output_tensor_name) else { continue };
                let mut chars = decode_chars(data, plate.plate_class, config, &letterbox);
                nms_chars(&mut chars, config.char_iou_threshold);
                plate.numbers =
                    assemble_numbers(&mut chars, plate.plate_class, config.char_iou_threshold);
            }
            Err(e) => {
                tracing::error!(error = %e, "plate recognition inference failed");
            }
        }
    }
}

fn bbox_rect(bbox: &[f32; 4]) -> fp_domain::geometry::Rect {
    fp_domain::geometry::Rect::new(
        bbox[0] as i32,
        bbox[1] as i32,
        (bbox[2] - bbox[0]) as i32,
        (bbox[3] - bbox[1]) as i32,
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event emission
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn emit_event(
    state: &AppState,
    vstream_key: &str,
    config: &StreamConfig,
    frame: &Frame,
    image_data: &[u8],
    vehicles: &[Vehicle],
    is_special_banned: bool,
) {
    let mut vehicles_info = Vec::new();
    let mut callback_plates = Vec::new();
    let mut has_special = false;
    let mut has_failed = false;

    for vehicle in vehicles {
        has_special = has_special || vehicle.is_special;
        let mut plates_info = Vec::new();
        for plate in &vehicle.plates {
            has_failed = has_failed || plate.numbers.is_empty();
            for number in &plate.numbers {
                let banned = state.lprs.bans.check_plate(
                    vstream_key,
                    &number.number,
                    RectF::from_corners(plate.bbox[0], plate.bbox[1], plate.bbox[2], plate.bbox[3]),
                    config.ban_duration,
                    config.ban_duration_area,
                    config.ban_iou_threshold,
                );
                if banned {
                    if config.logs_level <= LogLevel::Debug {
                        tracing::debug!(vstream_key, number = %number.number, "plate number is banned");
                    }
                    continue;
                }
                if config.logs_level <= LogLevel::Info {
                    tracing::info!(vstream_key, number = %number.number, "plate number recognized");
                }
                plates_info.push(json!({
                    "box": [
                        plate.bbox[0] as i32,
                        plate.bbox[1] as i32,
                        plate.bbox[2] as i32,
                        plate.bbox[3] as i32,
                    ],
                    "kpts": plate.kpts.iter().map(|k| *k as i32).collect::<Vec<_>>(),
                    "number": number.number,
                    "score": number.score,
                    "type": PLATE_CLASSES[plate.plate_class as usize],
                }));
                callback_plates.push(json!({
                    "type": PLATE_CLASSES[plate.plate_class as usize],
                    "number": number.number,
                }));
            }
        }

        if !plates_info.is_empty() || (vehicle.is_special && !is_special_banned) {
            vehicles_info.push(json!({
                "plates": plates_info,
                "isSpecial": vehicle.is_special,
                "confidence": vehicle.confidence,
                "box": [
                    vehicle.bbox[0] as i32,
                    vehicle.bbox[1] as i32,
                    vehicle.bbox[2] as i32,
                    vehicle.bbox[3] as i32,
                ],
            }));
        }
    }

    if !vehicles_info.is_empty() {
        let log_date = chrono::Utc::now();
        let uuid = Uuid::new_v4().to_string();
        let mut chars = uuid.chars();
        let suffix = format!(
            "{}/{}/{}/{}/",
            chars.next().unwrap_or('0'),
            chars.next().unwrap_or('0'),
            chars.next().unwrap_or('0'),
            chars.next().unwrap_or('0'),
        );
        let screenshot_url = format!(
            "{}{}{}.jpg",
            state.config.lprs.screenshots_url_prefix, suffix, uuid
        );
        let info = json!({
            "vehicles": vehicles_info,
            "screenshotUrl": screenshot_url,
            "date": log_date.to_rfc3339(),
        });
        let id_event = match state.lprs.store.add_event(config.id_vstream, log_date, &info).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(vstream_key, error = %e, "failed to insert event row");
                -1
            }
        };

        let directory = format!("{}{}", state.config.lprs.screenshots_path, suffix);
        if let Err(e) = write_artifact(&directory, &format!("{uuid}.jpg"), image_data).await {
            tracing::error!(error = %e, "failed to write event screenshot");
        }

        if !config.callback_url.is_empty() {
            let body = json!({
                "streamId": config.ext_id,
                "date": log_date.to_rfc3339(),
                "eventId": id_event,
                "plates": callback_plates,
                "hasSpecial": has_special,
            });
            post_callback(&state.http, &config.callback_url, &body, config.callback_timeout).await;
        }
    }

    if has_special {
        state.lprs.bans.ban_special(vstream_key, config.ban_duration);
    }

    if has_failed && config.flag_save_failed {
        save_failed_artifacts(state, config, frame, image_data, vehicles).await;
    }
}

/// Persist the raw frame plus an annotated copy (work area, vehicle boxes,
/// plate quads) for plates that failed character recognition.
async fn save_failed_artifacts(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
    image_data: &[u8],
    vehicles: &[Vehicle],
) {
    let uuid = Uuid::new_v4().to_string();
    let directory = format!("{}{}/", state.config.lprs.failed_path, config.ext_id);
    if let Err(e) = write_artifact(&directory, &format!("{uuid}.jpg"), image_data).await {
        tracing::error!(error = %e, "failed to write failed-plate screenshot");
        return;
    }

    let mut annotated = frame.image.clone();
    for polygon in config.work_area_absolute(frame.width(), frame.height()) {
        fp_imaging::draw::draw_polygon(&mut annotated, &polygon, Rgb([0, 200, 0]));
    }
    for vehicle in vehicles {
        let polygon = vec![
            Point2f::new(vehicle.bbox[0], vehicle.bbox[1]),
            Point2f::new(vehicle.bbox[2], vehicle.bbox[1]),
            Point2f::new(vehicle.bbox[2], vehicle.bbox[3]),
            Point2f::new(vehicle.bbox[0], vehicle.bbox[3]),
        ];
        let color = if vehicle.is_special { Rgb([200, 0, 0]) } else { Rgb([0, 0, 200]) };
        fp_imaging::draw::draw_polygon(&mut annotated, &polygon, color);
        for plate in &vehicle.plates {
            let quad = vec![
                Point2f::new(plate.kpts[0], plate.kpts[1]),
                Point2f::new(plate.kpts[2], plate.kpts[3]),
                Point2f::new(plate.kpts[4], plate.kpts[5]),
                Point2f::new(plate.kpts[6], plate.kpts[7]),
            ];
            let color = if plate.numbers.is_empty() { Rgb([138, 43, 226]) } else { Rgb([255, 105, 2]) };
            fp_imaging::draw::draw_polygon(&mut annotated, &quad, color);
        }
    }
    match Frame::from_rgb(annotated).encode_jpeg() {
        Ok(bytes) => {
            if let Err(e) = write_artifact(&directory, &format!("{uuid}_draw.jpg"), &bytes).await {
                tracing::error!(error = %e, "failed to write annotated failed-plate frame");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode annotated frame"),
    }
}
