//! The per-frame face recognition pipeline.
//!
//! One invocation handles a single frame for a single stream: fetch, detect,
//! walk the per-face decision cascade (work area → frontality → sharpness →
//! face class → descriptor), match against the stream and special-group
//! galleries, then perform the task-specific tail: event emission for
//! RECOGNIZE, descriptor registration, descriptor collection for
//! PROCESS_FRAME, or artifact dumps for TEST.

use std::time::{Duration, Instant};

use fp_domain::frs::{CommonConfig, LogLevel, StreamConfig};
use fp_domain::geometry::Rect;
use fp_domain::{Error, Result};
use fp_imaging::sharpness::variance_of_laplacian;
use fp_imaging::tensor::{self, Normalization};
use fp_imaging::{warp, Frame};
use fp_infer::InputTensor;
use image::RgbImage;

use super::detect::{self, FaceClass, FaceDetection, FD_OUTPUT_TENSORS, FD_STRIDES};
use super::descriptor::{bytes_from_floats, dot, normalize_l2};
use super::events;
use super::{
    prune_unknown, DnnStats, FaceData, PipelineResult, SGroupFaceData, TaskData, TaskType,
    UnknownDescriptor, FACE_CLASS_NONE, FACE_CLASS_NORMAL, MIME_IMAGE,
};
use crate::fetch;
use crate::state::AppState;
use crate::workflow::Continuation;

const INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);
const DUPLICATE_COSINE: f64 = 0.999;
const REGISTER_IOA: f64 = 0.999;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn start_workflow(state: &AppState, vstream_key: String) {
    let (id_group, workflow_timeout) = {
        let streams = state.frs.caches.streams.load();
        match streams.get(&vstream_key) {
            Some(config) => (config.id_group, config.workflow_timeout),
            None => return,
        }
    };
    if id_group <= 0 {
        return;
    }
    if state.frs.workflows.begin(&vstream_key, workflow_timeout) {
        let task = TaskData::new(id_group, vstream_key, TaskType::Recognize);
        spawn_iteration(state.clone(), task);
    }
}

pub fn stop_workflow(state: &AppState, vstream_key: &str, is_internal: bool) {
    state.frs.workflows.stop(vstream_key, is_internal);
}

fn spawn_iteration(state: AppState, task: TaskData) {
    let tracker = state.tracker.clone();
    tracker.spawn(async move {
        let _ = process_pipeline(state, task).await;
    });
}

/// Interruptible delay, then re-arm unless the workflow was stopped or its
/// deadline passed.
async fn next_pipeline(state: AppState, task: TaskData, delay: Duration) {
    tokio::select! {
        _ = state.shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    match state.frs.workflows.next(&task.vstream_key) {
        Continuation::Continue => spawn_iteration(state.clone(), task),
        Continuation::Timeout => {
            tracing::info!(vstream_key = %task.vstream_key, "Stopping a workflow by timeout")
        }
        Continuation::Stop => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn process_pipeline(state: AppState, task: TaskData) -> PipelineResult {
    let (common, mut config) = {
        let configs = state.frs.caches.configs.load();
        (
            configs.common.get(&task.id_group).cloned().unwrap_or_default(),
            configs
                .default_stream
                .get(&task.id_group)
                .cloned()
                .unwrap_or_default(),
        )
    };

    if !task.vstream_key.is_empty() {
        match state.frs.caches.streams.load().get(&task.vstream_key) {
            Some(stream) => config = stream.clone(),
            None => {
                stop_workflow(&state, &task.vstream_key, true);
                return PipelineResult {
                    comments: format!("Invalid video stream key: {}", task.vstream_key),
                    ..Default::default()
                };
            }
        }
    }
    if config.id_group == 0 {
        config.id_group = task.id_group;
    }

    let url = if task.task_type == TaskType::Recognize {
        config.url.clone()
    } else {
        task.frame_url.clone()
    };

    if config.logs_level <= LogLevel::Debug || task.task_type == TaskType::Test {
        let frame_url = if url.starts_with("data:") { "data:base64..." } else { url.as_str() };
        tracing::debug!(vstream_key = %task.vstream_key, url = frame_url, "start processPipeline");
    }

    let outcome = run_iteration(&state, &task, &common, &config, &url).await;
    let err = match outcome {
        Ok(result) => {
            if config.logs_level <= LogLevel::Debug || task.task_type == TaskType::Test {
                tracing::debug!(vstream_key = %task.vstream_key, "end processPipeline");
            }
            if task.task_type == TaskType::Recognize {
                next_pipeline(state.clone(), task, config.delay_between_frames).await;
            }
            return result;
        }
        Err(e) => e,
    };

    // Error path: RECOGNIZE backs off or stops; everything else surfaces the
    // failure to its caller.
    if config.logs_level <= LogLevel::Error || task.task_type == TaskType::Test {
        tracing::error!(vstream_key = %task.vstream_key, error = %err, "pipeline iteration failed");
    }
    let comments = match &err {
        Error::UpstreamFetch(m) | Error::BadRequest(m) => m.clone(),
        _ => "Error during pipeline execution".to_string(),
    };
    if task.task_type == TaskType::Recognize {
        if config.delay_after_error > Duration::ZERO {
            if config.logs_level <= LogLevel::Error {
                tracing::error!(
                    vstream_key = %task.vstream_key,
                    delay_ms = config.delay_after_error.as_millis() as u64,
                    "delay after pipeline error"
                );
            }
            next_pipeline(state.clone(), task, config.delay_after_error).await;
        } else {
            stop_workflow(&state, &task.vstream_key, true);
        }
    }
    PipelineResult {
        comments,
        ..Default::default()
    }
}

async fn run_iteration(
    state: &AppState,
    task: &TaskData,
    common: &CommonConfig,
    config: &StreamConfig,
    url: &str,
) -> Result<PipelineResult> {
    let mut result = PipelineResult::default();

    let image_data = fetch::fetch_frame(
        &state.http,
        url,
        config.max_capture_error_count,
        config.capture_timeout,
    )
    .await?;
    let frame = Frame::decode(&image_data)?;

    // Work area: margin-shrunk frame intersected with the optional user rect.
    let work_area = if config.work_area.len() == 4 {
        Rect::new(
            (config.work_area[0] * frame.width() as f32 / 100.0) as i32,
            (config.work_area[1] * frame.height() as f32 / 100.0) as i32,
            (config.work_area[2] * frame.width() as f32 / 100.0) as i32,
            (config.work_area[3] * frame.height() as f32 / 100.0) as i32,
        )
    } else {
        Rect::default()
    };
    let margin_x = (config.margin / 100.0 * frame.width() as f32) as i32;
    let margin_y = (config.margin / 100.0 * frame.height() as f32) as i32;
    let mut work_region = Rect::new(
        margin_x,
        margin_y,
        frame.width() - 2 * margin_x,
        frame.height() - 2 * margin_y,
    );
    if !work_area.is_empty() {
        work_region = work_region.intersect(&work_area);
    }

    // Registration searches the whole frame when no hint was supplied.
    let mut hint = task.face_hint;
    if task.task_type == TaskType::RegisterDescriptor {
        if hint.width == 0 {
            hint.width = frame.width();
        }
        if hint.height == 0 {
            hint.height = frame.height();
        }
    }

    let detections = match detect_faces(state, common, config, &frame).await {
        Ok(detections) => Some(detections),
        Err(e) => {
            if config.logs_level <= LogLevel::Error || task.task_type == TaskType::Test {
                tracing::error!(vstream_key = %task.vstream_key, error = %e, "face detection failed");
            }
            None
        }
    };

    let Some(detections) = detections else {
        if task.task_type == TaskType::RegisterDescriptor {
            result.comments = common.comments_inference_error.clone();
        }
        return Ok(result);
    };

    let mut stats = DnnStats {
        fd_count: 1,
        ..Default::default()
    };
    let mut faces: Vec<FaceData> = Vec::with_capacity(detections.len());
    let mut recognized_face_count = 0usize;
    let mut best_quality = 0.0f64;
    let mut best_face_index: i32 = -1;
    let mut best_register_quality = 0.0f64;
    let mut best_register_ioa = 0.0f64;
    let mut best_register_index: i32 = -1;
    let mut has_sgroup_events = false;

    if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
        tracing::trace!(vstream_key = %task.vstream_key, count = detections.len(), "processing detected faces");
    }

    for detection in &detections {
        let face_rect = rect_from_bbox(&detection.bbox);
        let mut face = FaceData::new(face_rect);
        let face_index = faces.len();

        'cascade: {
            // 1. Fully inside the work area.
            if !work_region.contains_rect(&face_rect) {
                break 'cascade;
            }
            face.is_work_area = true;
            face.landmarks = Some(detection.landmarks);

            // 2. Frontality from landmarks.
            if !detect::is_frontal_face(&detection.landmarks) {
                if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
                    tracing::trace!(vstream_key = %task.vstream_key, "face is not frontal according to markers");
                }
                break 'cascade;
            }

            // 3. Align for recognition and measure sharpness.
            let aligned_face = match warp::align_face(
                &frame.image,
                &detection.landmarks,
                common.dnn_fr_input_width,
                common.dnn_fr_input_height,
            ) {
                Ok(aligned) => aligned,
                Err(_) => break 'cascade,
            };
            face.is_frontal = true;

            if task.task_type == TaskType::Test {
                write_test_artifact(&aligned_face, &format!("aligned_face_{}.jpg", face_index + 1))
                    .await;
            }

            let laplacian = variance_of_laplacian(&aligned_face);
            face.laplacian = laplacian;
            if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
                tracing::trace!(vstream_key = %task.vstream_key, laplacian, "sharpness measured");
            }
            if laplacian < config.blur as f64 || laplacian > config.blur_max as f64 {
                break 'cascade;
            }
            face.is_non_blurry = true;

            // 4. Face class must be "normal".
            let aligned_class = match warp::align_face(
                &frame.image,
                &detection.landmarks,
                common.dnn_fc_input_width,
                common.dnn_fc_input_height,
            ) {
                Ok(aligned) => aligned,
                Err(_) => break 'cascade,
            };
            if task.task_type == TaskType::Test {
                write_test_artifact(
                    &aligned_class,
                    &format!("aligned_face_class_{}.jpg", face_index + 1),
                )
                .await;
            }
            match infer_face_class(state, common, config, &aligned_class).await {
                Ok(classes) => {
                    stats.fc_count += 1;
                    face.face_class_index = classes[0].class_index;
                    face.face_class_confidence = classes[0].score;
                    if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
                        tracing::trace!(
                            vstream_key = %task.vstream_key,
                            class = classes[0].class_index,
                            score = classes[0].score,
                            "face class inferred"
                        );
                    }
                }
                Err(e) => {
                    if config.logs_level <= LogLevel::Error || task.task_type == TaskType::Test {
                        tracing::error!(vstream_key = %task.vstream_key, error = %e, "face class inference failed");
                    }
                }
            }
            if face.face_class_index == FACE_CLASS_NONE
                || (face.face_class_index != FACE_CLASS_NORMAL
                    && face.face_class_confidence > config.face_class_confidence)
            {
                break 'cascade;
            }
            face.face_class_index = FACE_CLASS_NORMAL;

            if task.task_type == TaskType::RegisterDescriptor {
                face.ioa = face_rect.ioa(&hint);
            }

            // 5. Extract the descriptor.
            match extract_descriptor(state, common, config, &aligned_face).await {
                Ok(descriptor) => {
                    stats.fr_count += 1;
                    face.descriptor = descriptor;
                }
                Err(e) => {
                    if config.logs_level <= LogLevel::Error || task.task_type == TaskType::Test {
                        tracing::error!(vstream_key = %task.vstream_key, error = %e, "descriptor inference failed");
                    }
                    break 'cascade;
                }
            }

            let mut probe = face.descriptor.clone();
            normalize_l2(&mut probe);

            // Match against the stream gallery and special groups.
            let mut max_cos = -2.0f64;
            let mut id_descriptor = 0i32;
            {
                let descriptors = state.frs.caches.descriptors.load();
                let links = state.frs.caches.stream_links.load();
                let sg_configs = state.frs.caches.sg_configs.load();
                let sg_links = state.frs.caches.sg_links.load();

                if config.id_vstream > 0 {
                    if let Some(gallery) = links.get(&config.id_vstream) {
                        for id in gallery {
                            if let Some(candidate) = descriptors.data.get(id) {
                                let cos = dot(&probe, candidate);
                                if cos > max_cos {
                                    max_cos = cos;
                                    id_descriptor = *id;
                                }
                            }
                        }
                    }
                }
                if let Some(parent) = descriptors.spawned.get(&id_descriptor) {
                    if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
                        tracing::trace!(
                            vstream_key = %task.vstream_key,
                            spawned = id_descriptor,
                            parent = *parent,
                            "substituting spawned descriptor's parent"
                        );
                    }
                    id_descriptor = *parent;
                }

                if task.id_sgroup > 0 {
                    if let Some(gallery) = sg_links.get(&task.id_sgroup) {
                        for id in gallery {
                            if let Some(candidate) = descriptors.data.get(id) {
                                let cos = dot(&probe, candidate);
                                if cos > max_cos {
                                    max_cos = cos;
                                    id_descriptor = *id;
                                }
                            }
                        }
                    }
                } else if let Some(sgroups) = sg_configs.by_group.get(&config.id_group) {
                    for id_sgroup in sgroups {
                        let Some(gallery) = sg_links.get(id_sgroup) else { continue };
                        let mut sg_max = -2.0f64;
                        let mut sg_best = 0i32;
                        for id in gallery {
                            if let Some(candidate) = descriptors.data.get(id) {
                                let cos = dot(&probe, candidate);
                                if cos > sg_max {
                                    sg_max = cos;
                                    sg_best = *id;
                                }
                            }
                        }
                        if sg_best > 0 && sg_max >= config.tolerance as f64 {
                            face.sg_descriptors.insert(
                                *id_sgroup,
                                SGroupFaceData {
                                    cosine_distance: sg_max,
                                    id_descriptor: sg_best,
                                },
                            );
                            has_sgroup_events = true;
                        }
                    }
                }
            }
            face.cosine_distance = max_cos;

            if config.logs_level <= LogLevel::Trace || task.task_type == TaskType::Test {
                tracing::trace!(
                    vstream_key = %task.vstream_key,
                    cosine_distance = max_cos,
                    id_descriptor,
                    "most similar gallery entry"
                );
            }

            if id_descriptor == 0 || max_cos < config.tolerance as f64 {
                // Not recognized.
                if face.laplacian > best_quality && recognized_face_count == 0 {
                    best_quality = face.laplacian;
                    best_face_index = face_index as i32;
                }
                if config.flag_spawned_descriptors && task.task_type == TaskType::Recognize {
                    remember_unknown(state, config, &frame, &face)?;
                }
            } else {
                // Recognized.
                face.id_descriptor = id_descriptor;
                recognized_face_count += 1;
                if recognized_face_count == 1 || face.laplacian > best_quality {
                    best_quality = face.laplacian;
                    best_face_index = face_index as i32;
                }
                if task.task_type == TaskType::ProcessFrame {
                    result.id_descriptors.push(id_descriptor);
                }
                if config.flag_spawned_descriptors && task.task_type == TaskType::Recognize {
                    spawn_descriptor_from_unknown(state, config, &probe, id_descriptor).await;
                }
            }

            if task.task_type == TaskType::RegisterDescriptor {
                if face.ioa > REGISTER_IOA && face.laplacian > best_register_quality {
                    best_register_quality = face.laplacian;
                    best_register_index = face_index as i32;
                }
                if best_register_quality.abs() < 0.001 && face.ioa > best_register_ioa {
                    best_register_ioa = face.ioa;
                    best_register_index = face_index as i32;
                }
            }
        }

        faces.push(face);
    }

    // Inference statistics.
    {
        let mut dnn_stats = state.frs.dnn_stats.lock();
        let entry = dnn_stats.entry(config.id_vstream).or_default();
        entry.fd_count += stats.fd_count;
        entry.fc_count += stats.fc_count;
        entry.fr_count += stats.fr_count;
    }

    // Event emission.
    let mut event_image: Option<Vec<u8>> = None;
    if best_face_index >= 0 && task.task_type == TaskType::Recognize {
        if config.logs_level <= LogLevel::Info {
            tracing::info!(vstream_key = %task.vstream_key, id_vstream = config.id_vstream, "faces detected");
        }
        if !config.title.is_empty() {
            if let Some(font) = &state.frs.osd_font {
                let mut annotated = frame.image.clone();
                draw_osd(&mut annotated, font, config);
                event_image = Frame::from_rgb(annotated).encode_jpeg().ok();
            }
        }
        let image = event_image.as_deref().unwrap_or(&image_data);
        events::emit_recognize_event(
            state,
            config,
            common,
            &faces,
            best_face_index as usize,
            image,
        )
        .await;
    }

    if has_sgroup_events && task.task_type == TaskType::Recognize {
        let image = event_image.as_deref().unwrap_or(&image_data);
        events::emit_sgroup_events(state, config, common, &faces, image).await;
    }

    if task.task_type == TaskType::RegisterDescriptor {
        register_descriptor(
            state,
            task,
            common,
            config,
            &frame,
            &faces,
            best_register_index,
            &mut result,
        )
        .await?;
    }

    if task.task_type == TaskType::Test {
        let mut annotated = frame.image.clone();
        for face in &faces {
            if let Some(landmarks) = &face.landmarks {
                for (k, point) in landmarks.iter().enumerate() {
                    let color = image::Rgb([
                        255 * u8::from(k * 2 > 2),
                        255 * u8::from(k * 2 > 0 && k * 2 < 8),
                        255 * u8::from(k * 2 < 6),
                    ]);
                    fp_imaging::draw::draw_marker(&mut annotated, *point, color);
                }
            }
            fp_imaging::draw::draw_rect(&mut annotated, &face.face_rect, image::Rgb([0, 200, 0]));
        }
        let frame_index = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        write_test_artifact(&annotated, &format!("frame_{frame_index}.jpg")).await;
        tracing::info!(vstream_key = %task.vstream_key, frame_index, "test frame written");
    }

    Ok(result)
}

fn rect_from_bbox(bbox: &[f32; 4]) -> Rect {
    Rect::new(
        bbox[0] as i32,
        bbox[1] as i32,
        (bbox[2] - bbox[0] + 1.0) as i32,
        (bbox[3] - bbox[1] + 1.0) as i32,
    )
}

fn draw_osd(frame: &mut RgbImage, font: &fp_imaging::draw::OsdFont, config: &StreamConfig) {
    use std::fmt::Write as _;
    let mut datetime_text = String::new();
    if write!(datetime_text, "{}", chrono::Local::now().format(&config.osd_dt_format)).is_err() {
        datetime_text = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    }
    let text_height = (config.title_height_ratio * frame.height() as f32).max(8.0);
    // Datetime in the upper left corner, title in the lower left.
    font.draw_outlined(frame, &datetime_text, 10, 10, text_height);
    font.draw_outlined(
        frame,
        &config.title,
        10,
        frame.height() as i32 - 10 - text_height as i32,
        text_height,
    );
}

async fn write_test_artifact(image: &RgbImage, filename: &str) {
    let frame = Frame::from_rgb(image.clone());
    match frame.encode_jpeg() {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(filename, bytes).await {
                tracing::error!(filename, error = %e, "failed to write test artifact");
            }
        }
        Err(e) => tracing::error!(filename, error = %e, "failed to encode test artifact"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawned descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An unknown face joins the per-stream ring with a TTL; it may later be
/// persisted as a spawned descriptor when a known identity shows up.
fn remember_unknown(
    state: &AppState,
    config: &StreamConfig,
    frame: &Frame,
    face: &FaceData,
) -> Result<()> {
    let enlarged = face
        .face_rect
        .enlarged(config.face_enlarge_scale as f64)
        .intersect(&frame.bounds());
    let face_image = frame.crop(&enlarged).encode_jpeg()?;
    if config.logs_level <= LogLevel::Trace {
        tracing::trace!(id_vstream = config.id_vstream, "adding an unknown descriptor");
    }
    let mut rings = state.frs.unknown_descriptors.lock();
    let ring = rings.entry(config.id_vstream).or_default();
    prune_unknown(ring);
    ring.push(UnknownDescriptor {
        expires_at: Instant::now() + config.unknown_descriptor_ttl,
        descriptor: face.descriptor.clone(),
        face_image,
    });
    Ok(())
}

/// On a recognized face, the closest unknown from the ring (above tolerance)
/// becomes a spawned descriptor linked to the recognized identity. The ring
/// is cleared either way.
async fn spawn_descriptor_from_unknown(
    state: &AppState,
    config: &StreamConfig,
    probe: &[f32],
    id_descriptor: i32,
) {
    let candidate = {
        let mut rings = state.frs.unknown_descriptors.lock();
        let ring = rings.entry(config.id_vstream).or_default();
        prune_unknown(ring);
        let mut best: Option<(f64, usize)> = None;
        for (index, unknown) in ring.iter().enumerate() {
            let mut normalized = unknown.descriptor.clone();
            normalize_l2(&mut normalized);
            let cos = dot(probe, &normalized);
            if best.map(|(b, _)| cos > b).unwrap_or(true) {
                best = Some((cos, index));
            }
        }
        let picked = best
            .filter(|(cos, _)| *cos > config.tolerance as f64)
            .map(|(_, index)| {
                let unknown = &ring[index];
                (unknown.descriptor.clone(), unknown.face_image.clone())
            });
        ring.clear();
        picked
    };

    if let Some((descriptor, face_image)) = candidate {
        match state
            .frs
            .store
            .add_face_descriptor(
                config.id_group,
                config.id_vstream,
                &bytes_from_floats(&descriptor),
                &face_image,
                MIME_IMAGE,
                Some(id_descriptor),
            )
            .await
        {
            Ok(id_spawned) => {
                if config.logs_level <= LogLevel::Trace {
                    tracing::trace!(
                        id_vstream = config.id_vstream,
                        id_spawned,
                        id_parent = id_descriptor,
                        "created spawned descriptor"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to persist spawned descriptor"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration tail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn register_descriptor(
    state: &AppState,
    task: &TaskData,
    common: &CommonConfig,
    config: &StreamConfig,
    frame: &Frame,
    faces: &[FaceData],
    best_register_index: i32,
    result: &mut PipelineResult,
) -> Result<()> {
    if best_register_index < 0 {
        result.comments = match faces.first() {
            Some(face) if !face.is_work_area => common.comments_partial_face.clone(),
            Some(face) if !face.is_frontal => common.comments_non_frontal_face.clone(),
            Some(face) if !face.is_non_blurry => common.comments_blurry_face.clone(),
            Some(face) if face.face_class_index != FACE_CLASS_NORMAL => {
                common.comments_non_normal_face_class.clone()
            }
            Some(_) => common.comments_inference_error.clone(),
            None => common.comments_no_faces.clone(),
        };
        return Ok(());
    }

    let face = &faces[best_register_index as usize];
    let crop_rect = face
        .face_rect
        .enlarged(config.face_enlarge_scale as f64)
        .intersect(&frame.bounds());
    let face_image = frame.crop(&crop_rect).encode_jpeg()?;

    if face.cosine_distance > DUPLICATE_COSINE {
        result.id_descriptor = face.id_descriptor;
    } else if task.id_sgroup > 0 {
        let max_count = state
            .frs
            .caches
            .sg_configs
            .load()
            .by_id(task.id_sgroup)
            .map(|c| c.max_descriptor_count)
            .unwrap_or(common.sg_max_descriptor_count);
        result.id_descriptor = state
            .frs
            .store
            .add_sgroup_face_descriptor(
                task.id_sgroup,
                &bytes_from_floats(&face.descriptor),
                &face_image,
                MIME_IMAGE,
                max_count,
            )
            .await?;
    } else {
        result.id_descriptor = state
            .frs
            .store
            .add_face_descriptor(
                config.id_group,
                config.id_vstream,
                &bytes_from_floats(&face.descriptor),
                &face_image,
                MIME_IMAGE,
                None,
            )
            .await?;
    }

    if result.id_descriptor > 0 {
        if face.id_descriptor != result.id_descriptor {
            result.comments = common.comments_new_descriptor.clone();
            if config.logs_level <= LogLevel::Info {
                tracing::info!(vstream_key = %task.vstream_key, id_descriptor = result.id_descriptor, "descriptor created");
            }
        } else {
            result.comments = common.comments_descriptor_exists.clone();
            if config.logs_level <= LogLevel::Info {
                tracing::info!(vstream_key = %task.vstream_key, id_descriptor = result.id_descriptor, "descriptor already exists");
            }
        }
        result.face_image = Some(face_image);
        result.face_rect = face.face_rect;
    } else {
        result.comments = common.comments_descriptor_creation_error.clone();
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inference calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn detect_faces(
    state: &AppState,
    common: &CommonConfig,
    config: &StreamConfig,
    frame: &Frame,
) -> Result<Vec<FaceDetection>> {
    let (canvas, letterbox) =
        tensor::letterbox_top_left(frame, common.dnn_fd_input_width, common.dnn_fd_input_height);
    let chw = tensor::to_chw(&canvas, Normalization::Centered128);
    let input = InputTensor::chw(
        &common.dnn_fd_input_tensor_name,
        common.dnn_fd_input_height,
        common.dnn_fd_input_width,
        chw,
    );
    let outputs = state
        .infer
        .infer(
            &config.dnn_fd_inference_server,
            &common.dnn_fd_model_name,
            &input,
            &FD_OUTPUT_TENSORS,
            INFERENCE_TIMEOUT,
        )
        .await?;

    let mut detections = Vec::new();
    for (i, stride) in FD_STRIDES.iter().enumerate() {
        let scores = outputs.floats(FD_OUTPUT_TENSORS[i])?;
        let bbox_preds = outputs.floats(FD_OUTPUT_TENSORS[i + 3])?;
        let kps_preds = outputs.floats(FD_OUTPUT_TENSORS[i + 6])?;
        detect::decode_stride(
            *stride,
            common.dnn_fd_input_width,
            common.dnn_fd_input_height,
            scores,
            bbox_preds,
            kps_preds,
            config.face_confidence,
            &letterbox,
            &mut detections,
        );
    }
    detect::nms(&mut detections);
    Ok(detections)
}

async fn infer_face_class(
    state: &AppState,
    common: &CommonConfig,
    config: &StreamConfig,
    aligned_face: &RgbImage,
) -> Result<Vec<FaceClass>> {
    let chw = tensor::to_chw(aligned_face, Normalization::IMAGENET);
    let input = InputTensor::chw(
        &common.dnn_fc_input_tensor_name,
        common.dnn_fc_input_height,
        common.dnn_fc_input_width,
        chw,
    );
    let outputs = state
        .infer
        .infer(
            &config.dnn_fc_inference_server,
            &common.dnn_fc_model_name,
            &input,
            &[&common.dnn_fc_output_tensor_name],
            INFERENCE_TIMEOUT,
        )
        .await?;
    let logits = outputs.floats(&common.dnn_fc_output_tensor_name)?;
    let size = common.dnn_fc_output_size as usize;
    if logits.len() < size {
        return Err(Error::Inference(format!(
            "face class output holds {} floats, expected {size}",
            logits.len()
        )));
    }
    Ok(detect::softmax(&logits[..size]))
}

async fn extract_descriptor(
    state: &AppState,
    common: &CommonConfig,
    config: &StreamConfig,
    aligned_face: &RgbImage,
) -> Result<Vec<f32>> {
    let normalization = if common.dnn_fr_model_name == "arcface" {
        Normalization::ArcFace
    } else {
        Normalization::Centered128
    };
    let chw = tensor::to_chw(aligned_face, normalization);
    let input = InputTensor::chw(
        &common.dnn_fr_input_tensor_name,
        common.dnn_fr_input_height,
        common.dnn_fr_input_width,
        chw,
    );
    let outputs = state
        .infer
        .infer(
            &config.dnn_fr_inference_server,
            &common.dnn_fr_model_name,
            &input,
            &[&common.dnn_fr_output_tensor_name],
            INFERENCE_TIMEOUT,
        )
        .await?;
    let floats = outputs.floats(&common.dnn_fr_output_tensor_name)?;
    let size = common.dnn_fr_output_size as usize;
    if floats.len() < size {
        return Err(Error::Inference(format!(
            "descriptor output holds {} floats, expected {size}",
            floats.len()
        )));
    }
    Ok(floats[..size].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_to_rect_is_inclusive() {
        let rect = rect_from_bbox(&[10.0, 20.0, 19.0, 39.0]);
        assert_eq!(rect, Rect::new(10, 20, 10, 20));
    }

    #[test]
    fn work_region_margin_and_area() {
        // Mirrors the pipeline's work-region computation for a 1000x500
        // frame with a 5% margin and a user area covering the left half.
        let frame_w = 1000i32;
        let frame_h = 500i32;
        let margin = 5.0f32;
        let margin_x = (margin / 100.0 * frame_w as f32) as i32;
        let margin_y = (margin / 100.0 * frame_h as f32) as i32;
        let region = Rect::new(margin_x, margin_y, frame_w - 2 * margin_x, frame_h - 2 * margin_y);
        assert_eq!(region, Rect::new(50, 25, 900, 450));
        let user = Rect::new(0, 0, 500, 500);
        assert_eq!(region.intersect(&user), Rect::new(50, 25, 450, 450));
    }
}
