//! Face recognition configuration: per-tenant common parameters and the
//! per-stream parameters, both merged from free-form JSON blobs.
//!
//! Merge semantics: every recognized key overwrites the current value,
//! unknown keys are ignored, missing keys keep whatever was there before.
//! The tenant default stream config is the common blob merged with the
//! tenant's default-stream blob; an individual stream's effective config is
//! that default merged with the stream's own override.

use std::time::Duration;

use serde_json::Value;

use crate::convert::{to_bool, to_duration, to_f32, to_i32, to_string};

// Recognized config keys.
pub mod keys {
    // Common (tenant-wide)
    pub const CALLBACK_TIMEOUT: &str = "callback-timeout";
    pub const FLAG_COPY_EVENT_DATA: &str = "flag-copy-event-data";
    pub const DNN_FD_MODEL_NAME: &str = "dnn-fd-model-name";
    pub const DNN_FD_INPUT_WIDTH: &str = "dnn-fd-input-width";
    pub const DNN_FD_INPUT_HEIGHT: &str = "dnn-fd-input-height";
    pub const DNN_FD_INPUT_TENSOR_NAME: &str = "dnn-fd-input-tensor-name";
    pub const DNN_FC_MODEL_NAME: &str = "dnn-fc-model-name";
    pub const DNN_FC_INPUT_WIDTH: &str = "dnn-fc-input-width";
    pub const DNN_FC_INPUT_HEIGHT: &str = "dnn-fc-input-height";
    pub const DNN_FC_INPUT_TENSOR_NAME: &str = "dnn-fc-input-tensor-name";
    pub const DNN_FC_OUTPUT_TENSOR_NAME: &str = "dnn-fc-output-tensor-name";
    pub const DNN_FC_OUTPUT_SIZE: &str = "dnn-fc-output-size";
    pub const DNN_FR_MODEL_NAME: &str = "dnn-fr-model-name";
    pub const DNN_FR_INPUT_WIDTH: &str = "dnn-fr-input-width";
    pub const DNN_FR_INPUT_HEIGHT: &str = "dnn-fr-input-height";
    pub const DNN_FR_INPUT_TENSOR_NAME: &str = "dnn-fr-input-tensor-name";
    pub const DNN_FR_OUTPUT_TENSOR_NAME: &str = "dnn-fr-output-tensor-name";
    pub const DNN_FR_OUTPUT_SIZE: &str = "dnn-fr-output-size";
    pub const SG_MAX_DESCRIPTOR_COUNT: &str = "sg-max-descriptor-count";
    pub const COMMENTS_BLURRY_FACE: &str = "comments-blurry-face";
    pub const COMMENTS_DESCRIPTOR_CREATION_ERROR: &str = "comments-descriptor-creation-error";
    pub const COMMENTS_DESCRIPTOR_EXISTS: &str = "comments-descriptor-exists";
    pub const COMMENTS_INFERENCE_ERROR: &str = "comments-inference-error";
    pub const COMMENTS_NEW_DESCRIPTOR: &str = "comments-new-descriptor";
    pub const COMMENTS_NO_FACES: &str = "comments-no-faces";
    pub const COMMENTS_NON_FRONTAL_FACE: &str = "comments-non-frontal-face";
    pub const COMMENTS_NON_NORMAL_FACE_CLASS: &str = "comments-non-normal-face-class";
    pub const COMMENTS_PARTIAL_FACE: &str = "comments-partial-face";
    pub const COMMENTS_URL_IMAGE_ERROR: &str = "comments-url-image-error";

    // Per-stream
    pub const BEST_QUALITY_INTERVAL_AFTER: &str = "best-quality-interval-after";
    pub const BEST_QUALITY_INTERVAL_BEFORE: &str = "best-quality-interval-before";
    pub const BLUR: &str = "blur";
    pub const BLUR_MAX: &str = "blur-max";
    pub const CAPTURE_TIMEOUT: &str = "capture-timeout";
    pub const DELAY_AFTER_ERROR: &str = "delay-after-error";
    pub const DELAY_BETWEEN_FRAMES: &str = "delay-between-frames";
    pub const DNN_FD_INFERENCE_SERVER: &str = "dnn-fd-inference-server";
    pub const DNN_FC_INFERENCE_SERVER: &str = "dnn-fc-inference-server";
    pub const DNN_FR_INFERENCE_SERVER: &str = "dnn-fr-inference-server";
    pub const FACE_CLASS_CONFIDENCE: &str = "face-class-confidence";
    pub const FACE_CONFIDENCE: &str = "face-confidence";
    pub const FACE_ENLARGE_SCALE: &str = "face-enlarge-scale";
    pub const FLAG_SPAWNED_DESCRIPTORS: &str = "flag-spawned-descriptors";
    pub const LOGS_LEVEL: &str = "logs-level";
    pub const MARGIN: &str = "margin";
    pub const MAX_CAPTURE_ERROR_COUNT: &str = "max-capture-error-count";
    pub const OPEN_DOOR_DURATION: &str = "open-door-duration";
    pub const TOLERANCE: &str = "tolerance";
    pub const TITLE: &str = "title";
    pub const TITLE_HEIGHT_RATIO: &str = "title-height-ratio";
    pub const OSD_DATETIME_FORMAT: &str = "osd-datetime-format";
    pub const UNKNOWN_DESCRIPTOR_TTL: &str = "unknown-descriptor-ttl";
    pub const WORKFLOW_TIMEOUT: &str = "workflow-timeout";
    pub const WORK_AREA: &str = "work-area";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline log level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stream verbosity gate for pipeline logging. Ordered so that
/// `level <= LogLevel::Debug` means "debug messages are emitted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

fn to_level(value: &Value, default: LogLevel) -> LogLevel {
    match value {
        Value::String(s) => LogLevel::parse(s).unwrap_or(default),
        _ => default,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tenant common config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct CommonConfig {
    pub callback_timeout: Duration,
    pub flag_copy_event_data: bool,
    pub dnn_fd_model_name: String,
    pub dnn_fd_input_width: i32,
    pub dnn_fd_input_height: i32,
    pub dnn_fd_input_tensor_name: String,
    pub dnn_fc_model_name: String,
    pub dnn_fc_input_width: i32,
    pub dnn_fc_input_height: i32,
    pub dnn_fc_input_tensor_name: String,
    pub dnn_fc_output_tensor_name: String,
    pub dnn_fc_output_size: i32,
    pub dnn_fr_model_name: String,
    pub dnn_fr_input_width: i32,
    pub dnn_fr_input_height: i32,
    pub dnn_fr_input_tensor_name: String,
    pub dnn_fr_output_tensor_name: String,
    pub dnn_fr_output_size: i32,
    pub sg_max_descriptor_count: i32,
    pub comments_blurry_face: String,
    pub comments_descriptor_creation_error: String,
    pub comments_descriptor_exists: String,
    pub comments_inference_error: String,
    pub comments_new_descriptor: String,
    pub comments_no_faces: String,
    pub comments_non_frontal_face: String,
    pub comments_non_normal_face_class: String,
    pub comments_partial_face: String,
    pub comments_url_image_error: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(2),
            flag_copy_event_data: false,
            dnn_fd_model_name: "scrfd".into(),
            dnn_fd_input_width: 320,
            dnn_fd_input_height: 320,
            dnn_fd_input_tensor_name: "input.1".into(),
            dnn_fc_model_name: "genet".into(),
            dnn_fc_input_width: 192,
            dnn_fc_input_height: 192,
            dnn_fc_input_tensor_name: "input.1".into(),
            dnn_fc_output_tensor_name: "419".into(),
            dnn_fc_output_size: 3,
            dnn_fr_model_name: "arcface".into(),
            dnn_fr_input_width: 112,
            dnn_fr_input_height: 112,
            dnn_fr_input_tensor_name: "input.1".into(),
            dnn_fr_output_tensor_name: "683".into(),
            dnn_fr_output_size: 512,
            sg_max_descriptor_count: 1000,
            comments_blurry_face: "The face image is not clear enough for registration.".into(),
            comments_descriptor_creation_error: "Failed to register descriptor.".into(),
            comments_descriptor_exists: "The descriptor already exists.".into(),
            comments_inference_error: "Error: inference server request failed.".into(),
            comments_new_descriptor: "A new descriptor has been created.".into(),
            comments_no_faces: "There are no faces in the image.".into(),
            comments_non_frontal_face: "The face in the image must be frontal.".into(),
            comments_non_normal_face_class: "A person wearing a mask or dark glasses.".into(),
            comments_partial_face: "The face must be fully visible in the image.".into(),
            comments_url_image_error: "Failed to receive image.".into(),
        }
    }
}

impl CommonConfig {
    pub fn apply(&mut self, json: &Value) {
        use keys::*;
        let Some(map) = json.as_object() else { return };
        for (key, value) in map {
            match key.as_str() {
                CALLBACK_TIMEOUT => self.callback_timeout = to_duration(value, self.callback_timeout),
                FLAG_COPY_EVENT_DATA => {
                    self.flag_copy_event_data = to_bool(value, self.flag_copy_event_data)
                }
                DNN_FD_MODEL_NAME => self.dnn_fd_model_name = to_string(value, &self.dnn_fd_model_name),
                DNN_FD_INPUT_WIDTH => self.dnn_fd_input_width = to_i32(value, self.dnn_fd_input_width),
                DNN_FD_INPUT_HEIGHT => {
                    self.dnn_fd_input_height = to_i32(value, self.dnn_fd_input_height)
                }
                DNN_FD_INPUT_TENSOR_NAME => {
                    self.dnn_fd_input_tensor_name = to_string(value, &self.dnn_fd_input_tensor_name)
                }
                DNN_FC_MODEL_NAME => self.dnn_fc_model_name = to_string(value, &self.dnn_fc_model_name),
                DNN_FC_INPUT_WIDTH => self.dnn_fc_input_width = to_i32(value, self.dnn_fc_input_width),
                DNN_FC_INPUT_HEIGHT => {
                    self.dnn_fc_input_height = to_i32(value, self.dnn_fc_input_height)
                }
                DNN_FC_INPUT_TENSOR_NAME => {
                    self.dnn_fc_input_tensor_name = to_string(value, &self.dnn_fc_input_tensor_name)
                }
                DNN_FC_OUTPUT_TENSOR_NAME => {
                    self.dnn_fc_output_tensor_name = to_string(value, &self.dnn_fc_output_tensor_name)
                }
                DNN_FC_OUTPUT_SIZE => self.dnn_fc_output_size = to_i32(value, self.dnn_fc_output_size),
                DNN_FR_MODEL_NAME => self.dnn_fr_model_name = to_string(value, &self.dnn_fr_model_name),
                DNN_FR_INPUT_WIDTH => self.dnn_fr_input_width = to_i32(value, self.dnn_fr_input_width),
                DNN_FR_INPUT_HEIGHT => {
                    self.dnn_fr_input_height = to_i32(value, self.dnn_fr_input_height)
                }
                DNN_FR_INPUT_TENSOR_NAME => {
                    self.dnn_fr_input_tensor_name = to_string(value, &self.dnn_fr_input_tensor_name)
                }
                DNN_FR_OUTPUT_TENSOR_NAME => {
                    self.dnn_fr_output_tensor_name = to_string(value, &self.dnn_fr_output_tensor_name)
                }
                DNN_FR_OUTPUT_SIZE => self.dnn_fr_output_size = to_i32(value, self.dnn_fr_output_size),
                SG_MAX_DESCRIPTOR_COUNT => {
                    self.sg_max_descriptor_count = to_i32(value, self.sg_max_descriptor_count)
                }
                COMMENTS_BLURRY_FACE => {
                    self.comments_blurry_face = to_string(value, &self.comments_blurry_face)
                }
                COMMENTS_DESCRIPTOR_CREATION_ERROR => {
                    self.comments_descriptor_creation_error =
                        to_string(value, &self.comments_descriptor_creation_error)
                }
                COMMENTS_DESCRIPTOR_EXISTS => {
                    self.comments_descriptor_exists = to_string(value, &self.comments_descriptor_exists)
                }
                COMMENTS_INFERENCE_ERROR => {
                    self.comments_inference_error = to_string(value, &self.comments_inference_error)
                }
                COMMENTS_NEW_DESCRIPTOR => {
                    self.comments_new_descriptor = to_string(value, &self.comments_new_descriptor)
                }
                COMMENTS_NO_FACES => self.comments_no_faces = to_string(value, &self.comments_no_faces),
                COMMENTS_NON_FRONTAL_FACE => {
                    self.comments_non_frontal_face = to_string(value, &self.comments_non_frontal_face)
                }
                COMMENTS_NON_NORMAL_FACE_CLASS => {
                    self.comments_non_normal_face_class =
                        to_string(value, &self.comments_non_normal_face_class)
                }
                COMMENTS_PARTIAL_FACE => {
                    self.comments_partial_face = to_string(value, &self.comments_partial_face)
                }
                COMMENTS_URL_IMAGE_ERROR => {
                    self.comments_url_image_error = to_string(value, &self.comments_url_image_error)
                }
                _ => {}
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-stream config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub best_quality_interval_after: Duration,
    pub best_quality_interval_before: Duration,
    pub blur: f32,
    pub blur_max: f32,
    pub capture_timeout: Duration,
    pub delay_after_error: Duration,
    pub delay_between_frames: Duration,
    pub dnn_fd_inference_server: String,
    pub dnn_fc_inference_server: String,
    pub dnn_fr_inference_server: String,
    pub face_class_confidence: f32,
    pub face_confidence: f32,
    pub face_enlarge_scale: f32,
    pub flag_spawned_descriptors: bool,
    pub logs_level: LogLevel,
    pub margin: f32,
    pub max_capture_error_count: i32,
    pub open_door_duration: Duration,
    pub tolerance: f32,
    pub title: String,
    pub title_height_ratio: f32,
    pub osd_dt_format: String,
    pub unknown_descriptor_ttl: Duration,
    pub workflow_timeout: Duration,
    /// Work area as `[left%, top%, width%, height%]` of the frame.
    pub work_area: Vec<f32>,

    // Stream identity, filled by the cache layer rather than the JSON blob.
    pub id_group: i32,
    pub id_vstream: i32,
    pub vstream_ext: String,
    pub url: String,
    pub callback_url: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            best_quality_interval_after: Duration::from_secs(2),
            best_quality_interval_before: Duration::from_secs(5),
            blur: 300.0,
            blur_max: 13_000.0,
            capture_timeout: Duration::from_secs(2),
            delay_after_error: Duration::from_secs(30),
            delay_between_frames: Duration::from_secs(1),
            dnn_fd_inference_server: "127.0.0.1:8000".into(),
            dnn_fc_inference_server: "127.0.0.1:8000".into(),
            dnn_fr_inference_server: "127.0.0.1:8000".into(),
            face_class_confidence: 0.7,
            face_confidence: 0.7,
            face_enlarge_scale: 1.5,
            flag_spawned_descriptors: false,
            logs_level: LogLevel::Info,
            margin: 5.0,
            max_capture_error_count: 3,
            open_door_duration: Duration::from_secs(10),
            tolerance: 0.5,
            title: String::new(),
            title_height_ratio: 0.033,
            osd_dt_format: "%Y-%m-%d %H:%M:%S".into(),
            unknown_descriptor_ttl: Duration::from_secs(60),
            workflow_timeout: Duration::ZERO,
            work_area: Vec::new(),
            id_group: 0,
            id_vstream: 0,
            vstream_ext: String::new(),
            url: String::new(),
            callback_url: String::new(),
        }
    }
}

impl StreamConfig {
    pub fn apply(&mut self, json: &Value) {
        use keys::*;
        let Some(map) = json.as_object() else { return };
        for (key, value) in map {
            match key.as_str() {
                BEST_QUALITY_INTERVAL_AFTER => {
                    self.best_quality_interval_after =
                        to_duration(value, self.best_quality_interval_after)
                }
                BEST_QUALITY_INTERVAL_BEFORE => {
                    self.best_quality_interval_before =
                        to_duration(value, self.best_quality_interval_before)
                }
                BLUR => self.blur = to_f32(value, self.blur),
                BLUR_MAX => self.blur_max = to_f32(value, self.blur_max),
                CAPTURE_TIMEOUT => self.capture_timeout = to_duration(value, self.capture_timeout),
                DELAY_AFTER_ERROR => {
                    self.delay_after_error = to_duration(value, self.delay_after_error)
                }
                DELAY_BETWEEN_FRAMES => {
                    self.delay_between_frames = to_duration(value, self.delay_between_frames)
                }
                DNN_FD_INFERENCE_SERVER => {
                    self.dnn_fd_inference_server = to_string(value, &self.dnn_fd_inference_server)
                }
                DNN_FC_INFERENCE_SERVER => {
                    self.dnn_fc_inference_server = to_string(value, &self.dnn_fc_inference_server)
                }
                DNN_FR_INFERENCE_SERVER => {
                    self.dnn_fr_inference_server = to_string(value, &self.dnn_fr_inference_server)
                }
                FACE_CLASS_CONFIDENCE => {
                    self.face_class_confidence = to_f32(value, self.face_class_confidence)
                }
                FACE_CONFIDENCE => self.face_confidence = to_f32(value, self.face_confidence),
                FACE_ENLARGE_SCALE => self.face_enlarge_scale = to_f32(value, self.face_enlarge_scale),
                FLAG_SPAWNED_DESCRIPTORS => {
                    self.flag_spawned_descriptors = to_bool(value, self.flag_spawned_descriptors)
                }
                LOGS_LEVEL => self.logs_level = to_level(value, self.logs_level),
                MARGIN => self.margin = to_f32(value, self.margin),
                MAX_CAPTURE_ERROR_COUNT => {
                    self.max_capture_error_count = to_i32(value, self.max_capture_error_count)
                }
                OPEN_DOOR_DURATION => {
                    self.open_door_duration = to_duration(value, self.open_door_duration)
                }
                TOLERANCE => self.tolerance = to_f32(value, self.tolerance),
                TITLE => self.title = to_string(value, &self.title),
                TITLE_HEIGHT_RATIO => self.title_height_ratio = to_f32(value, self.title_height_ratio),
                OSD_DATETIME_FORMAT => self.osd_dt_format = to_string(value, &self.osd_dt_format),
                UNKNOWN_DESCRIPTOR_TTL => {
                    self.unknown_descriptor_ttl = to_duration(value, self.unknown_descriptor_ttl)
                }
                WORKFLOW_TIMEOUT => self.workflow_timeout = to_duration(value, self.workflow_timeout),
                WORK_AREA => {
                    if let Value::Array(items) = value {
                        let parsed: Vec<f32> =
                            items.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect();
                        if parsed.len() == items.len() {
                            self.work_area = parsed;
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_config_merge_keeps_missing_keys() {
        let mut config = StreamConfig::default();
        config.apply(&json!({
            "blur": 450.0,
            "tolerance": "0.6",
            "delay-between-frames": "250ms",
            "logs-level": "debug",
            "work-area": [10.0, 10.0, 80.0, 80.0],
            "not-a-real-key": 123,
        }));

        assert_eq!(config.blur, 450.0);
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.delay_between_frames, Duration::from_millis(250));
        assert_eq!(config.logs_level, LogLevel::Debug);
        assert_eq!(config.work_area, vec![10.0, 10.0, 80.0, 80.0]);
        // Untouched keys keep their defaults.
        assert_eq!(config.blur_max, 13_000.0);
        assert_eq!(config.face_confidence, 0.7);
    }

    #[test]
    fn second_apply_overrides_first() {
        let mut config = StreamConfig::default();
        config.apply(&json!({"tolerance": 0.4, "title": "entrance"}));
        config.apply(&json!({"tolerance": 0.55}));
        assert_eq!(config.tolerance, 0.55);
        assert_eq!(config.title, "entrance");
    }

    #[test]
    fn invalid_values_keep_previous() {
        let mut config = StreamConfig::default();
        config.apply(&json!({"blur": "not-a-number", "logs-level": "loud", "capture-timeout": "soon"}));
        assert_eq!(config.blur, 300.0);
        assert_eq!(config.logs_level, LogLevel::Info);
        assert_eq!(config.capture_timeout, Duration::from_secs(2));
    }

    #[test]
    fn common_config_merge() {
        let mut config = CommonConfig::default();
        config.apply(&json!({
            "dnn-fr-output-size": 256,
            "dnn-fr-model-name": "insight",
            "flag-copy-event-data": true,
            "callback-timeout": "5s",
        }));
        assert_eq!(config.dnn_fr_output_size, 256);
        assert_eq!(config.dnn_fr_model_name, "insight");
        assert!(config.flag_copy_event_data);
        assert_eq!(config.callback_timeout, Duration::from_secs(5));
        assert_eq!(config.dnn_fd_input_width, 320);
    }
}
