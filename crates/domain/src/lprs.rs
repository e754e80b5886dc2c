//! License plate recognition per-stream configuration.
//!
//! Same merge semantics as the FRS side: recognized keys overwrite, unknown
//! keys are ignored, malformed values keep the previous setting. The LPRS
//! work area is a list of polygons in percent coordinates rather than a
//! single rectangle.

use std::time::Duration;

use serde_json::Value;

use crate::convert::{to_bool, to_duration, to_f32, to_i32, to_string};
use crate::frs::LogLevel;
use crate::geometry::Point2f;

pub mod keys {
    pub const CALLBACK_TIMEOUT: &str = "callback-timeout";
    pub const VD_NET_INFERENCE_SERVER: &str = "vd-net-inference-server";
    pub const VD_NET_MODEL_NAME: &str = "vd-net-model-name";
    pub const VD_NET_INPUT_WIDTH: &str = "vd-net-input-width";
    pub const VD_NET_INPUT_HEIGHT: &str = "vd-net-input-height";
    pub const VD_NET_INPUT_TENSOR_NAME: &str = "vd-net-input-tensor-name";
    pub const VD_NET_OUTPUT_TENSOR_NAME: &str = "vd-net-output-tensor-name";
    pub const VC_NET_INFERENCE_SERVER: &str = "vc-net-inference-server";
    pub const VC_NET_MODEL_NAME: &str = "vc-net-model-name";
    pub const VC_NET_INPUT_WIDTH: &str = "vc-net-input-width";
    pub const VC_NET_INPUT_HEIGHT: &str = "vc-net-input-height";
    pub const VC_NET_INPUT_TENSOR_NAME: &str = "vc-net-input-tensor-name";
    pub const VC_NET_OUTPUT_TENSOR_NAME: &str = "vc-net-output-tensor-name";
    pub const LPD_NET_INFERENCE_SERVER: &str = "lpd-net-inference-server";
    pub const LPD_NET_MODEL_NAME: &str = "lpd-net-model-name";
    pub const LPD_NET_INPUT_WIDTH: &str = "lpd-net-input-width";
    pub const LPD_NET_INPUT_HEIGHT: &str = "lpd-net-input-height";
    pub const LPD_NET_INPUT_TENSOR_NAME: &str = "lpd-net-input-tensor-name";
    pub const LPD_NET_OUTPUT_TENSOR_NAME: &str = "lpd-net-output-tensor-name";
    pub const LPR_NET_INFERENCE_SERVER: &str = "lpr-net-inference-server";
    pub const LPR_NET_MODEL_NAME: &str = "lpr-net-model-name";
    pub const LPR_NET_INPUT_WIDTH: &str = "lpr-net-input-width";
    pub const LPR_NET_INPUT_HEIGHT: &str = "lpr-net-input-height";
    pub const LPR_NET_INPUT_TENSOR_NAME: &str = "lpr-net-input-tensor-name";
    pub const LPR_NET_OUTPUT_TENSOR_NAME: &str = "lpr-net-output-tensor-name";
    pub const VEHICLE_CONFIDENCE: &str = "vehicle-confidence";
    pub const VEHICLE_IOU_THRESHOLD: &str = "vehicle-iou-threshold";
    pub const VEHICLE_AREA_RATIO_THRESHOLD: &str = "vehicle-area-ratio-threshold";
    pub const SPECIAL_CONFIDENCE: &str = "special-confidence";
    pub const PLATE_CONFIDENCE: &str = "plate-confidence";
    pub const CHAR_SCORE: &str = "char-score";
    pub const CHAR_IOU_THRESHOLD: &str = "char-iou-threshold";
    pub const MAX_CAPTURE_ERROR_COUNT: &str = "max-capture-error-count";
    pub const CAPTURE_TIMEOUT: &str = "capture-timeout";
    pub const EVENT_LOG_BEFORE: &str = "event-log-before";
    pub const EVENT_LOG_AFTER: &str = "event-log-after";
    pub const DELAY_BETWEEN_FRAMES: &str = "delay-between-frames";
    pub const DELAY_AFTER_ERROR: &str = "delay-after-error";
    pub const BAN_DURATION: &str = "ban-duration";
    pub const BAN_DURATION_AREA: &str = "ban-duration-area";
    pub const BAN_IOU_THRESHOLD: &str = "ban-iou-threshold";
    pub const LOGS_LEVEL: &str = "logs-level";
    pub const MIN_PLATE_HEIGHT: &str = "min-plate-height";
    pub const FLAG_SAVE_FAILED: &str = "flag-save-failed";
    pub const FLAG_PROCESS_SPECIAL: &str = "flag-process-special";
    pub const WORKFLOW_TIMEOUT: &str = "workflow-timeout";

    // Stream-specific
    pub const SCREENSHOT_URL: &str = "screenshot-url";
    pub const CALLBACK_URL: &str = "callback-url";
    pub const WORK_AREA: &str = "work-area";
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub vd_net_inference_server: String,
    pub vd_net_model_name: String,
    pub vd_net_input_width: i32,
    pub vd_net_input_height: i32,
    pub vd_net_input_tensor_name: String,
    pub vd_net_output_tensor_name: String,

    pub vc_net_inference_server: String,
    pub vc_net_model_name: String,
    pub vc_net_input_width: i32,
    pub vc_net_input_height: i32,
    pub vc_net_input_tensor_name: String,
    pub vc_net_output_tensor_name: String,

    pub lpd_net_inference_server: String,
    pub lpd_net_model_name: String,
    pub lpd_net_input_width: i32,
    pub lpd_net_input_height: i32,
    pub lpd_net_input_tensor_name: String,
    pub lpd_net_output_tensor_name: String,

    pub lpr_net_inference_server: String,
    pub lpr_net_model_name: String,
    pub lpr_net_input_width: i32,
    pub lpr_net_input_height: i32,
    pub lpr_net_input_tensor_name: String,
    pub lpr_net_output_tensor_name: String,

    pub callback_timeout: Duration,
    pub vehicle_confidence: f32,
    pub vehicle_iou_threshold: f32,
    pub vehicle_area_ratio_threshold: f32,
    pub special_confidence: f32,
    pub plate_confidence: f32,
    pub char_score: f32,
    pub char_iou_threshold: f32,
    pub max_capture_error_count: i32,
    pub capture_timeout: Duration,
    pub event_log_before: Duration,
    pub event_log_after: Duration,
    pub delay_between_frames: Duration,
    pub delay_after_error: Duration,
    pub ban_duration: Duration,
    pub ban_duration_area: Duration,
    pub ban_iou_threshold: f32,
    pub logs_level: LogLevel,
    pub min_plate_height: i32,
    pub flag_save_failed: bool,
    pub flag_process_special: bool,
    pub workflow_timeout: Duration,
    /// Work area polygons in percent coordinates.
    pub work_area: Vec<Vec<Point2f>>,

    // Stream identity
    pub id_group: i32,
    pub id_vstream: i32,
    pub ext_id: String,
    pub screenshot_url: String,
    pub callback_url: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            vd_net_inference_server: "127.0.0.1:8000".into(),
            vd_net_model_name: "vdnet_yolo".into(),
            vd_net_input_width: 640,
            vd_net_input_height: 640,
            vd_net_input_tensor_name: "images".into(),
            vd_net_output_tensor_name: "output0".into(),
            vc_net_inference_server: "127.0.0.1:8000".into(),
            vc_net_model_name: "vc_genet".into(),
            vc_net_input_width: 224,
            vc_net_input_height: 224,
            vc_net_input_tensor_name: "input".into(),
            vc_net_output_tensor_name: "output".into(),
            lpd_net_inference_server: "127.0.0.1:8000".into(),
            lpd_net_model_name: "lpdnet_yolo".into(),
            lpd_net_input_width: 640,
            lpd_net_input_height: 640,
            lpd_net_input_tensor_name: "images".into(),
            lpd_net_output_tensor_name: "output0".into(),
            lpr_net_inference_server: "127.0.0.1:8000".into(),
            lpr_net_model_name: "lprnet_yolo".into(),
            lpr_net_input_width: 160,
            lpr_net_input_height: 160,
            lpr_net_input_tensor_name: "images".into(),
            lpr_net_output_tensor_name: "output0".into(),
            callback_timeout: Duration::from_secs(2),
            vehicle_confidence: 0.6,
            vehicle_iou_threshold: 0.45,
            vehicle_area_ratio_threshold: 0.01,
            special_confidence: 0.7,
            plate_confidence: 0.6,
            char_score: 0.4,
            char_iou_threshold: 0.7,
            max_capture_error_count: 3,
            capture_timeout: Duration::from_secs(2),
            event_log_before: Duration::from_secs(10),
            event_log_after: Duration::from_secs(5),
            delay_between_frames: Duration::from_secs(1),
            delay_after_error: Duration::from_secs(30),
            ban_duration: Duration::from_secs(30),
            ban_duration_area: Duration::from_secs(12 * 3_600),
            ban_iou_threshold: 0.9,
            logs_level: LogLevel::Info,
            min_plate_height: 0,
            flag_save_failed: false,
            flag_process_special: false,
            workflow_timeout: Duration::ZERO,
            work_area: Vec::new(),
            id_group: 0,
            id_vstream: 0,
            ext_id: String::new(),
            screenshot_url: String::new(),
            callback_url: String::new(),
        }
    }
}

fn to_level(value: &Value, default: LogLevel) -> LogLevel {
    match value {
        Value::String(s) => LogLevel::parse(s).unwrap_or(default),
        _ => default,
    }
}

/// Work-area polygons arrive as `[[[x, y], ...], ...]` percent pairs.
fn to_work_area(value: &Value) -> Option<Vec<Vec<Point2f>>> {
    let polygons = value.as_array()?;
    let mut result = Vec::with_capacity(polygons.len());
    for polygon in polygons {
        let points = polygon.as_array()?;
        let mut poly = Vec::with_capacity(points.len());
        for point in points {
            let pair = point.as_array()?;
            if pair.len() != 2 {
                return None;
            }
            poly.push(Point2f::new(pair[0].as_f64()? as f32, pair[1].as_f64()? as f32));
        }
        if poly.len() < 3 {
            return None;
        }
        result.push(poly);
    }
    Some(result)
}

impl StreamConfig {
    pub fn apply(&mut self, json: &Value) {
        use keys::*;
        let Some(map) = json.as_object() else { return };
        for (key, value) in map {
            match key.as_str() {
                VD_NET_INFERENCE_SERVER => {
                    self.vd_net_inference_server = to_string(value, &self.vd_net_inference_server)
                }
                VD_NET_MODEL_NAME => self.vd_net_model_name = to_string(value, &self.vd_net_model_name),
                VD_NET_INPUT_WIDTH => self.vd_net_input_width = to_i32(value, self.vd_net_input_width),
                VD_NET_INPUT_HEIGHT => {
                    self.vd_net_input_height = to_i32(value, self.vd_net_input_height)
                }
                VD_NET_INPUT_TENSOR_NAME => {
                    self.vd_net_input_tensor_name = to_string(value, &self.vd_net_input_tensor_name)
                }
                VD_NET_OUTPUT_TENSOR_NAME => {
                    self.vd_net_output_tensor_name = to_string(value, &self.vd_net_output_tensor_name)
                }
                VC_NET_INFERENCE_SERVER => {
                    self.vc_net_inference_server = to_string(value, &self.vc_net_inference_server)
                }
                VC_NET_MODEL_NAME => self.vc_net_model_name = to_string(value, &self.vc_net_model_name),
                VC_NET_INPUT_WIDTH => self.vc_net_input_width = to_i32(value, self.vc_net_input_width),
                VC_NET_INPUT_HEIGHT => {
                    self.vc_net_input_height = to_i32(value, self.vc_net_input_height)
                }
                VC_NET_INPUT_TENSOR_NAME => {
                    self.vc_net_input_tensor_name = to_string(value, &self.vc_net_input_tensor_name)
                }
                VC_NET_OUTPUT_TENSOR_NAME => {
                    self.vc_net_output_tensor_name = to_string(value, &self.vc_net_output_tensor_name)
                }
                LPD_NET_INFERENCE_SERVER => {
                    self.lpd_net_inference_server = to_string(value, &self.lpd_net_inference_server)
                }
                LPD_NET_MODEL_NAME => {
                    self.lpd_net_model_name = to_string(value, &self.lpd_net_model_name)
                }
                LPD_NET_INPUT_WIDTH => {
                    self.lpd_net_input_width = to_i32(value, self.lpd_net_input_width)
                }
                LPD_NET_INPUT_HEIGHT => {
                    self.lpd_net_input_height = to_i32(value, self.lpd_net_input_height)
                }
                LPD_NET_INPUT_TENSOR_NAME => {
                    self.lpd_net_input_tensor_name = to_string(value, &self.lpd_net_input_tensor_name)
                }
                LPD_NET_OUTPUT_TENSOR_NAME => {
                    self.lpd_net_output_tensor_name =
                        to_string(value, &self.lpd_net_output_tensor_name)
                }
                LPR_NET_INFERENCE_SERVER => {
                    self.lpr_net_inference_server = to_string(value, &self.lpr_net_inference_server)
                }
                LPR_NET_MODEL_NAME => {
                    self.lpr_net_model_name = to_string(value, &self.lpr_net_model_name)
                }
                LPR_NET_INPUT_WIDTH => {
                    self.lpr_net_input_width = to_i32(value, self.lpr_net_input_width)
                }
                LPR_NET_INPUT_HEIGHT => {
                    self.lpr_net_input_height = to_i32(value, self.lpr_net_input_height)
                }
                LPR_NET_INPUT_TENSOR_NAME => {
                    self.lpr_net_input_tensor_name = to_string(value, &self.lpr_net_input_tensor_name)
                }
                LPR_NET_OUTPUT_TENSOR_NAME => {
                    self.lpr_net_output_tensor_name =
                        to_string(value, &self.lpr_net_output_tensor_name)
                }
                CALLBACK_TIMEOUT => self.callback_timeout = to_duration(value, self.callback_timeout),
                VEHICLE_CONFIDENCE => self.vehicle_confidence = to_f32(value, self.vehicle_confidence),
                VEHICLE_IOU_THRESHOLD => {
                    self.vehicle_iou_threshold = to_f32(value, self.vehicle_iou_threshold)
                }
                VEHICLE_AREA_RATIO_THRESHOLD => {
                    self.vehicle_area_ratio_threshold =
                        to_f32(value, self.vehicle_area_ratio_threshold)
                }
                SPECIAL_CONFIDENCE => self.special_confidence = to_f32(value, self.special_confidence),
                PLATE_CONFIDENCE => self.plate_confidence = to_f32(value, self.plate_confidence),
                CHAR_SCORE => self.char_score = to_f32(value, self.char_score),
                CHAR_IOU_THRESHOLD => self.char_iou_threshold = to_f32(value, self.char_iou_threshold),
                MAX_CAPTURE_ERROR_COUNT => {
                    self.max_capture_error_count = to_i32(value, self.max_capture_error_count)
                }
                CAPTURE_TIMEOUT => self.capture_timeout = to_duration(value, self.capture_timeout),
                EVENT_LOG_BEFORE => self.event_log_before = to_duration(value, self.event_log_before),
                EVENT_LOG_AFTER => self.event_log_after = to_duration(value, self.event_log_after),
                DELAY_BETWEEN_FRAMES => {
                    self.delay_between_frames = to_duration(value, self.delay_between_frames)
                }
                DELAY_AFTER_ERROR => {
                    self.delay_after_error = to_duration(value, self.delay_after_error)
                }
                BAN_DURATION => self.ban_duration = to_duration(value, self.ban_duration),
                BAN_DURATION_AREA => {
                    self.ban_duration_area = to_duration(value, self.ban_duration_area)
                }
                BAN_IOU_THRESHOLD => self.ban_iou_threshold = to_f32(value, self.ban_iou_threshold),
                LOGS_LEVEL => self.logs_level = to_level(value, self.logs_level),
                MIN_PLATE_HEIGHT => self.min_plate_height = to_i32(value, self.min_plate_height),
                FLAG_SAVE_FAILED => self.flag_save_failed = to_bool(value, self.flag_save_failed),
                FLAG_PROCESS_SPECIAL => {
                    self.flag_process_special = to_bool(value, self.flag_process_special)
                }
                WORKFLOW_TIMEOUT => self.workflow_timeout = to_duration(value, self.workflow_timeout),
                SCREENSHOT_URL => self.screenshot_url = to_string(value, &self.screenshot_url),
                CALLBACK_URL => self.callback_url = to_string(value, &self.callback_url),
                WORK_AREA => {
                    if let Some(work_area) = to_work_area(value) {
                        self.work_area = work_area;
                    }
                }
                _ => {}
            }
        }
    }

    /// Work-area polygons converted to absolute pixel coordinates.
    pub fn work_area_absolute(&self, width: i32, height: i32) -> Vec<Vec<Point2f>> {
        self.work_area
            .iter()
            .map(|polygon| {
                polygon
                    .iter()
                    .map(|p| {
                        Point2f::new(p.x * width as f32 / 100.0, p.y * height as f32 / 100.0)
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_and_override() {
        let mut config = StreamConfig::default();
        config.apply(&json!({
            "screenshot-url": "http://cam/shot.jpg",
            "callback-url": "http://host/cb",
            "plate-confidence": 0.7,
            "ban-duration": "45s",
            "flag-process-special": true,
            "bogus": "ignored",
        }));
        assert_eq!(config.screenshot_url, "http://cam/shot.jpg");
        assert_eq!(config.plate_confidence, 0.7);
        assert_eq!(config.ban_duration, Duration::from_secs(45));
        assert!(config.flag_process_special);
        assert_eq!(config.char_score, 0.4);
    }

    #[test]
    fn work_area_polygons() {
        let mut config = StreamConfig::default();
        config.apply(&json!({
            "work-area": [[[0.0, 0.0], [100.0, 0.0], [100.0, 50.0], [0.0, 50.0]]]
        }));
        assert_eq!(config.work_area.len(), 1);
        let wa = config.work_area_absolute(200, 100);
        assert_eq!(wa[0][2], Point2f::new(200.0, 50.0));

        // Malformed polygon is ignored, previous value kept.
        config.apply(&json!({"work-area": [[[1.0], [2.0, 3.0]]]}));
        assert_eq!(config.work_area.len(), 1);
    }
}
