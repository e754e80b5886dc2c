//! Remote model-server adapter.
//!
//! Speaks the KServe v2 HTTP inference protocol with the binary tensor
//! extension: a JSON header describing inputs/outputs, followed by raw
//! little-endian FP32 bytes; the response carries an
//! `Inference-Header-Content-Length` header locating the JSON part, with the
//! requested output tensors appended as raw bytes in header order.
//!
//! All failures surface as [`fp_domain::Error::Inference`]; the pipelines log
//! them and skip the affected stage rather than aborting the workflow.

use std::time::Duration;

use fp_domain::{Error, Result};
use serde::Deserialize;
use serde_json::json;

const INFERENCE_HEADER: &str = "Inference-Header-Content-Length";

/// A single FP32 input tensor in CHW layout with a leading batch dimension.
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

impl InputTensor {
    pub fn chw(name: &str, height: i32, width: i32, data: Vec<f32>) -> InputTensor {
        InputTensor {
            name: name.to_string(),
            shape: vec![1, 3, height as i64, width as i64],
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    outputs: Vec<ResponseOutput>,
}

#[derive(Debug, Deserialize)]
struct ResponseOutput {
    name: String,
    #[serde(default)]
    parameters: ResponseParameters,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    binary_data_size: usize,
}

/// Raw output tensors addressable by name as float slices.
#[derive(Debug)]
pub struct InferOutputs {
    tensors: Vec<(String, Vec<f32>)>,
}

impl InferOutputs {
    pub fn floats(&self, name: &str) -> Result<&[f32]> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
            .ok_or_else(|| Error::Inference(format!("output tensor `{name}` missing from response")))
    }
}

/// Thin client over a shared `reqwest::Client`. Connections are pooled per
/// host, so concurrent calls against the same inference server reuse
/// sockets; the wire protocol is identical to a client-per-call setup.
#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
}

impl InferenceClient {
    pub fn new(http: reqwest::Client) -> InferenceClient {
        InferenceClient { http }
    }

    /// Run model `model` on `server` (`host:port`), requesting the named
    /// output tensors as binary data.
    pub async fn infer(
        &self,
        server: &str,
        model: &str,
        input: &InputTensor,
        outputs: &[&str],
        timeout: Duration,
    ) -> Result<InferOutputs> {
        let (header, body) = encode_request(input, outputs);
        let url = format!("http://{server}/v2/models/{model}/infer");

        let response = self
            .http
            .post(&url)
            .header(INFERENCE_HEADER, header.len().to_string())
            .header("Content-Type", "application/octet-stream")
            .body([header, body].concat())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("request to {server} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Inference(format!(
                "model `{model}` on {server} returned {status}"
            )));
        }

        let header_len: usize = response
            .headers()
            .get(INFERENCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Inference("missing inference header length".into()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Inference(format!("reading response body: {e}")))?;

        decode_response(&bytes, header_len)
    }
}

fn encode_request(input: &InputTensor, outputs: &[&str]) -> (Vec<u8>, Vec<u8>) {
    let binary_size = input.data.len() * 4;
    let header = json!({
        "inputs": [{
            "name": input.name,
            "shape": input.shape,
            "datatype": "FP32",
            "parameters": {"binary_data_size": binary_size},
        }],
        "outputs": outputs
            .iter()
            .map(|name| json!({"name": name, "parameters": {"binary_data": true}}))
            .collect::<Vec<_>>(),
    });
    let mut body = Vec::with_capacity(binary_size);
    for value in &input.data {
        body.extend_from_slice(&value.to_le_bytes());
    }
    (header.to_string().into_bytes(), body)
}

fn decode_response(bytes: &[u8], header_len: usize) -> Result<InferOutputs> {
    if bytes.len() < header_len {
        return Err(Error::Inference("response shorter than declared header".into()));
    }
    let header: ResponseHeader = serde_json::from_slice(&bytes[..header_len])
        .map_err(|e| Error::Inference(format!("malformed response header: {e}")))?;

    let mut offset = header_len;
    let mut tensors = Vec::with_capacity(header.outputs.len());
    for output in header.outputs {
        let size = output.parameters.binary_data_size;
        if size % 4 != 0 || offset + size > bytes.len() {
            return Err(Error::Inference(format!(
                "output tensor `{}` has invalid binary size {size}",
                output.name
            )));
        }
        let floats: Vec<f32> = bytes[offset..offset + size]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset += size;
        tensors.push((output.name, floats));
    }
    Ok(InferOutputs { tensors })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding_layout() {
        let input = InputTensor::chw("input.1", 2, 2, vec![0.5; 12]);
        let (header, body) = encode_request(&input, &["448", "471"]);
        let parsed: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(parsed["inputs"][0]["shape"], json!([1, 3, 2, 2]));
        assert_eq!(parsed["inputs"][0]["parameters"]["binary_data_size"], json!(48));
        assert_eq!(parsed["outputs"][1]["name"], json!("471"));
        assert_eq!(body.len(), 48);
        assert_eq!(f32::from_le_bytes([body[0], body[1], body[2], body[3]]), 0.5);
    }

    #[test]
    fn response_decoding_round_trip() {
        let header = json!({
            "model_name": "scrfd",
            "outputs": [
                {"name": "a", "datatype": "FP32", "shape": [2], "parameters": {"binary_data_size": 8}},
                {"name": "b", "datatype": "FP32", "shape": [1], "parameters": {"binary_data_size": 4}},
            ],
        })
        .to_string();
        let mut bytes = header.clone().into_bytes();
        for v in [1.0f32, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let outputs = decode_response(&bytes, header.len()).unwrap();
        assert_eq!(outputs.floats("a").unwrap(), &[1.0, 2.0]);
        assert_eq!(outputs.floats("b").unwrap(), &[3.0]);
        assert!(outputs.floats("c").is_err());
    }

    #[test]
    fn truncated_response_is_error() {
        let header = json!({
            "outputs": [{"name": "a", "parameters": {"binary_data_size": 16}}],
        })
        .to_string();
        let mut bytes = header.clone().into_bytes();
        bytes.extend_from_slice(&1.0f32.to_le_bytes()); // only 4 of 16 bytes
        assert!(decode_response(&bytes, header.len()).is_err());
    }
}
