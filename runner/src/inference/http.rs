use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use storyteller_common::frame::{Frame, Geometry};
use tracing::{debug, warn};

use super::{InferenceBackend, InferenceError, InferenceOutput, InferenceRequest};

/// Response header an img2img service sets when its safety checker fired.
pub const REJECTED_HEADER: &str = "x-content-rejected";

/// Sends the camera frame to an img2img HTTP service.
///
/// The request body is the PNG-encoded frame; prompts and sampling
/// parameters travel as query parameters. The response body is the
/// transformed image. A rejection is signalled with HTTP 451 or a
/// `X-Content-Rejected: true` header.
pub struct HttpBackend {
    client: Client,
    endpoint: String,
}

impl HttpBackend {
    /// Build the client. Must run on a blocking thread.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, InferenceError> {
        // No overall timeout: a slow transform only delays the next refresh.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl InferenceBackend for HttpBackend {
    fn transform(&self, request: &InferenceRequest) -> Result<InferenceOutput, InferenceError> {
        let body = request.image.encode_png()?;
        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("prompt", request.prompt.clone()),
                ("negative_prompt", request.negative_prompt.clone()),
                ("width", request.width.to_string()),
                ("height", request.height.to_string()),
                ("strength", request.strength.to_string()),
                ("steps", request.steps.to_string()),
                ("seed", request.seed.to_string()),
            ])
            .header(CONTENT_TYPE, "image/png")
            .body(body)
            .send()?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes()?;
        read_response(status, &headers, &body, request)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Turn a backend response into an output: rejection first, then status,
/// then the image body.
fn read_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    request: &InferenceRequest,
) -> Result<InferenceOutput, InferenceError> {
    if is_rejection(status, headers) {
        warn!(prompt = request.prompt, "inference output rejected by safety checker");
        return Ok(InferenceOutput::Rejected);
    }
    if !status.is_success() {
        return Err(InferenceError::HttpStatus(status.as_u16()));
    }
    let frame = Frame::decode(body)?;
    debug!(
        bytes = body.len(),
        width = frame.width(),
        height = frame.height(),
        "inference response decoded"
    );
    Ok(InferenceOutput::Image(conform(frame, request.width, request.height)))
}

fn is_rejection(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS {
        return true;
    }
    headers
        .get(REJECTED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Bring a response that ignored the requested size back to the target
/// geometry so it composites against the film.
fn conform(frame: Frame, width: u32, height: u32) -> Frame {
    if frame.dimensions() == (width, height) {
        return frame;
    }
    debug!(
        got_width = frame.width(),
        got_height = frame.height(),
        width,
        height,
        "resizing inference output to target geometry"
    );
    Geometry::new(width, width as f64 / height as f64).normalize(frame.as_image())
}
