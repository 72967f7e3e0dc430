use super::{InferenceBackend, InferenceError, InferenceOutput, InferenceRequest};

/// Returns the camera frame untouched. Useful for lining up the camera and
/// the green screen before the model is available.
pub struct PassthroughBackend;

impl InferenceBackend for PassthroughBackend {
    fn transform(&self, request: &InferenceRequest) -> Result<InferenceOutput, InferenceError> {
        Ok(InferenceOutput::Image(request.image.clone()))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
