use image::{DynamicImage, GenericImageView, ImageReader};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

use super::{CaptureDevice, CaptureError};

/// Polls a camera's single-frame endpoint (`GET <url>?quality=<q>`) and
/// decodes the JPEG body.
///
/// The blocking client must only be driven from blocking threads
/// (`spawn_blocking`), never from an async task.
pub struct HttpSnapshotDevice {
    url: String,
    quality: u32,
    timeout: Duration,
    client: Option<Client>,
}

impl HttpSnapshotDevice {
    pub fn new(url: impl Into<String>, quality: u32, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            quality,
            timeout,
            client: None,
        }
    }

    fn frame_url(&self) -> String {
        format!("{}?quality={}", self.url, self.quality)
    }

    fn fetch(&self, client: &Client) -> Result<DynamicImage, CaptureError> {
        let resp = client.get(self.frame_url()).send()?;
        let status = resp.status();
        let body = resp.bytes()?;
        decode_snapshot(status, &body)
    }
}

fn decode_snapshot(status: StatusCode, body: &[u8]) -> Result<DynamicImage, CaptureError> {
    if !status.is_success() {
        return Err(CaptureError::HttpStatus(status.as_u16()));
    }
    debug!(bytes = body.len(), "fetched camera snapshot");
    ImageReader::new(Cursor::new(body))
        .with_guessed_format()
        .map_err(|e| CaptureError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))
}

impl CaptureDevice for HttpSnapshotDevice {
    fn open(&mut self) -> Result<(), CaptureError> {
        let client = Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .build()?;
        // Probe once so an unreachable camera fails at startup, not mid-show.
        let probe = self.fetch(&client)?;
        info!(
            url = self.url,
            width = probe.width(),
            height = probe.height(),
            "camera snapshot endpoint reachable"
        );
        self.client = Some(client);
        Ok(())
    }

    fn read(&mut self) -> Result<DynamicImage, CaptureError> {
        let client = self.client.as_ref().ok_or(CaptureError::NotOpen)?;
        self.fetch(client)
    }

    fn release(&mut self) {
        self.client = None;
        info!(url = self.url, "camera snapshot client released");
    }

    fn name(&self) -> &str {
        "http-snapshot"
    }
}
