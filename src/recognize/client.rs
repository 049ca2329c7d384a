//! HTTP client for the plate reader service.

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use std::time::Duration;

use super::{parse_response, PlateRecognizer, RecognitionResult};
use crate::error::RecognitionFailure;

pub const DEFAULT_API_URL: &str = "https://api.platerecognizer.com/v1/plate-reader/";

#[derive(Clone, Debug)]
pub struct RecognizerSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    /// Region hints, sent as one `regions` field each.
    pub regions: Vec<String>,
    pub timeout: Duration,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            regions: vec!["vn".to_string()],
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpPlateRecognizer {
    client: Client,
    settings: RecognizerSettings,
}

impl HttpPlateRecognizer {
    pub fn new(settings: RecognizerSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("build recognition http client")?;
        Ok(Self { client, settings })
    }

    fn form(&self, image: &[u8]) -> Result<Form, RecognitionFailure> {
        let upload = Part::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| RecognitionFailure::Network(err.to_string()))?;
        let mut form = Form::new().part("upload", upload);
        for region in &self.settings.regions {
            form = form.text("regions", region.clone());
        }
        Ok(form)
    }
}

fn transport_failure(err: reqwest::Error) -> RecognitionFailure {
    if err.is_timeout() {
        RecognitionFailure::Timeout
    } else {
        RecognitionFailure::Network(err.to_string())
    }
}

impl PlateRecognizer for HttpPlateRecognizer {
    fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, RecognitionFailure> {
        log::debug!(
            "sending {} bytes to {} (regions: {:?})",
            image.len(),
            self.settings.api_url,
            self.settings.regions
        );
        let mut request = self
            .client
            .post(&self.settings.api_url)
            .multipart(self.form(image)?);
        if let Some(key) = &self.settings.api_key {
            request = request.header("Authorization", format!("Token {}", key));
        }

        let response = request.send().map_err(transport_failure)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            log::warn!("recognition service returned {}: {}", status, body.trim());
            return Err(RecognitionFailure::ServerError {
                status: status.as_u16(),
            });
        }
        let body = response.text().map_err(transport_failure)?;
        parse_response(&body)
    }
}
