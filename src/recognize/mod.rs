//! Plate recognition contract.
//!
//! The recognition service is consumed through a single synchronous call. Its
//! JSON response is decoded once here into a [`RecognitionResult`]; nothing
//! downstream sees the untyped body except as the stored raw payload.

pub mod client;

pub use client::{HttpPlateRecognizer, RecognizerSettings};

use serde::{Deserialize, Serialize};

use crate::error::RecognitionFailure;
use crate::UNKNOWN_PLATE;

/// One blocking recognition call. Implementations must bound their own latency.
pub trait PlateRecognizer: Send + Sync {
    fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, RecognitionFailure>;
}

/// Normalized recognition outcome. `confidence` is only meaningful when the
/// plate is not [`UNKNOWN_PLATE`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub plate: String,
    pub confidence: f64,
    pub region: Option<String>,
    pub vehicle_type: Option<String>,
    /// Full response body as returned by the service.
    pub raw: serde_json::Value,
}

impl RecognitionResult {
    pub fn unknown(raw: serde_json::Value) -> Self {
        Self {
            plate: UNKNOWN_PLATE.to_string(),
            confidence: 0.0,
            region: None,
            vehicle_type: None,
            raw,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.plate == UNKNOWN_PLATE
    }

    /// Serialized form stored alongside the vehicle event.
    pub fn raw_json(&self) -> String {
        self.raw.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ReaderResponse {
    #[serde(default)]
    results: Option<Vec<ReaderDetection>>,
}

#[derive(Debug, Deserialize)]
struct ReaderDetection {
    #[serde(default)]
    plate: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    region: Option<CodeField>,
    #[serde(default)]
    vehicle: Option<VehicleField>,
}

#[derive(Debug, Deserialize)]
struct CodeField {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VehicleField {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Decode a service response body. The first detection wins; its score is
/// used directly as the confidence.
pub fn parse_response(body: &str) -> Result<RecognitionResult, RecognitionFailure> {
    let raw: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| RecognitionFailure::BadResponse(format!("invalid json: {}", err)))?;
    if !raw.is_object() {
        return Err(RecognitionFailure::BadResponse(
            "response is not a json object".to_string(),
        ));
    }
    let response: ReaderResponse = serde_json::from_value(raw.clone())
        .map_err(|err| RecognitionFailure::BadResponse(err.to_string()))?;

    let Some(first) = response.results.unwrap_or_default().into_iter().next() else {
        return Ok(RecognitionResult::unknown(raw));
    };

    let confidence = first.score.unwrap_or(0.0);
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(RecognitionFailure::BadResponse(format!(
            "score {} outside [0, 1]",
            confidence
        )));
    }

    let plate = match first.plate.map(|p| p.trim().to_string()) {
        Some(plate) if !plate.is_empty() => plate,
        _ => return Ok(RecognitionResult::unknown(raw)),
    };

    Ok(RecognitionResult {
        plate,
        confidence,
        region: first.region.and_then(|r| r.code).filter(|c| !c.is_empty()),
        vehicle_type: first.vehicle.and_then(|v| v.kind).filter(|t| !t.is_empty()),
        raw,
    })
}
