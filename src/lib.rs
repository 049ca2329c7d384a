//! Plate Gateway
//!
//! This crate ingests JPEG images streamed by a gate camera over a serial link,
//! recognizes the license plate through an external recognition service, and
//! persists the outcome while notifying live viewers.
//!
//! # Architecture
//!
//! ```text
//! link (serial/stdin) -> frame decoder -> ingest pool -> recognizer
//!                                              |-> images (temp/archive)
//!                                              |-> persistence worker (sqlite)
//!                                              |-> device ack (link)
//!                                              '-> notification fan-out -> subscribers
//! ```
//!
//! The link reader never blocks on recognition: decoded images are handed to a
//! worker pool over a channel. Persistence runs on its own worker thread and the
//! fan-out owns a single delivery loop.
//!
//! # Module Structure
//!
//! - `frame`: line protocol decoder (START_IMAGE .. END_IMAGE)
//! - `link`: line transport, device acknowledgments, reader loop
//! - `recognize`: recognition service contract and HTTP client
//! - `images`: staging, archiving and discarding image files
//! - `storage` / `persist`: vehicle log and slot state persistence
//! - `ingest`: per-image orchestration and worker pool
//! - `notify`: notification fan-out and the live TCP feed
//! - `slots`: slot occupancy updates over MQTT
//! - `mqtt`: broker address parsing and connection options
//! - `gateway`: composition of the above for the daemon

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod images;
pub mod ingest;
pub mod link;
pub mod mqtt;
pub mod notify;
pub mod persist;
pub mod recognize;
pub mod slots;
pub mod storage;

pub use config::GatewayConfig;
pub use error::{FrameError, IngestError, RecognitionFailure};
pub use frame::{DecoderEvent, DecoderState, Frame, FrameDecoder};
pub use gateway::Gateway;
pub use images::ImageStore;
pub use ingest::{Disposition, IngestOrchestrator, IngestPool, ImageSubmitter};
pub use link::{AckSink, DeviceAck, LineSource, LinkRead, LinkReader};
pub use notify::{FanOut, NotificationEvent, Notifier, Subscriber, SubscriberRegistry};
pub use persist::{PersistenceHandle, PersistenceWorker};
pub use recognize::{PlateRecognizer, RecognitionResult};
pub use storage::{EventStore, InMemoryEventStore, SqliteEventStore};

/// Plate value reported when the recognizer found nothing usable.
pub const UNKNOWN_PLATE: &str = "UNKNOWN";

/// Timestamp format used in image file names.
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

// -------------------- Images --------------------

/// A validated frame: the decoded byte length matched the declared length.
#[derive(Clone, Debug)]
pub struct Image {
    bytes: Vec<u8>,
    captured_at: DateTime<Local>,
}

impl Image {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Local::now(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Local-time tag used to name the staged and archived files.
    pub fn timestamp_tag(&self) -> String {
        self.captured_at.format(FILE_TIMESTAMP_FORMAT).to_string()
    }
}

// -------------------- Vehicle Log --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VehicleAction {
    Entry,
    Exit,
}

impl VehicleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleAction::Entry => "entry",
            VehicleAction::Exit => "exit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entry" => Some(VehicleAction::Entry),
            "exit" => Some(VehicleAction::Exit),
            _ => None,
        }
    }
}

/// A vehicle event that has not been written yet.
#[derive(Clone, Debug)]
pub struct NewVehicleEvent {
    pub plate: String,
    pub image_path: PathBuf,
    /// Serialized recognition result.
    pub raw_result: String,
    pub confidence: f64,
    pub action: VehicleAction,
}

/// Durable record of one ingestion outcome. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleEvent {
    pub id: i64,
    pub plate: String,
    pub image_path: String,
    pub raw_result: String,
    pub confidence: f64,
    pub action: VehicleAction,
    pub timestamp: DateTime<Utc>,
}

// -------------------- Slots --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotState {
    pub slot_id: String,
    pub occupied: bool,
    pub last_updated: DateTime<Utc>,
}
