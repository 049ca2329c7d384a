use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mqtt::MqttSettings;
use crate::notify::feed::FeedConfig;
use crate::notify::DEFAULT_IDLE_INTERVAL;
use crate::recognize::client::DEFAULT_API_URL;
use crate::recognize::RecognizerSettings;
use crate::slots::DEFAULT_SLOT_TOPIC;

const DEFAULT_DB_PATH: &str = "parking.db";
const DEFAULT_BAUD: u32 = 115200;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;
const DEFAULT_TEMP_DIR: &str = "uploads/temp";
const DEFAULT_ARCHIVE_DIR: &str = "uploads/archive";
const DEFAULT_REGION: &str = "vn";
const DEFAULT_OCR_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FEED_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_MQTT_CLIENT_ID: &str = "parkingd";

#[derive(Debug, Deserialize, Default)]
struct GatewayConfigFile {
    db_path: Option<String>,
    serial: Option<SerialConfigFile>,
    storage: Option<StorageConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    mqtt: Option<MqttConfigFile>,
    feed: Option<FeedConfigFile>,
    workers: Option<usize>,
    fanout_idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialConfigFile {
    device: Option<String>,
    baud: Option<u32>,
    reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    temp_dir: Option<PathBuf>,
    archive_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    api_url: Option<String>,
    api_key: Option<String>,
    regions: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    slot_topic: Option<String>,
    event_topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FeedConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub db_path: String,
    pub serial: SerialConfig,
    pub temp_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub recognition: RecognizerSettings,
    pub mqtt: MqttConfig,
    /// `None` disables the live feed.
    pub feed: Option<FeedConfig>,
    pub workers: usize,
    pub fanout_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// `None` reads the device protocol from stdin and writes acks to stdout.
    pub device: Option<String>,
    pub baud: u32,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Slot listener and event publisher stay off without a broker.
    pub broker: Option<String>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub slot_topic: String,
    pub event_topic: Option<String>,
}

impl MqttConfig {
    /// Connection settings, if a broker is configured. `suffix` keeps client ids
    /// unique when more than one connection is opened.
    pub fn settings(&self, suffix: &str) -> Option<MqttSettings> {
        self.broker.as_ref().map(|broker| MqttSettings {
            broker: broker.clone(),
            client_id: format!("{}-{}", self.client_id, suffix),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(GatewayConfigFile::default())
    }
}

impl GatewayConfig {
    /// Load from the file named by `PARKING_CONFIG` (if any), then environment.
    pub fn load() -> Result<Self> {
        let config_path = env_nonempty("PARKING_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Self {
        let serial = file.serial.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let feed = file.feed.unwrap_or_default();

        let feed = if feed.enabled.unwrap_or(true) {
            Some(FeedConfig {
                addr: feed.addr.unwrap_or_else(|| DEFAULT_FEED_ADDR.to_string()),
                ..FeedConfig::default()
            })
        } else {
            None
        };

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            serial: SerialConfig {
                device: serial.device.filter(|d| !d.trim().is_empty()),
                baud: serial.baud.unwrap_or(DEFAULT_BAUD),
                reconnect_delay: Duration::from_secs(
                    serial
                        .reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
            },
            temp_dir: storage
                .temp_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            archive_dir: storage
                .archive_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_DIR)),
            recognition: RecognizerSettings {
                api_url: recognition
                    .api_url
                    .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                api_key: recognition.api_key.filter(|k| !k.trim().is_empty()),
                regions: recognition
                    .regions
                    .unwrap_or_else(|| vec![DEFAULT_REGION.to_string()]),
                timeout: Duration::from_secs(
                    recognition.timeout_secs.unwrap_or(DEFAULT_OCR_TIMEOUT_SECS),
                ),
            },
            mqtt: MqttConfig {
                broker: mqtt.broker.filter(|b| !b.trim().is_empty()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                slot_topic: mqtt
                    .slot_topic
                    .unwrap_or_else(|| DEFAULT_SLOT_TOPIC.to_string()),
                event_topic: mqtt.event_topic.filter(|t| !t.trim().is_empty()),
            },
            feed,
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            fanout_idle: file
                .fanout_idle_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_INTERVAL),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("PARKING_DB_PATH") {
            self.db_path = path;
        }
        if let Some(device) = env_nonempty("PARKING_SERIAL_DEVICE") {
            self.serial.device = Some(device);
        }
        if let Some(baud) = env_nonempty("PARKING_SERIAL_BAUD") {
            self.serial.baud = baud
                .parse()
                .map_err(|_| anyhow!("PARKING_SERIAL_BAUD must be an integer baud rate"))?;
        }
        if let Some(dir) = env_nonempty("PARKING_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("PARKING_ARCHIVE_DIR") {
            self.archive_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_nonempty("PARKING_OCR_API_URL") {
            self.recognition.api_url = url;
        }
        if let Some(key) = env_nonempty("PARKING_OCR_API_KEY") {
            self.recognition.api_key = Some(key);
        }
        if let Ok(regions) = std::env::var("PARKING_OCR_REGIONS") {
            let parsed = split_csv(&regions);
            if !parsed.is_empty() {
                self.recognition.regions = parsed;
            }
        }
        if let Some(timeout) = env_nonempty("PARKING_OCR_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("PARKING_OCR_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.recognition.timeout = Duration::from_secs(seconds);
        }
        if let Some(broker) = env_nonempty("PARKING_MQTT_BROKER") {
            self.mqtt.broker = Some(broker);
        }
        if let Some(user) = env_nonempty("PARKING_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = env_nonempty("PARKING_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = env_nonempty("PARKING_MQTT_SLOT_TOPIC") {
            self.mqtt.slot_topic = topic;
        }
        if let Some(topic) = env_nonempty("PARKING_MQTT_EVENT_TOPIC") {
            self.mqtt.event_topic = Some(topic);
        }
        if let Some(addr) = env_nonempty("PARKING_FEED_ADDR") {
            self.feed = Some(FeedConfig {
                addr,
                ..self.feed.clone().unwrap_or_default()
            });
        }
        if let Some(workers) = env_nonempty("PARKING_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| anyhow!("PARKING_WORKERS must be a positive integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.baud == 0 {
            return Err(anyhow!("serial baud rate must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        if self.recognition.timeout.is_zero() {
            return Err(anyhow!("recognition timeout must be greater than zero"));
        }
        if self.recognition.api_url.trim().is_empty() {
            return Err(anyhow!("recognition api url must not be empty"));
        }
        if self.fanout_idle.is_zero() {
            return Err(anyhow!("fan-out idle interval must be greater than zero"));
        }
        if self.temp_dir == self.archive_dir {
            return Err(anyhow!(
                "temp and archive directories must differ ({})",
                self.temp_dir.display()
            ));
        }
        if let Some(feed) = &self.feed {
            feed.addr
                .parse::<std::net::SocketAddr>()
                .map_err(|_| anyhow!("invalid feed address '{}'", feed.addr))?;
        }
        if let Some(settings) = self.mqtt.settings("check") {
            settings.endpoint()?;
        }
        Ok(())
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
