use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use plate_gateway::config::GatewayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PARKING_CONFIG",
        "PARKING_DB_PATH",
        "PARKING_SERIAL_DEVICE",
        "PARKING_SERIAL_BAUD",
        "PARKING_TEMP_DIR",
        "PARKING_ARCHIVE_DIR",
        "PARKING_OCR_API_URL",
        "PARKING_OCR_API_KEY",
        "PARKING_OCR_REGIONS",
        "PARKING_OCR_TIMEOUT_SECS",
        "PARKING_MQTT_BROKER",
        "PARKING_MQTT_USERNAME",
        "PARKING_MQTT_PASSWORD",
        "PARKING_MQTT_SLOT_TOPIC",
        "PARKING_MQTT_EVENT_TOPIC",
        "PARKING_FEED_ADDR",
        "PARKING_WORKERS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "gate_prod.db",
            "serial": {
                "device": "/dev/ttyUSB0",
                "baud": 57600,
                "reconnect_delay_secs": 7
            },
            "storage": {
                "temp_dir": "/var/lib/parking/temp",
                "archive_dir": "/var/lib/parking/archive"
            },
            "recognition": {
                "api_url": "http://ocr.local/v1/plate-reader/",
                "api_key": "file-key",
                "regions": ["vn"],
                "timeout_secs": 12
            },
            "mqtt": {
                "broker": "localhost:1883",
                "slot_topic": "garage/slots"
            },
            "feed": {
                "addr": "0.0.0.0:9100"
            },
            "workers": 3
        }"#,
    );

    std::env::set_var("PARKING_CONFIG", file.path());
    std::env::set_var("PARKING_OCR_API_KEY", "env-key");
    std::env::set_var("PARKING_OCR_REGIONS", "vn, us-ca");
    std::env::set_var("PARKING_WORKERS", "5");
    std::env::set_var("PARKING_MQTT_EVENT_TOPIC", "garage/events");

    let cfg = GatewayConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "gate_prod.db");
    assert_eq!(cfg.serial.device.as_deref(), Some("/dev/ttyUSB0"));
    assert_eq!(cfg.serial.baud, 57600);
    assert_eq!(cfg.serial.reconnect_delay, Duration::from_secs(7));
    assert_eq!(cfg.temp_dir, PathBuf::from("/var/lib/parking/temp"));
    assert_eq!(cfg.archive_dir, PathBuf::from("/var/lib/parking/archive"));
    assert_eq!(cfg.recognition.api_url, "http://ocr.local/v1/plate-reader/");
    assert_eq!(cfg.recognition.api_key.as_deref(), Some("env-key"));
    assert_eq!(cfg.recognition.regions, vec!["vn", "us-ca"]);
    assert_eq!(cfg.recognition.timeout, Duration::from_secs(12));
    assert_eq!(cfg.mqtt.broker.as_deref(), Some("localhost:1883"));
    assert_eq!(cfg.mqtt.slot_topic, "garage/slots");
    assert_eq!(cfg.mqtt.event_topic.as_deref(), Some("garage/events"));
    assert_eq!(cfg.feed.as_ref().unwrap().addr, "0.0.0.0:9100");
    assert_eq!(cfg.workers, 5);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GatewayConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "parking.db");
    assert!(cfg.serial.device.is_none());
    assert_eq!(cfg.temp_dir, PathBuf::from("uploads/temp"));
    assert_eq!(cfg.archive_dir, PathBuf::from("uploads/archive"));
    assert_eq!(
        cfg.recognition.api_url,
        "https://api.platerecognizer.com/v1/plate-reader/"
    );
    assert!(cfg.recognition.api_key.is_none());
    assert!(cfg.mqtt.settings("slots").is_none());
    assert_eq!(cfg.fanout_idle, plate_gateway::notify::DEFAULT_IDLE_INTERVAL);

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("PARKING_SERIAL_BAUD", "fast"),
        ("PARKING_SERIAL_BAUD", "0"),
        ("PARKING_WORKERS", "0"),
        ("PARKING_OCR_TIMEOUT_SECS", "0"),
        ("PARKING_FEED_ADDR", "not-an-address"),
        ("PARKING_MQTT_BROKER", "broker-without-port"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            GatewayConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }

    clear_env();
}

#[test]
fn rejects_unreadable_or_malformed_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PARKING_CONFIG", "/nonexistent/parking.json");
    assert!(GatewayConfig::load().is_err());

    let file = write_config("{ not json");
    std::env::set_var("PARKING_CONFIG", file.path());
    let err = GatewayConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
