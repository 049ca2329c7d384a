use anyhow::Result;
use crossbeam_channel::Receiver;
use serde_json::json;
use std::io::{BufRead, BufReader, Cursor};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plate_gateway::ingest::{IngestPool, IngestProgress, IngestStep};
use plate_gateway::link::BufReadSource;
use plate_gateway::notify::ChannelSubscriber;
use plate_gateway::{
    AckSink, Disposition, FanOut, GatewayConfig, Gateway, Image, ImageStore, InMemoryEventStore,
    IngestOrchestrator, LinkReader, NotificationEvent, PersistenceWorker, PlateRecognizer,
    RecognitionFailure, RecognitionResult,
};

type Respond = dyn Fn(&[u8]) -> Result<RecognitionResult, RecognitionFailure> + Send + Sync;

struct FakeRecognizer {
    respond: Box<Respond>,
    calls: AtomicUsize,
}

impl FakeRecognizer {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&[u8]) -> Result<RecognitionResult, RecognitionFailure> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }

    fn plate(plate: &'static str, confidence: f64) -> Arc<Self> {
        Self::new(move |_| Ok(result(plate, confidence)))
    }

    fn failing(failure: fn() -> RecognitionFailure) -> Arc<Self> {
        Self::new(move |_| Err(failure()))
    }
}

impl PlateRecognizer for FakeRecognizer {
    fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, RecognitionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(image)
    }
}

#[derive(Default)]
struct RecordingAcks {
    lines: Mutex<Vec<String>>,
}

impl RecordingAcks {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl AckSink for RecordingAcks {
    fn send_line(&self, line: &str) -> Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

fn result(plate: &str, confidence: f64) -> RecognitionResult {
    RecognitionResult {
        plate: plate.to_string(),
        confidence,
        region: Some("vn".to_string()),
        vehicle_type: None,
        raw: json!({"results": [{"plate": plate, "score": confidence}]}),
    }
}

fn jpeg_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend((0..len.saturating_sub(6)).map(|i| (i % 251) as u8));
    bytes.extend([0xFF, 0xD9]);
    bytes
}

fn frame_text(bytes: &[u8]) -> String {
    let mut text = format!("START_IMAGE\nSIZE:{}\nDATA_START\n", bytes.len());
    for chunk in bytes.chunks(32) {
        text.push_str(&hex::encode_upper(chunk));
        text.push('\n');
    }
    text.push_str("DATA_END\nEND_IMAGE\n");
    text
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

struct Harness {
    _root: tempfile::TempDir,
    temp_dir: std::path::PathBuf,
    archive_dir: std::path::PathBuf,
    store: InMemoryEventStore,
    acks: Arc<RecordingAcks>,
    events: Receiver<NotificationEvent>,
    orchestrator: Option<Arc<IngestOrchestrator>>,
    fanout: Option<FanOut>,
    worker: Option<PersistenceWorker>,
}

impl Harness {
    fn new(recognizer: Arc<dyn PlateRecognizer>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let temp_dir = root.path().join("temp");
        let archive_dir = root.path().join("archive");
        let images = ImageStore::new(&temp_dir, &archive_dir).unwrap();

        let store = InMemoryEventStore::new();
        let (worker, persistence) = PersistenceWorker::spawn(store.clone()).unwrap();
        let fanout = FanOut::start(Duration::from_millis(20)).unwrap();
        let (subscriber, events) = ChannelSubscriber::new("test");
        fanout.registry().register(Arc::new(subscriber));

        let acks = Arc::new(RecordingAcks::default());
        let orchestrator = IngestOrchestrator::new(
            images,
            recognizer,
            persistence,
            acks.clone(),
            fanout.notifier(),
        );

        Self {
            _root: root,
            temp_dir,
            archive_dir,
            store,
            acks,
            events,
            orchestrator: Some(Arc::new(orchestrator)),
            fanout: Some(fanout),
            worker: Some(worker),
        }
    }

    fn orchestrator(&self) -> &IngestOrchestrator {
        self.orchestrator.as_ref().unwrap()
    }

    fn next_event(&self) -> NotificationEvent {
        self.events
            .recv_timeout(Duration::from_secs(2))
            .expect("notification delivered")
    }

    fn assert_no_event(&self) {
        assert!(self
            .events
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.take();
        if let Some(fanout) = self.fanout.take() {
            fanout.stop();
        }
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
    }
}

#[test]
fn confident_read_is_archived_recorded_acked_and_announced() {
    let harness = Harness::new(FakeRecognizer::plate("30A-12345", 0.91));

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(2048)))
        .unwrap();

    let path = match &disposition {
        Disposition::Archived {
            path,
            plate,
            confidence,
        } => {
            assert_eq!(plate, "30A-12345");
            assert!((confidence - 0.91).abs() < f64::EPSILON);
            path.clone()
        }
        other => panic!("expected archived image, got {:?}", other),
    };
    assert!(path.starts_with(&harness.archive_dir));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("30A-12345_"), "{}", name);
    assert!(name.ends_with(".jpg"));
    assert_eq!(std::fs::read(&path).unwrap().len(), 2048);
    assert!(files_in(&harness.temp_dir).is_empty());

    let events = harness.store.vehicle_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].plate, "30A-12345");
    assert_eq!(events[0].image_path, path.to_string_lossy());
    assert!(events[0].raw_result.contains("30A-12345"));

    assert_eq!(
        harness.acks.lines(),
        vec!["ACK:SUCCESS,PLATE:30A-12345,CONF:0.91".to_string()]
    );

    match harness.next_event() {
        NotificationEvent::NewVehicle {
            plate, image_path, ..
        } => {
            assert_eq!(plate, "30A-12345");
            assert_eq!(image_path, path.to_string_lossy());
        }
        other => panic!("unexpected notification {:?}", other),
    }
    harness.assert_no_event();
}

#[test]
fn recognition_timeout_discards_image_and_reports_failure() {
    let harness = Harness::new(FakeRecognizer::failing(|| RecognitionFailure::Timeout));

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(512)))
        .unwrap();

    assert_eq!(disposition, Disposition::Discarded { cause: "timeout" });
    assert!(files_in(&harness.temp_dir).is_empty());
    assert!(files_in(&harness.archive_dir).is_empty());
    assert!(harness.store.vehicle_events().is_empty());
    assert_eq!(
        harness.acks.lines(),
        vec!["ACK:FAILED,ERROR:OCR_FAILED".to_string()]
    );
    harness.assert_no_event();
}

#[test]
fn server_error_and_bad_response_are_discarded_too() {
    for cause in ["server_error", "bad_response", "network"] {
        let recognizer = FakeRecognizer::new(move |_| {
            Err(match cause {
                "server_error" => RecognitionFailure::ServerError { status: 503 },
                "bad_response" => RecognitionFailure::BadResponse("not json".to_string()),
                _ => RecognitionFailure::Network("connection refused".to_string()),
            })
        });
        let harness = Harness::new(recognizer);
        let disposition = harness
            .orchestrator()
            .process(Image::new(jpeg_bytes(64)))
            .unwrap();
        assert_eq!(disposition, Disposition::Discarded { cause });
        assert!(files_in(&harness.temp_dir).is_empty());
        assert_eq!(
            harness.acks.lines(),
            vec!["ACK:FAILED,ERROR:OCR_FAILED".to_string()]
        );
    }
}

#[test]
fn confidence_at_threshold_stays_temporary() {
    let harness = Harness::new(FakeRecognizer::plate("51F-99999", 0.5));

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(256)))
        .unwrap();

    let path = match &disposition {
        Disposition::KeptTemporary { path, plate, .. } => {
            assert_eq!(plate, "51F-99999");
            path.clone()
        }
        other => panic!("expected temporary image, got {:?}", other),
    };
    assert!(path.starts_with(&harness.temp_dir));
    assert!(path.exists());
    assert!(files_in(&harness.archive_dir).is_empty());

    let events = harness.store.vehicle_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].image_path, path.to_string_lossy());
    assert_eq!(
        harness.acks.lines(),
        vec!["ACK:SUCCESS,PLATE:51F-99999,CONF:0.50".to_string()]
    );
    assert_eq!(harness.next_event().kind(), "new_vehicle");
}

#[test]
fn confidence_just_above_threshold_is_archived() {
    let harness = Harness::new(FakeRecognizer::plate("51F-99999", 0.50001));

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(256)))
        .unwrap();

    assert!(matches!(disposition, Disposition::Archived { .. }));
    assert_eq!(files_in(&harness.archive_dir).len(), 1);
    assert!(files_in(&harness.temp_dir).is_empty());
}

#[test]
fn unknown_plate_is_kept_and_still_acknowledged() {
    let recognizer = FakeRecognizer::new(|_| Ok(RecognitionResult::unknown(json!({"results": []}))));
    let harness = Harness::new(recognizer);

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(128)))
        .unwrap();

    match &disposition {
        Disposition::KeptTemporary { plate, .. } => assert_eq!(plate, "UNKNOWN"),
        other => panic!("expected temporary image, got {:?}", other),
    }
    assert_eq!(files_in(&harness.temp_dir).len(), 1);
    assert_eq!(harness.store.vehicle_events()[0].plate, "UNKNOWN");
    assert_eq!(
        harness.acks.lines(),
        vec!["ACK:SUCCESS,PLATE:UNKNOWN,CONF:0.00".to_string()]
    );
}

#[test]
fn persistence_failure_does_not_block_ack_or_notification() {
    let harness = Harness::new(FakeRecognizer::plate("29B-55555", 0.87));
    harness.store.fail_writes(true);

    let disposition = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(300)))
        .unwrap();

    assert!(matches!(disposition, Disposition::Archived { .. }));
    assert!(harness.store.vehicle_events().is_empty());
    assert_eq!(
        harness.acks.lines(),
        vec!["ACK:SUCCESS,PLATE:29B-55555,CONF:0.87".to_string()]
    );
    assert_eq!(harness.next_event().kind(), "new_vehicle");
}

#[test]
fn staging_failure_abandons_image_before_recognition() {
    let recognizer = FakeRecognizer::plate("30A-12345", 0.91);
    let harness = Harness::new(recognizer.clone());
    std::fs::remove_dir_all(&harness.temp_dir).unwrap();

    let err = harness
        .orchestrator()
        .process(Image::new(jpeg_bytes(100)))
        .unwrap_err();

    assert!(err.to_string().contains("failed to stage image"));
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    assert!(harness.acks.lines().is_empty());
    harness.assert_no_event();
}

#[test]
fn panic_during_recognition_reports_the_step_and_staged_file() {
    let recognizer = FakeRecognizer::new(|_| panic!("recognizer bug"));
    let harness = Harness::new(recognizer);

    let mut progress = IngestProgress::default();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        harness
            .orchestrator()
            .process_tracked(Image::new(jpeg_bytes(100)), &mut progress)
    }));

    assert!(outcome.is_err());
    assert_eq!(progress.step(), IngestStep::Recognize);
    let left = progress.image_path().expect("image was staged");
    assert!(left.starts_with(&harness.temp_dir));
    assert!(left.exists());
    assert!(harness.acks.lines().is_empty());
}

#[test]
fn pool_worker_survives_a_panicking_image() {
    let recognizer = FakeRecognizer::new(|image| {
        if image.len() == 400 {
            panic!("recognizer bug");
        }
        Ok(result("30A-12345", 0.93))
    });
    let harness = Harness::new(recognizer.clone());
    let pool = IngestPool::start(harness.orchestrator.clone().unwrap(), 1).unwrap();
    let submitter = pool.submitter();

    assert!(submitter.submit(Image::new(jpeg_bytes(400))));
    assert!(submitter.submit(Image::new(jpeg_bytes(1000))));

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().completed() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let stats = pool.shutdown();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.archived, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(files_in(&harness.archive_dir).len(), 1);
    // The panicking run leaves its staged file for inspection.
    assert_eq!(files_in(&harness.temp_dir).len(), 1);
}

#[test]
fn pool_processes_every_frame_read_from_the_link() {
    let recognizer = FakeRecognizer::new(|image| {
        if image.len() == 400 {
            Err(RecognitionFailure::Timeout)
        } else {
            Ok(result("30A-12345", 0.93))
        }
    });
    let harness = Harness::new(recognizer.clone());
    let pool = IngestPool::start(harness.orchestrator.clone().unwrap(), 2).unwrap();
    let submitter = pool.submitter();

    let mut input = String::from("camera boot ok\n");
    input.push_str(&frame_text(&jpeg_bytes(1000)));
    input.push_str("wifi rssi -61\n");
    input.push_str(&frame_text(&jpeg_bytes(400)));
    // Declared length does not match the payload: dropped by the decoder.
    input.push_str("START_IMAGE\nSIZE:10\nDATA_START\nFFD8FFD9\nDATA_END\nEND_IMAGE\n");
    input.push_str(&frame_text(&jpeg_bytes(1200)));

    let mut source = BufReadSource::new(Cursor::new(input.into_bytes()));
    let mut reader = LinkReader::new();
    let shutdown = AtomicBool::new(false);
    reader
        .run(&mut source, &shutdown, |image| {
            assert!(submitter.submit(image));
        })
        .unwrap();

    assert_eq!(reader.stats().frames_ready, 3);
    assert_eq!(reader.stats().frames_dropped, 1);
    assert_eq!(reader.stats().device_logs, 2);

    let stats = pool.shutdown();
    assert_eq!(stats.archived, 2);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.completed(), 3);
    assert_eq!(stats.dropped, 0);
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
    assert!(!submitter.submit(Image::new(jpeg_bytes(50))));

    let mut acks = harness.acks.lines();
    acks.sort();
    assert_eq!(
        acks,
        vec![
            "ACK:FAILED,ERROR:OCR_FAILED".to_string(),
            "ACK:SUCCESS,PLATE:30A-12345,CONF:0.93".to_string(),
            "ACK:SUCCESS,PLATE:30A-12345,CONF:0.93".to_string(),
        ]
    );
    assert_eq!(harness.store.vehicle_events().len(), 2);
    assert_eq!(files_in(&harness.archive_dir).len(), 2);
    assert!(files_in(&harness.temp_dir).is_empty());
}

#[test]
fn gateway_streams_new_vehicles_to_feed_clients() {
    let root = tempfile::tempdir().unwrap();
    let mut cfg = GatewayConfig::default();
    cfg.temp_dir = root.path().join("temp");
    cfg.archive_dir = root.path().join("archive");
    cfg.feed.as_mut().unwrap().addr = "127.0.0.1:0".to_string();
    cfg.workers = 1;

    let store = InMemoryEventStore::new();
    let acks = Arc::new(RecordingAcks::default());
    let gateway = Gateway::start_with(
        &cfg,
        store.clone(),
        FakeRecognizer::plate("30A-12345", 0.91),
        acks.clone(),
    )
    .unwrap();

    let addr = gateway.feed_addr().expect("feed enabled");
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while gateway.subscribers().is_empty() {
        assert!(Instant::now() < deadline, "feed client never registered");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(gateway.submitter().submit(Image::new(jpeg_bytes(700))));

    let mut line = String::new();
    BufReader::new(&client).read_line(&mut line).unwrap();
    let event: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(event["type"], "new_vehicle");
    assert_eq!(event["plate"], "30A-12345");
    assert!(event["image_path"]
        .as_str()
        .unwrap()
        .contains("30A-12345_"));

    let persisted = gateway.persistence().recent_vehicle_events(10).unwrap();
    assert_eq!(persisted.len(), 1);

    let stats = gateway.stop();
    assert_eq!(stats.archived, 1);
    assert_eq!(store.vehicle_events().len(), 1);
    assert_eq!(
        acks.lines(),
        vec!["ACK:SUCCESS,PLATE:30A-12345,CONF:0.91".to_string()]
    );
}
