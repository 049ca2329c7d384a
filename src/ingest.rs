//! Ingestion orchestration.
//!
//! Each decoded [`Image`] is driven through stage, recognize, place, persist,
//! acknowledge and notify by exactly one worker. Only a staging failure aborts
//! an image; every later error is logged with its step and contained here.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::IngestError;
use crate::images::ImageStore;
use crate::link::{AckSink, DeviceAck};
use crate::notify::{NotificationEvent, Notifier};
use crate::persist::PersistenceHandle;
use crate::recognize::{PlateRecognizer, RecognitionResult};
use crate::{Image, NewVehicleEvent, VehicleAction};

/// Images at or below this confidence stay in temporary storage.
pub const ARCHIVE_CONFIDENCE_THRESHOLD: f64 = 0.5;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IngestStep {
    #[default]
    Stage,
    Recognize,
    Place,
    Persist,
    Acknowledge,
    Notify,
}

impl IngestStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStep::Stage => "stage",
            IngestStep::Recognize => "recognize",
            IngestStep::Place => "place",
            IngestStep::Persist => "persist",
            IngestStep::Acknowledge => "acknowledge",
            IngestStep::Notify => "notify",
        }
    }
}

impl fmt::Display for IngestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far one run has got. Read back after a panic to name the step and
/// the file the image was left in.
#[derive(Clone, Debug, Default)]
pub struct IngestProgress {
    step: IngestStep,
    image_path: Option<PathBuf>,
}

impl IngestProgress {
    pub fn step(&self) -> IngestStep {
        self.step
    }

    /// Where the image file currently is, once staged.
    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }
}

/// Terminal state of one image.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    Archived {
        path: PathBuf,
        plate: String,
        confidence: f64,
    },
    KeptTemporary {
        path: PathBuf,
        plate: String,
        confidence: f64,
    },
    /// Recognition failed; the staged file was removed.
    Discarded { cause: &'static str },
}

impl Disposition {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Disposition::Archived { path, .. } | Disposition::KeptTemporary { path, .. } => {
                Some(path)
            }
            Disposition::Discarded { .. } => None,
        }
    }
}

/// Archive only a real plate read with confidence strictly above the threshold.
pub fn should_archive(result: &RecognitionResult) -> bool {
    !result.is_unknown() && result.confidence > ARCHIVE_CONFIDENCE_THRESHOLD
}

fn contained(step: IngestStep, err: &IngestError) {
    log::error!("{} failed: {}", step, err);
}

pub struct IngestOrchestrator {
    images: ImageStore,
    recognizer: Arc<dyn PlateRecognizer>,
    persistence: PersistenceHandle,
    acks: Arc<dyn AckSink>,
    notifier: Notifier,
}

impl IngestOrchestrator {
    pub fn new(
        images: ImageStore,
        recognizer: Arc<dyn PlateRecognizer>,
        persistence: PersistenceHandle,
        acks: Arc<dyn AckSink>,
        notifier: Notifier,
    ) -> Self {
        Self {
            images,
            recognizer,
            persistence,
            acks,
            notifier,
        }
    }

    /// Run one image to a terminal state. `Err` means staging failed and no
    /// further step ran.
    pub fn process(&self, image: Image) -> Result<Disposition, IngestError> {
        self.process_tracked(image, &mut IngestProgress::default())
    }

    /// Like [`process`](Self::process), recording each step in `progress`
    /// before it starts.
    pub fn process_tracked(
        &self,
        image: Image,
        progress: &mut IngestProgress,
    ) -> Result<Disposition, IngestError> {
        progress.step = IngestStep::Stage;
        if image.is_empty() {
            log::warn!("device sent an empty image; processing it anyway");
        }
        let staged = match self.images.stage(&image) {
            Ok(path) => path,
            Err(err) => {
                log::error!("{} failed, image abandoned: {}", IngestStep::Stage, err);
                return Err(err);
            }
        };
        log::debug!("staged {} bytes at {}", image.len(), staged.display());
        progress.image_path = Some(staged.clone());

        progress.step = IngestStep::Recognize;
        let result = match self.recognizer.recognize(image.bytes()) {
            Ok(result) => result,
            Err(failure) => {
                let cause = failure.cause_tag();
                log::warn!("{} failed ({}): {}", IngestStep::Recognize, cause, failure);
                if let Err(err) = self.images.discard(&staged) {
                    log::error!("could not remove {}: {}", staged.display(), err);
                }
                progress.image_path = None;
                progress.step = IngestStep::Acknowledge;
                self.acknowledge(DeviceAck::ocr_failed());
                log::info!("image discarded: {}", staged.display());
                return Ok(Disposition::Discarded { cause });
            }
        };
        log::info!(
            "recognized plate {} (confidence {:.2})",
            result.plate,
            result.confidence
        );

        progress.step = IngestStep::Place;
        let disposition = self.place(&staged, &image, &result);

        let location = disposition.path().unwrap_or(&staged).to_path_buf();
        progress.image_path = Some(location.clone());

        progress.step = IngestStep::Persist;
        if let Err(err) = self.persistence.append_vehicle_event(NewVehicleEvent {
            plate: result.plate.clone(),
            image_path: location.clone(),
            raw_result: result.raw_json(),
            confidence: result.confidence,
            // The camera watches the entry lane only.
            action: VehicleAction::Entry,
        }) {
            contained(IngestStep::Persist, &IngestError::Persistence(err));
        }

        progress.step = IngestStep::Acknowledge;
        self.acknowledge(DeviceAck::Success {
            plate: result.plate.clone(),
            confidence: result.confidence,
        });

        progress.step = IngestStep::Notify;
        if let Err(err) = self.notifier.notify(NotificationEvent::new_vehicle(
            &result.plate,
            result.confidence,
            &location,
        )) {
            contained(IngestStep::Notify, &IngestError::Notify(err.to_string()));
        }

        match &disposition {
            Disposition::Archived { path, .. } => log::info!("image archived: {}", path.display()),
            Disposition::KeptTemporary { path, .. } => {
                log::info!("image kept in temporary storage: {}", path.display())
            }
            Disposition::Discarded { .. } => {}
        }
        Ok(disposition)
    }

    fn place(&self, staged: &Path, image: &Image, result: &RecognitionResult) -> Disposition {
        let kept = || Disposition::KeptTemporary {
            path: staged.to_path_buf(),
            plate: result.plate.clone(),
            confidence: result.confidence,
        };
        if !should_archive(result) {
            return kept();
        }
        match self
            .images
            .archive(staged, &result.plate, &image.timestamp_tag())
        {
            Ok(path) => Disposition::Archived {
                path,
                plate: result.plate.clone(),
                confidence: result.confidence,
            },
            Err(err) => {
                contained(IngestStep::Place, &err);
                kept()
            }
        }
    }

    fn acknowledge(&self, ack: DeviceAck) {
        let line = ack.to_string();
        match self.acks.send_line(&line) {
            Ok(()) => log::info!("sent {}", line),
            Err(err) => contained(IngestStep::Acknowledge, &IngestError::Acknowledge(err)),
        }
    }
}

/// Counters across all workers of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub archived: u64,
    pub kept_temporary: u64,
    pub discarded: u64,
    pub staging_failed: u64,
    pub panicked: u64,
    /// Queued after the workers had stopped; never processed.
    pub dropped: u64,
}

impl IngestStats {
    pub fn completed(&self) -> u64 {
        self.archived + self.kept_temporary + self.discarded + self.staging_failed + self.panicked
    }
}

#[derive(Default)]
struct PoolCounters {
    archived: AtomicU64,
    kept_temporary: AtomicU64,
    discarded: AtomicU64,
    staging_failed: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            archived: self.archived.load(Ordering::SeqCst),
            kept_temporary: self.kept_temporary.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
            staging_failed: self.staging_failed.load(Ordering::SeqCst),
            panicked: self.panicked.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

/// Hands images from the link reader to the pool without blocking.
#[derive(Clone)]
pub struct ImageSubmitter {
    tx: Sender<Image>,
    closed: Arc<AtomicBool>,
}

impl ImageSubmitter {
    /// Returns false if the pool is shutting down; the image is dropped.
    pub fn submit(&self, image: Image) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            log::warn!("ingest pool closed; dropping image ({} bytes)", image.len());
            return false;
        }
        match self.tx.send(image) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("ingest pool gone; dropping image");
                false
            }
        }
    }
}

/// Fixed set of worker threads sharing one orchestrator.
pub struct IngestPool {
    tx: Sender<Image>,
    rx: Receiver<Image>,
    closed: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestPool {
    pub fn start(orchestrator: Arc<IngestOrchestrator>, workers: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PoolCounters::default());
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let orchestrator = Arc::clone(&orchestrator);
            let closed = Arc::clone(&closed);
            let counters = Arc::clone(&counters);
            let handle = std::thread::Builder::new()
                .name(format!("ingest-{}", index))
                .spawn(move || worker_loop(rx, orchestrator, closed, counters))
                .with_context(|| format!("spawn ingest worker {}", index))?;
            handles.push(handle);
        }
        log::info!("ingest pool started with {} worker(s)", handles.len());
        Ok(Self {
            tx,
            rx,
            closed,
            counters,
            workers: handles,
        })
    }

    pub fn submitter(&self) -> ImageSubmitter {
        ImageSubmitter {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Refuse new images, finish everything already queued, join workers.
    /// Images that slipped in after the workers stopped are logged and
    /// counted as dropped.
    pub fn shutdown(self) -> IngestStats {
        self.closed.store(true, Ordering::SeqCst);
        for worker in self.workers {
            if worker.join().is_err() {
                log::error!("ingest worker panicked outside an image run");
            }
        }
        let dropped = drain_unprocessed(&self.rx);
        self.counters.dropped.fetch_add(dropped, Ordering::SeqCst);
        self.counters.snapshot()
    }
}

fn drain_unprocessed(rx: &Receiver<Image>) -> u64 {
    let mut dropped = 0;
    for image in rx.try_iter() {
        log::warn!(
            "ingest pool stopped; dropping queued image ({} bytes)",
            image.len()
        );
        dropped += 1;
    }
    dropped
}

fn report_panic(progress: &IngestProgress) {
    match progress.image_path() {
        Some(path) => log::error!(
            "image workflow panicked during {}; image left at {}; worker continues",
            progress.step(),
            path.display()
        ),
        None => log::error!(
            "image workflow panicked during {}; worker continues",
            progress.step()
        ),
    }
}

fn worker_loop(
    rx: Receiver<Image>,
    orchestrator: Arc<IngestOrchestrator>,
    closed: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
) {
    loop {
        let image = match rx.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(image) => image,
            Err(RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let mut progress = IngestProgress::default();
        let outcome =
            catch_unwind(AssertUnwindSafe(|| orchestrator.process_tracked(image, &mut progress)));
        let counter = match outcome {
            Ok(Ok(Disposition::Archived { .. })) => &counters.archived,
            Ok(Ok(Disposition::KeptTemporary { .. })) => &counters.kept_temporary,
            Ok(Ok(Disposition::Discarded { .. })) => &counters.discarded,
            Ok(Err(_)) => &counters.staging_failed,
            Err(_) => {
                report_panic(&progress);
                &counters.panicked
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}
