//! Notification fan-out.
//!
//! Producers enqueue [`NotificationEvent`]s through a [`Notifier`] and never
//! block. One delivery thread takes events in FIFO order and offers each to
//! every registered [`Subscriber`]; a subscriber whose delivery fails is
//! unregistered on the spot.

pub mod feed;
pub mod mqtt;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the delivery thread waits for an event before checking for shutdown.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    NewVehicle {
        plate: String,
        confidence: f64,
        image_path: String,
        timestamp: DateTime<Utc>,
    },
    SlotUpdate {
        slot: String,
        occupied: bool,
        timestamp: DateTime<Utc>,
    },
}

impl NotificationEvent {
    pub fn new_vehicle(plate: &str, confidence: f64, image_path: &Path) -> Self {
        NotificationEvent::NewVehicle {
            plate: plate.to_string(),
            confidence,
            image_path: image_path.to_string_lossy().into_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn slot_update(slot: &str, occupied: bool, timestamp: DateTime<Utc>) -> Self {
        NotificationEvent::SlotUpdate {
            slot: slot.to_string(),
            occupied,
            timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::NewVehicle { .. } => "new_vehicle",
            NotificationEvent::SlotUpdate { .. } => "slot_update",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize notification")
    }
}

/// Receiver of fan-out events. `deliver` may block briefly but must be bounded.
pub trait Subscriber: Send + Sync {
    /// Label used in logs.
    fn describe(&self) -> String;

    fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

pub type SubscriberId = u64;

/// Current subscriber set. Safe to modify while a delivery pass is running;
/// the pass works on a snapshot.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("subscriber {} registered ({})", id, subscriber.describe());
        self.lock().push((id, subscriber));
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        before != subscribers.len()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn Subscriber>)> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriberId, Arc<dyn Subscriber>)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offer one event to every subscriber; failed subscribers are dropped.
    /// Returns the number of successful deliveries.
    pub fn deliver_all(&self, event: &NotificationEvent) -> usize {
        let mut delivered = 0;
        for (id, subscriber) in self.snapshot() {
            match subscriber.deliver(event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    log::warn!(
                        "dropping subscriber {} ({}): {:#}",
                        id,
                        subscriber.describe(),
                        err
                    );
                    self.unregister(id);
                }
            }
        }
        delivered
    }
}

/// Producer side of the fan-out queue. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<NotificationEvent>,
}

impl Notifier {
    pub fn notify(&self, event: NotificationEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("notification fan-out has stopped"))
    }
}

pub struct FanOut {
    registry: Arc<SubscriberRegistry>,
    tx: Sender<NotificationEvent>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FanOut {
    /// Start the delivery thread. `idle` bounds how long shutdown takes to
    /// be noticed; new events wake the loop immediately.
    pub fn start(idle: Duration) -> Result<Self> {
        let registry = Arc::new(SubscriberRegistry::new());
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("notify-fanout".to_string())
                .spawn(move || delivery_loop(rx, registry, shutdown, idle))
                .context("spawn notification fan-out")?
        };
        Ok(Self {
            registry,
            tx,
            shutdown,
            join: Some(join),
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
        }
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.registry)
    }

    /// Deliver what is already queued, then stop the delivery thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("notification fan-out thread panicked");
            }
        }
    }
}

impl Drop for FanOut {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn delivery_loop(
    rx: Receiver<NotificationEvent>,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
    idle: Duration,
) {
    let mut delivered_events = 0u64;
    loop {
        match rx.recv_timeout(idle) {
            Ok(event) => {
                let reached = registry.deliver_all(&event);
                log::debug!("{} delivered to {} subscriber(s)", event.kind(), reached);
                delivered_events += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!(
        "notification fan-out exiting ({} events processed)",
        delivered_events
    );
}

/// Subscriber forwarding events into a channel. Fails once the receiver is gone.
pub struct ChannelSubscriber {
    label: String,
    tx: Sender<NotificationEvent>,
}

impl ChannelSubscriber {
    pub fn new(label: &str) -> (Self, Receiver<NotificationEvent>) {
        let (tx, rx) = unbounded();
        (
            Self {
                label: label.to_string(),
                tx,
            },
            rx,
        )
    }
}

impl Subscriber for ChannelSubscriber {
    fn describe(&self) -> String {
        format!("channel:{}", self.label)
    }

    fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow!("channel subscriber {} closed", self.label))
    }
}
