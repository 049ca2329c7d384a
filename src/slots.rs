//! Slot occupancy updates received over MQTT.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Event, Incoming};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mqtt::MqttSettings;
use crate::notify::{NotificationEvent, Notifier};
use crate::persist::PersistenceHandle;
use crate::SlotState;

pub const DEFAULT_SLOT_TOPIC: &str = "parking/slots";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotUpdate {
    pub slot_id: String,
    pub occupied: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SlotKey {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
struct SlotPayload {
    slot: SlotKey,
    occupied: bool,
}

impl SlotUpdate {
    /// Parse `{"slot": "<id>", "occupied": <bool>}`; numeric slot ids are accepted.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let parsed: SlotPayload =
            serde_json::from_slice(payload).context("invalid slot update payload")?;
        let slot_id = match parsed.slot {
            SlotKey::Text(text) => text.trim().to_string(),
            SlotKey::Number(n) => n.to_string(),
        };
        if slot_id.is_empty() {
            return Err(anyhow!("slot update has an empty slot id"));
        }
        Ok(Self {
            slot_id,
            occupied: parsed.occupied,
        })
    }
}

/// Upsert the slot and announce the change.
pub fn apply_slot_update(
    persistence: &PersistenceHandle,
    notifier: &Notifier,
    update: &SlotUpdate,
) -> Result<SlotState> {
    let state = persistence
        .upsert_slot(&update.slot_id, update.occupied)
        .with_context(|| format!("upsert slot {}", update.slot_id))?;
    log::info!(
        "slot {} is now {}",
        state.slot_id,
        if state.occupied { "occupied" } else { "free" }
    );
    if let Err(err) = notifier.notify(NotificationEvent::slot_update(
        &state.slot_id,
        state.occupied,
        state.last_updated,
    )) {
        log::warn!("slot update not broadcast: {}", err);
    }
    Ok(state)
}

/// Handle one raw MQTT payload. Bad payloads are logged and skipped.
pub fn handle_slot_message(
    persistence: &PersistenceHandle,
    notifier: &Notifier,
    payload: &[u8],
) -> Option<SlotState> {
    let update = match SlotUpdate::parse(payload) {
        Ok(update) => update,
        Err(err) => {
            log::warn!(
                "skipping slot message {:?}: {:#}",
                String::from_utf8_lossy(payload),
                err
            );
            return None;
        }
    };
    match apply_slot_update(persistence, notifier, &update) {
        Ok(state) => Some(state),
        Err(err) => {
            log::error!("slot update failed: {:#}", err);
            None
        }
    }
}

pub struct SlotListener {
    settings: MqttSettings,
    topic: String,
    persistence: PersistenceHandle,
    notifier: Notifier,
}

pub struct SlotListenerHandle {
    shutdown: Arc<AtomicBool>,
    client: Arc<Mutex<Option<Client>>>,
    join: Option<JoinHandle<()>>,
}

impl SlotListenerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = client.disconnect();
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("slot listener thread panicked"))?;
        }
        Ok(())
    }
}

impl SlotListener {
    pub fn new(
        settings: MqttSettings,
        topic: &str,
        persistence: PersistenceHandle,
        notifier: Notifier,
    ) -> Self {
        Self {
            settings,
            topic: topic.to_string(),
            persistence,
            notifier,
        }
    }

    pub fn spawn(self) -> Result<SlotListenerHandle> {
        // Fail fast on a malformed broker address.
        self.settings.endpoint()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let client = Arc::new(Mutex::new(None));
        let join = {
            let shutdown = Arc::clone(&shutdown);
            let client = Arc::clone(&client);
            std::thread::Builder::new()
                .name("slot-listener".to_string())
                .spawn(move || self.run(&shutdown, &client))
                .context("spawn slot listener")?
        };
        Ok(SlotListenerHandle {
            shutdown,
            client,
            join: Some(join),
        })
    }

    fn run(&self, shutdown: &AtomicBool, current: &Mutex<Option<Client>>) {
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.session(shutdown, current) {
                if !shutdown.load(Ordering::SeqCst) {
                    log::error!("MQTT slot listener: {:#}. Reconnecting...", err);
                }
            }
            current.lock().unwrap_or_else(|e| e.into_inner()).take();
            let deadline = Instant::now() + RECONNECT_DELAY;
            while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        log::info!("slot listener stopped");
    }

    fn session(&self, shutdown: &AtomicBool, current: &Mutex<Option<Client>>) -> Result<()> {
        let (client, mut connection) = Client::new(self.settings.options()?, 10);
        client
            .subscribe(self.topic.as_str(), QoS::AtLeastOnce)
            .context("subscribe to slot topic")?;
        *current.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        log::info!("subscribed to {} on {}", self.topic, self.settings.broker);

        for event in connection.iter() {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => log::debug!("slot message on {}", topic),
                        Err(e) => {
                            log::warn!("skipping publish with invalid topic: {}", e);
                            continue;
                        }
                    }
                    handle_slot_message(&self.persistence, &self.notifier, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("MQTT connection error: {}", e)),
            }
        }
        Ok(())
    }
}
