//! Fan-out subscriber republishing notifications to an MQTT topic.
//!
//! The connection thread keeps polling the event loop, which reconnects after
//! broker errors, so the publisher stays registered for the life of the
//! gateway. Events that arrive while the request queue is full are dropped
//! with a warning instead of stalling the fan-out.

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{NotificationEvent, Subscriber};
use crate::mqtt::MqttSettings;

/// Requests buffered while the broker is slow or reconnecting.
const PUBLISH_QUEUE_CAPACITY: usize = 100;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct MqttEventPublisher {
    client: Client,
    topic: String,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttEventPublisher {
    pub fn connect(settings: &MqttSettings, topic: &str) -> Result<Self> {
        Self::connect_with(settings, topic, RECONNECT_DELAY)
    }

    fn connect_with(settings: &MqttSettings, topic: &str, reconnect_delay: Duration) -> Result<Self> {
        let options = settings.options()?;
        let (client, connection) = Client::new(options, PUBLISH_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_connection_loop(
            connection,
            Arc::clone(&shutdown),
            Arc::clone(&running),
            reconnect_delay,
        )?;
        log::info!(
            "publishing notifications to MQTT {} on topic {}",
            settings.broker,
            topic
        );
        Ok(Self {
            client,
            topic: topic.to_string(),
            shutdown,
            running,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Never block here: the queue may be full while the broker is away.
        let _ = self.client.try_disconnect();
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn spawn_connection_loop(
    mut connection: Connection,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    reconnect_delay: Duration,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-publisher".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        log::info!("MQTT publisher connected")
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("MQTT publisher connection error: {}. Reconnecting...", e);
                        let deadline = Instant::now() + reconnect_delay;
                        while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            log::info!("MQTT publisher stopped");
        })
        .context("spawn mqtt publisher connection")
}

impl Subscriber for MqttEventPublisher {
    fn describe(&self) -> String {
        format!("mqtt:{}", self.topic)
    }

    fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            anyhow::bail!("MQTT publisher stopped");
        }
        let payload = event.to_json()?;
        if let Err(err) =
            self.client
                .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.into_bytes())
        {
            log::warn!("MQTT publish queue full, dropping {} event: {}", event.kind(), err);
        }
        Ok(())
    }
}
