//! Composition root: wires storage, recognition, the ingest pool, the fan-out
//! and the optional MQTT and live feed surfaces. The link reader is driven by
//! the caller and feeds images through [`Gateway::submitter`].

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::images::ImageStore;
use crate::ingest::{ImageSubmitter, IngestOrchestrator, IngestPool, IngestStats};
use crate::link::AckSink;
use crate::notify::feed::{FeedHandle, LiveFeedServer};
use crate::notify::mqtt::MqttEventPublisher;
use crate::notify::{FanOut, Notifier, SubscriberRegistry};
use crate::persist::{PersistenceHandle, PersistenceWorker};
use crate::recognize::{HttpPlateRecognizer, PlateRecognizer};
use crate::slots::{SlotListener, SlotListenerHandle};
use crate::storage::{EventStore, SqliteEventStore};

pub struct Gateway {
    pool: IngestPool,
    fanout: FanOut,
    persistence: PersistenceHandle,
    persist_worker: PersistenceWorker,
    feed: Option<FeedHandle>,
    slots: Option<SlotListenerHandle>,
    event_publisher: Option<Arc<MqttEventPublisher>>,
}

impl Gateway {
    /// Start with the SQLite store and the HTTP recognizer from `cfg`.
    pub fn start(cfg: &GatewayConfig, acks: Arc<dyn AckSink>) -> Result<Self> {
        let store = SqliteEventStore::open(&cfg.db_path)?;
        let recognizer = HttpPlateRecognizer::new(cfg.recognition.clone())?;
        Self::start_with(cfg, store, Arc::new(recognizer), acks)
    }

    pub fn start_with<S>(
        cfg: &GatewayConfig,
        store: S,
        recognizer: Arc<dyn PlateRecognizer>,
        acks: Arc<dyn AckSink>,
    ) -> Result<Self>
    where
        S: EventStore + 'static,
    {
        cfg.validate()?;
        let images = ImageStore::new(&cfg.temp_dir, &cfg.archive_dir)?;
        let (persist_worker, persistence) = PersistenceWorker::spawn(store)?;
        let fanout = FanOut::start(cfg.fanout_idle)?;

        let feed = match &cfg.feed {
            Some(feed_cfg) => Some(
                LiveFeedServer::new(feed_cfg.clone(), fanout.registry())
                    .spawn()
                    .context("start live feed")?,
            ),
            None => None,
        };

        let event_publisher = match (cfg.mqtt.settings("events"), &cfg.mqtt.event_topic) {
            (Some(settings), Some(topic)) => {
                let publisher = Arc::new(MqttEventPublisher::connect(&settings, topic)?);
                fanout.registry().register(publisher.clone());
                Some(publisher)
            }
            _ => None,
        };

        let slots = match cfg.mqtt.settings("slots") {
            Some(settings) => Some(
                SlotListener::new(
                    settings,
                    &cfg.mqtt.slot_topic,
                    persistence.clone(),
                    fanout.notifier(),
                )
                .spawn()?,
            ),
            None => None,
        };

        let orchestrator = IngestOrchestrator::new(
            images,
            recognizer,
            persistence.clone(),
            acks,
            fanout.notifier(),
        );
        let pool = IngestPool::start(Arc::new(orchestrator), cfg.workers)?;

        Ok(Self {
            pool,
            fanout,
            persistence,
            persist_worker,
            feed,
            slots,
            event_publisher,
        })
    }

    pub fn submitter(&self) -> ImageSubmitter {
        self.pool.submitter()
    }

    pub fn persistence(&self) -> PersistenceHandle {
        self.persistence.clone()
    }

    pub fn notifier(&self) -> Notifier {
        self.fanout.notifier()
    }

    pub fn subscribers(&self) -> Arc<SubscriberRegistry> {
        self.fanout.registry()
    }

    pub fn feed_addr(&self) -> Option<SocketAddr> {
        self.feed.as_ref().map(|feed| feed.addr)
    }

    pub fn stats(&self) -> IngestStats {
        self.pool.stats()
    }

    /// Stop after the link reader has returned. In-flight images finish, queued
    /// notifications are delivered, then persistence shuts down. Any
    /// [`PersistenceHandle`] clones held by the caller must be dropped first.
    pub fn stop(self) -> IngestStats {
        if let Some(slots) = self.slots {
            if let Err(err) = slots.stop() {
                log::warn!("slot listener: {}", err);
            }
        }
        let stats = self.pool.shutdown();
        self.fanout.stop();
        if let Some(feed) = self.feed {
            if let Err(err) = feed.stop() {
                log::warn!("live feed: {}", err);
            }
        }
        if let Some(publisher) = self.event_publisher {
            publisher.disconnect();
        }
        drop(self.persistence);
        self.persist_worker.join();
        log::info!(
            "gateway stopped: {} archived, {} kept temporary, {} discarded, {} staging failures",
            stats.archived,
            stats.kept_temporary,
            stats.discarded,
            stats.staging_failed
        );
        stats
    }
}
