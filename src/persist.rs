//! Persistence worker.
//!
//! One thread owns the [`EventStore`]; everything else talks to it through a
//! cloneable [`PersistenceHandle`]. Each request carries its own reply channel.
//! The worker exits once every handle is dropped and the queue is drained.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::JoinHandle;

use crate::storage::EventStore;
use crate::{NewVehicleEvent, SlotState, VehicleEvent};

enum PersistRequest {
    AppendVehicleEvent {
        event: NewVehicleEvent,
        reply: Sender<Result<VehicleEvent>>,
    },
    UpsertSlot {
        slot_id: String,
        occupied: bool,
        reply: Sender<Result<SlotState>>,
    },
    RecentVehicleEvents {
        limit: usize,
        reply: Sender<Result<Vec<VehicleEvent>>>,
    },
    Slots {
        reply: Sender<Result<Vec<SlotState>>>,
    },
}

pub struct PersistenceWorker {
    join: JoinHandle<()>,
}

impl PersistenceWorker {
    pub fn spawn<S>(store: S) -> Result<(Self, PersistenceHandle)>
    where
        S: EventStore + 'static,
    {
        let (tx, rx) = unbounded();
        let join = std::thread::Builder::new()
            .name("persistence".to_string())
            .spawn(move || run(store, rx))
            .context("spawn persistence worker")?;
        Ok((Self { join }, PersistenceHandle { tx }))
    }

    /// Wait for the worker to exit. Returns once all handles are gone.
    pub fn join(self) {
        if self.join.join().is_err() {
            log::error!("persistence worker panicked");
        }
    }
}

fn run<S: EventStore>(mut store: S, rx: Receiver<PersistRequest>) {
    for request in rx.iter() {
        match request {
            PersistRequest::AppendVehicleEvent { event, reply } => {
                let _ = reply.send(store.append_vehicle_event(&event));
            }
            PersistRequest::UpsertSlot {
                slot_id,
                occupied,
                reply,
            } => {
                let _ = reply.send(store.upsert_slot(&slot_id, occupied));
            }
            PersistRequest::RecentVehicleEvents { limit, reply } => {
                let _ = reply.send(store.recent_vehicle_events(limit));
            }
            PersistRequest::Slots { reply } => {
                let _ = reply.send(store.slots());
            }
        }
    }
    log::debug!("persistence worker exiting");
}

#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Sender<PersistRequest>,
}

impl PersistenceHandle {
    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> PersistRequest) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| anyhow!("persistence worker stopped"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("persistence worker dropped the request"))?
    }

    pub fn append_vehicle_event(&self, event: NewVehicleEvent) -> Result<VehicleEvent> {
        self.call(|reply| PersistRequest::AppendVehicleEvent { event, reply })
    }

    pub fn upsert_slot(&self, slot_id: &str, occupied: bool) -> Result<SlotState> {
        let slot_id = slot_id.to_string();
        self.call(|reply| PersistRequest::UpsertSlot {
            slot_id,
            occupied,
            reply,
        })
    }

    pub fn recent_vehicle_events(&self, limit: usize) -> Result<Vec<VehicleEvent>> {
        self.call(|reply| PersistRequest::RecentVehicleEvents { limit, reply })
    }

    pub fn slots(&self) -> Result<Vec<SlotState>> {
        self.call(|reply| PersistRequest::Slots { reply })
    }
}
