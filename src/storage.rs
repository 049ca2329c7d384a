use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{NewVehicleEvent, SlotState, VehicleAction, VehicleEvent};

/// Durable log of vehicle events plus slot occupancy.
///
/// Vehicle events are append-only; slots are upserted and never deleted.
pub trait EventStore: Send {
    fn append_vehicle_event(&mut self, event: &NewVehicleEvent) -> Result<VehicleEvent>;

    fn upsert_slot(&mut self, slot_id: &str, occupied: bool) -> Result<SlotState>;

    /// Newest first.
    fn recent_vehicle_events(&mut self, limit: usize) -> Result<Vec<VehicleEvent>>;

    fn slots(&mut self) -> Result<Vec<SlotState>>;
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("corrupt timestamp '{}'", value))?
        .with_timezone(&Utc))
}

struct VehicleLogRow {
    id: i64,
    plate: String,
    image_path: String,
    raw_result: String,
    confidence: f64,
    action: String,
    timestamp: String,
}

impl VehicleLogRow {
    fn into_event(self) -> Result<VehicleEvent> {
        let action = VehicleAction::parse(&self.action)
            .ok_or_else(|| anyhow!("corrupt vehicle log {}: action '{}'", self.id, self.action))?;
        Ok(VehicleEvent {
            id: self.id,
            plate: self.plate,
            image_path: self.image_path,
            raw_result: self.raw_result,
            confidence: self.confidence,
            action,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS vehicle_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              license_plate TEXT NOT NULL,
              image_path TEXT NOT NULL,
              ocr_result TEXT NOT NULL,
              confidence REAL NOT NULL,
              action TEXT NOT NULL,
              timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS parking_slots (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              slot_number TEXT NOT NULL UNIQUE,
              is_occupied INTEGER NOT NULL,
              last_updated TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vehicle_logs_plate ON vehicle_logs(license_plate);
            "#,
        )?;
        Ok(())
    }
}

impl EventStore for SqliteEventStore {
    fn append_vehicle_event(&mut self, event: &NewVehicleEvent) -> Result<VehicleEvent> {
        let timestamp = Utc::now();
        let image_path = event.image_path.to_string_lossy().into_owned();
        self.conn.execute(
            r#"
            INSERT INTO vehicle_logs(license_plate, image_path, ocr_result, confidence, action, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.plate,
                image_path,
                event.raw_result,
                event.confidence,
                event.action.as_str(),
                format_ts(&timestamp)
            ],
        )?;
        Ok(VehicleEvent {
            id: self.conn.last_insert_rowid(),
            plate: event.plate.clone(),
            image_path,
            raw_result: event.raw_result.clone(),
            confidence: event.confidence,
            action: event.action,
            timestamp,
        })
    }

    fn upsert_slot(&mut self, slot_id: &str, occupied: bool) -> Result<SlotState> {
        let last_updated = Utc::now();
        self.conn.execute(
            r#"
            INSERT INTO parking_slots(slot_number, is_occupied, last_updated)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(slot_number) DO UPDATE SET
              is_occupied = excluded.is_occupied,
              last_updated = excluded.last_updated
            "#,
            params![slot_id, occupied, format_ts(&last_updated)],
        )?;
        Ok(SlotState {
            slot_id: slot_id.to_string(),
            occupied,
            last_updated,
        })
    }

    fn recent_vehicle_events(&mut self, limit: usize) -> Result<Vec<VehicleEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, license_plate, image_path, ocr_result, confidence, action, timestamp
            FROM vehicle_logs ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(VehicleLogRow {
                id: row.get(0)?,
                plate: row.get(1)?,
                image_path: row.get(2)?,
                raw_result: row.get(3)?,
                confidence: row.get(4)?,
                action: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_event()?);
        }
        Ok(out)
    }

    fn slots(&mut self) -> Result<Vec<SlotState>> {
        let mut stmt = self.conn.prepare(
            "SELECT slot_number, is_occupied, last_updated FROM parking_slots ORDER BY slot_number ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (slot_id, occupied, last_updated) = row?;
            out.push(SlotState {
                slot_id,
                occupied,
                last_updated: parse_ts(&last_updated)?,
            });
        }
        Ok(out)
    }
}

#[derive(Default)]
struct MemoryInner {
    vehicle_events: Vec<VehicleEvent>,
    slots: BTreeMap<String, SlotState>,
    fail_writes: bool,
}

/// In-process store. Clones share the same contents, so a test can keep a
/// handle after moving the store into a persistence worker.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// All vehicle events in insertion order.
    pub fn vehicle_events(&self) -> Vec<VehicleEvent> {
        self.lock().vehicle_events.clone()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_vehicle_event(&mut self, event: &NewVehicleEvent) -> Result<VehicleEvent> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(anyhow!("in-memory store rejected write"));
        }
        let record = VehicleEvent {
            id: inner.vehicle_events.len() as i64 + 1,
            plate: event.plate.clone(),
            image_path: event.image_path.to_string_lossy().into_owned(),
            raw_result: event.raw_result.clone(),
            confidence: event.confidence,
            action: event.action,
            timestamp: Utc::now(),
        };
        inner.vehicle_events.push(record.clone());
        Ok(record)
    }

    fn upsert_slot(&mut self, slot_id: &str, occupied: bool) -> Result<SlotState> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(anyhow!("in-memory store rejected write"));
        }
        let state = SlotState {
            slot_id: slot_id.to_string(),
            occupied,
            last_updated: Utc::now(),
        };
        inner.slots.insert(slot_id.to_string(), state.clone());
        Ok(state)
    }

    fn recent_vehicle_events(&mut self, limit: usize) -> Result<Vec<VehicleEvent>> {
        Ok(self
            .lock()
            .vehicle_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn slots(&mut self) -> Result<Vec<SlotState>> {
        Ok(self.lock().slots.values().cloned().collect())
    }
}
