//! Test fixtures and helpers

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use worlty_types::DeviceRecord;

use crate::tree::EntityListener;

pub const GATEWAY: &str = "pad-1";

/// Build a record from JSON, panicking on malformed fixtures
pub fn record(value: Value) -> DeviceRecord {
    serde_json::from_value(value).expect("fixture record")
}

/// A root switch device
pub fn switch(pk: i64, name: &str, stt: bool, lct: i64) -> DeviceRecord {
    record(json!({
        "pk": pk,
        "did": name,
        "type": 4,
        "cls": 0,
        "stt": stt,
        "lct": lct,
        "payload": {"stt": stt}
    }))
}

/// A root fan with two child endpoints given out of order
pub fn fan_with_children(pk: i64) -> DeviceRecord {
    record(json!({
        "pk": pk,
        "did": "fan_1",
        "type": 6,
        "lct": 100,
        "children": [
            {"pk": 3, "cid": "ch_b", "type": 4, "stt": false},
            {"pk": 2, "cid": "ch_a", "type": 4, "stt": true}
        ]
    }))
}

pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("payload fixture must be an object"),
    }
}

/// Entity that records every update it receives
#[derive(Default)]
pub struct RecordingEntity {
    pub updates: Mutex<Vec<DeviceRecord>>,
}

impl RecordingEntity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<DeviceRecord> {
        self.updates.lock().unwrap().last().cloned()
    }
}

impl EntityListener for RecordingEntity {
    fn record_updated(&self, record: &DeviceRecord) -> bool {
        self.updates.lock().unwrap().push(record.clone());
        true
    }
}
