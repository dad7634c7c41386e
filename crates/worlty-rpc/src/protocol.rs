//! Gateway wire protocol.
//!
//! Every logical message is one JSON object with a `type` discriminator.
//! Client messages carry their body inline or under `data`; server messages
//! always put their body under `data`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use worlty_types::{DeviceRecord, int_from_value};

/// Platform tag sent with the `auth` message
pub const AUTH_PLATFORM: &str = "ha";

/// Messages sent from the client to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        access_token: String,
        platform: String,
    },
    Get {
        data: DeviceKeys,
    },
    Set {
        data: CommandBatch,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn auth(access_token: impl Into<String>) -> Self {
        Self::Auth {
            access_token: access_token.into(),
            platform: AUTH_PLATFORM.to_string(),
        }
    }

    #[must_use]
    pub fn get(devices: Vec<i64>) -> Self {
        Self::Get {
            data: DeviceKeys { devices },
        }
    }

    #[must_use]
    pub fn set(devices: Vec<Command>) -> Self {
        Self::Set {
            data: CommandBatch { devices },
        }
    }

    /// Short name for log lines
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub devices: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandBatch {
    pub devices: Vec<Command>,
}

/// One outgoing write addressed to a device pk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub pk: i64,
    pub payload: Map<String, Value>,
}

impl Command {
    #[must_use]
    pub fn new(pk: i64, payload: Map<String, Value>) -> Self {
        Self { pk, payload }
    }

    /// Address a write for the entity backed by `record`.
    ///
    /// Roots take the payload as is. Children are written through their
    /// parent: the command targets `fk` and carries the child's `stt` under
    /// the child's name.
    #[must_use]
    pub fn for_record(record: &DeviceRecord, mut payload: Map<String, Value>) -> Self {
        if !record.is_child() {
            return Self::new(record.pk, payload);
        }

        let mut routed = Map::new();
        if let Some(state) = payload.remove("stt").filter(|v| !v.is_null()) {
            routed.insert(record.name().to_string(), state);
        }
        Self::new(record.fk, routed)
    }
}

/// Messages received from the gateway
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth_required")]
    AuthRequired,

    #[serde(rename = "authenticated")]
    Authenticated {
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "update")]
    Update { data: DeviceBatch },

    #[serde(rename = "health")]
    Health { data: HealthReport },

    #[serde(rename = "device/list")]
    DeviceList { data: DeviceListing },

    #[serde(rename = "device/delete")]
    DeviceDelete {
        #[serde(default)]
        data: Value,
    },

    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame has no `type` or a known type with a
    /// malformed body.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Body of an `update`. Records stay raw until [`DeviceBatch::records`] so one
/// malformed record cannot sink the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceBatch {
    #[serde(default)]
    pub devices: Vec<Value>,
}

impl DeviceBatch {
    /// Decode each record on its own, skipping the ones that do not parse.
    #[must_use]
    pub fn records(self) -> Vec<DeviceRecord> {
        self.devices
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<DeviceRecord>(raw.clone()) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed device record ({e}): {raw}");
                    None
                }
            })
            .collect()
    }
}

/// Compact `pk -> lct` map sent as a liveness ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HealthReport {
    #[serde(default, deserialize_with = "deserialize_health_map")]
    pub devices: BTreeMap<i64, i64>,
}

/// Entries whose pk or lct is not an integer are dropped with a warning
fn deserialize_health_map<'de, D>(deserializer: D) -> Result<BTreeMap<i64, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
    let mut devices = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        match (key.trim().parse::<i64>(), int_from_value(&value)) {
            (Ok(pk), Some(lct)) => {
                devices.insert(pk, lct);
            }
            _ => warn!("Skipping health entry {key}: {value}"),
        }
    }
    Ok(devices)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceListing {
    #[serde(default)]
    pub devices: Vec<Value>,
}

impl DeviceListing {
    /// Device keys in the listing; entries may be bare pks or objects with a `pk`.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        self.devices
            .iter()
            .filter_map(|entry| match entry {
                Value::Object(obj) => obj.get("pk").and_then(int_from_value),
                other => int_from_value(other),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_message_shape() {
        let msg = ClientMessage::auth("secret");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "auth", "access_token": "secret", "platform": "ha"})
        );
    }

    #[test]
    fn test_get_and_set_message_shape() {
        let get = ClientMessage::get(vec![2, 3]);
        assert_eq!(
            serde_json::to_value(&get).unwrap(),
            json!({"type": "get", "data": {"devices": [2, 3]}})
        );

        let mut payload = Map::new();
        payload.insert("stt".into(), json!(true));
        let set = ClientMessage::set(vec![Command::new(5, payload)]);
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({"type": "set", "data": {"devices": [{"pk": 5, "payload": {"stt": true}}]}})
        );
    }

    #[test]
    fn test_parse_server_messages() {
        let msg = ServerMessage::from_value(json!({"type": "auth_required"})).unwrap();
        assert_eq!(msg, ServerMessage::AuthRequired);

        let msg = ServerMessage::from_value(json!({
            "type": "health",
            "data": {"devices": {"1": 100, "2": 250}}
        }))
        .unwrap();
        let ServerMessage::Health { data } = msg else {
            panic!("Expected Health");
        };
        assert_eq!(data.devices.get(&2), Some(&250));

        let msg = ServerMessage::from_value(json!({
            "type": "update",
            "data": {"devices": [{"pk": 5, "did": "switch_1", "type": 4, "stt": false}]}
        }))
        .unwrap();
        let ServerMessage::Update { data } = msg else {
            panic!("Expected Update");
        };
        assert_eq!(data.records()[0].name(), "switch_1");
    }

    #[test]
    fn test_bad_record_does_not_sink_batch() {
        let msg = ServerMessage::from_value(json!({
            "type": "update",
            "data": {"devices": [
                {"pk": 1, "did": "switch_1", "type": 4, "stt": true},
                {"pk": 2, "did": "temp", "type": 2, "cls": null, "lct": 1_700_000_000.0},
                {"pk": {"nested": true}, "did": "broken"},
                "junk"
            ]}
        }))
        .unwrap();
        let ServerMessage::Update { data } = msg else {
            panic!("Expected Update");
        };

        let records = data.records();
        let pks: Vec<i64> = records.iter().map(|r| r.pk).collect();
        assert_eq!(pks, vec![1, 2]);
        assert_eq!(records[1].lct, 1_700_000_000);
    }

    #[test]
    fn test_health_skips_unreadable_entries() {
        let msg = ServerMessage::from_value(json!({
            "type": "health",
            "data": {"devices": {"1": 100, "2": null, "3": 42.0, "x": 5}}
        }))
        .unwrap();
        let ServerMessage::Health { data } = msg else {
            panic!("Expected Health");
        };
        assert_eq!(data.devices, BTreeMap::from([(1, 100), (3, 42)]));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = ServerMessage::from_value(json!({"type": "firmware", "data": {}})).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        assert!(ServerMessage::from_value(json!({"data": {}})).is_err());
    }

    #[test]
    fn test_device_listing_keys() {
        let listing = DeviceListing {
            devices: vec![json!(4), json!({"pk": 9}), json!("junk"), json!({"pk": "11"})],
        };
        assert_eq!(listing.keys(), vec![4, 9, 11]);
    }

    #[test]
    fn test_command_for_root_record() {
        let record: DeviceRecord = serde_json::from_value(json!({"pk": 5, "did": "switch_1"})).unwrap();
        let mut payload = Map::new();
        payload.insert("stt".into(), json!(true));
        payload.insert("brightness".into(), json!(80));

        let cmd = Command::for_record(&record, payload.clone());
        assert_eq!(cmd.pk, 5);
        assert_eq!(cmd.payload, payload);
    }

    #[test]
    fn test_command_for_child_routes_through_parent() {
        let record: DeviceRecord =
            serde_json::from_value(json!({"pk": 3, "fk": 7, "cid": "ch1"})).unwrap();
        let mut payload = Map::new();
        payload.insert("stt".into(), json!(true));

        let cmd = Command::for_record(&record, payload);
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"pk": 7, "payload": {"ch1": true}})
        );
    }
}
