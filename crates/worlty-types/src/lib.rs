//! Shared types for Worlty gateway components.
//!
//! This crate provides the device and gateway types used across worlty-rpc,
//! worlty-core and the CLI. All types are serializable so they can travel over
//! the wire and into the persisted state store unchanged.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Manufacturer reported for every gateway
pub const MANUFACTURER: &str = "Worlty";

/// Deserialize a Vec that may be null or missing (both become empty vec)
fn deserialize_null_as_empty_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt: Option<Vec<T>> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Deserialize a map that may be null or missing (both become empty map)
fn deserialize_null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Read an integer field the gateway may send as a float or a numeric string.
///
/// Floats are truncated toward zero. Returns `None` for anything else.
// Saturating float-to-int cast; fractional epoch seconds are dropped
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn int_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Deserialize an integer that may be null, missing, a float or a numeric string (null becomes 0)
fn deserialize_lenient_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(0);
    }
    int_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {value}")))
}

/// Device category codes reported in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    BinarySensor = 1,
    Sensor = 2,
    Light = 3,
    Switch = 4,
    Event = 5,
    Fan = 6,
    Input = 7,
    Climate = 8,
    Cover = 9,
}

impl TryFrom<i64> for DeviceType {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::BinarySensor),
            2 => Ok(Self::Sensor),
            3 => Ok(Self::Light),
            4 => Ok(Self::Switch),
            5 => Ok(Self::Event),
            6 => Ok(Self::Fan),
            7 => Ok(Self::Input),
            8 => Ok(Self::Climate),
            9 => Ok(Self::Cover),
            other => Err(other),
        }
    }
}

/// Entity platform a device is exposed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    BinarySensor,
    Sensor,
    Light,
    Switch,
    Fan,
    Climate,
    WaterHeater,
    Cover,
}

impl Platform {
    pub const ALL: [Platform; 8] = [
        Platform::BinarySensor,
        Platform::Sensor,
        Platform::Light,
        Platform::Switch,
        Platform::Fan,
        Platform::Climate,
        Platform::WaterHeater,
        Platform::Cover,
    ];

    /// Classify a device by its `(type, cls)` codes.
    ///
    /// Events surface as sensors; a climate device of class 1 is a water heater.
    /// Inputs and unknown codes are not exposed on any platform.
    #[must_use]
    pub fn classify(device_type: i64, class: i64) -> Option<Self> {
        let kind = DeviceType::try_from(device_type).ok()?;
        let platform = match kind {
            DeviceType::BinarySensor => Self::BinarySensor,
            DeviceType::Sensor | DeviceType::Event => Self::Sensor,
            DeviceType::Light => Self::Light,
            DeviceType::Switch => Self::Switch,
            DeviceType::Fan => Self::Fan,
            DeviceType::Climate if class == 1 => Self::WaterHeater,
            DeviceType::Climate => Self::Climate,
            DeviceType::Cover => Self::Cover,
            DeviceType::Input => return None,
        };
        Some(platform)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BinarySensor => "binary_sensor",
            Self::Sensor => "sensor",
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Fan => "fan",
            Self::Climate => "climate",
            Self::WaterHeater => "water_heater",
            Self::Cover => "cover",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

/// Externally visible address of an entity within one gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(String);

impl UniqueId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UniqueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UniqueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for UniqueId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Structured key an entity's unique id is derived from.
///
/// `fk` is 0 for root devices. Roots render as `{gateway}:{pk}:{name}` and
/// children as `{gateway}:{fk}_{pk}:{name}`, so a child can never share an id
/// with a root of the same pk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub pk: i64,
    pub fk: i64,
    pub name: String,
}

impl EntityKey {
    #[must_use]
    pub fn new(pk: i64, fk: i64, name: impl Into<String>) -> Self {
        Self {
            pk,
            fk,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn is_child(&self) -> bool {
        self.fk != 0
    }

    #[must_use]
    pub fn unique_id(&self, gateway_id: &str) -> UniqueId {
        let id = if self.is_child() {
            format!("{gateway_id}:{}_{}:{}", self.fk, self.pk, self.name)
        } else {
            format!("{gateway_id}:{}:{}", self.pk, self.name)
        };
        UniqueId(id)
    }
}

/// One device (or child endpoint) as reported by the gateway.
///
/// Fields the gateway adds beyond the known set are kept in `extra` so a
/// record survives persistence without losing data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub pk: i64,

    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub fk: i64,

    /// Root device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,

    /// Child endpoint name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,

    #[serde(rename = "type", default, deserialize_with = "deserialize_lenient_int")]
    pub device_type: i64,

    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub cls: i64,

    /// Raw status, meaning depends on the device type
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub stt: Value,

    /// Last-changed time in epoch seconds
    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub lct: i64,

    #[serde(default, deserialize_with = "deserialize_null_as_empty_map")]
    pub payload: Map<String, Value>,

    #[serde(
        default,
        deserialize_with = "deserialize_null_as_empty_vec",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub children: Vec<DeviceRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide: Option<bool>,

    /// Unique id of the parent, stamped on children during merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_unique_id: Option<UniqueId>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceRecord {
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.fk != 0
    }

    /// `did` for roots, `cid` for children
    #[must_use]
    pub fn name(&self) -> &str {
        let name = if self.is_child() { &self.cid } else { &self.did };
        name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.pk, self.fk, self.name())
    }

    #[must_use]
    pub fn unique_id(&self, gateway_id: &str) -> UniqueId {
        self.key().unique_id(gateway_id)
    }

    #[must_use]
    pub fn platform(&self) -> Option<Platform> {
        Platform::classify(self.device_type, self.cls)
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.hide == Some(true)
    }

    /// Sort children by pk and stamp each with this record's pk as its parent.
    pub fn normalize_children(&mut self) {
        self.children.sort_by_key(|child| child.pk);
        for child in &mut self.children {
            child.fk = self.pk;
        }
    }
}

/// Identity of the authenticated gateway ("pad")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayIdentity {
    #[serde(default)]
    pub device_id: String,

    #[serde(default)]
    pub mac_address: String,

    #[serde(default)]
    pub model: String,

    /// Firmware version
    #[serde(default)]
    pub version: String,

    #[serde(skip)]
    pub available: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GatewayIdentity {
    /// Build an identity from the `data` object of an `authenticated` reply.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not an object.
    pub fn from_auth_data(data: Value) -> serde_json::Result<Self> {
        let mut identity: Self = serde_json::from_value(data)?;
        identity.available = true;
        Ok(identity)
    }

    #[must_use]
    pub fn manufacturer(&self) -> &'static str {
        MANUFACTURER
    }
}

impl fmt::Display for GatewayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worlty(model={}, id={}, mac_address={}, fw_version={})",
            self.model, self.device_id, self.mac_address, self.version
        )
    }
}


/// Property-based tests for unique-id derivation.
#[cfg(test)]
mod proptest_unique_id_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[a-z0-9_:\\-]{0,16}").unwrap()
    }

    proptest! {
        #[test]
        fn distinct_keys_yield_distinct_ids(
            pk_a in -1000i64..1000, fk_a in 0i64..50, name_a in arb_name(),
            pk_b in -1000i64..1000, fk_b in 0i64..50, name_b in arb_name(),
        ) {
            let a = EntityKey::new(pk_a, fk_a, name_a);
            let b = EntityKey::new(pk_b, fk_b, name_b);
            prop_assume!(a != b);
            prop_assert_ne!(a.unique_id("pad"), b.unique_id("pad"));
        }

        #[test]
        fn derivation_is_deterministic(pk in any::<i64>(), fk in any::<i64>(), name in arb_name()) {
            let key = EntityKey::new(pk, fk, name);
            prop_assert_eq!(key.unique_id("pad"), key.clone().unique_id("pad"));
        }
    }
}
