//! Responses and notifications arriving from the remote application.
//!
//! Payloads are JSON objects. When their `dataType` names a registered
//! decoder they are turned into a typed [`InboundMessage`], otherwise they
//! are passed along as the raw object.

use std::collections::HashMap;

use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Vector3 {
    #[serde(deserialize_with = "lenient_f64")]
    pub x: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub y: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub z: f64,
}

impl Vector3 {
    pub fn as_tuple(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentRecord {
    #[serde(rename = "agentId", deserialize_with = "lenient_i64")]
    pub id: i64,
    #[serde(rename = "agentName", default)]
    pub name: String,
    pub location: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
}

/// Reply to a `GetWorld` request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorldData {
    pub agents: Vec<AgentRecord>,
}

impl WorldData {
    pub fn agent(&self, agent_id: i64) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn agent_location(&self, agent_id: i64) -> Option<Vector3> {
        self.agent(agent_id).map(|a| a.location)
    }

    pub fn agent_rotation(&self, agent_id: i64) -> Option<Vector3> {
        self.agent(agent_id).map(|a| a.rotation)
    }

    pub fn agent_velocity(&self, agent_id: i64) -> Option<Vector3> {
        self.agent(agent_id).map(|a| a.velocity)
    }

    /// Name of an agent, empty when the id is unknown.
    pub fn agent_name(&self, agent_id: i64) -> &str {
        self.agent(agent_id).map(|a| a.name.as_str()).unwrap_or("")
    }

    pub fn agent_ids(&self) -> Vec<i64> {
        self.agents.iter().map(|a| a.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RaycastData {
    #[serde(deserialize_with = "lenient_bool")]
    pub hit: bool,
    pub location: Vector3,
    #[serde(rename = "hitActorName", default)]
    pub actor_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformData {
    #[serde(rename = "agentId", deserialize_with = "lenient_i64")]
    pub agent_id: i64,
    #[serde(rename = "agentName", default)]
    pub name: String,
    pub location: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalIdData {
    #[serde(rename = "agentId", deserialize_with = "lenient_i64")]
    pub agent_id: i64,
}

/// A decoded data channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    World(WorldData),
    Raycast(RaycastData),
    Transform(TransformData),
    LocalId(LocalIdData),
    /// No decoder matched, the object is passed on as received
    Raw(Map<String, Value>),
}

impl InboundMessage {
    pub fn as_raw(&self) -> Option<&Map<String, Value>> {
        match self {
            InboundMessage::Raw(m) => Some(m),
            _ => None,
        }
    }
}

pub type Decoder = fn(Map<String, Value>) -> Result<InboundMessage>;

/// Maps `dataType` tags to decoder functions.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = DecoderRegistry::empty();
        registry.register("WorldLVR", |m| {
            typed(m, "WorldLVR").map(InboundMessage::World)
        });
        registry.register("Raycast", |m| {
            typed(m, "Raycast").map(InboundMessage::Raycast)
        });
        registry.register("Transform", |m| {
            typed(m, "Transform").map(InboundMessage::Transform)
        });
        registry.register("LocalID", |m| {
            typed(m, "LocalID").map(InboundMessage::LocalId)
        });
        registry
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        DecoderRegistry {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, tag: &'static str, decoder: Decoder) {
        self.decoders.insert(tag, decoder);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Decodes by `dataType`, falling back to [`InboundMessage::Raw`].
    pub fn decode(&self, object: Map<String, Value>) -> Result<InboundMessage> {
        let decoder = object
            .get("dataType")
            .and_then(Value::as_str)
            .and_then(|tag| self.decoders.get(tag).copied());

        match decoder {
            Some(decode) => decode(object),
            None => Ok(InboundMessage::Raw(object)),
        }
    }
}

fn typed<T: de::DeserializeOwned>(object: Map<String, Value>, tag: &str) -> Result<T> {
    serde_json::from_value(Value::Object(object))
        .map_err(|e| BridgeError::Decode(format!("{} payload: {}", tag, e)))
}

/// Reads an integer id that may arrive as a number or a numeric string.
pub fn id_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(i) => Ok(i as f64),
        Lenient::Float(f) => Ok(f),
        Lenient::Text(s) => s.trim().parse().map_err(de::Error::custom),
        Lenient::Bool(_) => Err(de::Error::custom("expected a number")),
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(i) => Ok(i),
        Lenient::Float(f) if f.fract() == 0.0 => Ok(f as i64),
        Lenient::Text(s) => s.trim().parse().map_err(de::Error::custom),
        _ => Err(de::Error::custom("expected an integer")),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Bool(b) => Ok(b),
        Lenient::Int(i) => Ok(i != 0),
        Lenient::Float(f) => Ok(f != 0.0),
        Lenient::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            other => Err(de::Error::custom(format!("not a boolean: {}", other))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn agent(id: Value, name: &str, x: f64) -> Value {
        json!({
            "agentId": id,
            "agentName": name,
            "location": {"x": x, "y": 2.0, "z": 3.0},
            "rotation": {"x": 0, "y": 90, "z": 0},
            "velocity": {"x": "1.5", "y": 0, "z": 0},
        })
    }

    #[test]
    fn decodes_world() {
        let registry = DecoderRegistry::default();
        let msg = registry
            .decode(object(json!({
                "messageId": "0",
                "dataType": "WorldLVR",
                "agents": [agent(json!(1), "drone", 10.0), agent(json!("2"), "rover", 20.0)],
            })))
            .unwrap();

        let InboundMessage::World(world) = msg else {
            panic!("expected world data");
        };
        assert_eq!(world.agent_ids(), vec![1, 2]);
        assert_eq!(world.agent_name(2), "rover");
        assert_eq!(world.agent_name(9), "");
        assert_eq!(world.agent_location(1).unwrap().as_tuple(), (10.0, 2.0, 3.0));
        assert_eq!(world.agent_rotation(2).unwrap().y, 90.0);
        assert_eq!(world.agent_velocity(1).unwrap().x, 1.5);
        assert!(world.agent_location(5).is_none());
    }

    #[test]
    fn decodes_raycast_transform_and_local_id() {
        let registry = DecoderRegistry::default();

        let ray = registry
            .decode(object(json!({
                "dataType": "Raycast",
                "hit": 1,
                "hitActorName": "Wall_3",
                "location": {"x": 1, "y": 2, "z": 3},
            })))
            .unwrap();
        assert!(matches!(ray, InboundMessage::Raycast(ref r) if r.hit && r.actor_name == "Wall_3"));

        let mut t = agent(json!(4), "car", 5.0);
        t["dataType"] = json!("Transform");
        let tr = registry.decode(object(t)).unwrap();
        match tr {
            InboundMessage::Transform(t) => {
                assert_eq!(t.agent_id, 4);
                assert_eq!(t.name, "car");
            }
            other => panic!("unexpected {:?}", other),
        }

        let id = registry
            .decode(object(json!({"dataType": "LocalID", "agentId": 12})))
            .unwrap();
        assert_eq!(id, InboundMessage::LocalId(LocalIdData { agent_id: 12 }));
    }

    #[test]
    fn unknown_tag_passes_through_raw() {
        let registry = DecoderRegistry::default();
        let raw = object(json!({"dataType": "Weather", "rain": true}));
        let msg = registry.decode(raw.clone()).unwrap();
        assert_eq!(msg, InboundMessage::Raw(raw));

        let untagged = object(json!({"hello": "world"}));
        assert!(registry.decode(untagged).unwrap().as_raw().is_some());
    }

    #[test]
    fn missing_field_in_known_tag_is_an_error() {
        let registry = DecoderRegistry::default();
        let err = registry
            .decode(object(json!({"dataType": "Transform", "agentId": 1})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
    }

    #[test]
    fn custom_decoder_can_be_registered() {
        let mut registry = DecoderRegistry::empty();
        assert!(!registry.contains("LocalID"));
        registry.register("Ping", |_| Ok(InboundMessage::LocalId(LocalIdData { agent_id: -1 })));
        let msg = registry.decode(object(json!({"dataType": "Ping"}))).unwrap();
        assert_eq!(msg, InboundMessage::LocalId(LocalIdData { agent_id: -1 }));
    }

    #[test]
    fn ids_parse_from_numbers_and_strings() {
        assert_eq!(id_from_value(&json!(3)), Some(3));
        assert_eq!(id_from_value(&json!("17")), Some(17));
        assert_eq!(id_from_value(&json!("x")), None);
        assert_eq!(id_from_value(&json!(null)), None);
    }
}
