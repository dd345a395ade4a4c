//! Request and response envelopes exchanged with the guest's `call` export.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::FlowOptions;
use crate::error::RuntimeError;

/// Reserved call id issued once before the first call on a fresh instance.
pub const ENGINE_CALL_ID_INITIALIZE: &str = "ENGINE_CALL_ID_INITIALIZE";
/// Reserved call id answered with the guest's `EngineVersion`.
pub const ENGINE_CALL_ID_GET_VERSION: &str = "ENGINE_CALL_ID_GET_VERSION";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Fresh per command; unrelated to future keys.
    pub request_id: String,
    pub kind: CommandKind,
    pub call: Call,
    #[serde(default)]
    pub options: CallOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Call,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallOptions {
    pub content_type: ContentType,
    pub bundle_id: String,
    pub device_id: String,
    pub country_code: String,
    pub language_code: String,
    pub region_code: String,
    pub app_version: String,
    pub premium: bool,
    /// Per-module serialized options, keyed by module name.
    pub extra: Map<String, Value>,
}

impl CallOptions {
    pub fn apply_flow(&mut self, flow: &FlowOptions) {
        self.bundle_id = flow.bundle_id.clone();
        self.device_id = flow.device_id.clone();
        self.country_code = flow.country_code.clone();
        self.language_code = flow.language_code.clone();
        self.region_code = flow.region_code.clone();
        self.app_version = flow.app_version.clone();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/grpc")]
    Grpc,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Grpc => "application/grpc",
        }
    }
}

impl Command {
    pub fn new(id: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            kind: CommandKind::Call,
            call: Call { id: id.into(), args },
            options: CallOptions::default(),
        }
    }

    /// Command for a call id that takes no arguments.
    pub fn bare(id: impl Into<String>) -> Self {
        Self::new(id, Map::new())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub code: i32,
    pub reason: String,
}

impl From<EventError> for RuntimeError {
    fn from(err: EventError) -> Self {
        RuntimeError::Protocol {
            code: err.code,
            reason: err.reason,
        }
    }
}

/// A guest response, read according to the content type it was requested with.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Event),
    Grpc(Vec<u8>),
}

impl Reply {
    /// Split off guest error events. An error event surfaces as
    /// `RuntimeError::Protocol` whatever the content type.
    pub fn from_bytes(content_type: ContentType, bytes: Vec<u8>) -> Result<Self, RuntimeError> {
        match content_type {
            ContentType::Json => {
                let mut event = serde_json::from_slice::<Event>(&bytes).unwrap_or_default();
                if let Some(err) = event.error.take() {
                    return Err(err.into());
                }
                if event.payload.is_none() {
                    event.payload = Some(serde_json::from_slice(&bytes)?);
                }
                Ok(Reply::Json(event))
            }
            ContentType::Grpc => {
                if let Ok(Event { error: Some(err), .. }) = serde_json::from_slice::<Event>(&bytes) {
                    return Err(err.into());
                }
                Ok(Reply::Grpc(bytes))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RuntimeError> {
        match self {
            Reply::Json(event) => Ok(serde_json::from_value(event.payload.unwrap_or(Value::Null))?),
            Reply::Grpc(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Reply::Json(event) => Ok(serde_json::to_vec(&event.payload.unwrap_or(Value::Null))?),
            Reply::Grpc(bytes) => Ok(bytes),
        }
    }
}

static CAMEL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([a-z])([A-Z])").expect("literal pattern"));

/// Wire name of a call case: the last two path components of `path`
/// (separated by `.` or `::`), snake-cased and upper-cased.
///
/// `MusicCallID::getDetails` becomes `MUSIC_CALL_ID_GET_DETAILS`.
pub fn to_call_id(path: &str) -> String {
    let parts: Vec<&str> = path.split([':', '.']).filter(|p| !p.is_empty()).collect();
    let tail = &parts[parts.len().saturating_sub(2)..];
    tail.iter()
        .map(|part| CAMEL_BOUNDARY.replace_all(part, "${1}_${2}").to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_serializes_camel_case() {
        let mut args = Map::new();
        args.insert("vid".into(), json!("abc"));
        let mut cmd = Command::new("MUSIC_CALL_ID_GET_DETAILS", args);
        cmd.options.content_type = ContentType::Grpc;
        cmd.options.premium = true;

        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["kind"], "call");
        assert_eq!(value["call"]["id"], "MUSIC_CALL_ID_GET_DETAILS");
        assert_eq!(value["call"]["args"]["vid"], "abc");
        assert_eq!(value["options"]["contentType"], "application/grpc");
        assert_eq!(value["options"]["premium"], true);
        assert!(value["requestId"].as_str().is_some_and(|id| id.len() == 36));

        let back = Command::from_bytes(&cmd.to_bytes().unwrap()).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn request_ids_are_fresh() {
        assert_ne!(Command::bare("A").request_id, Command::bare("A").request_id);
    }

    #[test]
    fn flow_options_are_stamped() {
        let flow = FlowOptions {
            bundle_id: "com.example".into(),
            country_code: "VN".into(),
            ..FlowOptions::default()
        };
        let mut options = CallOptions::default();
        options.apply_flow(&flow);
        assert_eq!(options.bundle_id, "com.example");
        assert_eq!(options.country_code, "VN");
        assert_eq!(options.content_type, ContentType::Json);
    }

    #[test]
    fn error_event_becomes_protocol_error() {
        let bytes = br#"{"error":{"code":7,"reason":"boom"}}"#.to_vec();
        match Reply::from_bytes(ContentType::Json, bytes.clone()) {
            Err(RuntimeError::Protocol { code, reason }) => {
                assert_eq!(code, 7);
                assert_eq!(reason, "boom");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert!(matches!(
            Reply::from_bytes(ContentType::Grpc, bytes),
            Err(RuntimeError::Protocol { code: 7, .. })
        ));
    }

    #[test]
    fn payload_or_bare_body_decodes() {
        #[derive(Deserialize)]
        struct Details {
            title: String,
        }

        let wrapped = br#"{"requestId":"r1","payload":{"title":"Song"}}"#.to_vec();
        let details: Details = Reply::from_bytes(ContentType::Json, wrapped).unwrap().decode().unwrap();
        assert_eq!(details.title, "Song");

        let bare = br#"{"title":"Bare"}"#.to_vec();
        let details: Details = Reply::from_bytes(ContentType::Json, bare).unwrap().decode().unwrap();
        assert_eq!(details.title, "Bare");

        let scalar = br#""plain""#.to_vec();
        let text: String = Reply::from_bytes(ContentType::Json, scalar).unwrap().decode().unwrap();
        assert_eq!(text, "plain");

        let raw = b"\x08\x01".to_vec();
        assert_eq!(
            Reply::from_bytes(ContentType::Grpc, raw.clone()).unwrap().into_bytes().unwrap(),
            raw
        );
    }

    #[test]
    fn call_ids_follow_naming_convention() {
        assert_eq!(to_call_id("MusicCallID::getDetails"), "MUSIC_CALL_ID_GET_DETAILS");
        assert_eq!(to_call_id("music.MusicCallID.getDetails"), "MUSIC_CALL_ID_GET_DETAILS");
        assert_eq!(to_call_id("Foo.bar2"), "FOO_BAR2");
        assert_eq!(to_call_id("Foo::bar_3"), "FOO_BAR_3");
        assert_eq!(to_call_id("Foo::fooBar"), "FOO_FOO_BAR");
        assert_eq!(to_call_id("single"), "SINGLE");
    }
}
