//! JSON envelope used on the remote-control socket.
//!
//! Every outbound object carries a fresh `_id`. A reply additionally carries
//! `_response_to` (the request's `_id`) and `_query` (the request itself).

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::actions::Action;

pub const ID: &str = "_id";
pub const RESPONSE_TO: &str = "_response_to";
pub const QUERY: &str = "_query";

/// Method name of pushed and replied status payloads
pub const UPDATE_STATUS: &str = "update_status";

/// Request handlers the server knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Button,
    Status,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "button" => Some(Self::Button),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// What an incoming object is, judged by its envelope keys
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Has a `method`
    Request(&'a str),
    /// No `method` but a `_response_to`
    Response(String),
    Undispatchable,
}

pub fn classify(payload: &Value) -> Inbound<'_> {
    if let Some(method) = payload.get("method").and_then(Value::as_str) {
        return Inbound::Request(method);
    }
    match payload.get(RESPONSE_TO) {
        Some(Value::String(id)) => Inbound::Response(id.clone()),
        Some(Value::Null) | None => Inbound::Undispatchable,
        Some(other) => Inbound::Response(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ButtonCmd {
    Launch,
    LaunchTag,
    Stop,
    StopTag,
    Terminate,
}

/// Parameters of a `button` request. `id` is a window name, a tag, or empty.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonRequest {
    #[serde(default)]
    pub id: String,
    pub cmd: ButtonCmd,
}

impl ButtonRequest {
    pub fn action(&self) -> Action {
        let window = (!self.id.is_empty()).then(|| self.id.clone());
        match self.cmd {
            ButtonCmd::Launch => Action::launch(window),
            ButtonCmd::LaunchTag => Action::launch_tag(&self.id),
            ButtonCmd::Stop => Action::stop(window),
            ButtonCmd::StopTag => Action::stop_tag(&self.id),
            ButtonCmd::Terminate => Action::Terminate { reinit: true },
        }
    }
}

pub fn status_message(windows: &BTreeMap<String, bool>) -> Value {
    json!({
        "windows": windows,
        "method": UPDATE_STATUS,
    })
}

/// Give an outbound object its own `_id`. Non-objects are wrapped as `{"data": ...}`.
pub fn stamp(data: Value) -> (String, Value) {
    let mut object = match data {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    let id = Uuid::new_v4().to_string();
    object.insert(ID.to_string(), Value::String(id.clone()));
    (id, Value::Object(object))
}

/// Attach correlation fields to a handler result
pub fn reply_to(query: &Value, result: Value) -> Value {
    let mut object = match result {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object.insert(
        RESPONSE_TO.to_string(),
        query.get(ID).cloned().unwrap_or(Value::Null),
    );
    object.insert(QUERY.to_string(), query.clone());
    Value::Object(object)
}
