//! Wire messages exchanged with the voice server.
//!
//! Binary frames are raw PCM16 mono audio in both directions, with no header.
//! Text frames are JSON control messages of the form
//! `{"method": <name>, "data"?: <any>}`.

use crate::error::{Result, VoicelinkError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const METHOD_INITIATE: &str = "initiate";
pub const METHOD_PING: &str = "ping";
pub const METHOD_PONG: &str = "pong";

/// A JSON control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlMessage {
    pub fn new(method: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Keepalive probe sent alongside outbound audio.
    pub fn ping() -> Self {
        Self::new(METHOD_PING, None)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Field of the `data` object, if `data` is an object containing `key`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.as_object()?.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key)?.as_str()
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.field(key)?.as_bool()
    }
}

/// Parse an inbound text frame.
///
/// Returns `Ok(None)` for keepalive acknowledgements, which are not
/// forwarded. Malformed JSON or a missing `method` is a protocol error the
/// caller logs and drops.
pub fn parse_inbound(text: &str) -> Result<Option<ControlMessage>> {
    let message: ControlMessage =
        serde_json::from_str(text).map_err(|e| VoicelinkError::Protocol {
            message: format!("malformed control message: {}", e),
        })?;
    if message.method == METHOD_PONG {
        return Ok(None);
    }
    Ok(Some(message))
}

/// Connection parameters captured once at `connect` time.
///
/// Every reconnect replays exactly these values in its `initiate` message,
/// whatever the caller has changed since.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConnection {
    pub endpoint: String,
    pub agent_id: String,
    pub public_key: String,
    pub metadata: Option<Map<String, Value>>,
    pub include_metadata_in_prompt: bool,
}

#[derive(Serialize)]
struct AgentRef<'a> {
    agent_id: &'a str,
}

#[derive(Serialize)]
struct InitiateData<'a> {
    agent: AgentRef<'a>,
    public_key: &'a str,
    include_metadata_in_prompt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Map<String, Value>>,
}

impl PendingConnection {
    /// The authentication message sent first on every successful open.
    pub fn initiate_message(&self) -> Result<ControlMessage> {
        let data = InitiateData {
            agent: AgentRef {
                agent_id: &self.agent_id,
            },
            public_key: &self.public_key,
            include_metadata_in_prompt: self.include_metadata_in_prompt,
            metadata: self.metadata.as_ref().filter(|m| !m.is_empty()),
        };
        Ok(ControlMessage::new(
            METHOD_INITIATE,
            Some(serde_json::to_value(data)?),
        ))
    }
}
