//! JSON frames exchanged with agents over the WebSocket.
//!
//! Every frame is an object tagged by `event`. Field names are camelCase.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    PowerOff,
    PowerOn,
    Execute,
    KeylogStart,
    KeylogStop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerOff => "power-off",
            Self::PowerOn => "power-on",
            Self::Execute => "execute",
            Self::KeylogStart => "keylog-start",
            Self::KeylogStop => "keylog-stop",
        }
    }

    /// Deadline used when the caller does not supply one. `None` defers to
    /// the relay-wide default.
    pub fn default_timeout(&self) -> Option<Duration> {
        match self {
            Self::Execute => Some(Duration::from_secs(10)),
            Self::PowerOff | Self::PowerOn => Some(Duration::from_secs(30)),
            Self::KeylogStart | Self::KeylogStop => None,
        }
    }

    pub fn requires_command(&self) -> bool {
        matches!(self, Self::Execute)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command pushed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<u64>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub correlation_id: String,
    pub chunk_index: i64,
    pub size: usize,
    pub received_at: i64,
    pub duplicate: bool,
}

/// Frames sent from the relay to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerFrame {
    Registered(Registered),
    Command(CommandEnvelope),
    ChunkAck(ChunkAck),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub secret: String,
}

/// Single-shot result for a dispatched command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStart {
    pub correlation_id: String,
    pub total_chunks: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// One fragment of a chunked transfer. `data` is base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferChunk {
    pub correlation_id: String,
    pub chunk_index: i64,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEnd {
    pub correlation_id: String,
    #[serde(default)]
    pub sent_chunks: u64,
    #[serde(default)]
    pub failed_chunks: Vec<i64>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub correlation_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub failed_chunks: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlive {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Frames received from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AgentFrame {
    Register(Registration),
    CommandResponse(CommandResult),
    TransferStart(TransferStart),
    TransferChunk(TransferChunk),
    TransferEnd(TransferEnd),
    TransferError(TransferFailure),
    KeepAlive(KeepAlive),
}

impl AgentFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::CommandResponse(_) => "commandResponse",
            Self::TransferStart(_) => "transferStart",
            Self::TransferChunk(_) => "transferChunk",
            Self::TransferEnd(_) => "transferEnd",
            Self::TransferError(_) => "transferError",
            Self::KeepAlive(_) => "keepAlive",
        }
    }
}

/// Reply delivered to the operator when an agent answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Terminal outcome of a dispatched command.
pub type Outcome = Result<CommandReply, fleet_relay_error::RelayError>;
