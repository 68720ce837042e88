//! Unified run event model.
//!
//! Every vendor stream is normalized into [`EventData`] variants. The core
//! wraps each payload into a [`RunEvent`] carrying the run id, a per-run
//! sequence number and an emission timestamp.
//!
//! # Wire format
//!
//! ```text
//! {"id":"3","run_id":"…","type":"tool_call","ts":"2025-01-01T00:00:00Z","data":{…}}
//! ```
//!
//! Cost reports and generic metrics share the `metric` type; a `data`
//! object carrying `total_cost_usd` decodes as [`EventData::Cost`].

pub mod emitter;
pub mod sink;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::types::RunId;

pub use emitter::RunEmitter;
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, SinkError};

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Tag of a [`RunEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    ToolCall,
    ToolResult,
    Metric,
    Log,
    Error,
    Status,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Metric => "metric",
            Self::Log => "log",
            Self::Error => "error",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "metric" => Ok(Self::Metric),
            "log" => Ok(Self::Log),
            "error" => Ok(Self::Error),
            "status" => Ok(Self::Status),
            other => Err(format!("invalid event type: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEventData {
    pub role: String,
    pub content: String,
}

impl MessageEventData {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEventData {
    pub tool_name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEventData {
    pub tool_name: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEventData {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Generic named metric (e.g. a usage report without a cost).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEventData {
    pub name: String,
    #[serde(default)]
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEventData {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LogEventData {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventData {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEventData {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Normalized payload of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Message(MessageEventData),
    ToolCall(ToolCallEventData),
    ToolResult(ToolResultEventData),
    Cost(CostEventData),
    Metric(MetricEventData),
    Log(LogEventData),
    Error(ErrorEventData),
    Status(StatusEventData),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Message(_) => EventType::Message,
            Self::ToolCall(_) => EventType::ToolCall,
            Self::ToolResult(_) => EventType::ToolResult,
            Self::Cost(_) | Self::Metric(_) => EventType::Metric,
            Self::Log(_) => EventType::Log,
            Self::Error(_) => EventType::Error,
            Self::Status(_) => EventType::Status,
        }
    }

    /// Serialize the payload into the `data` object of the wire format.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Message(d) => serde_json::to_value(d),
            Self::ToolCall(d) => serde_json::to_value(d),
            Self::ToolResult(d) => serde_json::to_value(d),
            Self::Cost(d) => serde_json::to_value(d),
            Self::Metric(d) => serde_json::to_value(d),
            Self::Log(d) => serde_json::to_value(d),
            Self::Error(d) => serde_json::to_value(d),
            Self::Status(d) => serde_json::to_value(d),
        }
    }

    /// Rebuild a payload from its wire type tag and `data` object.
    pub fn from_parts(event_type: EventType, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            EventType::Message => Self::Message(serde_json::from_value(data)?),
            EventType::ToolCall => Self::ToolCall(serde_json::from_value(data)?),
            EventType::ToolResult => Self::ToolResult(serde_json::from_value(data)?),
            EventType::Metric if data.get("total_cost_usd").is_some() => {
                Self::Cost(serde_json::from_value(data)?)
            }
            EventType::Metric => Self::Metric(serde_json::from_value(data)?),
            EventType::Log => Self::Log(serde_json::from_value(data)?),
            EventType::Error => Self::Error(serde_json::from_value(data)?),
            EventType::Status => Self::Status(serde_json::from_value(data)?),
        })
    }
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// One unit of stream output, stamped by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub run_id: RunId,
    /// Per-run sequence number, starting at 1, gapless.
    pub seq: u64,
    /// Assigned at emission time, never taken from the CLI.
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl RunEvent {
    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }
}

#[derive(Serialize)]
struct WireEventRef {
    id: String,
    run_id: RunId,
    #[serde(rename = "type")]
    event_type: EventType,
    ts: String,
    data: Value,
}

#[derive(Deserialize)]
struct WireEvent {
    id: String,
    run_id: RunId,
    #[serde(rename = "type")]
    event_type: EventType,
    ts: DateTime<Utc>,
    #[serde(default)]
    data: Value,
}

impl Serialize for RunEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.data.to_value().map_err(serde::ser::Error::custom)?;
        WireEventRef {
            id: self.seq.to_string(),
            run_id: self.run_id,
            event_type: self.event_type(),
            ts: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEvent::deserialize(deserializer)?;
        let seq = wire
            .id
            .parse::<u64>()
            .map_err(|e| D::Error::custom(format!("invalid event id {:?}: {e}", wire.id)))?;
        let data = EventData::from_parts(wire.event_type, wire.data).map_err(D::Error::custom)?;
        Ok(Self {
            run_id: wire.run_id,
            seq,
            timestamp: wire.ts,
            data,
        })
    }
}
