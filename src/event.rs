//! Event value object and the standard event-type taxonomy.
//!
//! An [`Event`] records something that happened: a dot-separated hierarchical
//! type string (e.g. `agent.message.sent`), a JSON payload, an urgency level,
//! and provenance metadata. Events are immutable once constructed; all
//! construction goes through [`Event::new`] or [`Event::builder`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Standard event-type constants following the format `<category>.<action>`.
///
/// These are conventions shared with collaborating components, not a closed
/// enum — any dot-segmented string is a legal event type.
pub mod topics {
    // System lifecycle
    pub const SYSTEM_STARTUP: &str = "system.startup";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";

    // Agent conversation
    pub const AGENT_CONVERSATION_STARTED: &str = "agent.conversation.started";
    pub const AGENT_MESSAGE_RECEIVED: &str = "agent.message.received";
    pub const AGENT_MESSAGE_SENT: &str = "agent.message.sent";

    // MCP integration
    pub const MCP_SERVER_CONNECTED: &str = "mcp.server.connected";
    pub const MCP_TOOL_CALLED: &str = "mcp.tool.called";

    // Memory
    pub const MEMORY_ENTRY_CREATED: &str = "memory.entry.created";

    // Scheduler lifecycle
    pub const TASK_SCHEDULED: &str = "scheduler.task.scheduled";
    pub const TASK_COMPLETED: &str = "scheduler.task.completed";
    pub const TASK_FAILED: &str = "scheduler.task.failed";
    pub const TASK_CANCELLED: &str = "scheduler.task.cancelled";
    pub const TASK_RETRYING: &str = "scheduler.task.retrying";
}

/// Event urgency. `Critical` is the most urgent; the derived ordering puts
/// more urgent levels first, so `Critical < High < Normal < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl EventPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Parse the lowercase wire form. Unknown strings map to `Normal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// An immutable record of something that happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dot-separated hierarchical type (e.g. `agent.message.sent`).
    pub event_type: String,
    /// Payload.
    pub data: Map<String, Value>,
    /// Urgency level.
    #[serde(default)]
    pub priority: EventPriority,
    /// Component that published the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Correlates related events across operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Unique identifier, generated if absent at construction.
    pub event_id: String,
    /// When the event occurred (UTC), generated if absent at construction.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with a generated id and timestamp.
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            priority: EventPriority::Normal,
            source: None,
            correlation_id: None,
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Start building an event with optional fields.
    pub fn builder(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder {
            event_type: event_type.into(),
            data: Map::new(),
            priority: EventPriority::Normal,
            source: None,
            correlation_id: None,
            event_id: None,
            timestamp: None,
        }
    }
}

/// Builder for [`Event`].
pub struct EventBuilder {
    event_type: String,
    data: Map<String, Value>,
    priority: EventPriority,
    source: Option<String>,
    correlation_id: Option<String>,
    event_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventBuilder {
    /// Replace the whole payload.
    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Insert one payload field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Supply an explicit event id instead of generating one.
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Supply an explicit timestamp instead of "now".
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Event {
        Event {
            event_type: self.event_type,
            data: self.data,
            priority: self.priority,
            source: self.source,
            correlation_id: self.correlation_id,
            event_id: self
                .event_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}
