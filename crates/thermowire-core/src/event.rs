//! Events emitted by the engine

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;
use crate::device::BusId;

/// Why an `Error` event was raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorReason {
    /// Enumeration returned a ROM code whose CRC does not match
    ChecksumMismatch,
    /// A live device did not deliver a reading
    ReadFailed(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
            Self::ReadFailed(msg) => write!(f, "read failed: {}", msg),
        }
    }
}

/// Change in a device's presence or identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// First sighting of an address with no record
    Added {
        name: String,
        address: Address,
        bus: BusId,
    },
    /// A known device that was down answers again
    Restored {
        name: String,
        address: Address,
        bus: BusId,
    },
    /// A device that was up stopped answering
    Lost {
        name: String,
        address: Address,
        bus: BusId,
    },
    Renamed {
        old_name: String,
        new_name: String,
        address: Address,
        bus: Option<BusId>,
    },
    Error {
        name: String,
        address: Address,
        bus: BusId,
        reason: ErrorReason,
    },
}

impl LifecycleEvent {
    /// Current name of the device the event is about
    pub fn name(&self) -> &str {
        match self {
            Self::Added { name, .. }
            | Self::Restored { name, .. }
            | Self::Lost { name, .. }
            | Self::Error { name, .. } => name,
            Self::Renamed { new_name, .. } => new_name,
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            Self::Added { address, .. }
            | Self::Restored { address, .. }
            | Self::Lost { address, .. }
            | Self::Renamed { address, .. }
            | Self::Error { address, .. } => address,
        }
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Restored { .. } => "restored",
            Self::Lost { .. } => "lost",
            Self::Renamed { .. } => "renamed",
            Self::Error { .. } => "error",
        }
    }
}

/// A device's reading changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEvent {
    pub name: String,
    pub address: Address,
    /// Reading in °C, rounded to one decimal
    pub value: f64,
}

/// Either kind of event, for consumers that want a single stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Lifecycle(LifecycleEvent),
    Value(ValueEvent),
}

impl From<LifecycleEvent> for EngineEvent {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

impl From<ValueEvent> for EngineEvent {
    fn from(event: ValueEvent) -> Self {
        Self::Value(event)
    }
}

/// Everything a single engine operation produced, in emission order per stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub lifecycle: Vec<LifecycleEvent>,
    pub values: Vec<ValueEvent>,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_lifecycle(&mut self, event: LifecycleEvent) {
        self.lifecycle.push(event);
    }

    pub fn push_value(&mut self, event: ValueEvent) {
        self.values.push(event);
    }

    pub fn extend(&mut self, other: EventBatch) {
        self.lifecycle.extend(other.lifecycle);
        self.values.extend(other.values);
    }

    pub fn is_empty(&self) -> bool {
        self.lifecycle.is_empty() && self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamed_reports_new_name() {
        let event = LifecycleEvent::Renamed {
            old_name: "T1".to_string(),
            new_name: "T2".to_string(),
            address: Address::default(),
            bus: None,
        };
        assert_eq!(event.name(), "T2");
        assert_eq!(event.kind(), "renamed");
    }

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent::Error {
            name: "boiler".to_string(),
            address: Address::new([0x28, 0, 0, 0, 0, 0, 0, 0x01]),
            bus: BusId(25),
            reason: ErrorReason::ChecksumMismatch,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["bus"], 25);
        assert_eq!(json["address"], "28:00:00:00:00:00:00:01");
        assert_eq!(json["reason"]["kind"], "checksum_mismatch");
    }

    #[test]
    fn test_batch_extend_keeps_order() {
        let mut first = EventBatch::new();
        first.push_value(ValueEvent {
            name: "a".to_string(),
            address: Address::default(),
            value: 1.0,
        });
        let mut second = EventBatch::new();
        second.push_value(ValueEvent {
            name: "b".to_string(),
            address: Address::default(),
            value: 2.0,
        });
        first.extend(second);
        let names: Vec<_> = first.values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(!first.is_empty());
    }
}
