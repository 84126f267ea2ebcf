use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity reported by the monitoring server for one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// The primary resource a fault points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    /// Namespace for namespaced resources, scope label otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Extra material the server attached to a fault (container logs,
/// recent events, ...). Opaque to the pipeline; handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedSignal {
    pub kind: String,
    pub content: String,
}

/// One decoded fault event. Constructed by a stream client (which
/// injects the cluster name and subscription id) and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultEvent {
    pub cluster: String,
    pub subscription_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub fault_kind: String,
    #[serde(default)]
    pub context: String,
    pub resource: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<Vec<EnrichedSignal>>,
}

/// Event payload as it appears on the wire, before the cluster name and
/// subscription id are stamped on.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub fault_kind: String,
    #[serde(default)]
    pub context: String,
    pub resource: ResourceRef,
    #[serde(default)]
    pub signals: Option<Vec<EnrichedSignal>>,
}

impl FaultEvent {
    pub fn from_wire(cluster: &str, subscription_id: &str, wire: WireEvent) -> Self {
        Self {
            cluster: cluster.to_string(),
            subscription_id: subscription_id.to_string(),
            timestamp: wire.timestamp,
            severity: wire.severity,
            fault_kind: wire.fault_kind,
            context: wire.context,
            resource: wire.resource,
            signals: wire.signals,
        }
    }
}

/// Server-pushed frames of one subscription session.
///
/// The session is newline-delimited JSON: one `subscribed` ack after the
/// subscribe command is accepted, then interleaved `event` and `ping`
/// frames until either side closes.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Subscribed { subscription_id: String },
    Event { event: WireEvent },
    Ping,
}

impl StreamFrame {
    /// Decode a single frame line. Malformed frames are reported by the
    /// caller and dropped; they never tear down the session.
    pub fn decode(line: &str) -> Result<StreamFrame, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_event_frame() {
        let line = r#"{"type":"event","event":{"timestamp":"2026-03-01T10:00:00Z","severity":"warning","fault_kind":"CrashLoopBackOff","context":"restarted 5 times","resource":{"kind":"Pod","name":"p1","namespace":"default"}}}"#;
        let frame = StreamFrame::decode(line).unwrap();
        match frame {
            StreamFrame::Event { event } => {
                assert_eq!(event.severity, Severity::Warning);
                assert_eq!(event.resource.name, "p1");
                assert_eq!(event.resource.namespace.as_deref(), Some("default"));
            }
            other => panic!("expected event frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_subscribed_and_ping() {
        let frame = StreamFrame::decode(r#"{"type":"subscribed","subscription_id":"sub-7"}"#).unwrap();
        assert!(matches!(frame, StreamFrame::Subscribed { ref subscription_id } if subscription_id == "sub-7"));

        let frame = StreamFrame::decode(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, StreamFrame::Ping));
    }

    #[test]
    fn test_decode_malformed_frame_is_error() {
        assert!(StreamFrame::decode("not json").is_err());
        assert!(StreamFrame::decode(r#"{"type":"wat"}"#).is_err());
    }

    #[test]
    fn test_from_wire_injects_cluster() {
        let wire = WireEvent {
            timestamp: Utc::now(),
            severity: Severity::Error,
            fault_kind: "OOMKilled".to_string(),
            context: String::new(),
            resource: ResourceRef {
                kind: "Pod".to_string(),
                name: "api-0".to_string(),
                namespace: Some("prod".to_string()),
            },
            signals: None,
        };
        let event = FaultEvent::from_wire("cluster-a", "sub-1", wire);
        assert_eq!(event.cluster, "cluster-a");
        assert_eq!(event.subscription_id, "sub-1");
    }
}
