use serde::{Deserialize, Serialize};

/// One line of the relay's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Stamp a new entry with a fresh UUID v4 and the current UTC time.
    pub fn new(
        event_type: AuditEventType,
        source: AuditSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
        }
    }
}

/// Lifecycle events recorded by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RelayStarted,
    RelayStopped,
    ConnectionOpened,
    OriginRejected,
    RouteNotFound,
    UpgradeFailed,
    UpstreamDialFailed,
    SessionClosed,
}

/// Where an event came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuditSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            origin: None,
            remote_addr: None,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl ToString, remote_addr: impl ToString) -> Self {
        self.session_id = Some(session_id.to_string());
        self.remote_addr = Some(remote_addr.to_string());
        self
    }

    pub fn with_origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }
}
