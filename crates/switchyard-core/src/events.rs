use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{FeatureName, ProjectId};

/// Every kind of event the log accepts. The set is closed: dispatch tables
/// and projections match on it exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    FeatureCreated,
    FeatureUpdated,
    FeatureArchived,
    FeatureRevived,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::ProjectCreated,
        Self::ProjectUpdated,
        Self::ProjectDeleted,
        Self::FeatureCreated,
        Self::FeatureUpdated,
        Self::FeatureArchived,
        Self::FeatureRevived,
    ];

    /// Storage and wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project-created",
            Self::ProjectUpdated => "project-updated",
            Self::ProjectDeleted => "project-deleted",
            Self::FeatureCreated => "feature-created",
            Self::FeatureUpdated => "feature-updated",
            Self::FeatureArchived => "feature-archived",
            Self::FeatureRevived => "feature-revived",
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::ProjectCreated | Self::ProjectUpdated | Self::ProjectDeleted => EntityKind::Project,
            _ => EntityKind::Feature,
        }
    }
}

/// Projects and features have separate key spaces; an entity key only
/// identifies something together with its kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Feature,
}

impl EntityKind {
    pub fn event_types(&self) -> &'static [EventType] {
        match self {
            Self::Project => &[EventType::ProjectCreated, EventType::ProjectUpdated, EventType::ProjectDeleted],
            Self::Feature => &[
                EventType::FeatureCreated,
                EventType::FeatureUpdated,
                EventType::FeatureArchived,
                EventType::FeatureRevived,
            ],
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectData {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: ProjectId,
}

/// An activation strategy attached to a toggle. Parameters are opaque to
/// the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureData {
    pub name: FeatureName,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRef {
    pub name: FeatureName,
}

/// Typed event body. Serialized adjacently tagged:
/// `{"type": "project-created", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EventPayload {
    ProjectCreated(ProjectData),
    ProjectUpdated(ProjectData),
    ProjectDeleted(ProjectRef),
    FeatureCreated(FeatureData),
    FeatureUpdated(FeatureData),
    FeatureArchived(FeatureRef),
    FeatureRevived(FeatureRef),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ProjectCreated(_) => EventType::ProjectCreated,
            Self::ProjectUpdated(_) => EventType::ProjectUpdated,
            Self::ProjectDeleted(_) => EventType::ProjectDeleted,
            Self::FeatureCreated(_) => EventType::FeatureCreated,
            Self::FeatureUpdated(_) => EventType::FeatureUpdated,
            Self::FeatureArchived(_) => EventType::FeatureArchived,
            Self::FeatureRevived(_) => EventType::FeatureRevived,
        }
    }

    /// Key of the entity this event is about: project id or feature name.
    pub fn entity_key(&self) -> &str {
        match self {
            Self::ProjectCreated(d) | Self::ProjectUpdated(d) => d.id.as_str(),
            Self::ProjectDeleted(r) => r.id.as_str(),
            Self::FeatureCreated(d) | Self::FeatureUpdated(d) => d.name.as_str(),
            Self::FeatureArchived(r) | Self::FeatureRevived(r) => r.name.as_str(),
        }
    }

    /// The untagged body, as stored in the log's `data` column.
    pub fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ProjectCreated(d) | Self::ProjectUpdated(d) => serde_json::to_value(d),
            Self::ProjectDeleted(r) => serde_json::to_value(r),
            Self::FeatureCreated(d) | Self::FeatureUpdated(d) => serde_json::to_value(d),
            Self::FeatureArchived(r) | Self::FeatureRevived(r) => serde_json::to_value(r),
        }
    }

    /// Reassemble a payload from its stored tag and body. Fails when the body
    /// does not have the shape its tag demands.
    pub fn from_parts(event_type: EventType, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": event_type.as_str(),
            "data": data,
        }))
    }
}

/// An event as submitted by the command layer, before the log assigns an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub created_by: String,
    pub payload: EventPayload,
}

impl NewEvent {
    pub fn new(created_by: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            created_by: created_by.into(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// An event after a durable append. Immutable from here on.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: i64,
    pub created_by: String,
    pub created_at: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StoredEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
