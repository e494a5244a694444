pub mod events;
pub mod ids;

pub use events::{EntityKind, EventPayload, EventType, NewEvent, StoredEvent};
pub use ids::{FeatureName, ProjectId};
