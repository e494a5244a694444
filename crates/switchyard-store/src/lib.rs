pub mod database;
pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod features;
pub mod projection;
pub mod projects;
pub mod retry;
pub mod row_helpers;
pub mod schema;
pub mod stores;

pub use database::Database;
pub use dispatch::{DispatchReport, Dispatcher, DispatcherBuilder, EventHandler, HandlerFailure};
pub use error::StoreError;
pub use event_log::{EventLog, RebuildReport};
pub use features::{FeatureStatus, FeatureToggle, FeatureToggleStore};
pub use projection::{Projection, ProjectionSchema, ProjectionTable};
pub use projects::{Project, ProjectStore};
pub use retry::RetryPolicy;
pub use stores::Stores;
