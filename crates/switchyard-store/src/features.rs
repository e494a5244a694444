use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use tracing::instrument;

use switchyard_core::events::{FeatureData, Strategy};
use switchyard_core::{EventPayload, EventType, FeatureName, StoredEvent};

use crate::database::Database;
use crate::dispatch::{DispatcherBuilder, EventHandler};
use crate::error::StoreError;
use crate::projection::{Filter, Projection, ProjectionSchema, ProjectionTable};
use crate::row_helpers::{self, RowReader};

const SUBSCRIPTIONS: &[EventType] = &[
    EventType::FeatureCreated,
    EventType::FeatureUpdated,
    EventType::FeatureArchived,
    EventType::FeatureRevived,
];

const ACTIVE: Filter<'static> = &[("archived", Value::Integer(0))];
const ARCHIVED: Filter<'static> = &[("archived", Value::Integer(1))];

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggle {
    pub name: FeatureName,
    pub description: Option<String>,
    pub enabled: bool,
    pub strategies: Vec<Strategy>,
    pub created_at: String,
}

/// Whether a name is taken, and by what. Archived toggles keep their name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Active,
    Archived,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureRow {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// JSON array of strategies.
    pub strategies: String,
    pub archived: bool,
    pub created_at: String,
}

impl FeatureRow {
    pub fn from_data(data: &FeatureData, created_at: &str) -> Result<Self, StoreError> {
        Ok(Self {
            name: data.name.as_str().to_string(),
            description: data.description.clone(),
            enabled: data.enabled,
            strategies: serde_json::to_string(&data.strategies)?,
            archived: false,
            created_at: created_at.to_string(),
        })
    }
}

/// `None` means no such toggle.
pub fn feature_from_row(row: Option<FeatureRow>) -> Result<FeatureToggle, StoreError> {
    let row = row.ok_or_else(|| StoreError::NotFound("no feature toggle found".into()))?;
    let strategies = row_helpers::parse_json(&row.strategies, "features", "strategies")?;
    Ok(FeatureToggle {
        name: FeatureName::from_raw(row.name),
        description: row.description,
        enabled: row.enabled,
        strategies,
        created_at: row.created_at,
    })
}

pub struct FeatureSchema;

impl ProjectionSchema for FeatureSchema {
    type Row = FeatureRow;
    type Entity = FeatureToggle;

    const ENTITY: &'static str = "feature";
    const TABLE: &'static str = "features";
    const COLUMNS: &'static [&'static str] =
        &["name", "description", "enabled", "strategies", "archived", "created_at"];
    const KEY: &'static str = "name";
    const ORDER_BY: &'static str = "name ASC";

    fn read_row(row: &rusqlite::Row<'_>) -> Result<FeatureRow, StoreError> {
        let r = RowReader::new(row, Self::TABLE);
        Ok(FeatureRow {
            name: r.get(0, "name")?,
            description: r.get(1, "description")?,
            enabled: r.flag(2, "enabled")?,
            strategies: r.get(3, "strategies")?,
            archived: r.flag(4, "archived")?,
            created_at: r.get(5, "created_at")?,
        })
    }

    fn to_entity(row: Option<FeatureRow>) -> Result<FeatureToggle, StoreError> {
        feature_from_row(row)
    }
}

/// Projection of feature toggle events into the `features` table.
pub struct FeatureToggleStore {
    table: ProjectionTable<FeatureSchema>,
}

impl FeatureToggleStore {
    pub fn new(db: Database) -> Self {
        Self {
            table: ProjectionTable::new(db),
        }
    }

    pub fn register(db: Database, dispatcher: &mut DispatcherBuilder) -> Arc<Self> {
        let store = Arc::new(Self::new(db));
        dispatcher.subscribe(Arc::clone(&store));
        store
    }

    /// Active toggles, by name.
    #[instrument(skip(self))]
    pub fn get_features(&self) -> Result<Vec<FeatureToggle>, StoreError> {
        self.table.list(ACTIVE)
    }

    /// An active toggle. Archived toggles are `NotFound` here.
    #[instrument(skip(self), fields(feature = %name))]
    pub fn get_feature(&self, name: &FeatureName) -> Result<FeatureToggle, StoreError> {
        self.table.get(name.as_str(), ACTIVE)
    }

    #[instrument(skip(self))]
    pub fn get_archived_features(&self) -> Result<Vec<FeatureToggle>, StoreError> {
        self.table.list(ARCHIVED)
    }

    pub fn lookup(&self, name: &FeatureName) -> Result<Option<FeatureStatus>, StoreError> {
        Ok(self.table.find(name.as_str(), &[])?.map(|row| {
            if row.archived {
                FeatureStatus::Archived
            } else {
                FeatureStatus::Active
            }
        }))
    }

    pub fn on_created(&self, conn: &Connection, data: &FeatureData, created_at: &str) -> Result<(), StoreError> {
        let row = FeatureRow::from_data(data, created_at)?;
        self.table.insert(
            conn,
            &[
                ("name", Value::Text(row.name)),
                ("description", row.description.map_or(Value::Null, Value::Text)),
                ("enabled", flag(row.enabled)),
                ("strategies", Value::Text(row.strategies)),
                ("archived", flag(row.archived)),
                ("created_at", Value::Text(row.created_at)),
            ],
        )
    }

    /// Only active toggles take updates; an archived one stays as archived.
    pub fn on_updated(&self, conn: &Connection, data: &FeatureData) -> Result<(), StoreError> {
        self.table.update(
            conn,
            data.name.as_str(),
            ACTIVE,
            &[
                ("description", data.description.clone().map_or(Value::Null, Value::Text)),
                ("enabled", flag(data.enabled)),
                ("strategies", Value::Text(serde_json::to_string(&data.strategies)?)),
            ],
        )
    }

    /// Archiving also switches the toggle off.
    pub fn on_archived(&self, conn: &Connection, name: &FeatureName) -> Result<(), StoreError> {
        self.table
            .update(conn, name.as_str(), &[], &[("archived", flag(true)), ("enabled", flag(false))])
    }

    /// A revived toggle comes back disabled.
    pub fn on_revived(&self, conn: &Connection, name: &FeatureName) -> Result<(), StoreError> {
        self.table
            .update(conn, name.as_str(), &[], &[("archived", flag(false)), ("enabled", flag(false))])
    }
}

fn flag(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

#[async_trait]
impl EventHandler for FeatureToggleStore {
    fn name(&self) -> &str {
        "feature-store"
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), StoreError> {
        self.table.db().with_conn(|conn| self.apply(conn, event))
    }
}

impl Projection for FeatureToggleStore {
    fn subscriptions(&self) -> &'static [EventType] {
        SUBSCRIPTIONS
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<(), StoreError> {
        match &event.payload {
            EventPayload::FeatureCreated(data) => self.on_created(conn, data, &event.created_at),
            EventPayload::FeatureUpdated(data) => self.on_updated(conn, data),
            EventPayload::FeatureArchived(feature) => self.on_archived(conn, &feature.name),
            EventPayload::FeatureRevived(feature) => self.on_revived(conn, &feature.name),
            _ => Ok(()),
        }
    }

    fn reset(&self, conn: &Connection) -> Result<(), StoreError> {
        self.table.clear(conn).map(|_| ())
    }

    fn row_count(&self) -> Result<u64, StoreError> {
        self.table.count(&[])
    }
}
