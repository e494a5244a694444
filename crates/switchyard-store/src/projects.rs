use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, instrument};

use switchyard_core::events::ProjectData;
use switchyard_core::{EventPayload, EventType, ProjectId, StoredEvent};

use crate::database::Database;
use crate::dispatch::{DispatcherBuilder, EventHandler};
use crate::error::StoreError;
use crate::projection::{Filter, Projection, ProjectionSchema, ProjectionTable};
use crate::row_helpers::RowReader;

const SUBSCRIPTIONS: &[EventType] = &[
    EventType::ProjectCreated,
    EventType::ProjectUpdated,
    EventType::ProjectDeleted,
];

/// A project as callers see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// Storage shape of the `projects` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl ProjectRow {
    /// Row for a freshly created project. `created_at` is the creating
    /// event's timestamp, so a replay produces the same row.
    pub fn from_data(data: &ProjectData, created_at: &str) -> Self {
        Self {
            id: data.id.as_str().to_string(),
            name: data.name.clone(),
            description: data.description.clone(),
            created_at: created_at.to_string(),
        }
    }
}

/// `None` means no such project.
pub fn project_from_row(row: Option<ProjectRow>) -> Result<Project, StoreError> {
    let row = row.ok_or_else(|| StoreError::NotFound("no project found".into()))?;
    Ok(Project {
        id: ProjectId::from_raw(row.id),
        name: row.name,
        description: row.description,
        created_at: row.created_at,
    })
}

pub struct ProjectSchema;

impl ProjectionSchema for ProjectSchema {
    type Row = ProjectRow;
    type Entity = Project;

    const ENTITY: &'static str = "project";
    const TABLE: &'static str = "projects";
    const COLUMNS: &'static [&'static str] = &["id", "name", "description", "created_at"];
    const KEY: &'static str = "id";
    const ORDER_BY: &'static str = "name ASC, id ASC";

    fn read_row(row: &rusqlite::Row<'_>) -> Result<ProjectRow, StoreError> {
        let r = RowReader::new(row, Self::TABLE);
        Ok(ProjectRow {
            id: r.get(0, "id")?,
            name: r.get(1, "name")?,
            description: r.get(2, "description")?,
            created_at: r.get(3, "created_at")?,
        })
    }

    fn to_entity(row: Option<ProjectRow>) -> Result<Project, StoreError> {
        project_from_row(row)
    }
}

/// Rows still visible to clients. A deleted project keeps its row as a
/// tombstone so its id can never be projected again.
const LIVE: Filter<'static> = &[("deleted", Value::Integer(0))];

/// Projection of project events into the `projects` table.
pub struct ProjectStore {
    table: ProjectionTable<ProjectSchema>,
}

impl ProjectStore {
    pub fn new(db: Database) -> Self {
        Self {
            table: ProjectionTable::new(db),
        }
    }

    /// Create the store and subscribe it to project events.
    pub fn register(db: Database, dispatcher: &mut DispatcherBuilder) -> Arc<Self> {
        let store = Arc::new(Self::new(db));
        dispatcher.subscribe(Arc::clone(&store));
        store
    }

    /// All live projects, by name.
    #[instrument(skip(self))]
    pub fn get_all(&self) -> Result<Vec<Project>, StoreError> {
        self.table.list(LIVE)
    }

    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<Project, StoreError> {
        self.table.get(id.as_str(), LIVE)
    }

    pub fn exists(&self, id: &ProjectId) -> Result<bool, StoreError> {
        self.table.exists(id.as_str(), LIVE)
    }

    /// Whether `id` was ever projected, deleted or not.
    pub fn id_taken(&self, id: &ProjectId) -> Result<bool, StoreError> {
        self.table.exists(id.as_str(), &[])
    }

    /// A second create for a known id, tombstoned or not, is a `Conflict`.
    pub fn on_created(&self, conn: &Connection, data: &ProjectData, created_at: &str) -> Result<(), StoreError> {
        let row = ProjectRow::from_data(data, created_at);
        self.table.insert(
            conn,
            &[
                ("id", Value::Text(row.id)),
                ("name", Value::Text(row.name)),
                ("description", optional_text(row.description)),
                ("created_at", Value::Text(row.created_at)),
            ],
        )?;
        debug!(project_id = %data.id, "project projected");
        Ok(())
    }

    pub fn on_updated(&self, conn: &Connection, data: &ProjectData) -> Result<(), StoreError> {
        self.table.update(
            conn,
            data.id.as_str(),
            LIVE,
            &[
                ("name", Value::Text(data.name.clone())),
                ("description", optional_text(data.description.clone())),
            ],
        )
    }

    pub fn on_deleted(&self, conn: &Connection, id: &ProjectId) -> Result<(), StoreError> {
        self.table.update(conn, id.as_str(), LIVE, &[("deleted", Value::Integer(1))])
    }
}

fn optional_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

#[async_trait]
impl EventHandler for ProjectStore {
    fn name(&self) -> &str {
        "project-store"
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), StoreError> {
        self.table.db().with_conn(|conn| self.apply(conn, event))
    }
}

impl Projection for ProjectStore {
    fn subscriptions(&self) -> &'static [EventType] {
        SUBSCRIPTIONS
    }

    fn apply(&self, conn: &Connection, event: &StoredEvent) -> Result<(), StoreError> {
        match &event.payload {
            EventPayload::ProjectCreated(data) => self.on_created(conn, data, &event.created_at),
            EventPayload::ProjectUpdated(data) => self.on_updated(conn, data),
            EventPayload::ProjectDeleted(project) => self.on_deleted(conn, &project.id),
            _ => Ok(()),
        }
    }

    fn reset(&self, conn: &Connection) -> Result<(), StoreError> {
        self.table.clear(conn).map(|_| ())
    }

    fn row_count(&self) -> Result<u64, StoreError> {
        self.table.count(LIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::events::ProjectRef;
    use switchyard_core::NewEvent;

    use crate::dispatch::Dispatcher;
    use crate::event_log::EventLog;

    fn data(id: &str, name: &str, description: Option<&str>) -> ProjectData {
        ProjectData {
            id: ProjectId::from(id),
            name: name.into(),
            description: description.map(Into::into),
        }
    }

    fn created(id: &str, name: &str) -> NewEvent {
        NewEvent::new("admin", EventPayload::ProjectCreated(data(id, name, Some("d"))))
    }

    fn updated(id: &str, name: &str) -> NewEvent {
        NewEvent::new("admin", EventPayload::ProjectUpdated(data(id, name, None)))
    }

    fn deleted(id: &str) -> NewEvent {
        NewEvent::new("admin", EventPayload::ProjectDeleted(ProjectRef { id: ProjectId::from(id) }))
    }

    fn setup() -> (EventLog, Arc<ProjectStore>) {
        let db = Database::in_memory().unwrap();
        let mut builder = Dispatcher::builder();
        let store = ProjectStore::register(db.clone(), &mut builder);
        (EventLog::new(db, builder.build()), store)
    }

    #[test]
    fn row_mapping() {
        let row = ProjectRow::from_data(&data("p1", "Alpha", Some("d")), "2026-01-01T00:00:00+00:00");
        assert_eq!(row.id, "p1");
        let project = project_from_row(Some(row)).unwrap();
        assert_eq!(project.id.as_str(), "p1");
        assert_eq!(project.created_at, "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        assert!(matches!(project_from_row(None).unwrap_err(), StoreError::NotFound(_)));
    }

    #[test]
    fn entity_hides_storage_columns() {
        let project = project_from_row(Some(ProjectRow::from_data(&data("p1", "Alpha", None), "now"))).unwrap();
        let v = serde_json::to_value(&project).unwrap();
        assert_eq!(v["createdAt"], "now");
        assert!(v.get("created_at").is_none());
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (_, store) = setup();
        assert!(matches!(
            store.get(&ProjectId::from("ghost")).unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(!store.exists(&ProjectId::from("ghost")).unwrap());
    }

    #[tokio::test]
    async fn created_project_is_readable() {
        let (log, store) = setup();
        let stored = log.store(created("p1", "Alpha")).await.unwrap();

        let project = store.get(&ProjectId::from("p1")).unwrap();
        assert_eq!(project.id.as_str(), "p1");
        assert_eq!(project.name, "Alpha");
        assert_eq!(project.description.as_deref(), Some("d"));
        assert_eq!(project.created_at, stored.created_at);
    }

    #[tokio::test]
    async fn get_all_sorted_by_name() {
        let (log, store) = setup();
        log.store(created("b", "Beta")).await.unwrap();
        log.store(created("a", "Alpha")).await.unwrap();

        let names: Vec<String> = store.get_all().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn get_all_empty() {
        let (_, store) = setup();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_changes_name_and_description() {
        let (log, store) = setup();
        log.store(created("p1", "Alpha")).await.unwrap();
        log.store(updated("p1", "Alpha Prime")).await.unwrap();

        let project = store.get(&ProjectId::from("p1")).unwrap();
        assert_eq!(project.name, "Alpha Prime");
        assert_eq!(project.description, None);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found_and_double_delete_is_safe() {
        let (log, store) = setup();
        log.store(created("p1", "Alpha")).await.unwrap();
        log.store(deleted("p1")).await.unwrap();
        assert!(matches!(
            store.get(&ProjectId::from("p1")).unwrap_err(),
            StoreError::NotFound(_)
        ));

        assert!(!store.exists(&ProjectId::from("p1")).unwrap());
        assert!(store.id_taken(&ProjectId::from("p1")).unwrap());

        let second = log.store(deleted("p1")).await;
        assert!(second.is_ok());
        assert_eq!(log.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn deleted_id_stays_deleted() {
        let (log, store) = setup();
        let p1 = ProjectId::from("p1");
        log.store(created("p1", "Alpha")).await.unwrap();
        log.store(deleted("p1")).await.unwrap();
        log.store(created("p1", "Alpha again")).await.unwrap();
        log.store(updated("p1", "Alpha renamed")).await.unwrap();

        assert!(matches!(store.get(&p1).unwrap_err(), StoreError::NotFound(_)));
        assert!(store.get_all().unwrap().is_empty());
        assert_eq!(store.row_count().unwrap(), 0);

        let report = log.rebuild(store.as_ref()).await.unwrap();
        assert_eq!(report.failed, 2);
        assert!(matches!(store.get(&p1).unwrap_err(), StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn projection_failure_is_contained() {
        let (log, store) = setup();
        log.db()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER fail_boom BEFORE INSERT ON projects WHEN NEW.id = 'boom'
                     BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let stored = log.store(created("boom", "Boom")).await;
        assert!(stored.is_ok(), "projection failure leaked to the caller");
        assert!(store.get(&ProjectId::from("boom")).is_err());

        log.store(created("p2", "Next")).await.unwrap();
        assert_eq!(store.get(&ProjectId::from("p2")).unwrap().name, "Next");
        assert_eq!(log.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn replay_matches_live_projection() {
        let (log, store) = setup();
        for event in [
            created("a", "Alpha"),
            created("b", "Beta"),
            updated("a", "Alpha 2"),
            deleted("b"),
            created("c", "Gamma"),
            updated("c", "Gamma 2"),
            created("b", "Beta again"),
        ] {
            log.store(event).await.unwrap();
        }
        let live = store.get_all().unwrap();
        let names: Vec<&str> = live.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Alpha 2", "Gamma 2"]);

        let report = log.rebuild(store.as_ref()).await.unwrap();
        assert_eq!(report.projection, "project-store");
        assert_eq!(report.replayed, 6);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rows, 2);
        assert_eq!(store.get_all().unwrap(), live);
    }

    #[tokio::test]
    async fn rebuild_repairs_drift() {
        let (log, store) = setup();
        log.store(created("a", "Alpha")).await.unwrap();
        log.store(created("b", "Beta")).await.unwrap();
        log.db()
            .with_conn(|conn| Ok(conn.execute("DELETE FROM projects WHERE id = 'a'", [])?))
            .unwrap();
        assert_eq!(store.get_all().unwrap().len(), 1);

        log.rebuild(store.as_ref()).await.unwrap();
        assert_eq!(store.get_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_rows() {
        let (log, store) = setup();
        log.store(created("a", "Alpha")).await.unwrap();
        log.store(created("b", "Beta")).await.unwrap();
        log.db()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO events (type, created_by, entity_key, data, created_at)
                     VALUES ('project-created', 'admin', 'c', 'not json', 'now')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let err = log.rebuild(store.as_ref()).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { table: "events", .. }), "{err:?}");
        let names: Vec<String> = store.get_all().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["Alpha", "Beta"]);
    }
}
