use std::sync::Arc;

use tracing::info;

use switchyard_telemetry::MetricsRecorder;

use crate::database::Database;
use crate::dispatch::Dispatcher;
use crate::error::StoreError;
use crate::event_log::{EventLog, RebuildReport};
use crate::features::FeatureToggleStore;
use crate::projects::ProjectStore;
use crate::retry::RetryPolicy;

/// The event log with every projection subscribed to it.
#[derive(Clone)]
pub struct Stores {
    pub events: EventLog,
    pub projects: Arc<ProjectStore>,
    pub features: Arc<FeatureToggleStore>,
}

impl Stores {
    pub fn open(db: Database, retry: RetryPolicy, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        let mut builder = Dispatcher::builder().retry_policy(retry);
        if let Some(metrics) = metrics {
            builder = builder.metrics(metrics);
        }
        let projects = ProjectStore::register(db.clone(), &mut builder);
        let features = FeatureToggleStore::register(db.clone(), &mut builder);
        let events = EventLog::new(db, builder.build());

        info!("stores ready");
        Self {
            events,
            projects,
            features,
        }
    }

    /// Replay the log into every projection.
    pub async fn rebuild_all(&self) -> Result<Vec<RebuildReport>, StoreError> {
        Ok(vec![
            self.events.rebuild(self.projects.as_ref()).await?,
            self.events.rebuild(self.features.as_ref()).await?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use switchyard_core::events::{FeatureData, ProjectData};
    use switchyard_core::{EventPayload, EventType, FeatureName, NewEvent, ProjectId, StoredEvent};

    use crate::dispatch::EventHandler;

    fn project(id: &str) -> NewEvent {
        NewEvent::new(
            "admin",
            EventPayload::ProjectCreated(ProjectData {
                id: ProjectId::from(id),
                name: id.into(),
                description: None,
            }),
        )
    }

    #[tokio::test]
    async fn events_reach_the_right_store() {
        let stores = Stores::open(Database::in_memory().unwrap(), RetryPolicy::default(), None);
        stores.events.store(project("p1")).await.unwrap();
        stores
            .events
            .store(NewEvent::new(
                "admin",
                EventPayload::FeatureCreated(FeatureData {
                    name: FeatureName::from("f1"),
                    description: None,
                    enabled: true,
                    strategies: vec![],
                }),
            ))
            .await
            .unwrap();

        assert_eq!(stores.projects.get_all().unwrap().len(), 1);
        assert_eq!(stores.features.get_features().unwrap().len(), 1);
        assert_eq!(stores.events.dispatcher().handler_count(EventType::ProjectCreated), 1);
        assert_eq!(stores.events.dispatcher().handler_count(EventType::FeatureRevived), 1);
    }

    #[tokio::test]
    async fn metrics_count_applied_events() {
        let metrics = Arc::new(MetricsRecorder::new());
        let stores = Stores::open(
            Database::in_memory().unwrap(),
            RetryPolicy::default(),
            Some(Arc::clone(&metrics)),
        );
        stores.events.store(project("p1")).await.unwrap();
        stores.events.store(project("p1")).await.unwrap();

        assert_eq!(
            metrics.counter_get("projection.applied", &[("handler", "project-store"), ("type", "project-created")]),
            1
        );
        assert_eq!(metrics.counter_total("projection.failed"), 1);
        assert_eq!(metrics.counter_total("events.appended"), 2);
    }

    /// Second subscriber on project events, alongside the project store.
    struct Counter(AtomicU32);

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&self, _event: &StoredEvent) -> Result<(), StoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database("always fails".into()))
        }
    }

    #[tokio::test]
    async fn two_stores_on_one_type_each_receive_once() {
        let db = Database::in_memory().unwrap();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        let mut builder = Dispatcher::builder();
        let projects = ProjectStore::register(db.clone(), &mut builder);
        builder.on(EventType::ProjectCreated, counter.clone());
        let log = EventLog::new(db, builder.build());

        log.store(project("p1")).await.unwrap();
        log.store(project("p2")).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(projects.get_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rebuild_all_reports_each_projection() {
        let stores = Stores::open(Database::in_memory().unwrap(), RetryPolicy::default(), None);
        stores.events.store(project("p1")).await.unwrap();
        let reports = stores.rebuild_all().await.unwrap();
        let names: Vec<&str> = reports.iter().map(|r| r.projection.as_str()).collect();
        assert_eq!(names, vec!["project-store", "feature-store"]);
        assert_eq!(reports[0].rows, 1);
        assert_eq!(reports[1].replayed, 0);
    }
}
