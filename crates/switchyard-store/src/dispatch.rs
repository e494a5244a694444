//! In-process routing of stored events to the handlers subscribed to their type.
//!
//! The routing table is assembled once through [`DispatcherBuilder`] and frozen
//! by [`DispatcherBuilder::build`]; a [`Dispatcher`] is immutable afterwards,
//! so emitting needs no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, warn, Instrument};

use switchyard_core::{EventType, StoredEvent};
use switchyard_telemetry::MetricsRecorder;

use crate::error::StoreError;
use crate::projection::Projection;
use crate::retry::RetryPolicy;

/// Receives stored events from the dispatcher.
///
/// The `Result` of [`handle`](EventHandler::handle) goes to logs and metrics
/// only. It never reaches the caller that stored the event, and an `Err`
/// never undoes the append: the log stays authoritative and a rebuild repairs
/// whatever a handler missed. A handler may see the same event more than once
/// (retries, rebuilds), so it must tolerate re-delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and metric labels.
    fn name(&self) -> &str;

    async fn handle(&self, event: &StoredEvent) -> Result<(), StoreError>;
}

/// A handler that did not apply an event.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub error_kind: &'static str,
    pub message: String,
    pub attempts: u32,
}

/// Outcome of one `emit`. Informational: the event log logs it and moves on.
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
    retry: RetryPolicy,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `handler` for one event type. Handlers for the same type are
    /// kept in registration order.
    pub fn on(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.routes.entry(event_type).or_default().push(handler);
        self
    }

    /// Register a projection for every type it subscribes to.
    pub fn subscribe<P: Projection + 'static>(&mut self, projection: Arc<P>) -> &mut Self {
        for event_type in projection.subscriptions() {
            let handler: Arc<dyn EventHandler> = Arc::clone(&projection) as Arc<dyn EventHandler>;
            self.on(*event_type, handler);
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        for (event_type, handlers) in &self.routes {
            debug!(
                event_type = %event_type,
                handlers = handlers.len(),
                "subscription registered"
            );
        }
        Dispatcher {
            routes: self.routes,
            retry: self.retry,
            metrics: self.metrics,
        }
    }
}

pub struct Dispatcher {
    routes: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
    retry: RetryPolicy,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.routes.get(&event_type).map_or(0, Vec::len)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn metrics(&self) -> Option<&MetricsRecorder> {
        self.metrics.as_deref()
    }

    /// Deliver `event` to every handler registered for its type and wait for
    /// all of them. Each handler runs on its own task, so a slow, failing or
    /// panicking handler cannot affect the others.
    pub async fn emit(&self, event: &StoredEvent) -> DispatchReport {
        let event_type = event.event_type();
        let Some(handlers) = self.routes.get(&event_type) else {
            debug!(event_id = event.id, event_type = %event_type, "no handlers registered");
            return DispatchReport::default();
        };

        let shared = Arc::new(event.clone());
        let deliveries = handlers.iter().map(|handler| {
            let name = handler.name().to_string();
            let span = tracing::info_span!(
                "deliver",
                event_id = shared.id,
                event_type = %event_type,
                handler = %name
            );
            let task = tokio::spawn(
                deliver(Arc::clone(handler), Arc::clone(&shared), self.retry.clone()).instrument(span),
            );
            async move { (name, task.await) }
        });

        let mut report = DispatchReport::default();
        for (name, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(delivery) => {
                    self.record(&name, event_type, &delivery);
                    match delivery.result {
                        Ok(()) => report.delivered += 1,
                        Err(e) => {
                            log_failure(event, &name, &e, delivery.attempts);
                            report.failures.push(HandlerFailure {
                                handler: name,
                                error_kind: e.error_kind(),
                                message: e.to_string(),
                                attempts: delivery.attempts,
                            });
                        }
                    }
                }
                Err(join_err) => {
                    error!(
                        event_id = event.id,
                        event_type = %event_type,
                        handler = %name,
                        error = %join_err,
                        "projection handler aborted"
                    );
                    if let Some(metrics) = self.metrics() {
                        metrics.counter_inc(
                            "projection.failed",
                            &[("handler", &name), ("type", event_type.as_str()), ("kind", "panic")],
                            1,
                        );
                    }
                    report.failures.push(HandlerFailure {
                        handler: name,
                        error_kind: "panic",
                        message: join_err.to_string(),
                        attempts: 1,
                    });
                }
            }
        }
        report
    }

    fn record(&self, handler: &str, event_type: EventType, delivery: &Delivery) {
        let Some(metrics) = self.metrics() else {
            return;
        };
        let type_label = event_type.as_str();
        match &delivery.result {
            Ok(()) => metrics.counter_inc("projection.applied", &[("handler", handler), ("type", type_label)], 1),
            Err(e) => metrics.counter_inc(
                "projection.failed",
                &[("handler", handler), ("type", type_label), ("kind", e.error_kind())],
                1,
            ),
        }
        if delivery.attempts > 1 {
            metrics.counter_inc(
                "projection.retries",
                &[("handler", handler), ("type", type_label)],
                u64::from(delivery.attempts - 1),
            );
        }
        metrics.histogram_observe(
            "projection.apply_ms",
            &[("handler", handler)],
            delivery.elapsed.as_secs_f64() * 1000.0,
        );
    }
}

struct Delivery {
    attempts: u32,
    elapsed: Duration,
    result: Result<(), StoreError>,
}

async fn deliver(handler: Arc<dyn EventHandler>, event: Arc<StoredEvent>, retry: RetryPolicy) -> Delivery {
    let started = Instant::now();
    let mut attempt = 1;
    loop {
        match handler.handle(&event).await {
            Ok(()) => {
                return Delivery {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    result: Ok(()),
                }
            }
            Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                let delay = retry.delay_after(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient projection failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Delivery {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    result: Err(e),
                }
            }
        }
    }
}

fn log_failure(event: &StoredEvent, handler: &str, e: &StoreError, attempts: u32) {
    if e.is_skippable() {
        warn!(
            event_id = event.id,
            event_type = %event.event_type(),
            handler = %handler,
            kind = e.error_kind(),
            error = %e,
            "projection skipped event"
        );
    } else {
        error!(
            event_id = event.id,
            event_type = %event.event_type(),
            handler = %handler,
            kind = e.error_kind(),
            attempts,
            error = %e,
            "projection apply failed; projection is behind the log until rebuilt"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use switchyard_core::events::{ProjectData, ProjectRef};
    use switchyard_core::{EventPayload, ProjectId};

    /// Records the ids it sees; fails with `fail_with` for the first
    /// `failures` calls.
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<i64>>,
        calls: AtomicU32,
        failures: u32,
        fail_with: fn() -> StoreError,
    }

    impl Recorder {
        fn ok(name: &'static str) -> Arc<Self> {
            Self::failing(name, 0, || StoreError::Internal("unused".into()))
        }

        fn failing(name: &'static str, failures: u32, fail_with: fn() -> StoreError) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                failures,
                fail_with,
            })
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, event: &StoredEvent) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.fail_with)());
            }
            self.seen.lock().push(event.id);
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn handle(&self, _event: &StoredEvent) -> Result<(), StoreError> {
            panic!("handler bug");
        }
    }

    fn created(id: i64) -> StoredEvent {
        StoredEvent {
            id,
            created_by: "test".into(),
            created_at: "2026-01-01T00:00:00+00:00".into(),
            payload: EventPayload::ProjectCreated(ProjectData {
                id: ProjectId::from("p1"),
                name: "Alpha".into(),
                description: None,
            }),
        }
    }

    fn deleted(id: i64) -> StoredEvent {
        StoredEvent {
            payload: EventPayload::ProjectDeleted(ProjectRef { id: ProjectId::from("p1") }),
            ..created(id)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn routes_only_to_subscribed_type() {
        let on_created = Recorder::ok("created");
        let on_deleted = Recorder::ok("deleted");
        let mut builder = Dispatcher::builder();
        builder
            .on(EventType::ProjectCreated, on_created.clone())
            .on(EventType::ProjectDeleted, on_deleted.clone());
        let dispatcher = builder.build();

        let report = dispatcher.emit(&created(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(on_created.seen(), vec![1]);
        assert!(on_deleted.seen().is_empty());

        dispatcher.emit(&deleted(2)).await;
        assert_eq!(on_deleted.seen(), vec![2]);
    }

    #[tokio::test]
    async fn unrouted_type_is_a_no_op() {
        let dispatcher = Dispatcher::builder().build();
        let report = dispatcher.emit(&created(1)).await;
        assert_eq!(report.delivered, 0);
        assert!(report.is_clean());
        assert_eq!(dispatcher.handler_count(EventType::ProjectCreated), 0);
    }

    #[tokio::test]
    async fn two_handlers_each_receive_once_despite_failure() {
        let failing = Recorder::failing("failing", u32::MAX, || StoreError::Database("disk I/O".into()));
        let healthy = Recorder::ok("healthy");
        let mut builder = Dispatcher::builder().retry_policy(fast_retry());
        builder
            .on(EventType::ProjectCreated, failing.clone())
            .on(EventType::ProjectCreated, healthy.clone());
        let dispatcher = builder.build();

        let report = dispatcher.emit(&created(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler, "failing");
        assert_eq!(report.failures[0].attempts, 1);
        assert_eq!(healthy.seen(), vec![1]);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let flaky = Recorder::failing("flaky", 2, || StoreError::Busy("locked".into()));
        let metrics = Arc::new(MetricsRecorder::new());
        let mut builder = Dispatcher::builder()
            .retry_policy(fast_retry())
            .metrics(Arc::clone(&metrics));
        builder.on(EventType::ProjectCreated, flaky.clone());
        let dispatcher = builder.build();

        let report = dispatcher.emit(&created(1)).await;
        assert!(report.is_clean());
        assert_eq!(flaky.seen(), vec![1]);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            metrics.counter_get("projection.retries", &[("handler", "flaky"), ("type", "project-created")]),
            2
        );
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let stuck = Recorder::failing("stuck", u32::MAX, || StoreError::Busy("locked".into()));
        let mut builder = Dispatcher::builder().retry_policy(fast_retry());
        builder.on(EventType::ProjectCreated, stuck.clone());
        let dispatcher = builder.build();

        let report = dispatcher.emit(&created(1)).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(report.failures[0].error_kind, "busy");
        assert_eq!(stuck.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let healthy = Recorder::ok("healthy");
        let metrics = Arc::new(MetricsRecorder::new());
        let mut builder = Dispatcher::builder().metrics(Arc::clone(&metrics));
        builder
            .on(EventType::ProjectCreated, Arc::new(Panicker))
            .on(EventType::ProjectCreated, healthy.clone());
        let dispatcher = builder.build();

        let report = dispatcher.emit(&created(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures[0].error_kind, "panic");
        assert_eq!(healthy.seen(), vec![1]);
        assert_eq!(metrics.counter_total("projection.failed"), 1);
        assert_eq!(metrics.counter_total("projection.applied"), 1);
    }

    #[tokio::test]
    async fn handler_sees_events_in_emit_order() {
        let recorder = Recorder::ok("ordered");
        let mut builder = Dispatcher::builder();
        builder.on(EventType::ProjectCreated, recorder.clone());
        let dispatcher = builder.build();

        for id in 1..=20 {
            dispatcher.emit(&created(id)).await;
        }
        assert_eq!(recorder.seen(), (1..=20).collect::<Vec<_>>());
    }
}
