//! End-to-end batch scenarios against scripted backends.

use async_trait::async_trait;
use futures::StreamExt;
use meshforge_abstraction::{
    BackendError, BackendRequest, DisplayMeta, ErrorKind, GenerationBackend, GenerationOutput,
    ModelParamSchema, ParamMap, ProgressSink,
};
use meshforge_backends::{BackendRegistry, BackendSettings, MockBackend, MockBehavior};
use meshforge_orchestrator::{
    BatchItem, BatchOrchestrator, BatchState, BatchStatus, EngineConfig, InMemoryJobStore, JobStore,
    RetryConfig, SqliteJobStore, StoreResult, TaskState, TaskStatus,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn fast_config(max_concurrency: usize) -> EngineConfig {
    EngineConfig {
        max_concurrency,
        default_deadline_secs: 1,
        extended_deadline_secs: 5,
        retry: RetryConfig { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 5, multiplier: 2.0 },
        ..EngineConfig::default()
    }
}

fn orchestrator_with(mock: &Arc<MockBackend>, max_concurrency: usize) -> BatchOrchestrator {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::clone(mock) as Arc<dyn GenerationBackend>);
    BatchOrchestrator::new(registry, Arc::new(InMemoryJobStore::new()), &fast_config(max_concurrency))
}

fn items(n: usize) -> Vec<BatchItem> {
    (0..n).map(|i| BatchItem::new(format!("item-{}", i), format!("https://img.example/{}.png", i))).collect()
}

fn params(value: Value) -> ParamMap {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_three_ok_two_malformed_is_partially_completed() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_source(
                "https://img.example/3.png",
                MockBehavior::Respond(json!({"status": "succeeded", "output": {"model_file": ""}})),
            )
            .with_source("https://img.example/4.png", MockBehavior::Respond(json!({"output": null}))),
    );
    let orchestrator = orchestrator_with(&mock, 4);

    let report = orchestrator.run_batch("mock", items(5), ParamMap::new()).await.unwrap();

    assert_eq!(report.status, BatchStatus::PartiallyCompleted);
    assert_eq!(report.files.len(), 5);
    for file in &report.files[0..3] {
        assert_eq!(file.status, TaskStatus::Completed);
        assert!(file.download_url.as_deref().unwrap().ends_with(".glb"));
    }
    let error = report.files[3].error.as_ref().unwrap();
    assert_eq!(report.files[3].status, TaskStatus::Failed);
    assert_eq!(error.kind, ErrorKind::MalformedResponse);
    assert!(error.diagnostic.is_some());
    assert_eq!(report.files[4].error.as_ref().unwrap().kind, ErrorKind::MalformedResponse);

    // Malformed responses are never retried.
    assert_eq!(mock.calls_for("https://img.example/3.png"), 1);
    assert_eq!(orchestrator.report(&report.job_id).await.unwrap(), report);
}

/// In-memory store that counts writes.
#[derive(Default)]
struct CountingStore {
    inner: InMemoryJobStore,
    writes: AtomicUsize,
}

#[async_trait]
impl JobStore for CountingStore {
    async fn put_task(&self, task: &TaskState) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
        self.inner.get_task(task_id).await
    }

    async fn put_batch(&self, batch: &BatchState) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_batch(batch).await
    }

    async fn get_batch(&self, job_id: &str) -> StoreResult<Option<BatchState>> {
        self.inner.get_batch(job_id).await
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<TaskState>> {
        self.inner.list_tasks(job_id).await
    }
}

fn provider_orchestrator(store: &Arc<CountingStore>) -> BatchOrchestrator {
    BatchOrchestrator::new(
        BackendRegistry::from_settings(&BackendSettings::default()),
        Arc::clone(store) as Arc<dyn JobStore>,
        &fast_config(2),
    )
}

#[tokio::test]
async fn test_unknown_model_lists_registered_types() {
    let store = Arc::new(CountingStore::default());
    let orchestrator = provider_orchestrator(&store);

    let err = orchestrator.submit_batch("unknown-model", items(2), ParamMap::new()).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::UnsupportedModel));
    let message = err.to_string();
    assert!(message.contains("trellis"));
    assert!(message.contains("hunyuan3d"));

    let err = orchestrator.model_params("unknown-model").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedModel);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_out_of_range_param_rejected_before_any_task() {
    let store = Arc::new(CountingStore::default());
    let orchestrator = provider_orchestrator(&store);

    let err = orchestrator
        .submit_batch("trellis", items(3), params(json!({"ssGuidanceStrength": 15})))
        .await
        .unwrap_err();

    match err {
        meshforge_orchestrator::OrchestratorError::Backend(BackendError::Validation(v)) => {
            assert_eq!(v.field, "ssGuidanceStrength");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_string_face_limit_is_not_coerced() {
    let mock = Arc::new(MockBackend::new("mock"));
    let orchestrator = orchestrator_with(&mock, 2);

    let err = orchestrator
        .submit_batch("mock", items(1), params(json!({"faceLimit": "1000"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn test_unknown_params_are_ignored() {
    let mock = Arc::new(MockBackend::new("mock"));
    let orchestrator = orchestrator_with(&mock, 2);

    let report = orchestrator
        .run_batch("mock", items(1), params(json!({"notAParam": [1, 2, 3]})))
        .await
        .unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_always_rate_limited_exhausts_attempts() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_default(MockBehavior::Fail(BackendError::RateLimited("429".to_string()))),
    );
    let orchestrator = orchestrator_with(&mock, 2);

    let report = orchestrator.run_batch("mock", items(1), ParamMap::new()).await.unwrap();

    assert_eq!(report.status, BatchStatus::Failed);
    assert_eq!(report.files[0].status, TaskStatus::Failed);
    assert_eq!(report.files[0].error.as_ref().unwrap().kind, ErrorKind::RateLimited);
    assert_eq!(mock.calls_for("https://img.example/0.png"), 3);
}

#[tokio::test]
async fn test_single_item_batches_follow_the_same_rule() {
    let ok = Arc::new(MockBackend::new("mock"));
    let report = orchestrator_with(&ok, 1).run_batch("mock", items(1), ParamMap::new()).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);

    let broken = Arc::new(
        MockBackend::new("mock").with_default(MockBehavior::Fail(BackendError::Permanent("400".into()))),
    );
    let report = orchestrator_with(&broken, 1).run_batch("mock", items(1), ParamMap::new()).await.unwrap();
    assert_eq!(report.status, BatchStatus::Failed);
    assert_eq!(broken.total_calls(), 1);
}

#[tokio::test]
async fn test_sibling_failure_does_not_cancel_others() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_default(MockBehavior::SucceedAfter(Duration::from_millis(30)))
            .with_source("https://img.example/0.png", MockBehavior::Fail(BackendError::Auth("bad key".into()))),
    );
    let orchestrator = orchestrator_with(&mock, 4);

    let report = orchestrator.run_batch("mock", items(4), ParamMap::new()).await.unwrap();
    assert_eq!(report.status, BatchStatus::PartiallyCompleted);
    assert_eq!(report.files[0].error.as_ref().unwrap().kind, ErrorKind::Auth);
    assert!(report.files[1..].iter().all(|f| f.status == TaskStatus::Completed));
}

#[tokio::test]
async fn test_deadline_expiry_is_timed_out() {
    let mock = Arc::new(MockBackend::new("mock").with_source("https://img.example/1.png", MockBehavior::Hang));
    let orchestrator = orchestrator_with(&mock, 2);

    let report = orchestrator.run_batch("mock", items(2), ParamMap::new()).await.unwrap();

    assert_eq!(report.status, BatchStatus::PartiallyCompleted);
    assert_eq!(report.files[1].status, TaskStatus::TimedOut);
    assert_eq!(report.files[1].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(mock.calls_for("https://img.example/1.png"), 1);
}

#[tokio::test]
async fn test_estimated_seconds_scales_with_waves() {
    let mock = Arc::new(MockBackend::new("mock"));
    let orchestrator = orchestrator_with(&mock, 2);

    let ticket = orchestrator.submit_batch("mock", items(5), ParamMap::new()).await.unwrap();
    assert_eq!(ticket.estimated_seconds, 3);
    assert_eq!(ticket.task_ids.len(), 5);
    orchestrator.wait(&ticket.job_id).await.unwrap();
}

#[tokio::test]
async fn test_empty_and_duplicate_items_rejected() {
    let mock = Arc::new(MockBackend::new("mock"));
    let orchestrator = orchestrator_with(&mock, 2);

    let err = orchestrator.submit_batch("mock", Vec::new(), ParamMap::new()).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));

    let dupes = vec![BatchItem::new("a", "https://img.example/a.png"), BatchItem::new("a", "https://img.example/b.png")];
    let err = orchestrator.submit_batch("mock", dupes, ParamMap::new()).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn test_cancel_stops_tasks_not_yet_started() {
    let mock = Arc::new(MockBackend::new("mock").with_default(MockBehavior::SucceedAfter(Duration::from_millis(200))));
    let orchestrator = orchestrator_with(&mock, 1);

    let mut firehose = orchestrator.publisher().subscribe_all_stream();
    let ticket = orchestrator.submit_batch("mock", items(3), ParamMap::new()).await.unwrap();

    // Wait until one task holds the only pool slot.
    let running = loop {
        let event = firehose.next().await.unwrap();
        if event.status == TaskStatus::Processing {
            break event.task_id;
        }
    };

    assert!(orchestrator.cancel(&ticket.job_id).await.unwrap());
    let report = orchestrator.wait(&ticket.job_id).await.unwrap();

    assert_eq!(report.status, BatchStatus::PartiallyCompleted);
    let index = ticket.task_ids.iter().position(|id| *id == running).unwrap();
    for (i, file) in report.files.iter().enumerate() {
        if i == index {
            assert_eq!(file.status, TaskStatus::Completed);
        } else {
            assert_eq!(file.status, TaskStatus::Failed);
            assert_eq!(file.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        }
    }
    assert_eq!(mock.total_calls(), 1);
    assert!(!orchestrator.cancel(&ticket.job_id).await.unwrap());
}

#[tokio::test]
async fn test_progress_stream_ends_with_result() {
    let mock = Arc::new(MockBackend::new("mock").with_default(MockBehavior::SucceedAfter(Duration::from_millis(20))));
    let orchestrator = orchestrator_with(&mock, 1);

    let ticket = orchestrator.submit_batch("mock", items(1), ParamMap::new()).await.unwrap();
    let events: Vec<_> = orchestrator.publisher().subscribe(&ticket.task_ids[0]).collect().await;

    let last = events.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.percent, 100);
    assert!(last.result_ref.is_some());
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));

    orchestrator.wait(&ticket.job_id).await.unwrap();
}

#[tokio::test]
async fn test_each_subscriber_starts_from_latest_event() {
    let mock = Arc::new(MockBackend::new("mock").with_default(MockBehavior::SucceedAfter(Duration::from_millis(200))));
    let orchestrator = orchestrator_with(&mock, 1);
    let publisher = orchestrator.publisher();

    let ticket = orchestrator.submit_batch("mock", items(1), ParamMap::new()).await.unwrap();
    let task_id = &ticket.task_ids[0];

    let mut early = publisher.subscribe(task_id);
    loop {
        if early.next().await.unwrap().status == TaskStatus::Processing {
            break;
        }
    }

    let live = orchestrator.report(&ticket.job_id).await.unwrap();
    assert_eq!(live.status, BatchStatus::Processing);

    // Joins mid-flight: no replay of queued/uploading.
    let mut late = publisher.subscribe(task_id);
    let opening = late.next().await.unwrap();
    assert_eq!(opening.status, TaskStatus::Processing);
    assert_eq!(opening.percent, 55);

    let (early_rest, late_rest) = tokio::join!(early.collect::<Vec<_>>(), late.collect::<Vec<_>>());
    for events in [&early_rest, &late_rest] {
        let last = events.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed);
        assert!(last.result_ref.is_some());
        assert!(events.iter().all(|e| e.percent >= 55));
    }

    orchestrator.wait(&ticket.job_id).await.unwrap();
}

/// Backend whose result parsing panics.
struct PanickingBackend {
    meta: DisplayMeta,
    schema: ModelParamSchema,
}

#[async_trait]
impl GenerationBackend for PanickingBackend {
    fn model_type(&self) -> &str {
        "panicky"
    }

    fn display_meta(&self) -> &DisplayMeta {
        &self.meta
    }

    fn param_schema(&self) -> &ModelParamSchema {
        &self.schema
    }

    fn build_request(&self, source_url: &str, _params: &ParamMap) -> Result<BackendRequest, BackendError> {
        Ok(BackendRequest { model_type: "panicky".to_string(), payload: json!({ "image": source_url }) })
    }

    async fn submit(&self, _request: &BackendRequest, progress: &dyn ProgressSink) -> Result<Value, BackendError> {
        progress.report(60, "almost there");
        Ok(json!({}))
    }

    fn interpret_result(&self, _raw: &Value) -> Result<GenerationOutput, BackendError> {
        panic!("unexpected result layout")
    }
}

#[tokio::test]
async fn test_panicking_backend_still_ends_progress_stream() {
    let backend = Arc::new(PanickingBackend {
        meta: DisplayMeta {
            display_name: "Panicky".to_string(),
            description: "Panics while reading results".to_string(),
            estimated_seconds: 1,
        },
        schema: ModelParamSchema::new(Vec::new()),
    });
    let mut registry = BackendRegistry::new();
    registry.register(backend as Arc<dyn GenerationBackend>);
    let orchestrator = BatchOrchestrator::new(registry, Arc::new(InMemoryJobStore::new()), &fast_config(1));

    let ticket = orchestrator.submit_batch("panicky", items(1), ParamMap::new()).await.unwrap();
    let stream = orchestrator.publisher().subscribe(&ticket.task_ids[0]);
    let events = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>()).await.unwrap();

    let last = events.last().unwrap();
    assert_eq!(last.status, TaskStatus::Failed);
    assert!(last.percent >= 63);

    let report = orchestrator.wait(&ticket.job_id).await.unwrap();
    assert_eq!(report.status, BatchStatus::Failed);
    let error = report.files[0].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.message.contains("unexpected result layout"));

    let stored = orchestrator.store().get_task(&ticket.task_ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempt, 1);
}

#[tokio::test]
async fn test_sqlite_store_keeps_results() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let mock = Arc::new(
        MockBackend::new("mock")
            .with_source("https://img.example/1.png", MockBehavior::Fail(BackendError::Permanent("bad image".into()))),
    );
    let mut registry = BackendRegistry::new();
    registry.register(Arc::clone(&mock) as Arc<dyn GenerationBackend>);
    let store = Arc::new(SqliteJobStore::open(&path).unwrap());
    let orchestrator = BatchOrchestrator::new(registry, store, &fast_config(2));

    let report = orchestrator.run_batch("mock", items(2), ParamMap::new()).await.unwrap();
    assert_eq!(report.status, BatchStatus::PartiallyCompleted);

    let reopened = SqliteJobStore::open(&path).unwrap();
    let batch = reopened.get_batch(&report.job_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    assert!(batch.completed_at.is_some());
    let tasks = reopened.list_tasks(&report.job_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[1].error.as_ref().unwrap().kind, ErrorKind::Permanent);
}

/// Backend that records how many submissions overlap.
struct GaugeBackend {
    meta: DisplayMeta,
    schema: ModelParamSchema,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl GenerationBackend for GaugeBackend {
    fn model_type(&self) -> &str {
        "gauge"
    }

    fn display_meta(&self) -> &DisplayMeta {
        &self.meta
    }

    fn param_schema(&self) -> &ModelParamSchema {
        &self.schema
    }

    fn build_request(&self, source_url: &str, _params: &ParamMap) -> Result<BackendRequest, BackendError> {
        Ok(BackendRequest { model_type: "gauge".to_string(), payload: json!({ "image": source_url }) })
    }

    async fn submit(&self, _request: &BackendRequest, _progress: &dyn ProgressSink) -> Result<Value, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "url": "https://cdn.example/out.glb" }))
    }

    fn interpret_result(&self, raw: &Value) -> Result<GenerationOutput, BackendError> {
        let url = raw
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::malformed("no url", raw))?;
        Ok(GenerationOutput { download_url: url.to_string(), preview_url: None, size_bytes: None })
    }
}

#[tokio::test]
async fn test_pool_bounds_concurrent_submissions() {
    let gauge = Arc::new(GaugeBackend {
        meta: DisplayMeta {
            display_name: "Gauge".to_string(),
            description: "Counts overlapping submissions".to_string(),
            estimated_seconds: 1,
        },
        schema: ModelParamSchema::new(Vec::new()),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut registry = BackendRegistry::new();
    registry.register(Arc::clone(&gauge) as Arc<dyn GenerationBackend>);
    let orchestrator = BatchOrchestrator::new(registry, Arc::new(InMemoryJobStore::new()), &fast_config(3));

    let report = orchestrator.run_batch("gauge", items(10), ParamMap::new()).await.unwrap();

    assert_eq!(report.status, BatchStatus::Completed);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
}
