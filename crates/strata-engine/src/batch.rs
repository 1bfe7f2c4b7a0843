//! Ordered groups of mutations, applied all-or-nothing or lane by lane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use strata_core::{
    BatchFailure, BatchId, Change, ChangeEvent, ChangeEventType, ContextError, ContextKey, DeleteRequest,
    Lineage, Payload, Principal, PutRequest, Result, StagedWrite,
};

use crate::write::WritePath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Create,
    Update,
    /// Create when absent, update against the current version when present.
    Upsert,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchOperation {
    pub action: BatchAction,
    #[serde(flatten)]
    pub key: ContextKey,
    #[serde(default)]
    pub payload: Payload,
    /// For updates. When absent the current version is used.
    #[serde(default)]
    pub expected_version: Option<u64>,
    /// Parent id for creates.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Ids further up, used when a missing parent is auto-created.
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default)]
    pub cascade: bool,
}

impl BatchOperation {
    pub fn create(key: ContextKey, parent_id: Option<&str>, payload: Payload) -> Self {
        Self {
            action: BatchAction::Create,
            key,
            payload,
            expected_version: None,
            parent_id: parent_id.map(String::from),
            lineage: Lineage::default(),
            cascade: false,
        }
    }

    pub fn update(key: ContextKey, payload: Payload, expected_version: Option<u64>) -> Self {
        Self {
            action: BatchAction::Update,
            key,
            payload,
            expected_version,
            parent_id: None,
            lineage: Lineage::default(),
            cascade: false,
        }
    }

    pub fn upsert(key: ContextKey, parent_id: Option<&str>, payload: Payload) -> Self {
        Self {
            action: BatchAction::Upsert,
            parent_id: parent_id.map(String::from),
            ..Self::create(key, None, payload)
        }
    }

    pub fn delete(key: ContextKey, cascade: bool) -> Self {
        Self {
            action: BatchAction::Delete,
            key,
            payload: Payload::new(),
            expected_version: None,
            parent_id: None,
            lineage: Lineage::default(),
            cascade,
        }
    }

    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = lineage;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub auto_create_ancestors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    pub author: Principal,
}

impl BatchRequest {
    pub fn new(operations: Vec<BatchOperation>, author: Principal) -> Self {
        Self {
            operations,
            transactional: false,
            parallel: false,
            stop_on_error: false,
            auto_create_ancestors: false,
            deadline_ms: None,
            author,
        }
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn stop_on_error(mut self) -> Self {
        self.stop_on_error = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Committed,
    RolledBack,
    PartialFailed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied { version: u64 },
    Failed { kind: String, message: String },
    /// Still running when the deadline passed. The write may have committed;
    /// read the key before retrying.
    Abandoned,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub index: usize,
    pub key: ContextKey,
    #[serde(flatten)]
    pub outcome: OperationOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub id: BatchId,
    pub state: BatchState,
    pub results: Vec<OperationResult>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    fn new(id: BatchId, ops: &[BatchOperation]) -> Self {
        Self {
            id,
            state: BatchState::Pending,
            results: ops
                .iter()
                .enumerate()
                .map(|(index, op)| OperationResult {
                    index,
                    key: op.key.clone(),
                    outcome: OperationOutcome::Skipped,
                })
                .collect(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, index: usize, error: &ContextError) {
        let key = self.results[index].key.clone();
        self.results[index].outcome = OperationOutcome::Failed {
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        self.failures.push(BatchFailure {
            index,
            key,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    /// `BatchPartialFailure` for a batch that did not fully commit.
    pub fn error(&self) -> Option<ContextError> {
        (!self.failures.is_empty()).then(|| ContextError::BatchPartialFailure {
            failures: self.failures.clone(),
        })
    }
}

fn create_request(op: &BatchOperation, req: &BatchRequest) -> PutRequest {
    let put = PutRequest::create(op.key.clone(), op.payload.clone(), req.author.clone())
        .with_lineage(op.lineage.clone())
        .auto_create(req.auto_create_ancestors);
    match &op.parent_id {
        Some(parent) => put.under(parent.clone()),
        None => put,
    }
}

/// Turn one operation into a concrete write, given the key's current version
/// (`None` when absent).
fn plan(op: &BatchOperation, current: Option<u64>, req: &BatchRequest) -> Result<StagedWrite> {
    let write = match (op.action, current) {
        (BatchAction::Create, _) | (BatchAction::Upsert, None) => StagedWrite::Put(create_request(op, req)),
        (BatchAction::Upsert, Some(version)) => StagedWrite::Put(PutRequest::update(
            op.key.clone(),
            op.payload.clone(),
            version,
            req.author.clone(),
        )),
        (BatchAction::Update, current) => {
            let Some(expected) = op.expected_version.or(current) else {
                return Err(ContextError::NotFound { key: op.key.clone() });
            };
            StagedWrite::Put(PutRequest::update(
                op.key.clone(),
                op.payload.clone(),
                expected,
                req.author.clone(),
            ))
        }
        (BatchAction::Delete, _) => StagedWrite::Delete(
            DeleteRequest::new(op.key.clone(), req.author.clone()).cascade(op.cascade),
        ),
    };
    Ok(write)
}

fn current_version(writes: &WritePath, key: &ContextKey) -> Result<Option<u64>> {
    match writes.store().get(key) {
        Ok(ctx) => Ok(Some(ctx.version)),
        Err(ContextError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Apply one planned write through the full write path.
fn apply(writes: &WritePath, write: &StagedWrite) -> Result<Vec<Change>> {
    match write {
        StagedWrite::Put(req) => writes.put(req),
        StagedWrite::Delete(req) => writes.delete(req),
    }
}

pub struct BatchExecutor {
    writes: Arc<WritePath>,
    max_parallelism: usize,
    default_deadline: Option<Duration>,
}

impl BatchExecutor {
    pub fn new(writes: Arc<WritePath>, max_parallelism: usize, default_deadline: Option<Duration>) -> Self {
        Self {
            writes,
            max_parallelism: max_parallelism.max(1),
            default_deadline,
        }
    }

    /// Run a batch. Transactional failures are returned as errors after
    /// rollback; non-transactional failures are listed in the report.
    #[instrument(skip(self, req), fields(ops = req.operations.len(), transactional = req.transactional, parallel = req.parallel))]
    pub async fn execute(&self, req: BatchRequest) -> Result<BatchReport> {
        let deadline = req
            .deadline_ms
            .map(Duration::from_millis)
            .or(self.default_deadline)
            .map(|d| Instant::now() + d);
        let mut report = BatchReport::new(BatchId::new(), &req.operations);
        if req.operations.is_empty() {
            report.state = BatchState::Committed;
            return Ok(report);
        }

        report.state = BatchState::Running;
        if req.transactional {
            self.run_transactional(req, deadline, report).await
        } else {
            Ok(self.run_lanes(req, deadline, report).await)
        }
    }

    async fn run_transactional(
        &self,
        req: BatchRequest,
        deadline: Option<Instant>,
        mut report: BatchReport,
    ) -> Result<BatchReport> {
        let writes = Arc::clone(&self.writes);
        let req = Arc::new(req);
        let staged_req = Arc::clone(&req);

        let outcome = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<Vec<Change>>, (Option<usize>, ContextError)> {
            // Versions as they will stand after the writes staged so far.
            let mut staged: HashMap<ContextKey, Option<u64>> = HashMap::new();
            let mut plan_all = Vec::with_capacity(staged_req.operations.len());
            for (index, op) in staged_req.operations.iter().enumerate() {
                let current = match staged.get(&op.key) {
                    Some(v) => *v,
                    None => current_version(&writes, &op.key).map_err(|e| (Some(index), e))?,
                };
                let write = plan(op, current, &staged_req).map_err(|e| (Some(index), e))?;
                if let StagedWrite::Put(put) = &write {
                    writes.validate(put).map_err(|e| (Some(index), e))?;
                    staged.insert(op.key.clone(), Some(put.expected_version + 1));
                } else {
                    staged.insert(op.key.clone(), None);
                }
                plan_all.push(write);
            }
            let committed = writes
                .store()
                .apply_transaction(&plan_all, deadline)
                .map_err(|e| (e.index, e.error))?;
            for changes in &committed {
                writes.commit(changes);
            }
            Ok(committed)
        })
        .await
        .map_err(|e| ContextError::Storage(format!("batch task failed: {e}")))?;

        match outcome {
            Ok(committed) => {
                let mut lineage: Option<Lineage> = None;
                let mut keys = Vec::with_capacity(committed.len());
                for (index, changes) in committed.iter().enumerate() {
                    if let Some(target) = changes.last() {
                        report.results[index].outcome = OperationOutcome::Applied {
                            version: target.context.version,
                        };
                        keys.push(target.context.key.to_string());
                        lineage = Some(match lineage {
                            None => target.lineage.clone(),
                            Some(l) => l.common_prefix(&target.lineage),
                        });
                    }
                }
                let lineage = lineage.unwrap_or_default();
                let event = ChangeEvent::new(
                    ChangeEventType::BatchUpdated,
                    lineage.leaf_key(),
                    lineage,
                    req.author.clone(),
                    json!({ "batch_id": report.id, "operations": committed.len(), "keys": keys }),
                );
                self.writes.publish(&event);
                report.state = BatchState::Committed;
                info!(batch = %report.id, ops = committed.len(), "transactional batch committed");
                Ok(report)
            }
            Err((index, error)) => {
                report.state = BatchState::RolledBack;
                warn!(batch = %report.id, index, error = %error, "transactional batch rolled back");
                let Some(index) = index else {
                    return Err(error);
                };
                match error {
                    ContextError::Validation { key, reason } => Err(ContextError::Validation {
                        key,
                        reason: format!("operation {index}: {reason}"),
                    }),
                    other => {
                        report.fail(index, &other);
                        Err(ContextError::BatchPartialFailure {
                            failures: report.failures,
                        })
                    }
                }
            }
        }
    }

    /// Non-transactional execution. Operations on the same key share a lane
    /// and run in order; lanes run concurrently when `parallel` is set.
    async fn run_lanes(&self, req: BatchRequest, deadline: Option<Instant>, report: BatchReport) -> BatchReport {
        let lanes: Vec<Vec<usize>> = if req.parallel {
            let mut by_key: HashMap<&ContextKey, usize> = HashMap::new();
            let mut lanes: Vec<Vec<usize>> = Vec::new();
            for (index, op) in req.operations.iter().enumerate() {
                let lane = *by_key.entry(&op.key).or_insert_with(|| {
                    lanes.push(Vec::new());
                    lanes.len() - 1
                });
                lanes[lane].push(index);
            }
            lanes
        } else {
            vec![(0..req.operations.len()).collect()]
        };

        let req = Arc::new(req);
        let report = Arc::new(Mutex::new(report));
        let cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.max_parallelism));
        let mut set = JoinSet::new();

        for lane in lanes {
            let writes = Arc::clone(&self.writes);
            let req = Arc::clone(&req);
            let report = Arc::clone(&report);
            let cancel = cancel.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else { return };
                for index in lane {
                    if cancel.is_cancelled() {
                        return;
                    }
                    report.lock().results[index].outcome = OperationOutcome::Abandoned;
                    let job_writes = Arc::clone(&writes);
                    let job_req = Arc::clone(&req);
                    let result = tokio::task::spawn_blocking(move || {
                        let op = &job_req.operations[index];
                        let current = current_version(&job_writes, &op.key)?;
                        let write = plan(op, current, &job_req)?;
                        apply(&job_writes, &write)
                    })
                    .await
                    .unwrap_or_else(|e| Err(ContextError::Storage(format!("batch task failed: {e}"))));

                    let mut guard = report.lock();
                    match result {
                        Ok(changes) => {
                            let version = changes.last().map(|c| c.context.version).unwrap_or_default();
                            guard.results[index].outcome = OperationOutcome::Applied { version };
                        }
                        Err(error) => {
                            guard.fail(index, &error);
                            if req.stop_on_error {
                                cancel.cancel();
                            }
                        }
                    }
                    drop(guard);
                }
            });
        }

        let drain = async { while set.join_next().await.is_some() {} };
        let timed_out = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), drain).await.is_err(),
            None => {
                drain.await;
                false
            }
        };
        if timed_out {
            cancel.cancel();
            set.abort_all();
        }

        let mut report = report.lock().clone();
        if timed_out {
            let pending: Vec<usize> = report
                .results
                .iter()
                .filter(|r| r.outcome == OperationOutcome::Skipped)
                .map(|r| r.index)
                .collect();
            for index in pending {
                report.fail(index, &ContextError::DeadlineExceeded);
            }
        }
        report.failures.sort_by_key(|f| f.index);
        let abandoned = report
            .results
            .iter()
            .filter(|r| r.outcome == OperationOutcome::Abandoned)
            .count();
        if abandoned > 0 {
            warn!(batch = %report.id, abandoned, "deadline passed with writes in flight");
        }
        report.state = if report.failures.is_empty() && abandoned == 0 {
            BatchState::Committed
        } else {
            BatchState::PartialFailed
        };
        info!(batch = %report.id, state = ?report.state, failures = report.failures.len(), "batch finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::settings::{CacheSettings, ValidationSettings};
    use strata_core::{ContextStore, Level};
    use strata_store::{Database, SqliteContextStore};

    use crate::cache::{CacheLayer, MemoryCacheBackend};
    use crate::notify::{EventFilter, NotificationPublisher, SubscriptionScope};
    use crate::resolver::Resolver;
    use crate::testing::CountingStore;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn alice() -> Principal {
        Principal::new("alice")
    }

    fn executor_over(store: Arc<dyn ContextStore>) -> (Arc<WritePath>, BatchExecutor) {
        let cache = Arc::new(CacheLayer::new(
            Arc::clone(&store),
            Resolver::default(),
            Arc::new(MemoryCacheBackend::new()),
            CacheSettings::default(),
        ));
        let publisher = Arc::new(NotificationPublisher::new(64));
        let writes = Arc::new(WritePath::new(store, cache, publisher, ValidationSettings::default()));
        (Arc::clone(&writes), BatchExecutor::new(writes, 4, None))
    }

    fn seed(store: &dyn ContextStore) {
        store
            .put(&PutRequest::create(ContextKey::global(), Payload::new(), alice()))
            .unwrap();
        store
            .put(&PutRequest::create(ContextKey::project("p1"), Payload::new(), alice()))
            .unwrap();
        store
            .put(&PutRequest::create(ContextKey::branch("b1"), Payload::new(), alice()).under("p1"))
            .unwrap();
    }

    fn setup() -> (Arc<WritePath>, BatchExecutor) {
        let store: Arc<dyn ContextStore> = Arc::new(SqliteContextStore::new(Database::in_memory().unwrap()));
        seed(store.as_ref());
        executor_over(store)
    }

    fn task(id: &str, title: Option<&str>) -> BatchOperation {
        let body = match title {
            Some(t) => json!({ "title": t }),
            None => json!({ "notes": "no title" }),
        };
        BatchOperation::create(ContextKey::task(id), Some("b1"), payload(body))
    }

    #[tokio::test]
    async fn transactional_batch_commits_and_emits_aggregate() {
        let (writes, executor) = setup();
        let mut sub = writes
            .publisher()
            .subscribe(SubscriptionScope::Branch, "b1", EventFilter::default())
            .unwrap();

        let report = executor
            .execute(BatchRequest::new(vec![task("t1", Some("a")), task("t2", Some("b"))], alice()).transactional())
            .await
            .unwrap();
        assert_eq!(report.state, BatchState::Committed);
        assert!(report
            .results
            .iter()
            .all(|r| r.outcome == OperationOutcome::Applied { version: 1 }));

        let mut types = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(
            types,
            vec![ChangeEventType::Created, ChangeEventType::Created, ChangeEventType::BatchUpdated]
        );
    }

    #[tokio::test]
    async fn transactional_validation_failure_commits_nothing() {
        let (writes, executor) = setup();
        let err = executor
            .execute(BatchRequest::new(vec![task("t1", Some("ok")), task("t2", None)], alice()).transactional())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("operation 1"));
        assert!(writes.store().get(&ContextKey::task("t1")).is_err());
    }

    #[tokio::test]
    async fn transactional_conflict_is_partial_failure() {
        let (writes, executor) = setup();
        let ops = vec![
            task("t1", Some("ok")),
            BatchOperation::update(ContextKey::branch("b1"), payload(json!({"x": 1})), Some(9)),
        ];
        let err = executor
            .execute(BatchRequest::new(ops, alice()).transactional())
            .await
            .unwrap_err();
        match err {
            ContextError::BatchPartialFailure { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
                assert_eq!(failures[0].kind, "version_conflict");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(writes.store().get(&ContextKey::task("t1")).is_err());
        assert_eq!(writes.store().get(&ContextKey::branch("b1")).unwrap().version, 1);
    }

    #[tokio::test]
    async fn transactional_create_then_update_same_key() {
        let (writes, executor) = setup();
        let ops = vec![
            task("t1", Some("first")),
            BatchOperation::update(ContextKey::task("t1"), payload(json!({"title": "second"})), None),
        ];
        let report = executor
            .execute(BatchRequest::new(ops, alice()).transactional())
            .await
            .unwrap();
        assert_eq!(report.results[1].outcome, OperationOutcome::Applied { version: 2 });
        assert_eq!(writes.store().get(&ContextKey::task("t1")).unwrap().payload["title"], "second");
    }

    #[tokio::test]
    async fn parallel_batch_reports_each_failure() {
        let (writes, executor) = setup();
        let ops = vec![
            task("t1", Some("a")),
            task("t2", None),
            task("t3", Some("c")),
            BatchOperation::create(ContextKey::task("t4"), Some("missing"), payload(json!({"title": "d"}))),
        ];
        let report = executor
            .execute(BatchRequest::new(ops, alice()).parallel())
            .await
            .unwrap();
        assert_eq!(report.state, BatchState::PartialFailed);
        let failed: Vec<usize> = report.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 3]);
        assert_eq!(report.failures[1].kind, "missing_ancestor");
        assert!(writes.store().get(&ContextKey::task("t1")).is_ok());
        assert!(writes.store().get(&ContextKey::task("t3")).is_ok());
        assert!(matches!(report.error(), Some(ContextError::BatchPartialFailure { .. })));
    }

    #[tokio::test]
    async fn same_key_operations_run_in_order() {
        let (writes, executor) = setup();
        let key = ContextKey::task("t1");
        let mut ops = vec![task("t1", Some("v1"))];
        for i in 2..=5 {
            ops.push(BatchOperation::update(key.clone(), payload(json!({ "title": format!("v{i}") })), None));
        }
        let report = executor
            .execute(BatchRequest::new(ops, alice()).parallel())
            .await
            .unwrap();
        assert_eq!(report.state, BatchState::Committed);
        let ctx = writes.store().get(&key).unwrap();
        assert_eq!(ctx.version, 5);
        assert_eq!(ctx.payload["title"], "v5");
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let (writes, executor) = setup();
        let key = ContextKey::task("t1");
        for title in ["one", "two"] {
            let op = BatchOperation::upsert(key.clone(), Some("b1"), payload(json!({ "title": title })));
            let report = executor.execute(BatchRequest::new(vec![op], alice())).await.unwrap();
            assert_eq!(report.state, BatchState::Committed);
        }
        let ctx = writes.store().get(&key).unwrap();
        assert_eq!(ctx.version, 2);
        assert_eq!(ctx.payload["title"], "two");
    }

    #[tokio::test]
    async fn sequential_stop_on_error_skips_rest() {
        let (writes, executor) = setup();
        let ops = vec![task("t1", Some("a")), task("t2", None), task("t3", Some("c"))];
        let report = executor
            .execute(BatchRequest::new(ops, alice()).stop_on_error())
            .await
            .unwrap();
        assert_eq!(report.state, BatchState::PartialFailed);
        assert_eq!(report.results[2].outcome, OperationOutcome::Skipped);
        assert!(writes.store().get(&ContextKey::task("t3")).is_err());
    }

    #[tokio::test]
    async fn deadline_abandons_remaining_operations() {
        let inner = SqliteContextStore::new(Database::in_memory().unwrap());
        seed(&inner);
        let store = Arc::new(CountingStore::new(inner).with_write_delay(Duration::from_millis(200)));
        let (writes, executor) = executor_over(store);
        let ops = (1..=4).map(|i| task(&format!("t{i}"), Some("x"))).collect();
        let report = executor
            .execute(BatchRequest::new(ops, alice()).with_deadline(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(report.state, BatchState::PartialFailed);
        assert!(matches!(report.results[0].outcome, OperationOutcome::Applied { version: 1 }));
        // t2 was mid-write at the deadline: not reported as failed.
        assert_eq!(report.results[1].outcome, OperationOutcome::Abandoned);
        let failed: Vec<usize> = report.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![2, 3]);
        assert!(report.failures.iter().all(|f| f.kind == "deadline_exceeded"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writes.store().get(&ContextKey::task("t2")).unwrap().version, 1);
        assert!(writes.store().get(&ContextKey::task("t3")).is_err());
    }

    #[tokio::test]
    async fn create_under_missing_branch_uses_operation_lineage() {
        let (writes, executor) = setup();
        let mut lineage = Lineage::default();
        lineage.set(Level::Project, "p1");
        let op = BatchOperation::create(ContextKey::task("t1"), Some("b-new"), payload(json!({"title": "x"})))
            .with_lineage(lineage);
        let mut req = BatchRequest::new(vec![op], alice());
        req.auto_create_ancestors = true;

        let report = executor.execute(req).await.unwrap();
        assert_eq!(report.state, BatchState::Committed, "{:?}", report.failures);
        let branch = writes.store().get(&ContextKey::branch("b-new")).unwrap();
        assert_eq!(branch.parent_id.as_deref(), Some("p1"));
        let task = writes.store().get(&ContextKey::task("t1")).unwrap();
        assert_eq!(task.parent_id.as_deref(), Some("b-new"));
    }

    #[tokio::test]
    async fn transactional_deadline_rolls_back() {
        let inner = SqliteContextStore::new(Database::in_memory().unwrap());
        seed(&inner);
        let store = Arc::new(CountingStore::new(inner).with_write_delay(Duration::from_millis(50)));
        let (writes, executor) = executor_over(store);
        let err = executor
            .execute(
                BatchRequest::new(vec![task("t1", Some("a"))], alice())
                    .transactional()
                    .with_deadline(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::DeadlineExceeded));
        assert!(writes.store().get(&ContextKey::task("t1")).is_err());
    }

    #[tokio::test]
    async fn empty_batch_is_committed() {
        let (_writes, executor) = setup();
        let report = executor.execute(BatchRequest::new(Vec::new(), alice())).await.unwrap();
        assert_eq!(report.state, BatchState::Committed);
        assert!(report.results.is_empty());
    }

    #[test]
    fn operation_wire_shape() {
        let op: BatchOperation = serde_json::from_value(json!({
            "action": "upsert",
            "level": "task",
            "id": "t1",
            "parent_id": "b1",
            "payload": {"title": "x"}
        }))
        .unwrap();
        assert_eq!(op.action, BatchAction::Upsert);
        assert_eq!(op.key, ContextKey::new(Level::Task, "t1"));
        assert_eq!(op.parent_id.as_deref(), Some("b1"));
        assert_eq!(op.lineage, Lineage::default());

        let op: BatchOperation = serde_json::from_value(json!({
            "action": "create",
            "level": "task",
            "id": "t2",
            "parent_id": "b2",
            "lineage": {"project_id": "p2"}
        }))
        .unwrap();
        assert_eq!(op.lineage.project_id.as_deref(), Some("p2"));
    }
}
