use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tenantq_job_queue::{
    async_trait, BackoffPolicy, Clock, ConnectionResolver, Enqueuer, FailedJobRecord,
    HandlerError, HandlerRegistry, JobContext, JobId, JobOutcome, JobRecord, JobStore,
    ManualClock, MemoryJobStore, NoTenant, QueueError, TaskDescriptor, TenantId, Worker,
    WorkerOptions,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Hands out `db-<tenant>` labels and records every call in order.
#[derive(Default)]
struct RecordingResolver {
    events: Mutex<Vec<String>>,
}

impl RecordingResolver {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionResolver for RecordingResolver {
    type Connection = String;

    async fn resolve(&self, tenant: &TenantId) -> Result<String, QueueError> {
        self.push(format!("resolve:{tenant}"));
        if tenant.as_str() == "ghost" {
            return Err(QueueError::TenantNotFound(tenant.clone()));
        }
        Ok(format!("db-{tenant}"))
    }

    async fn resolve_default(&self) -> Result<String, QueueError> {
        self.push("resolve:default".to_owned());
        Ok("db-default".to_owned())
    }

    async fn release(&self, connection: String) {
        self.push(format!("release:{connection}"));
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    resolver: Arc<RecordingResolver>,
    handlers: HandlerRegistry<String>,
    enqueuer: Enqueuer,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(MemoryJobStore::new())
    }

    fn with_clock(clock: &ManualClock) -> Self {
        Self::with_store(MemoryJobStore::with_clock(Arc::new(clock.clone())))
    }

    fn with_store(store: MemoryJobStore) -> Self {
        let store = Arc::new(store);
        Self {
            enqueuer: Enqueuer::new(store.clone()),
            store,
            resolver: Arc::new(RecordingResolver::default()),
            handlers: HandlerRegistry::new(),
        }
    }

    fn worker(&self, options: WorkerOptions) -> Worker<RecordingResolver> {
        Worker::new(
            self.store.clone(),
            self.resolver.clone(),
            self.handlers.clone(),
            options,
        )
    }
}

/// Fails the first `outages` reservations, then behaves like the wrapped store.
struct FlakyStore {
    inner: MemoryJobStore,
    outages: AtomicU32,
}

impl FlakyStore {
    fn new(outages: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            outages: AtomicU32::new(outages),
        }
    }

    fn outages_left(&self) -> u32 {
        self.outages.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        tenant_id: Option<&TenantId>,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        self.inner.enqueue(queue, payload, tenant_id, delay).await
    }

    async fn reserve_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(QueueError::Storage("database is locked".to_owned()));
        }
        self.inner.reserve_next(queue, lease).await
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        self.inner.complete(id).await
    }

    async fn release(&self, job: &JobRecord, backoff: Duration) -> Result<bool, QueueError> {
        self.inner.release(job, backoff).await
    }

    async fn dead_letter(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        self.inner.dead_letter(job, last_error).await
    }

    async fn discard(&self, job: &JobRecord, last_error: &str) -> Result<bool, QueueError> {
        self.inner.discard(job, last_error).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.inner.get(id).await
    }

    async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        self.inner.size(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<u64, QueueError> {
        self.inner.clear(queue).await
    }

    async fn failed(&self, limit: usize) -> Result<Vec<FailedJobRecord>, QueueError> {
        self.inner.failed(limit).await
    }

    async fn find_failed(&self, id: JobId) -> Result<Option<FailedJobRecord>, QueueError> {
        self.inner.find_failed(id).await
    }

    async fn retry_failed(&self, id: JobId) -> Result<JobId, QueueError> {
        self.inner.retry_failed(id).await
    }

    async fn forget_failed(&self, id: JobId) -> Result<bool, QueueError> {
        self.inner.forget_failed(id).await
    }

    async fn flush_failed(&self) -> Result<u64, QueueError> {
        self.inner.flush_failed().await
    }
}

fn immediate_retries(max_attempts: u32) -> WorkerOptions {
    WorkerOptions {
        max_attempts,
        backoff: BackoffPolicy::fixed(Duration::ZERO),
        ..WorkerOptions::default()
    }
}

#[tokio::test]
async fn handler_runs_on_the_jobs_tenant_connection() {
    let h = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let resolver = h.resolver.clone();
    h.handlers
        .register_fn("report.build", move |ctx: JobContext<String>, args: Value| {
            let sink = sink.clone();
            let resolver = resolver.clone();
            async move {
                resolver.push("handler".to_owned());
                sink.lock()
                    .unwrap()
                    .push((ctx.tenant, ctx.connection, ctx.attempts, args));
                Ok(())
            }
        })
        .await;

    let task = TaskDescriptor::new("report.build", json!({"month": 3}));
    let id = h
        .enqueuer
        .push_now("default", &task, &TenantId::from(42u64))
        .await
        .unwrap();

    let outcome = h.worker(WorkerOptions::default()).run_once().await.unwrap();

    assert_eq!(outcome, Some(JobOutcome::Completed { job_id: id }));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(
            Some(TenantId::from("42")),
            "db-42".to_owned(),
            0,
            json!({"month": 3})
        )]
    );
    assert_eq!(
        h.resolver.events(),
        vec!["resolve:42", "handler", "release:db-42"]
    );
    assert!(h.store.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn jobs_without_tenant_use_the_default_connection() {
    let h = Harness::new();
    h.handlers
        .register_fn("cleanup", |ctx: JobContext<String>, _args: Value| async move {
            assert_eq!(ctx.connection, "db-default");
            assert_eq!(ctx.tenant, None);
            Ok(())
        })
        .await;

    h.enqueuer
        .push_now("default", &TaskDescriptor::new("cleanup", Value::Null), &NoTenant)
        .await
        .unwrap();

    let outcome = h.worker(WorkerOptions::default()).run_once().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    assert_eq!(
        h.resolver.events(),
        vec!["resolve:default", "release:db-default"]
    );
}

#[tokio::test]
async fn empty_queues_yield_nothing() {
    let h = Harness::new();
    let worker = h.worker(WorkerOptions::default().with_queues(["high", "low"]));
    assert_eq!(worker.run_once().await.unwrap(), None);
    assert!(h.resolver.events().is_empty());
}

#[tokio::test]
async fn queues_are_polled_in_priority_order() {
    let h = Harness::new();
    h.handlers
        .register_fn("noop", |_ctx: JobContext<String>, _args: Value| async { Ok(()) })
        .await;
    let task = TaskDescriptor::new("noop", Value::Null);
    let low = h.enqueuer.push_now("low", &task, &NoTenant).await.unwrap();
    let high = h.enqueuer.push_now("high", &task, &NoTenant).await.unwrap();

    let worker = h.worker(WorkerOptions::default().with_queues(["high", "low"]));
    assert_eq!(worker.run_once().await.unwrap().map(|o| o.job_id()), Some(high));
    assert_eq!(worker.run_once().await.unwrap().map(|o| o.job_id()), Some(low));
}

#[tokio::test]
async fn failing_job_is_retried_then_dead_lettered() {
    let h = Harness::new();
    h.handlers
        .register_fn("flaky", |_ctx: JobContext<String>, _args: Value| async {
            Err(HandlerError::new("upstream unavailable"))
        })
        .await;
    let id = h
        .enqueuer
        .push_now("default", &TaskDescriptor::new("flaky", Value::Null), &NoTenant)
        .await
        .unwrap();
    let worker = h.worker(immediate_retries(3));

    let first = worker.run_once().await.unwrap().unwrap();
    assert!(matches!(first, JobOutcome::Released { attempts: 1, .. }));
    assert_eq!(h.store.get(id).await.unwrap().unwrap().attempts, 1);

    let second = worker.run_once().await.unwrap().unwrap();
    assert!(matches!(second, JobOutcome::Released { attempts: 2, .. }));

    let third = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        third,
        JobOutcome::DeadLettered {
            job_id: id,
            attempts: 3,
            error: "job handler failed: upstream unavailable".to_owned(),
        }
    );

    assert!(h.store.get(id).await.unwrap().is_none());
    let failed = h.store.find_failed(id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 3);
    assert!(failed.last_error.contains("upstream unavailable"));
    assert_eq!(worker.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn descriptor_can_raise_the_attempt_budget() {
    let h = Harness::new();
    h.handlers
        .register_fn("flaky", |_ctx: JobContext<String>, _args: Value| async {
            Err(HandlerError::new("nope"))
        })
        .await;
    let task = TaskDescriptor::new("flaky", Value::Null).with_max_attempts(2);
    h.enqueuer.push_now("default", &task, &NoTenant).await.unwrap();

    let worker = h.worker(immediate_retries(1));
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Some(JobOutcome::Released { attempts: 1, .. })
    ));
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Some(JobOutcome::DeadLettered { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn released_job_waits_for_its_backoff() {
    let h = Harness::new();
    h.handlers
        .register_fn("flaky", |_ctx: JobContext<String>, _args: Value| async {
            Err(HandlerError::new("try later"))
        })
        .await;
    let id = h
        .enqueuer
        .push_now("default", &TaskDescriptor::new("flaky", Value::Null), &NoTenant)
        .await
        .unwrap();
    let worker = h.worker(WorkerOptions {
        backoff: BackoffPolicy::fixed(Duration::from_secs(3600)),
        ..WorkerOptions::default()
    });

    let outcome = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Released {
            job_id: id,
            attempts: 1,
            delay: Duration::from_secs(3600),
            error: "job handler failed: try later".to_owned(),
        }
    );
    assert_eq!(worker.run_once().await.unwrap(), None);
    assert_eq!(h.store.size("default").await.unwrap(), 1);
}

#[tokio::test]
async fn undecodable_payload_is_dead_lettered_immediately() {
    let h = Harness::new();
    let id = h
        .store
        .enqueue("default", b"not json".to_vec(), None, Duration::ZERO)
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(5)).run_once().await.unwrap();

    assert!(matches!(
        outcome,
        Some(JobOutcome::DeadLettered { job_id, attempts: 1, .. }) if job_id == id
    ));
    assert!(h.resolver.events().is_empty());
    assert!(h.store.find_failed(id).await.unwrap().is_some());
}

#[tokio::test]
async fn fatal_handler_error_skips_retries() {
    let h = Harness::new();
    h.handlers
        .register_fn("strict", |_ctx: JobContext<String>, _args: Value| async {
            Err(HandlerError::fatal("invalid invoice"))
        })
        .await;
    let id = h
        .enqueuer
        .push_now("default", &TaskDescriptor::new("strict", Value::Null), &NoTenant)
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(5)).run_once().await.unwrap();

    assert!(matches!(outcome, Some(JobOutcome::DeadLettered { attempts: 1, .. })));
    assert!(h.store.find_failed(id).await.unwrap().is_some());
    assert_eq!(
        h.resolver.events(),
        vec!["resolve:default", "release:db-default"]
    );
}

#[tokio::test]
async fn unresolvable_tenant_releases_without_running_handler() {
    let h = Harness::new();
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    h.handlers
        .register_fn("report.build", move |_ctx: JobContext<String>, _args: Value| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        })
        .await;
    let id = h
        .enqueuer
        .push_now(
            "default",
            &TaskDescriptor::new("report.build", Value::Null),
            &TenantId::from("ghost"),
        )
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(3)).run_once().await.unwrap().unwrap();

    assert!(matches!(outcome, JobOutcome::Released { attempts: 1, ref error, .. } if error.contains("ghost")));
    assert!(!*ran.lock().unwrap());
    assert_eq!(h.resolver.events(), vec!["resolve:ghost"]);
    assert_eq!(h.store.get(id).await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn unknown_job_type_is_retried() {
    let h = Harness::new();
    h.enqueuer
        .push_now("default", &TaskDescriptor::new("not.deployed.yet", Value::Null), &NoTenant)
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(3)).run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Released { ref error, .. } if error.contains("not.deployed.yet")));
    assert!(h.resolver.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_scope_is_released() {
    let h = Harness::new();
    h.handlers
        .register_fn("slow", |_ctx: JobContext<String>, _args: Value| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;
    let task = TaskDescriptor::new("slow", Value::Null).with_timeout(Duration::from_secs(5));
    h.enqueuer.push_now("default", &task, &NoTenant).await.unwrap();

    let outcome = h.worker(immediate_retries(3)).run_once().await.unwrap().unwrap();

    assert!(matches!(outcome, JobOutcome::Released { ref error, .. } if error.contains("timed out")));
    assert_eq!(
        h.resolver.events(),
        vec!["resolve:default", "release:db-default"]
    );
}

#[tokio::test]
async fn panicking_handler_fails_the_job_not_the_worker() {
    let h = Harness::new();
    h.handlers
        .register_fn("boom", |_ctx: JobContext<String>, _args: Value| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        })
        .await;
    h.enqueuer
        .push_now("default", &TaskDescriptor::new("boom", Value::Null), &NoTenant)
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(3)).run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Released { ref error, .. } if error.contains("panicked")));
    assert_eq!(
        h.resolver.events(),
        vec!["resolve:default", "release:db-default"]
    );
}

#[tokio::test]
async fn run_drains_queue_and_stops_on_shutdown() {
    let h = Harness::new();
    let done = Arc::new(Mutex::new(Vec::new()));
    let sink = done.clone();
    h.handlers
        .register_fn("count", move |ctx: JobContext<String>, _args: Value| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(ctx.job_id);
                Ok(())
            }
        })
        .await;
    for _ in 0..5 {
        h.enqueuer
            .push_now("default", &TaskDescriptor::new("count", Value::Null), &NoTenant)
            .await
            .unwrap();
    }

    let worker = h.worker(WorkerOptions {
        poll_interval: Duration::from_millis(10),
        ..WorkerOptions::default()
    });
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run_pool(3, shutdown).await }
    });

    for _ in 0..200 {
        if done.lock().unwrap().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("pool did not stop")
        .unwrap();

    let mut ids = done.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.store.size("default").await.unwrap(), 0);
}

#[tokio::test]
async fn reclaimed_job_without_attempts_left_is_dead_lettered_unrun() {
    let clock = ManualClock::default();
    let h = Harness::with_clock(&clock);
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    h.handlers
        .register_fn("report.build", move |_ctx: JobContext<String>, _args: Value| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        })
        .await;
    let task = TaskDescriptor::new("report.build", Value::Null).with_max_attempts(2);
    let id = h.enqueuer.push_now("default", &task, &NoTenant).await.unwrap();
    let options = immediate_retries(5);
    let lease = options.lease;

    // Two holders reserve the job and vanish without settling it.
    h.store.reserve_next("default", lease).await.unwrap().unwrap();
    clock.advance(lease + Duration::from_secs(1));
    h.store.reserve_next("default", lease).await.unwrap().unwrap();
    clock.advance(lease + Duration::from_secs(1));

    let outcome = h.worker(options).run_once().await.unwrap().unwrap();

    assert!(matches!(
        outcome,
        JobOutcome::DeadLettered { job_id, attempts: 2, .. } if job_id == id
    ));
    assert!(!*ran.lock().unwrap());
    assert!(h.resolver.events().is_empty());
    assert!(h.store.get(id).await.unwrap().is_none());
    let failed = h.store.find_failed(id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 2);
    assert!(failed.last_error.contains("lease expired"));
}

#[tokio::test]
async fn late_failure_leaves_a_reclaimed_job_to_its_new_holder() {
    let clock = ManualClock::default();
    let h = Harness::with_clock(&clock);
    let lease = WorkerOptions::default().lease;
    let store = h.store.clone();
    let ticker = clock.clone();
    h.handlers
        .register_fn("stuck", move |_ctx: JobContext<String>, _args: Value| {
            let store = store.clone();
            let ticker = ticker.clone();
            async move {
                // Another worker picks the job up while this attempt is still running.
                ticker.advance(lease + Duration::from_secs(1));
                store.reserve_next("default", lease).await.unwrap().unwrap();
                Err(HandlerError::new("upstream unavailable"))
            }
        })
        .await;
    let id = h
        .enqueuer
        .push_now("default", &TaskDescriptor::new("stuck", Value::Null), &NoTenant)
        .await
        .unwrap();

    let outcome = h.worker(immediate_retries(3)).run_once().await.unwrap().unwrap();

    assert_eq!(outcome, JobOutcome::LeaseLost { job_id: id });
    let current = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(current.reserved_at, Some(clock.now()));
    assert_eq!(current.attempts, 1);
    assert!(h.store.reserve_next("default", lease).await.unwrap().is_none());
    assert!(h.store.find_failed(id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn run_rides_out_store_outages_and_stops_on_cancel() {
    let store = Arc::new(FlakyStore::new(4));
    let handlers = HandlerRegistry::<String>::new();
    let ran = Arc::new(Notify::new());
    let signal = ran.clone();
    handlers
        .register_fn("count", move |_ctx: JobContext<String>, _args: Value| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                Ok(())
            }
        })
        .await;
    let id = Enqueuer::new(store.clone())
        .push_now("default", &TaskDescriptor::new("count", Value::Null), &NoTenant)
        .await
        .unwrap();

    let worker = Worker::new(
        store.clone(),
        Arc::new(RecordingResolver::default()),
        handlers,
        WorkerOptions {
            poll_interval: Duration::from_millis(100),
            max_poll_backoff: Duration::from_secs(1),
            ..WorkerOptions::default()
        },
    );
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(30), ran.notified())
        .await
        .expect("job never ran");
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not stop")
        .unwrap();

    assert_eq!(store.outages_left(), 0);
    assert!(store.get(id).await.unwrap().is_none());
    assert_eq!(store.size("default").await.unwrap(), 0);
}
