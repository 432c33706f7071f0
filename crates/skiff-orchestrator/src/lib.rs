//! Unified resource-lifecycle orchestrator: one in-memory registry of
//! containers and VMs, a per-resource transition lock, and bounded workers
//! that drive the backends under a timeout.
//!
//! State machine: `Requested → Provisioning → {Running, Failed}`;
//! `Running → Stopping → {Stopped, Failed}`. `Stopped` and `Failed` are
//! terminal; re-provisioning mints a new id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use skiff_common::{
    ExitNotice, FailureCause, ResourceBackend, ResourceKind, ResourceSnapshot, ResourceSpec,
    ResourceState, Result, SkiffError,
};

pub use skiff_common as common;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on a single backend provision; on expiry the resource lands in
    /// `Failed(Timeout)` instead of hanging in `Provisioning` forever.
    pub provision_timeout: Duration,
    pub stop_timeout: Duration,
    /// Bound on concurrently running backend operations.
    pub max_concurrent_ops: usize,
    /// A `Running` resource unobserved for longer than this is flagged stale
    /// in snapshots.
    pub staleness_after: Duration,
    /// Interval of the background liveness probe; `None` disables it.
    pub probe_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(30),
            max_concurrent_ops: 4,
            staleness_after: Duration::from_secs(15),
            probe_interval: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug)]
struct StateCell {
    state: ResourceState,
    backend_ref: Option<String>,
    detail: Option<String>,
    observed_at: Instant,
}

struct ResourceEntry {
    id: String,
    name: String,
    kind: ResourceKind,
    spec: ResourceSpec,
    created_at: DateTime<Utc>,
    cell: RwLock<StateCell>,
    /// At-most-one active transition per resource.
    transition: Mutex<()>,
    cancel_flag: AtomicBool,
    cancel_notify: Notify,
}

impl ResourceEntry {
    fn new(id: String, spec: ResourceSpec) -> Self {
        Self {
            id,
            name: spec.name().to_string(),
            kind: spec.kind(),
            spec,
            created_at: Utc::now(),
            cell: RwLock::new(StateCell {
                state: ResourceState::Requested,
                backend_ref: None,
                detail: None,
                observed_at: Instant::now(),
            }),
            transition: Mutex::new(()),
            cancel_flag: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    async fn set_state(&self, state: ResourceState, detail: Option<String>) {
        let mut cell = self.cell.write().await;
        debug!(id = %self.id, from = %cell.state, to = %state, "state transition");
        cell.state = state;
        cell.detail = detail;
        cell.observed_at = Instant::now();
    }

    async fn state(&self) -> ResourceState {
        self.cell.read().await.state.clone()
    }

    async fn snapshot(&self, staleness_after: Duration) -> ResourceSnapshot {
        let cell = self.cell.read().await;
        ResourceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            state: cell.state.clone(),
            backend_ref: cell.backend_ref.clone(),
            created_at: self.created_at,
            stale: cell.state == ResourceState::Running
                && cell.observed_at.elapsed() > staleness_after,
            detail: cell.detail.clone(),
        }
    }

    fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    backends: Arc<HashMap<ResourceKind, Arc<dyn ResourceBackend>>>,
    registry: Arc<DashMap<String, Arc<ResourceEntry>>>,
    semaphore: Arc<Semaphore>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Build an orchestrator over the two backends. Must be called within a
    /// Tokio runtime; the background probe loop (when enabled) is spawned
    /// here.
    pub fn new(
        container: Arc<dyn ResourceBackend>,
        vm: Arc<dyn ResourceBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        let mut backends = HashMap::new();
        backends.insert(ResourceKind::Container, container);
        backends.insert(ResourceKind::Vm, vm);

        let orchestrator = Self {
            backends: Arc::new(backends),
            registry: Arc::new(DashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_ops.max(1))),
            config: Arc::new(config),
        };

        if let Some(interval) = orchestrator.config.probe_interval {
            let this = orchestrator.clone();
            tokio::spawn(async move {
                this.probe_loop(interval).await;
            });
        }

        orchestrator
    }

    /// Validate the spec and register the resource, then drive the backend on
    /// a bounded worker. Returns the new resource id immediately; the caller
    /// observes progress through `get`/`list`/`wait_settled`.
    #[instrument(skip(self, spec), fields(name = %spec.name(), kind = %spec.kind()))]
    pub async fn provision(&self, spec: ResourceSpec) -> Result<String> {
        spec.validate()?;
        self.backend_for(spec.kind())?;

        // A second active resource with the same name would collide on disk
        // filenames and container names.
        let entries: Vec<Arc<ResourceEntry>> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            if entry.name == spec.name()
                && entry.kind == spec.kind()
                && !entry.state().await.is_terminal()
            {
                return Err(SkiffError::ResourceConflict(format!(
                    "'{}' is already active as resource {}",
                    spec.name(),
                    entry.id
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(ResourceEntry::new(id.clone(), spec));
        self.registry.insert(id.clone(), entry.clone());
        info!(%id, "resource registered");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_provision(entry).await;
        });

        Ok(id)
    }

    async fn run_provision(&self, entry: Arc<ResourceEntry>) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let backend = match self.backend_for(entry.kind) {
            Ok(b) => b,
            Err(e) => {
                entry
                    .set_state(ResourceState::Failed(FailureCause::from(&e)), Some(e.to_string()))
                    .await;
                return;
            }
        };

        let _guard = entry.transition.lock().await;

        let cancelled = entry.cancel_notify.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if entry.cancel_requested() {
            entry
                .set_state(
                    ResourceState::Failed(FailureCause::Cancelled),
                    Some("cancelled before provisioning started".to_string()),
                )
                .await;
            return;
        }

        entry.set_state(ResourceState::Provisioning, None).await;

        let outcome = tokio::select! {
            _ = &mut cancelled => {
                info!(id = %entry.id, "provision cancelled; reaping");
                backend.reap(&entry.id).await;
                entry.set_state(ResourceState::Failed(FailureCause::Cancelled), None).await;
                return;
            }
            res = tokio::time::timeout(
                self.config.provision_timeout,
                backend.provision(&entry.id, &entry.spec),
            ) => res,
        };

        match outcome {
            Ok(Ok(outcome)) => {
                if entry.cancel_requested() {
                    // Cancel arrived as the backend was finishing; tear it down.
                    if let Err(e) = backend.stop(&entry.id).await {
                        warn!(id = %entry.id, error = %e, "stop of freshly provisioned resource failed");
                    }
                    backend.reap(&entry.id).await;
                    entry
                        .set_state(ResourceState::Failed(FailureCause::Cancelled), None)
                        .await;
                    return;
                }
                {
                    let mut cell = entry.cell.write().await;
                    cell.state = ResourceState::Running;
                    cell.backend_ref = Some(outcome.backend_ref);
                    cell.detail = None;
                    cell.observed_at = Instant::now();
                }
                info!(id = %entry.id, "resource running");
                if let Some(exited) = outcome.exited {
                    self.spawn_exit_watcher(entry.clone(), exited);
                }
            }
            Ok(Err(err)) => {
                error!(id = %entry.id, error = %err, "backend provision failed");
                entry
                    .set_state(
                        ResourceState::Failed(FailureCause::from(&err)),
                        Some(err.to_string()),
                    )
                    .await;
            }
            Err(_elapsed) => {
                warn!(
                    id = %entry.id,
                    timeout = ?self.config.provision_timeout,
                    "backend provision timed out; reaping"
                );
                backend.reap(&entry.id).await;
                entry
                    .set_state(
                        ResourceState::Failed(FailureCause::Timeout),
                        Some(format!(
                            "provisioning exceeded {:?}",
                            self.config.provision_timeout
                        )),
                    )
                    .await;
            }
        }
    }

    fn spawn_exit_watcher(&self, entry: Arc<ResourceEntry>, exited: ExitNotice) {
        tokio::spawn(async move {
            let notice = match exited.await {
                Ok(notice) => notice,
                // Backend dropped the sender; the probe loop still covers us.
                Err(_) => return,
            };
            let _guard = entry.transition.lock().await;
            let mut cell = entry.cell.write().await;
            if cell.state != ResourceState::Running {
                // A stop owned this exit.
                return;
            }
            match notice {
                None => {
                    cell.state = ResourceState::Stopped;
                    cell.detail = Some("exited on its own".to_string());
                }
                Some(detail) => {
                    cell.state = ResourceState::Failed(FailureCause::BackendError);
                    cell.detail = Some(detail);
                }
            }
            cell.observed_at = Instant::now();
            info!(id = %entry.id, state = %cell.state, "resource exit observed");
        });
    }

    /// Stop a resource. Valid only from `Running` (stops the backend) or
    /// `Requested`/`Provisioning` (requests cancellation of the in-flight
    /// provision). Terminal resources return `InvalidState`.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        match entry.state().await {
            ResourceState::Requested | ResourceState::Provisioning => {
                entry.request_cancel();
                info!(%id, "cancellation requested for in-flight provision");
                Ok(())
            }
            ResourceState::Running => self.stop_running(&entry).await,
            other => Err(SkiffError::InvalidState(other.to_string())),
        }
    }

    async fn stop_running(&self, entry: &Arc<ResourceEntry>) -> Result<()> {
        let backend = self.backend_for(entry.kind)?;
        let _guard = entry.transition.lock().await;
        {
            // Recheck under the lock; the exit watcher may have won.
            let cell = entry.cell.read().await;
            if cell.state != ResourceState::Running {
                return Err(SkiffError::InvalidState(cell.state.to_string()));
            }
        }
        entry.set_state(ResourceState::Stopping, None).await;

        match tokio::time::timeout(self.config.stop_timeout, backend.stop(&entry.id)).await {
            Ok(Ok(())) => {
                entry.set_state(ResourceState::Stopped, None).await;
                info!(id = %entry.id, "resource stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(id = %entry.id, error = %err, "backend stop failed");
                entry
                    .set_state(
                        ResourceState::Failed(FailureCause::from(&err)),
                        Some(err.to_string()),
                    )
                    .await;
                Err(err)
            }
            Err(_elapsed) => {
                warn!(id = %entry.id, "backend stop timed out; reaping");
                backend.reap(&entry.id).await;
                entry
                    .set_state(
                        ResourceState::Failed(FailureCause::Timeout),
                        Some(format!("stop exceeded {:?}", self.config.stop_timeout)),
                    )
                    .await;
                Err(SkiffError::Timeout(self.config.stop_timeout))
            }
        }
    }

    /// Cancel an in-flight provision. Valid only from `Requested` or
    /// `Provisioning`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        match entry.state().await {
            ResourceState::Requested | ResourceState::Provisioning => {
                entry.request_cancel();
                Ok(())
            }
            other => Err(SkiffError::InvalidState(other.to_string())),
        }
    }

    /// Cached last-known view of a resource. Never touches a backend.
    pub async fn get(&self, id: &str) -> Result<ResourceSnapshot> {
        let entry = self.entry(id)?;
        Ok(entry.snapshot(self.config.staleness_after).await)
    }

    /// Cached last-known view of every tracked resource, oldest first.
    pub async fn list(&self) -> Vec<ResourceSnapshot> {
        let entries: Vec<Arc<ResourceEntry>> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.snapshot(self.config.staleness_after).await);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Actively probe the backend for a resource and fold the observation into
    /// the registry, then return the refreshed snapshot. This is the one read
    /// path that talks to a backend; `get` and `list` never do.
    #[instrument(skip(self))]
    pub async fn refresh(&self, id: &str) -> Result<ResourceSnapshot> {
        let entry = self.entry(id)?;
        self.probe_entry(&entry).await;
        Ok(entry.snapshot(self.config.staleness_after).await)
    }

    /// Poll until the resource reaches `Running` or a terminal state, or the
    /// deadline passes; returns the latest snapshot either way.
    pub async fn wait_settled(&self, id: &str, deadline: Duration) -> Result<ResourceSnapshot> {
        let start = Instant::now();
        loop {
            let snapshot = self.get(id).await?;
            if snapshot.state == ResourceState::Running
                || snapshot.state.is_terminal()
                || start.elapsed() > deadline
            {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn probe_entry(&self, entry: &Arc<ResourceEntry>) {
        let Ok(backend) = self.backend_for(entry.kind) else {
            return;
        };
        if entry.state().await != ResourceState::Running {
            return;
        }
        let alive = tokio::time::timeout(PROBE_TIMEOUT, backend.probe(&entry.id)).await;

        // Only touch state when the transition lock is free; a stop already in
        // flight owns the resource.
        let Ok(_guard) = entry.transition.try_lock() else {
            return;
        };
        let mut cell = entry.cell.write().await;
        if cell.state != ResourceState::Running {
            return;
        }
        match alive {
            Ok(Ok(true)) => {
                cell.observed_at = Instant::now();
            }
            Ok(Ok(false)) => {
                cell.state = ResourceState::Stopped;
                cell.detail = Some("backend reports resource gone".to_string());
                cell.observed_at = Instant::now();
                info!(id = %entry.id, "probe found resource gone");
            }
            Ok(Err(e)) => {
                // Leave the cached state; it will go stale on its own.
                warn!(id = %entry.id, error = %e, "liveness probe failed");
            }
            Err(_) => {
                warn!(id = %entry.id, "liveness probe timed out");
            }
        }
    }

    async fn probe_loop(self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let entries: Vec<Arc<ResourceEntry>> =
                self.registry.iter().map(|e| e.value().clone()).collect();
            for entry in entries {
                self.probe_entry(&entry).await;
            }
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<ResourceEntry>> {
        self.registry
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SkiffError::NotFound(format!("resource '{id}'")))
    }

    fn backend_for(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| SkiffError::Internal(format!("no backend registered for {kind}")))
    }
}

// --- Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_common::{ContainerSpec, ProvisionOutcome, VmSpec};
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    enum Behavior {
        Succeed { delay: Duration },
        Fail,
        Hang,
    }

    struct FakeBackend {
        behavior: Behavior,
        with_exit_notice: bool,
        provisions: AtomicUsize,
        stops: AtomicUsize,
        reaps: AtomicUsize,
        specs: std::sync::Mutex<Vec<ResourceSpec>>,
        exit_tx: std::sync::Mutex<Option<oneshot::Sender<Option<String>>>>,
    }

    impl FakeBackend {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                with_exit_notice: false,
                provisions: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                reaps: AtomicUsize::new(0),
                specs: std::sync::Mutex::new(Vec::new()),
                exit_tx: std::sync::Mutex::new(None),
            })
        }

        fn with_exit_notice(behavior: Behavior) -> Arc<Self> {
            let mut backend = Self::new(behavior);
            Arc::get_mut(&mut backend).unwrap().with_exit_notice = true;
            backend
        }

        fn provisions(&self) -> usize {
            self.provisions.load(Ordering::SeqCst)
        }
        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
        fn reaps(&self) -> usize {
            self.reaps.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceBackend for FakeBackend {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Container
        }

        async fn provision(&self, id: &str, spec: &ResourceSpec) -> Result<ProvisionOutcome> {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec.clone());
            match &self.behavior {
                Behavior::Succeed { delay } => {
                    tokio::time::sleep(*delay).await;
                    let exited = if self.with_exit_notice {
                        let (tx, rx) = oneshot::channel();
                        *self.exit_tx.lock().unwrap() = Some(tx);
                        Some(rx)
                    } else {
                        None
                    };
                    Ok(ProvisionOutcome {
                        backend_ref: format!("fake-{id}"),
                        exited,
                    })
                }
                Behavior::Fail => Err(SkiffError::BackendUnavailable("fake daemon down".into())),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn stop(&self, _id: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self, _id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn reap(&self, _id: &str) {
            self.reaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            provision_timeout: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(200),
            max_concurrent_ops: 4,
            staleness_after: Duration::from_secs(15),
            probe_interval: None,
        }
    }

    fn orchestrator_with(backend: Arc<FakeBackend>, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(backend.clone(), backend, config)
    }

    fn vm_spec() -> ResourceSpec {
        ResourceSpec::Vm(VmSpec {
            vm_name: "test".to_string(),
            ram_mb: 1024,
            cpu_cores: 2,
            disk_size_gb: 10,
            iso_path: None,
        })
    }

    fn container_spec(name: &str) -> ResourceSpec {
        ResourceSpec::Container(ContainerSpec {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["sleep".to_string(), "30".to_string()],
            env: None,
            memory_mb: None,
            cpu_count: None,
        })
    }

    #[tokio::test]
    async fn provisioning_only_passes_through_lifecycle_states() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::from_millis(50),
        });
        let orchestrator = orchestrator_with(backend.clone(), test_config());

        let id = orchestrator.provision(vm_spec()).await.unwrap();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(150) {
            let snapshot = orchestrator.get(&id).await.unwrap();
            assert!(
                matches!(
                    snapshot.state,
                    ResourceState::Requested
                        | ResourceState::Provisioning
                        | ResourceState::Running
                        | ResourceState::Failed(_)
                ),
                "unexpected state {}",
                snapshot.state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snapshot.state, ResourceState::Running);
        assert_eq!(snapshot.backend_ref.as_deref(), Some(&*format!("fake-{id}")));
        assert_eq!(backend.provisions(), 1);
    }

    #[tokio::test]
    async fn invalid_specs_are_rejected_before_the_backend() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::ZERO,
        });
        let orchestrator = orchestrator_with(backend.clone(), test_config());

        let err = orchestrator
            .provision(ResourceSpec::Vm(VmSpec {
                vm_name: "test".to_string(),
                ram_mb: 1,
                cpu_cores: 2,
                disk_size_gb: 10,
                iso_path: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::InvalidSpec(_)), "got {err:?}");
        assert_eq!(backend.provisions(), 0);
        assert!(orchestrator.list().await.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_lands_in_failed_with_typed_cause() {
        let backend = FakeBackend::new(Behavior::Fail);
        let orchestrator = orchestrator_with(backend, test_config());

        let id = orchestrator.provision(vm_spec()).await.unwrap();
        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            snapshot.state,
            ResourceState::Failed(FailureCause::BackendUnavailable)
        );
        assert!(snapshot.detail.unwrap().contains("fake daemon down"));
    }

    #[tokio::test]
    async fn hanging_backend_fails_with_timeout_within_the_bound() {
        let backend = FakeBackend::new(Behavior::Hang);
        let orchestrator = orchestrator_with(backend.clone(), test_config());

        let start = Instant::now();
        let id = orchestrator.provision(vm_spec()).await.unwrap();
        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(snapshot.state, ResourceState::Failed(FailureCause::Timeout));
        // 200ms bound; well under a second even with scheduling slack.
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(backend.reaps(), 1);
    }

    #[tokio::test]
    async fn stop_transitions_a_running_resource_to_stopped() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::ZERO,
        });
        let orchestrator = orchestrator_with(backend.clone(), test_config());

        let id = orchestrator.provision(container_spec("web")).await.unwrap();
        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snapshot.state, ResourceState::Running);

        orchestrator.stop(&id).await.unwrap();
        let snapshot = orchestrator.get(&id).await.unwrap();
        assert_eq!(snapshot.state, ResourceState::Stopped);
        assert_eq!(backend.stops(), 1);
    }

    #[tokio::test]
    async fn stop_on_a_terminal_resource_is_invalid_state() {
        let backend = FakeBackend::new(Behavior::Fail);
        let orchestrator = orchestrator_with(backend, test_config());

        let id = orchestrator.provision(vm_spec()).await.unwrap();
        orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();

        let err = orchestrator.stop(&id).await.unwrap_err();
        assert!(matches!(err, SkiffError::InvalidState(_)), "got {err:?}");

        let err = orchestrator.stop("no-such-id").await.unwrap_err();
        assert!(matches!(err, SkiffError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn concurrent_provision_and_stop_settle_in_one_terminal_state() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::from_millis(150),
        });
        let config = OrchestratorConfig {
            provision_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let orchestrator = orchestrator_with(backend.clone(), config);

        let id = orchestrator.provision(container_spec("racy")).await.unwrap();
        let start = Instant::now();
        loop {
            if orchestrator.get(&id).await.unwrap().state == ResourceState::Provisioning {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(1), "worker never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Provision is in flight; this must cancel it, not race it.
        orchestrator.stop(&id).await.unwrap();

        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            snapshot.state,
            ResourceState::Failed(FailureCause::Cancelled)
        );
        assert!(backend.reaps() >= 1);

        // The terminal state is stable across repeated reads.
        for _ in 0..3 {
            let again = orchestrator.get(&id).await.unwrap();
            assert_eq!(again.state, snapshot.state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn duplicate_active_names_conflict_until_terminal() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::ZERO,
        });
        let orchestrator = orchestrator_with(backend, test_config());

        let id = orchestrator.provision(container_spec("web")).await.unwrap();
        orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();

        let err = orchestrator
            .provision(container_spec("web"))
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::ResourceConflict(_)), "got {err:?}");

        orchestrator.stop(&id).await.unwrap();
        // A terminal resource frees the name for a fresh id.
        let second = orchestrator.provision(container_spec("web")).await.unwrap();
        assert_ne!(second, id);
    }

    #[tokio::test]
    async fn loaded_vm_config_reaches_the_backend_unchanged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"vm_name": "test", "ram_mb": 1024, "cpu_cores": 2, "disk_size_gb": 10}}"#
        )
        .unwrap();
        let spec = VmSpec::from_json_file(file.path()).unwrap();

        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::ZERO,
        });
        let orchestrator = orchestrator_with(backend.clone(), test_config());
        let id = orchestrator.provision(ResourceSpec::Vm(spec)).await.unwrap();
        orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();

        let seen = backend.specs.lock().unwrap();
        match &seen[0] {
            ResourceSpec::Vm(vm) => {
                assert_eq!(vm.vm_name, "test");
                assert_eq!(vm.ram_mb, 1024);
                assert_eq!(vm.cpu_cores, 2);
                assert_eq!(vm.disk_size_gb, 10);
            }
            other => panic!("expected a vm spec, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_notice_moves_running_to_stopped() {
        let backend = FakeBackend::with_exit_notice(Behavior::Succeed {
            delay: Duration::ZERO,
        });
        let orchestrator = orchestrator_with(backend.clone(), test_config());

        let id = orchestrator.provision(container_spec("web")).await.unwrap();
        let snapshot = orchestrator
            .wait_settled(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snapshot.state, ResourceState::Running);

        let tx = backend.exit_tx.lock().unwrap().take().unwrap();
        tx.send(None).unwrap();

        let start = Instant::now();
        loop {
            let snapshot = orchestrator.get(&id).await.unwrap();
            if snapshot.state == ResourceState::Stopped {
                break;
            }
            assert!(
                start.elapsed() < Duration::from_secs(1),
                "exit notice never folded into the registry"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn resources_with_distinct_ids_provision_concurrently() {
        let backend = FakeBackend::new(Behavior::Succeed {
            delay: Duration::from_millis(80),
        });
        let config = OrchestratorConfig {
            provision_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let orchestrator = orchestrator_with(backend.clone(), config);

        let start = Instant::now();
        let a = orchestrator.provision(container_spec("a")).await.unwrap();
        let b = orchestrator.provision(container_spec("b")).await.unwrap();
        let c = orchestrator.provision(container_spec("c")).await.unwrap();
        for id in [&a, &b, &c] {
            let snapshot = orchestrator
                .wait_settled(id, Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(snapshot.state, ResourceState::Running);
        }
        // Three 80ms provisions in parallel finish far sooner than serially.
        assert!(start.elapsed() < Duration::from_millis(240));
        assert_eq!(backend.provisions(), 3);
    }
}
