//! Sequence Orchestrator
//!
//! [`Conductor`] is the public entry point. It owns the registries, the
//! resource manager and the execution queue, and drives every admitted
//! execution beat by beat:
//! - Protects callbacks in `play` payloads before they cross into the baton
//! - Deduplicates equivalent in-flight requests
//! - Claims declared resources and queues, rejects or interrupts on conflict
//! - Runs `chained` requests inline and everything else on its own task
//! - Releases resources, emits the lifecycle event and drains the queue on
//!   termination
//!
//! Each shared structure sits behind its own coarse lock. The scheduler
//! lock is taken before the resource lock, so conflict check and claim
//! happen atomically; no lock is held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::beat::{run_beat, BeatOutcome};
use super::context::{ExecutionControl, ExecutionStatus, Priority, RequestId, SequenceExecutionContext};
use super::instances::{InstanceTracker, SequenceInstance};
use super::mutation::MutationSink;
use super::queue::{ExecutionQueue, QueuedSummary};
use super::resources::{ClaimOutcome, Claimant, ResourceManager, ResourceOwner};
use crate::callbacks::{CallbackRegistry, Payload};
use crate::config::{ConductorConfig, ConflictPolicy};
use crate::error::{ConductorError, Result};
use crate::events::{
    EventBus, EventCallback, Subscription, PLUGIN_MOUNTED, RESERVED_EVENTS, SEQUENCE_QUEUED, SEQUENCE_STARTED,
};
use crate::monitoring::{fingerprint, DuplicationDetector, ExecutionRecord, ExecutionTimeline, Statistics, StatisticsSnapshot};
use crate::plugin::{validate_mount, HandlerMap, MountResult, PluginRegistry};
use crate::sequence::{ErrorHandling, Sequence, SequenceRegistry};
use crate::sync::lock;

/// Plugin id of the built-in subscriber that releases correlations.
pub const CORRELATION_CLEANUP_PLUGIN: &str = "conductor:correlation-cleanup";

type ExecutionFuture = Pin<Box<dyn Future<Output = ExecutionStatus> + Send>>;

/// Diagnostic view of the scheduler.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub max_concurrent: usize,
    pub active: Vec<QueuedSummary>,
    pub queued: Vec<QueuedSummary>,
}

struct ActiveExecution {
    control: Arc<ExecutionControl>,
    sequence_id: String,
    priority: Priority,
    since: DateTime<Utc>,
}

struct Scheduler {
    queue: ExecutionQueue,
    active: HashMap<RequestId, ActiveExecution>,
    /// Abandoned requests whose terminal event is still being delivered
    closing: HashMap<RequestId, Arc<ExecutionControl>>,
    dedup: DuplicationDetector,
    instances: InstanceTracker,
    max_concurrent: usize,
}

impl Scheduler {
    fn control(&self, request_id: &RequestId) -> Option<Arc<ExecutionControl>> {
        self.active
            .get(request_id)
            .map(|active| Arc::clone(&active.control))
            .or_else(|| {
                self.queue
                    .get(request_id)
                    .map(|ctx| Arc::clone(&ctx.control))
            })
            .or_else(|| self.closing.get(request_id).cloned())
    }

    fn activate(&mut self, ctx: &mut SequenceExecutionContext) {
        ctx.transition(ExecutionStatus::Active);
        self.instances.update(&ctx.request_id, ExecutionStatus::Active);
        self.active.insert(
            ctx.request_id.clone(),
            ActiveExecution {
                control: Arc::clone(&ctx.control),
                sequence_id: ctx.sequence.id.clone(),
                priority: ctx.priority,
                since: Utc::now(),
            },
        );
    }

    /// Requests cancellation of executions that lost their resources.
    fn interrupt(&self, interrupted: &[RequestId]) {
        for request_id in interrupted {
            if let Some(active) = self.active.get(request_id) {
                info!("Cancelling interrupted execution {}", request_id);
                active.control.cancel();
            }
        }
    }

    fn load(&self) -> usize {
        self.active.len() + self.queue.len() + self.closing.len()
    }
}

struct Inner {
    config: Mutex<ConductorConfig>,
    bus: EventBus,
    sequences: Mutex<SequenceRegistry>,
    plugins: Mutex<PluginRegistry>,
    callbacks: CallbackRegistry,
    scheduler: Mutex<Scheduler>,
    resources: Mutex<ResourceManager>,
    statistics: Mutex<Statistics>,
    mutation_sink: Mutex<Option<Arc<dyn MutationSink>>>,
    load: watch::Sender<usize>,
}

/// Where a start request came from and what it carries.
struct StartRequest {
    sequence: Arc<Sequence>,
    data: Value,
    priority: Priority,
    plugin_id: Option<String>,
    handlers: Option<Arc<HandlerMap>>,
    ancestors: Vec<RequestId>,
    correlation_ids: Vec<String>,
}

enum Admission {
    Duplicate(RequestId),
    Run(SequenceExecutionContext),
    Queued {
        request_id: RequestId,
        reason: String,
    },
    Rejected(ConductorError),
}

/// The sequence orchestrator.
///
/// Cloning is cheap and every clone drives the same state; handlers reach
/// it through [`BeatInvocation`](crate::plugin::BeatInvocation).
///
/// # Example
///
/// ```rust,no_run
/// use conductor::{Conductor, ConductorConfig};
/// use conductor::execution::Priority;
/// use conductor::plugin::{Handler, HandlerMap};
/// use conductor::sequence::{Beat, Movement, Sequence};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let conductor = Conductor::new(ConductorConfig::default());
///
///     let sequence = Sequence::new("greet", "Greet")
///         .with_movement(Movement::new("main", "Main").with_beat(Beat::new(1, "hello", "say")));
///     let handlers = HandlerMap::new().with("say", Handler::sync(|_| Ok(Some(json!({"said": true})))));
///     assert!(conductor.mount(sequence, handlers, Some("greeter")).success);
///
///     let request = conductor.play("greeter", "greet", json!({}), Priority::Normal).await?;
///     conductor.wait_for(&request).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<Inner>,
}

impl Conductor {
    pub fn new(config: ConductorConfig) -> Self {
        let (load, _) = watch::channel(0);
        let inner = Inner {
            bus: EventBus::new(),
            sequences: Mutex::new(SequenceRegistry::new()),
            plugins: Mutex::new(PluginRegistry::new()),
            callbacks: CallbackRegistry::new(),
            scheduler: Mutex::new(Scheduler {
                queue: ExecutionQueue::new(),
                active: HashMap::new(),
                closing: HashMap::new(),
                dedup: DuplicationDetector::new(),
                instances: InstanceTracker::new(config.instance_retention()),
                max_concurrent: config.max_concurrent.max(1),
            }),
            resources: Mutex::new(ResourceManager::new(config.conflict_policy.clone())),
            statistics: Mutex::new(Statistics::new(config.statistics_window)),
            mutation_sink: Mutex::new(None),
            load,
            config: Mutex::new(config),
        };

        let conductor = Self {
            inner: Arc::new(inner),
        };
        conductor.install_correlation_cleanup();
        conductor
    }

    /// Releases one reference per correlation id on every terminal event.
    fn install_correlation_cleanup(&self) {
        for event in RESERVED_EVENTS {
            let callbacks = self.inner.callbacks.clone();
            self.inner.bus.subscribe(
                event,
                EventCallback::sync(move |data| {
                    let ids = data
                        .get("correlationIds")
                        .and_then(Value::as_array)
                        .map(|ids| ids.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                        .unwrap_or_default();
                    for id in ids {
                        callbacks.release(id);
                    }
                    Ok(())
                }),
                Some(CORRELATION_CLEANUP_PLUGIN),
            );
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }

    pub fn config(&self) -> ConductorConfig {
        lock(&self.inner.config).clone()
    }

    /// Sets the cap on concurrently active executions and admits whatever
    /// the new cap allows.
    pub fn set_max_concurrent(&self, max: usize) {
        let max = max.max(1);
        lock(&self.inner.config).set_max_concurrent(max);
        lock(&self.inner.scheduler).max_concurrent = max;
        self.drain_queue();
    }

    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        lock(&self.inner.config).set_conflict_policy(policy.clone());
        lock(&self.inner.resources).set_policy(policy);
    }

    pub fn set_signal_timeout(&self, timeout: Duration) {
        lock(&self.inner.config).set_signal_timeout(timeout);
    }

    pub fn set_statistics_window(&self, window: usize) {
        lock(&self.inner.config).set_statistics_window(window);
        lock(&self.inner.statistics).set_window(window);
    }

    pub fn set_instance_retention(&self, retention: Duration) {
        lock(&self.inner.config).set_instance_retention(retention);
        lock(&self.inner.scheduler).instances.set_retention(retention);
    }

    /// Installs the collaborator that receives each beat's mutations.
    pub fn set_mutation_sink(&self, sink: Arc<dyn MutationSink>) {
        *lock(&self.inner.mutation_sink) = Some(sink);
    }

    pub fn clear_mutation_sink(&self) {
        *lock(&self.inner.mutation_sink) = None;
    }

    pub(crate) fn mutation_sink(&self) -> Option<Arc<dyn MutationSink>> {
        lock(&self.inner.mutation_sink).clone()
    }

    pub(crate) fn record_beat(&self, errored: bool) {
        lock(&self.inner.statistics).record_beat(errored);
    }

    /// Validates and registers a sequence without handlers.
    pub fn register(&self, sequence: Sequence) -> Result<Arc<Sequence>> {
        lock(&self.inner.sequences).register(sequence)
    }

    /// Removes a sequence and its mounts. In-flight executions keep running
    /// the definition they started with.
    pub fn unregister(&self, sequence_id: &str) -> bool {
        let removed = lock(&self.inner.sequences).unregister(sequence_id).is_some();
        lock(&self.inner.plugins).remove_sequence(sequence_id);
        if removed {
            info!("Unregistered sequence '{}'", sequence_id);
        }
        removed
    }

    /// Resolves a registered sequence by id or display name.
    pub fn sequence(&self, id_or_name: &str) -> Option<Arc<Sequence>> {
        lock(&self.inner.sequences).resolve(id_or_name).ok()
    }

    pub fn sequence_ids(&self) -> Vec<String> {
        lock(&self.inner.sequences).ids()
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        lock(&self.inner.plugins).plugin_ids()
    }

    /// Validates and mounts `sequence` with its handlers.
    ///
    /// The plugin id defaults to the sequence id. On failure nothing is
    /// registered and the result says why.
    pub fn mount(&self, sequence: Sequence, handlers: HandlerMap, plugin_id: Option<&str>) -> MountResult {
        let plugin_id = plugin_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| sequence.id.clone());

        if let Err(issues) = validate_mount(&sequence, &handlers) {
            warn!(
                "Refusing to mount '{}' under plugin '{}': {} issue(s)",
                sequence.id,
                plugin_id,
                issues.len()
            );
            return MountResult::rejected(&plugin_id, &sequence.id, &issues);
        }

        let sequence_id = sequence.id.clone();
        lock(&self.inner.sequences).insert(sequence);
        lock(&self.inner.plugins).insert(&plugin_id, &sequence_id, handlers);
        info!("Mounted sequence '{}' under plugin '{}'", sequence_id, plugin_id);

        self.inner.bus.emit(
            PLUGIN_MOUNTED,
            json!({"pluginId": plugin_id, "sequenceId": sequence_id}),
        );
        MountResult::mounted(&plugin_id, &sequence_id)
    }

    /// Plays a mounted sequence.
    ///
    /// Callbacks inside `payload` are moved into the correlation registry
    /// first. Returns the new request id, or the id of an equivalent
    /// request already in flight.
    pub async fn play(
        &self,
        plugin_id: &str,
        sequence_id: &str,
        payload: impl Into<Payload>,
        priority: Priority,
    ) -> Result<RequestId> {
        self.play_from(Vec::new(), plugin_id, sequence_id, payload.into(), priority)
            .await
    }

    pub(crate) async fn play_from(
        &self,
        ancestors: Vec<RequestId>,
        plugin_id: &str,
        sequence_id: &str,
        payload: Payload,
        priority: Priority,
    ) -> Result<RequestId> {
        let sequence = lock(&self.inner.sequences).resolve(sequence_id)?;
        let handlers = lock(&self.inner.plugins).handlers(plugin_id, &sequence.id)?;
        let protected = self.inner.callbacks.protect(payload);

        self.start(StartRequest {
            sequence,
            data: protected.data,
            priority,
            plugin_id: Some(plugin_id.to_string()),
            handlers: Some(handlers),
            ancestors,
            correlation_ids: protected.correlation_ids,
        })
        .await
    }

    /// Starts a sequence by id or display name, using the handlers of the
    /// first plugin that mounted it.
    pub async fn start_sequence(
        &self,
        id_or_name: &str,
        data: impl Into<Payload>,
        priority: Priority,
    ) -> Result<RequestId> {
        let sequence = lock(&self.inner.sequences).resolve(id_or_name)?;
        let mounted = lock(&self.inner.plugins).find_sequence(&sequence.id);
        let protected = self.inner.callbacks.protect(data.into());
        let (plugin_id, handlers) = match mounted {
            Some((plugin_id, handlers)) => (Some(plugin_id), Some(handlers)),
            None => (None, None),
        };

        self.start(StartRequest {
            sequence,
            data: protected.data,
            priority,
            plugin_id,
            handlers,
            ancestors: Vec::new(),
            correlation_ids: protected.correlation_ids,
        })
        .await
    }

    async fn start(&self, request: StartRequest) -> Result<RequestId> {
        let StartRequest {
            sequence,
            data,
            priority,
            plugin_id,
            handlers,
            ancestors,
            correlation_ids,
        } = request;

        for id in &correlation_ids {
            self.inner.callbacks.retain(id);
        }

        let resources = sequence.resolve_resources(&data);
        let request_id = RequestId::generate(&sequence.id);
        let mut ctx = SequenceExecutionContext::new(request_id.clone(), sequence, data, priority);
        ctx.fingerprint = fingerprint(&ctx.sequence.id, &ctx.baton.snapshot());
        ctx.plugin_id = plugin_id;
        ctx.handlers = handlers;
        ctx.ancestors = ancestors;
        ctx.resources = resources;
        ctx.correlation_ids = correlation_ids;

        let held = ctx.correlation_ids.clone();
        let admission = self.admit(ctx);

        match admission {
            Admission::Duplicate(existing) => {
                info!(
                    "Duplicate request for '{}' ignored; returning {}",
                    request_id, existing
                );
                self.release_correlations(&held);
                lock(&self.inner.statistics).record_duplicate();
                Ok(existing)
            }
            Admission::Rejected(err) => {
                warn!("Request {} rejected: {}", request_id, err);
                self.release_correlations(&held);
                lock(&self.inner.statistics).record_rejected();
                Err(err)
            }
            Admission::Queued { request_id, reason } => {
                info!("Request {} queued ({})", request_id, reason);
                lock(&self.inner.statistics).record_queued();
                self.inner.bus.emit(
                    SEQUENCE_QUEUED,
                    json!({"requestId": request_id, "reason": reason}),
                );
                Ok(request_id)
            }
            Admission::Run(ctx) => {
                let chained = ctx.priority == Priority::Chained;
                lock(&self.inner.statistics).record_started();
                self.inner.bus.emit(SEQUENCE_STARTED, lifecycle_payload(&ctx, None));

                if chained {
                    let sequence_id = ctx.sequence.id.clone();
                    let status = run_execution(self.clone(), ctx).await;
                    if status == ExecutionStatus::Completed {
                        Ok(request_id)
                    } else {
                        Err(ConductorError::ChainedExecutionFailed {
                            sequence_id,
                            request_id,
                            status,
                        })
                    }
                } else {
                    self.launch(ctx);
                    Ok(request_id)
                }
            }
        }
    }

    /// Dedup, capacity and conflict check plus claim, all under the
    /// scheduler lock.
    fn admit(&self, mut ctx: SequenceExecutionContext) -> Admission {
        let mut scheduler = lock(&self.inner.scheduler);

        if let Some(existing) = scheduler.dedup.find(&ctx.fingerprint) {
            return Admission::Duplicate(existing.clone());
        }

        ctx.instance_number = scheduler
            .instances
            .create(&ctx.request_id, &ctx.sequence.id, &ctx.resources);

        let at_capacity =
            ctx.priority != Priority::Chained && scheduler.active.len() >= scheduler.max_concurrent;
        let outcome = if at_capacity {
            None
        } else {
            let mut resources = lock(&self.inner.resources);
            Some(claim(&mut resources, &ctx))
        };

        let admission = match outcome {
            Some(ClaimOutcome::Granted { interrupted }) => {
                scheduler.interrupt(&interrupted);
                scheduler.dedup.track(&ctx.fingerprint, &ctx.request_id);
                scheduler.activate(&mut ctx);
                Admission::Run(ctx)
            }
            None => {
                let request_id = ctx.request_id.clone();
                scheduler.dedup.track(&ctx.fingerprint, &request_id);
                scheduler.queue.push(ctx);
                Admission::Queued {
                    request_id,
                    reason: format!("{} executions active", scheduler.max_concurrent),
                }
            }
            Some(ClaimOutcome::Queued {
                resource_id,
                owner,
                conflict,
            }) if ctx.priority == Priority::Chained => {
                scheduler
                    .instances
                    .update(&ctx.request_id, ExecutionStatus::Failed);
                Admission::Rejected(ConductorError::Conflict {
                    resource_id,
                    owner,
                    conflict,
                })
            }
            Some(ClaimOutcome::Queued {
                resource_id,
                owner,
                conflict,
            }) => {
                let request_id = ctx.request_id.clone();
                scheduler.dedup.track(&ctx.fingerprint, &request_id);
                scheduler.queue.push(ctx);
                Admission::Queued {
                    request_id,
                    reason: format!("resource '{}' held by {} ({})", resource_id, owner, conflict),
                }
            }
            Some(ClaimOutcome::Rejected {
                resource_id,
                owner,
                conflict,
            }) => {
                scheduler
                    .instances
                    .update(&ctx.request_id, ExecutionStatus::Failed);
                Admission::Rejected(ConductorError::Conflict {
                    resource_id,
                    owner,
                    conflict,
                })
            }
        };

        self.inner.load.send_replace(scheduler.load());
        admission
    }

    /// Drops the references a request that never got admitted was holding.
    fn release_correlations(&self, correlation_ids: &[String]) {
        for id in correlation_ids {
            self.inner.callbacks.release(id);
        }
    }

    /// Spawns an admitted execution on the current runtime.
    fn launch(&self, ctx: SequenceExecutionContext) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_execution(self.clone(), ctx));
            }
            Err(_) => {
                error!(
                    "No async runtime available to run {}; marking it failed",
                    ctx.request_id
                );
                self.abandon(ctx, ExecutionStatus::Failed, Some("no async runtime".to_string()));
            }
        }
    }

    async fn execute(&self, mut ctx: SequenceExecutionContext) -> ExecutionStatus {
        let sequence = Arc::clone(&ctx.sequence);
        let signal_timeout = self.config().signal_timeout();
        let mut timeline = ExecutionTimeline::new();
        let mut beats_executed = 0;
        let mut beats_errored = 0;
        let mut cancelled = false;
        let mut failure: Option<String> = None;

        info!(
            "Executing '{}' as {} ({}, {} beat(s))",
            sequence.display_name(),
            ctx.request_id,
            ctx.priority,
            sequence.beat_count()
        );

        'movements: for (index, movement) in sequence.movements.iter().enumerate() {
            ctx.movement_index = index;

            for beat in movement.ordered_beats() {
                if ctx.control.is_cancelled() {
                    cancelled = true;
                    break 'movements;
                }
                ctx.beat = Some(beat.beat);

                let outcome = run_beat(self, &ctx, movement, beat, &mut timeline, signal_timeout).await;
                let message = match outcome {
                    BeatOutcome::Completed => {
                        beats_executed += 1;
                        continue;
                    }
                    BeatOutcome::Cancelled => {
                        cancelled = true;
                        break 'movements;
                    }
                    BeatOutcome::Errored(message) => {
                        beats_executed += 1;
                        beats_errored += 1;
                        message
                    }
                };

                match beat.error_handling {
                    ErrorHandling::Continue => {
                        debug!("Continuing after failed beat {}", beat.beat);
                    }
                    ErrorHandling::Abort => {
                        warn!(
                            "Aborting movement '{}' of {} after beat {}",
                            movement.id, ctx.request_id, beat.beat
                        );
                        continue 'movements;
                    }
                    ErrorHandling::AbortSequence => {
                        failure = Some(message);
                        break 'movements;
                    }
                }
            }
        }

        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        self.finish(ctx, status, failure, &timeline, (beats_executed, beats_errored))
            .await;
        status
    }

    async fn finish(
        &self,
        mut ctx: SequenceExecutionContext,
        status: ExecutionStatus,
        failure: Option<String>,
        timeline: &ExecutionTimeline,
        (beats_executed, beats_errored): (usize, usize),
    ) {
        ctx.transition(status);
        let released = lock(&self.inner.resources).release(&ctx.request_id, &ctx.resources);

        match status {
            ExecutionStatus::Completed => info!(
                "Sequence '{}' ({}) completed in {} ms",
                ctx.sequence.id,
                ctx.request_id,
                ctx.duration_ms().unwrap_or_default()
            ),
            _ => warn!(
                "Sequence '{}' ({}) ended {}{}",
                ctx.sequence.id,
                ctx.request_id,
                status,
                failure
                    .as_deref()
                    .map(|f| format!(": {}", f))
                    .unwrap_or_default()
            ),
        }
        debug!("{} released {} resource(s)", ctx.request_id, released);

        lock(&self.inner.statistics).record_finished(ExecutionRecord {
            request_id: ctx.request_id.clone(),
            sequence_id: ctx.sequence.id.clone(),
            plugin_id: ctx.plugin_id.clone(),
            priority: ctx.priority,
            status,
            started_at: ctx.started_at,
            finished_at: ctx.finished_at.unwrap_or_else(Utc::now),
            duration_ms: ctx.duration_ms(),
            beats_executed,
            beats_errored,
            beat_durations: timeline.durations(),
            error: failure.clone(),
        });

        if let Some(event) = status.lifecycle_event() {
            let report = self
                .inner
                .bus
                .emit_and_await(event, lifecycle_payload(&ctx, failure.as_deref()))
                .await;
            if report.failed > 0 {
                warn!("{} subscriber(s) failed on '{}'", report.failed, event);
            }
        }

        self.retire(&ctx);
        self.drain_queue();
    }

    /// Terminates an execution that never ran a beat.
    ///
    /// With a runtime available the terminal event is awaited on a spawned
    /// task, and the request stays visible to [`wait_for`](Self::wait_for)
    /// until its subscribers are done.
    fn abandon(&self, mut ctx: SequenceExecutionContext, status: ExecutionStatus, error: Option<String>) {
        ctx.transition(status);
        lock(&self.inner.resources).release(&ctx.request_id, &ctx.resources);

        lock(&self.inner.statistics).record_finished(ExecutionRecord {
            request_id: ctx.request_id.clone(),
            sequence_id: ctx.sequence.id.clone(),
            plugin_id: ctx.plugin_id.clone(),
            priority: ctx.priority,
            status,
            started_at: ctx.started_at,
            finished_at: ctx.finished_at.unwrap_or_else(Utc::now),
            duration_ms: ctx.duration_ms(),
            beats_executed: 0,
            beats_errored: 0,
            beat_durations: BTreeMap::new(),
            error: error.clone(),
        });

        lock(&self.inner.scheduler)
            .closing
            .insert(ctx.request_id.clone(), Arc::clone(&ctx.control));

        match Handle::try_current() {
            Ok(handle) => {
                let conductor = self.clone();
                handle.spawn(async move {
                    if let Some(event) = status.lifecycle_event() {
                        let report = conductor
                            .inner
                            .bus
                            .emit_and_await(event, lifecycle_payload(&ctx, error.as_deref()))
                            .await;
                        if report.failed > 0 {
                            warn!("{} subscriber(s) failed on '{}'", report.failed, event);
                        }
                    }
                    conductor.retire(&ctx);
                });
            }
            Err(_) => {
                if let Some(event) = status.lifecycle_event() {
                    self.inner
                        .bus
                        .emit(event, lifecycle_payload(&ctx, error.as_deref()));
                }
                self.retire(&ctx);
            }
        }
    }

    /// Publishes the terminal status and forgets the request.
    fn retire(&self, ctx: &SequenceExecutionContext) {
        ctx.publish();
        let mut scheduler = lock(&self.inner.scheduler);
        scheduler.active.remove(&ctx.request_id);
        scheduler.closing.remove(&ctx.request_id);
        scheduler.dedup.forget(&ctx.fingerprint, &ctx.request_id);
        scheduler.instances.update(&ctx.request_id, ctx.status);
        self.inner.load.send_replace(scheduler.load());
    }

    /// Admits queued executions in priority order while capacity and
    /// resources allow.
    fn drain_queue(&self) {
        let mut launches = Vec::new();
        let mut rejected = Vec::new();
        {
            let mut scheduler = lock(&self.inner.scheduler);
            let pending = scheduler.queue.drain_ordered();
            let mut waiting = Vec::new();

            for mut ctx in pending {
                if scheduler.active.len() >= scheduler.max_concurrent {
                    waiting.push(ctx);
                    continue;
                }

                let outcome = {
                    let mut resources = lock(&self.inner.resources);
                    claim(&mut resources, &ctx)
                };
                match outcome {
                    ClaimOutcome::Granted { interrupted } => {
                        scheduler.interrupt(&interrupted);
                        scheduler.activate(&mut ctx);
                        launches.push(ctx);
                    }
                    ClaimOutcome::Queued { .. } => waiting.push(ctx),
                    ClaimOutcome::Rejected {
                        resource_id,
                        owner,
                        conflict,
                    } => {
                        let reason = ConductorError::Conflict {
                            resource_id,
                            owner,
                            conflict,
                        }
                        .to_string();
                        rejected.push((ctx, reason));
                    }
                }
            }

            scheduler.queue.restore(waiting);
            self.inner.load.send_replace(scheduler.load());
        }

        for (ctx, reason) in rejected {
            warn!("Queued request {} rejected: {}", ctx.request_id, reason);
            lock(&self.inner.statistics).record_rejected();
            self.abandon(ctx, ExecutionStatus::Failed, Some(reason));
        }

        for ctx in launches {
            debug!("Dequeued {}", ctx.request_id);
            lock(&self.inner.statistics).record_started();
            self.inner.bus.emit(SEQUENCE_STARTED, lifecycle_payload(&ctx, None));
            self.launch(ctx);
        }
    }

    pub fn subscribe(&self, event: &str, callback: EventCallback, plugin_id: Option<&str>) -> Subscription {
        self.inner.bus.subscribe(event, callback, plugin_id)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.bus.unsubscribe(subscription)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        let (active, queued) = {
            let scheduler = lock(&self.inner.scheduler);
            (scheduler.active.len(), scheduler.queue.len())
        };
        lock(&self.inner.statistics).snapshot(active, queued)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let scheduler = lock(&self.inner.scheduler);
        let mut active: Vec<QueuedSummary> = scheduler
            .active
            .iter()
            .map(|(request_id, execution)| QueuedSummary {
                request_id: request_id.clone(),
                sequence_id: execution.sequence_id.clone(),
                priority: execution.priority,
                since: execution.since,
            })
            .collect();
        active.sort_by(|a, b| a.since.cmp(&b.since));

        QueueStatus {
            max_concurrent: scheduler.max_concurrent,
            active,
            queued: scheduler.queue.summaries(),
        }
    }

    pub fn resource_ownership(&self) -> BTreeMap<String, ResourceOwner> {
        lock(&self.inner.resources).ownership()
    }

    /// Retained instances of one sequence, ordered by instance number.
    pub fn instances(&self, sequence_id: &str) -> Vec<SequenceInstance> {
        let mut scheduler = lock(&self.inner.scheduler);
        scheduler.instances.prune();
        scheduler.instances.for_sequence(sequence_id)
    }

    /// Current status of a request still in flight or in the statistics window.
    pub fn status(&self, request_id: &RequestId) -> Option<ExecutionStatus> {
        let control = lock(&self.inner.scheduler).control(request_id);
        match control {
            Some(control) => Some(control.status()),
            None => lock(&self.inner.statistics)
                .find(request_id)
                .map(|record| record.status),
        }
    }

    /// Cancels a queued or active request.
    ///
    /// A queued request is terminated right away; an active one stops
    /// before its next beat.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let queued = {
            let mut scheduler = lock(&self.inner.scheduler);
            if let Some(active) = scheduler.active.get(request_id) {
                info!("Cancellation requested for {}", request_id);
                return active.control.cancel();
            }
            scheduler.queue.remove(request_id)
        };

        match queued {
            Some(ctx) => {
                info!("Cancelled queued request {}", request_id);
                self.abandon(ctx, ExecutionStatus::Cancelled, None);
                true
            }
            None => false,
        }
    }

    /// Cancels everything queued or active. Returns how many requests were
    /// affected.
    pub fn reset(&self) -> usize {
        let (queued, controls) = {
            let mut scheduler = lock(&self.inner.scheduler);
            let queued = scheduler.queue.drain_ordered();
            let controls: Vec<Arc<ExecutionControl>> = scheduler
                .active
                .values()
                .map(|active| Arc::clone(&active.control))
                .collect();
            (queued, controls)
        };

        let affected = queued.len() + controls.len();
        info!("Reset: cancelling {} request(s)", affected);

        for ctx in queued {
            self.abandon(ctx, ExecutionStatus::Cancelled, None);
        }
        for control in controls {
            control.cancel();
        }
        affected
    }

    /// Raises `signal` for a queued or active request.
    pub fn signal(&self, request_id: &RequestId, signal: &str) -> bool {
        let control = lock(&self.inner.scheduler).control(request_id);
        match control {
            Some(control) => {
                control.raise(signal);
                true
            }
            None => false,
        }
    }

    /// Waits for a request to reach a terminal status.
    pub async fn wait_for(&self, request_id: &RequestId) -> Result<ExecutionStatus> {
        let control = lock(&self.inner.scheduler).control(request_id);

        if let Some(control) = control {
            let mut status_rx = control.subscribe_status();
            let status = status_rx
                .wait_for(ExecutionStatus::is_terminal)
                .await
                .map(|status| *status);
            if let Ok(status) = status {
                return Ok(status);
            }
        }

        lock(&self.inner.statistics)
            .find(request_id)
            .map(|record| record.status)
            .ok_or_else(|| ConductorError::UnknownRequest(request_id.clone()))
    }

    /// Waits until nothing is active or queued.
    pub async fn wait_idle(&self) {
        let mut load_rx = self.inner.load.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = load_rx.wait_for(|load| *load == 0).await;
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.inner.scheduler).load() == 0
    }
}

impl Default for Conductor {
    fn default() -> Self {
        Self::new(ConductorConfig::default())
    }
}

impl fmt::Debug for Conductor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheduler = lock(&self.inner.scheduler);
        f.debug_struct("Conductor")
            .field("active", &scheduler.active.len())
            .field("queued", &scheduler.queue.len())
            .finish()
    }
}

/// Boxed so a chained execution can run inside a beat of another.
fn run_execution(conductor: Conductor, ctx: SequenceExecutionContext) -> ExecutionFuture {
    Box::pin(async move { conductor.execute(ctx).await })
}

fn claim(resources: &mut ResourceManager, ctx: &SequenceExecutionContext) -> ClaimOutcome {
    let instance_id = ctx.instance_id();
    let symphony_name = ctx
        .plugin_id
        .clone()
        .unwrap_or_else(|| ctx.sequence.display_name().to_string());

    resources.claim(
        &ctx.resources,
        &Claimant {
            execution_id: &ctx.request_id,
            sequence_id: &ctx.sequence.id,
            symphony_name: &symphony_name,
            instance_id: &instance_id,
            priority: ctx.priority,
            ancestors: &ctx.ancestors,
        },
    )
}

fn lifecycle_payload(ctx: &SequenceExecutionContext, error: Option<&str>) -> Value {
    json!({
        "requestId": ctx.request_id,
        "sequenceId": ctx.sequence.id,
        "pluginId": ctx.plugin_id,
        "instanceId": ctx.instance_id(),
        "priority": ctx.priority,
        "status": ctx.status,
        "correlationIds": ctx.correlation_ids,
        "durationMs": ctx.duration_ms(),
        "error": error,
    })
}
