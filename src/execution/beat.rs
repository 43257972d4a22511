//! Single Beat Execution
//!
//! Runs one beat of an execution:
//! - Waits according to the beat's timing mode
//! - Emits `beat:started` and the beat's own event
//! - Invokes the bound handler on its own task
//! - Merges the returned partial into the baton
//! - Hands buffered mutations to the sink
//! - Emits `beat:completed` or `beat:errored`
//!
//! What a failure means for the rest of the sequence is decided by the
//! caller from the beat's error-handling mode.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::time::sleep;

use super::context::{ExecutionControl, SequenceExecutionContext};
use super::engine::Conductor;
use super::mutation::MutationBuffer;
use crate::events::{BEAT_COMPLETED, BEAT_ERRORED, BEAT_STARTED};
use crate::monitoring::{beat_label, BeatPhase, ExecutionTimeline};
use crate::plugin::{BeatInvocation, Handler};
use crate::sequence::{Beat, Movement, Timing};

/// How one beat ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BeatOutcome {
    Completed,
    Errored(String),
    /// Cancellation was observed while waiting to start
    Cancelled,
}

/// Result of waiting for a beat's timing condition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Gate {
    Proceed,
    Cancelled,
    TimedOut(String),
}

/// Length of one beat at `tempo` bpm.
pub fn beat_interval(tempo: u32) -> Duration {
    Duration::from_millis(60_000 / u64::from(tempo.max(1)))
}

/// Waits until `beat` may start.
pub(crate) async fn gate(beat: &Beat, tempo: u32, control: &ExecutionControl, signal_timeout: Duration) -> Gate {
    match beat.timing {
        Timing::Immediate => Gate::Proceed,
        Timing::AfterBeat | Timing::NextTick => {
            tokio::task::yield_now().await;
            Gate::Proceed
        }
        Timing::Delayed => tokio::select! {
            _ = sleep(beat_interval(tempo)) => Gate::Proceed,
            _ = control.cancelled() => Gate::Cancelled,
        },
        Timing::WaitForSignal => {
            let signal = beat.signal.as_deref().unwrap_or(&beat.event);
            debug!("Beat {} waiting for signal '{}'", beat.beat, signal);
            tokio::select! {
                _ = control.signal(signal) => Gate::Proceed,
                _ = control.cancelled() => Gate::Cancelled,
                _ = sleep(signal_timeout) => Gate::TimedOut(format!(
                    "signal '{}' not raised within {} ms",
                    signal,
                    signal_timeout.as_millis()
                )),
            }
        }
    }
}

/// Runs `beat` of `movement` for `ctx`.
pub(crate) async fn run_beat(
    conductor: &Conductor,
    ctx: &SequenceExecutionContext,
    movement: &Movement,
    beat: &Beat,
    timeline: &mut ExecutionTimeline,
    signal_timeout: Duration,
) -> BeatOutcome {
    let label = beat_label(&movement.id, beat.beat);
    let bus = conductor.bus();
    let info = beat_payload(ctx, movement, beat);

    match gate(beat, ctx.sequence.tempo, &ctx.control, signal_timeout).await {
        Gate::Proceed => {}
        Gate::Cancelled => return BeatOutcome::Cancelled,
        Gate::TimedOut(message) => {
            warn!("Beat {} of '{}' timed out: {}", label, ctx.request_id, message);
            timeline.record(label, BeatPhase::Errored);
            conductor.record_beat(true);
            bus.emit_and_await(BEAT_ERRORED, errored_payload(info, beat, &message))
                .await;
            return BeatOutcome::Errored(message);
        }
    }

    timeline.record(label.clone(), BeatPhase::Started);
    bus.emit_and_await(BEAT_STARTED, info.clone()).await;

    let mut event_data = info.clone();
    extend(&mut event_data, json!({"data": beat.data, "baton": ctx.baton.snapshot()}));
    bus.emit_musical(&beat.event, event_data, beat.dynamics, beat.timing)
        .await;

    let started = Instant::now();
    let mutations = MutationBuffer::new();
    let handler = ctx
        .handlers
        .as_ref()
        .and_then(|handlers| handlers.get(&beat.handler))
        .cloned();

    let result = match handler {
        Some(handler) => {
            let invocation = BeatInvocation {
                request_id: ctx.request_id.clone(),
                ancestors: ctx.ancestors.clone(),
                sequence_id: ctx.sequence.id.clone(),
                movement_id: movement.id.clone(),
                beat: beat.clone(),
                baton: ctx.baton.clone(),
                conductor: conductor.clone(),
                mutations: mutations.clone(),
            };
            invoke(handler, invocation).await
        }
        None => Err(format!("handler '{}' is not mounted", beat.handler)),
    };

    if let Ok(Some(partial)) = &result {
        if !ctx.baton.merge(partial.clone()) {
            warn!(
                "Handler '{}' returned a non-object result; baton unchanged",
                beat.handler
            );
        }
    }

    flush_mutations(conductor, ctx, beat, &mutations);
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(_) => {
            ctx.control.raise(&beat.event);
            timeline.record(label, BeatPhase::Completed);
            conductor.record_beat(false);

            let mut payload = info;
            extend(&mut payload, json!({"durationMs": duration_ms}));
            bus.emit_and_await(BEAT_COMPLETED, payload).await;
            BeatOutcome::Completed
        }
        Err(message) => {
            error!(
                "Beat {} of '{}' failed in handler '{}': {}",
                label, ctx.request_id, beat.handler, message
            );
            timeline.record(label, BeatPhase::Errored);
            conductor.record_beat(true);

            let mut payload = errored_payload(info, beat, &message);
            extend(&mut payload, json!({"durationMs": duration_ms}));
            bus.emit_and_await(BEAT_ERRORED, payload).await;
            BeatOutcome::Errored(message)
        }
    }
}

/// Runs the handler on its own task so a panic surfaces as a beat error.
async fn invoke(handler: Handler, invocation: BeatInvocation) -> Result<Option<Value>, String> {
    let task = tokio::spawn(async move { handler.call(invocation).await });
    match task.await {
        Ok(Ok(partial)) => Ok(partial),
        Ok(Err(e)) => Err(e.message),
        Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Err(format!("handler task aborted: {}", e)),
    }
}

fn flush_mutations(conductor: &Conductor, ctx: &SequenceExecutionContext, beat: &Beat, buffer: &MutationBuffer) {
    let ops = buffer.take();
    if ops.is_empty() {
        return;
    }

    match conductor.mutation_sink() {
        Some(sink) => {
            let applied = catch_unwind(AssertUnwindSafe(|| sink.apply(&ctx.request_id, beat, &ops)));
            if applied.is_err() {
                error!("Mutation sink panicked on beat {} of '{}'", beat.beat, ctx.request_id);
            }
        }
        None => debug!(
            "No mutation sink; dropping {} operation(s) from beat {}",
            ops.len(),
            beat.beat
        ),
    }
}

fn beat_payload(ctx: &SequenceExecutionContext, movement: &Movement, beat: &Beat) -> Value {
    json!({
        "requestId": ctx.request_id,
        "sequenceId": ctx.sequence.id,
        "movementId": movement.id,
        "beat": beat.beat,
        "event": beat.event,
        "handler": beat.handler,
    })
}

fn errored_payload(mut info: Value, beat: &Beat, message: &str) -> Value {
    extend(&mut info, json!({"error": message, "errorHandling": beat.error_handling}));
    info
}

fn extend(target: &mut Value, fields: Value) {
    if let (Value::Object(target), Value::Object(fields)) = (target, fields) {
        target.extend(fields);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
