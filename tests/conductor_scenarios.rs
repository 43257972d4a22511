//! End-to-end scenarios driving a `Conductor` through its public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use conductor::events::{
    BEAT_COMPLETED, BEAT_ERRORED, BEAT_STARTED, SEQUENCE_COMPLETED, SEQUENCE_QUEUED, SEQUENCE_STARTED,
};
use conductor::execution::{MutationOp, MutationSink};
use conductor::sequence::{ErrorHandling, Timing};
use conductor::{
    Beat, Conductor, ConductorConfig, ConductorError, ExecutionStatus, Handler, HandlerError, HandlerMap,
    Movement, Payload, Priority, RequestId, Sequence,
};

fn conductor() -> Conductor {
    Conductor::new(ConductorConfig {
        max_concurrent: 8,
        ..ConductorConfig::default()
    })
}

fn recorder(conductor: &Conductor, events: &[&str]) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event in events {
        let sink = Arc::clone(&seen);
        let name = event.to_string();
        conductor.bus().subscribe_fn(event, move |_| {
            sink.lock().unwrap().push(name.clone());
            Ok(())
        });
    }
    seen
}

fn waiting_sequence(id: &str, resource: &str) -> Sequence {
    Sequence::new(id, id)
        .with_resource(resource)
        .with_movement(Movement::new("main", "Main").with_beat(Beat::new(1, format!("{}:hold", id), "hold").waiting_for("go")))
}

fn noop_handlers() -> HandlerMap {
    HandlerMap::new().with("hold", Handler::sync(|_| Ok(None)))
}

#[tokio::test]
async fn test_example_drag_sequence_event_order() {
    let conductor = conductor();
    let sequence = Sequence::new("drag", "Element Drag")
        .with_resource("element:{elementId}")
        .with_movement(
            Movement::new("drag", "Drag")
                .with_beat(Beat::new(1, "drag:start", "onDragStart"))
                .with_beat(Beat::new(2, "drag:end", "onDragEnd")),
        );
    let handlers = HandlerMap::new()
        .with("onDragStart", Handler::sync(|_| Ok(Some(json!({"dragging": true})))))
        .with(
            "onDragEnd",
            Handler::sync(|invocation| {
                let dragging = invocation.baton().get("dragging");
                Ok(Some(json!({"dragging": false, "wasDragging": dragging})))
            }),
        );
    assert!(conductor.mount(sequence, handlers, Some("canvas")).success);

    let seen = recorder(
        &conductor,
        &[SEQUENCE_STARTED, BEAT_STARTED, "drag:start", "drag:end", BEAT_COMPLETED, SEQUENCE_COMPLETED],
    );

    let request = conductor
        .play("canvas", "drag", json!({"elementId": "rect-1"}), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(conductor.wait_for(&request).await.unwrap(), ExecutionStatus::Completed);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SEQUENCE_STARTED,
            BEAT_STARTED,
            "drag:start",
            BEAT_COMPLETED,
            BEAT_STARTED,
            "drag:end",
            BEAT_COMPLETED,
            SEQUENCE_COMPLETED,
        ]
    );
    assert!(conductor.resource_ownership().is_empty());
}

#[tokio::test]
async fn test_beats_run_in_ascending_order() {
    let conductor = conductor();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);

    let sequence = Sequence::new("s", "S").with_movement(
        Movement::new("m", "M")
            .with_beat(Beat::new(3, "third", "record"))
            .with_beat(Beat::new(1, "first", "record"))
            .with_beat(Beat::new(2, "second", "record")),
    );
    let handlers = HandlerMap::new().with(
        "record",
        Handler::sync(move |invocation| {
            sink.lock().unwrap().push(invocation.beat.beat);
            Ok(None)
        }),
    );
    conductor.mount(sequence, handlers, None);

    let request = conductor.play("s", "s", json!({}), Priority::Normal).await.unwrap();
    conductor.wait_for(&request).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_baton_flows_between_beats() {
    let conductor = conductor();
    let sequence = Sequence::new("s", "S").with_movement(
        Movement::new("m", "M")
            .with_beat(Beat::new(1, "a", "double"))
            .with_beat(Beat::new(2, "b", "double").with_timing(Timing::NextTick)),
    );
    let result = Arc::new(Mutex::new(Value::Null));
    let sink = Arc::clone(&result);
    let handlers = HandlerMap::new().with(
        "double",
        Handler::sync(move |invocation| {
            let n = invocation.baton().get("n").and_then(|n| n.as_i64()).unwrap_or(0);
            *sink.lock().unwrap() = json!(n * 2);
            Ok(Some(json!({"n": n * 2})))
        }),
    );
    conductor.mount(sequence, handlers, None);

    let request = conductor.play("s", "s", json!({"n": 3}), Priority::Normal).await.unwrap();
    conductor.wait_for(&request).await.unwrap();
    assert_eq!(*result.lock().unwrap(), json!(12));
}

#[tokio::test]
async fn test_duplicate_in_flight_request_returns_existing_id() {
    let conductor = conductor();
    conductor.mount(waiting_sequence("s", "canvas"), noop_handlers(), None);

    let first = conductor.play("s", "s", json!({"a": 1, "b": 2}), Priority::Normal).await.unwrap();
    let again = conductor.play("s", "s", json!({"b": 2, "a": 1}), Priority::Normal).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(conductor.statistics().duplicates_prevented, 1);

    conductor.signal(&first, "go");
    conductor.wait_for(&first).await.unwrap();

    let later = conductor.play("s", "s", json!({"a": 1, "b": 2}), Priority::Normal).await.unwrap();
    assert_ne!(later, first);
    conductor.signal(&later, "go");
    conductor.wait_for(&later).await.unwrap();
}

#[tokio::test]
async fn test_shared_resource_is_never_owned_twice() {
    let conductor = conductor();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tracking = |in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>| {
        Handler::new(move |_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            }
        })
    };

    for id in ["a", "b"] {
        let sequence = Sequence::new(id, id)
            .with_resource("canvas")
            .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, format!("{}:go", id), "work")));
        let handlers = HandlerMap::new().with("work", tracking(Arc::clone(&in_flight), Arc::clone(&peak)));
        assert!(conductor.mount(sequence, handlers, Some("p")).success);
    }

    let queued = recorder(&conductor, &[SEQUENCE_QUEUED]);
    let a = conductor.play("p", "a", json!({}), Priority::Normal).await.unwrap();
    let b = conductor.play("p", "b", json!({}), Priority::Normal).await.unwrap();

    let owner = conductor.resource_ownership()["canvas"].clone();
    assert_eq!(owner.execution_id, a);
    assert_eq!(owner.sequence_id, "a");

    assert_eq!(conductor.wait_for(&a).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(conductor.wait_for(&b).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(queued.lock().unwrap().len(), 1);
    assert!(conductor.resource_ownership().is_empty());
}

#[tokio::test]
async fn test_high_priority_interrupts_normal_owner() {
    let conductor = conductor();
    conductor.mount(waiting_sequence("background", "canvas"), noop_handlers(), None);
    let urgent = Sequence::new("urgent", "Urgent")
        .with_resource("canvas")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "urgent:go", "hold")));
    conductor.mount(urgent, noop_handlers(), None);

    let background = conductor
        .play("background", "background", json!({}), Priority::Normal)
        .await
        .unwrap();
    let high = conductor.play("urgent", "urgent", json!({}), Priority::High).await.unwrap();

    assert_eq!(conductor.wait_for(&background).await.unwrap(), ExecutionStatus::Cancelled);
    assert_eq!(conductor.wait_for(&high).await.unwrap(), ExecutionStatus::Completed);
    conductor.wait_idle().await;
    assert!(conductor.resource_ownership().is_empty());
}

#[tokio::test]
async fn test_high_priority_queue_drains_first() {
    let conductor = Conductor::new(ConductorConfig {
        max_concurrent: 1,
        ..ConductorConfig::default()
    });
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    let sequence = Sequence::new("s", "S").with_movement(
        Movement::new("m", "M").with_beat(Beat::new(1, "run", "record").waiting_for("go")),
    );
    let handlers = HandlerMap::new().with(
        "record",
        Handler::sync(move |invocation| {
            let tag = invocation.baton().get("tag").unwrap_or_default();
            sink.lock().unwrap().push(tag);
            Ok(None)
        }),
    );
    conductor.mount(sequence, handlers, None);

    let blocker = conductor.play("s", "s", json!({"tag": "blocker"}), Priority::Normal).await.unwrap();
    let normal = conductor.play("s", "s", json!({"tag": "normal"}), Priority::Normal).await.unwrap();
    let high = conductor.play("s", "s", json!({"tag": "high"}), Priority::High).await.unwrap();

    let queued: Vec<RequestId> = conductor
        .queue_status()
        .queued
        .into_iter()
        .map(|summary| summary.request_id)
        .collect();
    assert_eq!(queued, vec![high.clone(), normal.clone()]);

    for request in [&blocker, &high, &normal] {
        while conductor.status(request) != Some(ExecutionStatus::Active) {
            tokio::task::yield_now().await;
        }
        conductor.signal(request, "go");
        conductor.wait_for(request).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![json!("blocker"), json!("high"), json!("normal")]);
}

#[tokio::test]
async fn test_callback_survives_relays_until_last_release() {
    let conductor = conductor();
    let children: Arc<Mutex<Vec<RequestId>>> = Arc::new(Mutex::new(Vec::new()));

    // The relay forwards its baton to two sibling finishers.
    let relay = Sequence::new("relay", "Relay")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "relay:forward", "forward")));
    let spawned = Arc::clone(&children);
    let relay_handlers = HandlerMap::new().with(
        "forward",
        Handler::new(move |invocation| {
            let spawned = Arc::clone(&spawned);
            async move {
                for n in 0..2 {
                    let payload = Payload::from(invocation.baton().snapshot()).with("n", json!(n));
                    let child = invocation
                        .play("finisher", "finisher", payload, Priority::Normal)
                        .await?;
                    spawned.lock().unwrap().push(child);
                }
                Ok::<_, HandlerError>(None)
            }
        }),
    );
    conductor.mount(relay, relay_handlers, None);

    let finisher = Sequence::new("finisher", "Finisher").with_movement(
        Movement::new("m", "M").with_beat(Beat::new(1, "finisher:done", "finish").waiting_for("go")),
    );
    let finisher_handlers = HandlerMap::new().with(
        "finish",
        Handler::sync(|invocation| {
            let n = invocation.baton().get("n").unwrap_or_default();
            let done = invocation
                .callback("/onDone")
                .ok_or_else(|| HandlerError::from("onDone missing"))?;
            let hook = invocation
                .callback("/hooks/0")
                .ok_or_else(|| HandlerError::from("hook missing"))?;
            done.invoke(json!({"n": n}))?;
            hook.invoke(json!("hooked"))?;
            Ok(None)
        }),
    );
    conductor.mount(finisher, finisher_handlers, None);

    let received = Arc::new(Mutex::new(Vec::new()));
    let done_sink = Arc::clone(&received);
    let hook_sink = Arc::clone(&received);
    let payload = Payload::from(json!({"elementId": "rect-1"}))
        .with(
            "onDone",
            Payload::callback(move |result| {
                done_sink.lock().unwrap().push(result.clone());
                result
            }),
        )
        .with(
            "hooks",
            Payload::array([Payload::callback(move |result| {
                hook_sink.lock().unwrap().push(result.clone());
                Value::Null
            })]),
        );

    let root = conductor.play("relay", "relay", payload, Priority::Normal).await.unwrap();
    assert_eq!(conductor.wait_for(&root).await.unwrap(), ExecutionStatus::Completed);

    // The relay finished, but both finishers still hold the correlation.
    assert_eq!(conductor.callbacks().len(), 1);
    let children = children.lock().unwrap().clone();
    assert_eq!(children.len(), 2);

    assert!(conductor.signal(&children[0], "go"));
    assert_eq!(conductor.wait_for(&children[0]).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(conductor.callbacks().len(), 1);
    assert_eq!(conductor.callbacks().purged_count(), 0);

    assert!(conductor.signal(&children[1], "go"));
    assert_eq!(conductor.wait_for(&children[1]).await.unwrap(), ExecutionStatus::Completed);

    assert_eq!(
        *received.lock().unwrap(),
        vec![json!({"n": 0}), json!("hooked"), json!({"n": 1}), json!("hooked")]
    );
    assert!(conductor.callbacks().is_empty());
    assert_eq!(conductor.callbacks().purged_count(), 1);
}

#[tokio::test]
async fn test_chained_play_runs_inline_on_parent_resources() {
    let conductor = conductor();
    let child = Sequence::new("child", "Child")
        .with_resource("canvas")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "child:run", "mark")));
    conductor.mount(
        child,
        HandlerMap::new().with("mark", Handler::sync(|_| Ok(Some(json!({"marked": true}))))),
        Some("p"),
    );

    let completed_inline = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&completed_inline);
    let parent = Sequence::new("parent", "Parent")
        .with_resource("canvas")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "parent:run", "nest")));
    conductor.mount(
        parent,
        HandlerMap::new().with(
            "nest",
            Handler::new(move |invocation| {
                let flag = Arc::clone(&flag);
                async move {
                    let child = invocation.play("p", "child", json!({}), Priority::Chained).await?;
                    if invocation.conductor().status(&child) == Some(ExecutionStatus::Completed) {
                        flag.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<_, HandlerError>(None)
                }
            }),
        ),
        Some("p"),
    );

    let request = conductor.play("p", "parent", json!({}), Priority::Normal).await.unwrap();
    assert_eq!(conductor.wait_for(&request).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(completed_inline.load(Ordering::SeqCst), 1);
    assert_eq!(conductor.statistics().completed, 2);
}

#[tokio::test]
async fn test_relay_callback_does_not_shadow_caller_callback() {
    let conductor = conductor();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let finisher = Sequence::new("finisher", "Finisher")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "finisher:done", "finish")));
    let finisher_handlers = HandlerMap::new().with(
        "finish",
        Handler::sync(|invocation| {
            for pointer in ["/orig/onDone", "/onDone"] {
                invocation
                    .callback(pointer)
                    .ok_or_else(|| HandlerError::from("callback missing"))?
                    .invoke(json!(null))?;
            }
            Ok(None)
        }),
    );
    conductor.mount(finisher, finisher_handlers, None);

    // The relay wraps its baton and adds a completion callback of its own.
    let relay = Sequence::new("relay", "Relay")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "relay:forward", "forward")));
    let relay_sink = Arc::clone(&fired);
    let relay_handlers = HandlerMap::new().with(
        "forward",
        Handler::new(move |invocation| {
            let relay_sink = Arc::clone(&relay_sink);
            async move {
                let payload = Payload::from(json!({"orig": invocation.baton().snapshot()})).with(
                    "onDone",
                    Payload::callback(move |args| {
                        relay_sink.lock().unwrap().push("relay");
                        args
                    }),
                );
                invocation
                    .play("finisher", "finisher", payload, Priority::Chained)
                    .await?;
                Ok::<_, HandlerError>(None)
            }
        }),
    );
    conductor.mount(relay, relay_handlers, None);

    let caller_sink = Arc::clone(&fired);
    let payload = Payload::from(json!({})).with(
        "onDone",
        Payload::callback(move |args| {
            caller_sink.lock().unwrap().push("caller");
            args
        }),
    );
    let root = conductor.play("relay", "relay", payload, Priority::Normal).await.unwrap();
    assert_eq!(conductor.wait_for(&root).await.unwrap(), ExecutionStatus::Completed);

    assert_eq!(*fired.lock().unwrap(), vec!["caller", "relay"]);
    assert!(conductor.callbacks().is_empty());
    assert_eq!(conductor.callbacks().purged_count(), 2);
}

fn nesting_handler(next: &'static str) -> Handler {
    Handler::new(move |invocation| async move {
        invocation.play("p", next, json!({}), Priority::Chained).await?;
        Ok::<_, HandlerError>(None)
    })
}

#[tokio::test]
async fn test_nested_chained_plays_share_root_resources() {
    let conductor = conductor();
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&leaf_runs);

    let step = |id: &str, handler: &str| {
        Sequence::new(id, id)
            .with_resource("canvas")
            .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, format!("{}:run", id), handler)))
    };
    conductor.mount(step("a", "nest"), HandlerMap::new().with("nest", nesting_handler("b")), Some("p"));
    conductor.mount(step("b", "nest"), HandlerMap::new().with("nest", nesting_handler("c")), Some("p"));
    conductor.mount(
        step("c", "mark"),
        HandlerMap::new().with(
            "mark",
            Handler::sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        ),
        Some("p"),
    );

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    conductor.bus().subscribe_fn(BEAT_ERRORED, move |data| {
        sink.lock().unwrap().push(data["error"].as_str().unwrap_or_default().to_string());
        Ok(())
    });

    let root = conductor.play("p", "a", json!({}), Priority::Normal).await.unwrap();
    assert_eq!(conductor.wait_for(&root).await.unwrap(), ExecutionStatus::Completed);

    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(conductor.statistics().completed, 3);
    assert!(conductor.resource_ownership().is_empty());
}

#[tokio::test]
async fn test_failing_beats_are_contained() {
    let conductor = conductor();
    let sequence = Sequence::new("s", "S").with_movement(
        Movement::new("m", "M")
            .with_beat(Beat::new(1, "boom", "panics").with_error_handling(ErrorHandling::Continue))
            .with_beat(Beat::new(2, "oops", "errors").with_error_handling(ErrorHandling::Continue))
            .with_beat(Beat::new(3, "fine", "ok")),
    );
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let handlers = HandlerMap::new()
        .with("panics", Handler::sync(|_| panic!("handler exploded")))
        .with("errors", Handler::sync(|_| Err(HandlerError::from("bad input"))))
        .with(
            "ok",
            Handler::sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        );
    conductor.mount(sequence, handlers, None);

    // A broken subscriber must not affect the execution either.
    conductor.bus().subscribe_fn(BEAT_STARTED, |_| Err("subscriber down".to_string()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    conductor.bus().subscribe_fn(BEAT_ERRORED, move |data| {
        sink.lock().unwrap().push(data["error"].as_str().unwrap_or_default().to_string());
        Ok(())
    });

    let request = conductor.play("s", "s", json!({}), Priority::Normal).await.unwrap();
    assert_eq!(conductor.wait_for(&request).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].contains("handler exploded"));
    assert_eq!(errors[1], "bad input");

    let stats = conductor.statistics();
    assert_eq!(stats.beats_executed, 3);
    assert_eq!(stats.beats_errored, 2);
}

#[tokio::test]
async fn test_invalid_mount_leaves_conductor_usable() {
    let conductor = conductor();
    let broken = Sequence::new("broken", "Broken")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "x", "absent")));
    let result = conductor.mount(broken, HandlerMap::new(), Some("bad"));
    assert!(!result.success);
    assert!(result.reason.unwrap().contains("absent"));

    assert!(matches!(
        conductor.play("bad", "broken", json!({}), Priority::Normal).await,
        Err(ConductorError::SequenceNotFound(_))
    ));

    conductor.mount(waiting_sequence("good", "r"), noop_handlers(), None);
    let request = conductor.play("good", "good", json!({}), Priority::Normal).await.unwrap();
    conductor.signal(&request, "go");
    assert_eq!(conductor.wait_for(&request).await.unwrap(), ExecutionStatus::Completed);
}

struct RecordingSink(Mutex<Vec<(String, MutationOp)>>);

impl MutationSink for RecordingSink {
    fn apply(&self, request_id: &RequestId, _beat: &Beat, ops: &[MutationOp]) {
        let mut applied = self.0.lock().unwrap();
        for op in ops {
            applied.push((request_id.to_string(), op.clone()));
        }
    }
}

#[tokio::test]
async fn test_mutations_reach_injected_sink() {
    let conductor = conductor();
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    conductor.set_mutation_sink(sink.clone());

    let sequence = Sequence::new("s", "S")
        .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "style", "paint")));
    let handlers = HandlerMap::new().with(
        "paint",
        Handler::sync(|invocation| {
            invocation.mutate(MutationOp::new("#rect-1", "set-style", json!({"fill": "red"})));
            Ok(None)
        }),
    );
    conductor.mount(sequence, handlers, None);

    let request = conductor.play("s", "s", json!({}), Priority::Normal).await.unwrap();
    conductor.wait_for(&request).await.unwrap();

    let applied = sink.0.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, request.to_string());
    assert_eq!(applied[0].1.kind, "set-style");
}
