//! Dispatch loop behavior against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base_service::codec::Payload;
use base_service::config::WorkerSettings;
use base_service::engine::{DispatchLoop, Dispatcher, LoopState};
use base_service::handler::{EventKind, Handler, handler_fn};
use base_service::model::Message;
use base_service::transport::memory::MemoryBroker;
use base_service::transport::{Disposition, QueueOptions};
use base_service::{Error, Result};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REJECT: Disposition = Disposition::Reject { requeue: false };

struct RunningLoop {
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl RunningLoop {
    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}

fn dispatch_loop(
    broker: &MemoryBroker,
    queue: &str,
    handler: impl Handler,
    settings: &WorkerSettings,
) -> (DispatchLoop<MemoryBroker>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(queue, EventKind::Rpc, Arc::new(handler), settings);
    let dispatch = DispatchLoop::new(
        Arc::new(broker.clone()),
        dispatcher,
        settings,
        shutdown.clone(),
    );
    (dispatch, shutdown)
}

/// Spawn a loop and wait until it is consuming.
async fn start(
    broker: &MemoryBroker,
    queue: &str,
    handler: impl Handler,
    settings: WorkerSettings,
) -> RunningLoop {
    let (dispatch, shutdown) = dispatch_loop(broker, queue, handler, &settings);
    let mut state = dispatch.subscribe();
    let task = tokio::spawn(dispatch.run());
    state
        .wait_for(|s| *s == LoopState::Consuming)
        .await
        .expect("loop stopped before consuming");
    RunningLoop { shutdown, task }
}

fn echo() -> impl Handler {
    handler_fn(|payload: Payload| async move { anyhow::Ok(payload) })
}

fn request(body: &str, correlation_id: &str, reply_to: &str) -> Message {
    Message::from_payload(&Payload::from(body))
        .correlation_id(correlation_id)
        .reply_to(reply_to)
}

#[tokio::test]
async fn echo_request_gets_one_correlated_reply() {
    let broker = MemoryBroker::new();
    let running = start(&broker, "ping", echo(), WorkerSettings::default()).await;

    broker
        .deliver("ping", request("ping", "abc", "R1"))
        .unwrap();

    let settled = broker.settled("ping", 1).await;
    assert_eq!(settled[0].disposition, Disposition::Ack);

    let replies = broker.published_to("R1");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id.as_deref(), Some("abc"));
    assert_eq!(replies[0].reply_to, None);
    assert_eq!(replies[0].payload(), Payload::from("ping"));
    assert!(replies[0].timestamp.is_some());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn echo_json_map_reply_matches_request_body() {
    let broker = MemoryBroker::new();
    let running = start(&broker, "ping", echo(), WorkerSettings::default()).await;

    let message = Message::new(r#"{"n": 1}"#)
        .correlation_id("abc")
        .reply_to("R1");
    broker.deliver("ping", message).unwrap();

    let settled = broker.settled("ping", 1).await;
    assert_eq!(settled[0].disposition, Disposition::Ack);

    let replies = broker.published_to("R1");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id.as_deref(), Some("abc"));
    assert_eq!(replies[0].body, br#"{"n":1}"#);
    assert_eq!(replies[0].payload(), Payload::Json(json!({"n": 1})));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn json_looking_text_result_replies_as_a_string() {
    let broker = MemoryBroker::new();
    let version = handler_fn(|_: Payload| async move { anyhow::Ok(Payload::from("1.0")) });
    let running = start(&broker, "version", version, WorkerSettings::default()).await;

    broker.deliver("version", request("?", "v", "R1")).unwrap();

    let replies = broker.published_at_least("R1", 1).await;
    assert_eq!(replies[0].body, br#""1.0""#);
    assert_eq!(replies[0].payload(), Payload::Text("1.0".to_string()));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn json_result_is_encoded_into_reply() {
    let broker = MemoryBroker::new();
    let double = handler_fn(|payload: Payload| async move {
        let n: i64 = payload.deserialize()?;
        anyhow::Ok(Payload::Json(json!(n * 2)))
    });
    let running = start(&broker, "double", double, WorkerSettings::default()).await;

    let message = Message::from_payload(&Payload::Json(json!(21)))
        .correlation_id("c-1")
        .reply_to("R1");
    broker.deliver("double", message).unwrap();

    let replies = broker.published_at_least("R1", 1).await;
    assert_eq!(replies[0].body, b"42");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn reply_without_request_correlation_id_has_none() {
    let broker = MemoryBroker::new();
    let running = start(&broker, "ping", echo(), WorkerSettings::default()).await;

    broker
        .deliver("ping", Message::new("x").reply_to("R1"))
        .unwrap();

    broker.settled("ping", 1).await;
    let replies = broker.published_to("R1");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id, None);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn failing_handler_rejects_without_reply() {
    let broker = MemoryBroker::new();
    let failing =
        handler_fn(|_: Payload| async move { Err::<Payload, _>(anyhow::anyhow!("boom")) });
    let running = start(&broker, "ping", failing, WorkerSettings::default()).await;

    broker.deliver("ping", request("x", "abc", "R1")).unwrap();

    let settled = broker.settled("ping", 1).await;
    assert_eq!(settled[0].disposition, REJECT);
    assert!(broker.published_to("R1").is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn fire_and_forget_is_acked_and_publishes_nothing() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = handler_fn(move |payload: Payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(payload)
        }
    });
    let running = start(&broker, "audit", handler, WorkerSettings::default()).await;

    broker.deliver("audit", Message::new("event")).unwrap();

    let settled = broker.settled("audit", 1).await;
    assert_eq!(settled[0].disposition, Disposition::Ack);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(broker.published().is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn one_queue_is_processed_strictly_in_order() {
    let broker = MemoryBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let handler = {
        let seen = Arc::clone(&seen);
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        handler_fn(move |payload: Payload| {
            let seen = Arc::clone(&seen);
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().unwrap().push(payload.to_string());
                in_flight.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(payload)
            }
        })
    };
    let running = start(&broker, "jobs", handler, WorkerSettings::default()).await;

    for i in 0..5 {
        broker
            .deliver("jobs", request(&format!("m{i}"), &format!("c{i}"), "R1"))
            .unwrap();
    }

    let settled = broker.settled("jobs", 5).await;
    assert!(settled.iter().all(|s| s.disposition == Disposition::Ack));
    assert_eq!(*seen.lock().unwrap(), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);

    let correlation_ids: Vec<_> = broker
        .published_to("R1")
        .into_iter()
        .filter_map(|m| m.correlation_id)
        .collect();
    assert_eq!(correlation_ids, vec!["c0", "c1", "c2", "c3", "c4"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn reply_publish_failure_rejects_and_loop_continues() {
    let broker = MemoryBroker::new();
    broker.fail_publishes_to("R1");
    let running = start(&broker, "ping", echo(), WorkerSettings::default()).await;

    broker.deliver("ping", request("a", "c1", "R1")).unwrap();
    broker.deliver("ping", request("b", "c2", "R2")).unwrap();

    let settled = broker.settled("ping", 2).await;
    assert_eq!(settled[0].disposition, REJECT);
    assert_eq!(settled[1].disposition, Disposition::Ack);
    assert!(broker.published_to("R1").is_empty());
    assert_eq!(broker.published_to("R2").len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn unusable_reply_address_is_handled_as_fire_and_forget() {
    let broker = MemoryBroker::new();
    let running = start(&broker, "ping", echo(), WorkerSettings::default()).await;

    broker.deliver("ping", request("a", "c1", "   ")).unwrap();
    let oversized = "r".repeat(300);
    broker.deliver("ping", request("b", "c2", &oversized)).unwrap();

    let settled = broker.settled("ping", 2).await;
    assert!(settled.iter().all(|s| s.disposition == Disposition::Ack));
    assert!(broker.published().is_empty());

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_handler_is_timed_out_and_rejected() {
    let broker = MemoryBroker::new();
    let slow = handler_fn(|payload: Payload| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        anyhow::Ok(payload)
    });
    let settings = WorkerSettings {
        handler_timeout_secs: Some(1),
        ..WorkerSettings::default()
    };
    let running = start(&broker, "slow", slow, settings).await;

    broker.deliver("slow", request("x", "c1", "R1")).unwrap();

    let settled = broker.settled("slow", 1).await;
    assert_eq!(settled[0].disposition, REJECT);
    assert!(broker.published_to("R1").is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let broker = MemoryBroker::new();
    let handler = handler_fn(|payload: Payload| async move {
        if payload == Payload::from("explode") {
            panic!("handler blew up");
        }
        anyhow::Ok(payload)
    });
    let running = start(&broker, "fragile", handler, WorkerSettings::default()).await;

    broker
        .deliver("fragile", request("explode", "c1", "R1"))
        .unwrap();
    broker.deliver("fragile", request("ok", "c2", "R1")).unwrap();

    let settled = broker.settled("fragile", 2).await;
    assert_eq!(settled[0].disposition, REJECT);
    assert_eq!(settled[1].disposition, Disposition::Ack);
    let replies = broker.published_to("R1");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id.as_deref(), Some("c2"));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_broker_fails_the_loop() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let (dispatch, _shutdown) =
        dispatch_loop(&broker, "ping", echo(), &WorkerSettings::default());
    let state = dispatch.subscribe();

    let err = dispatch.run().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    assert_eq!(*state.borrow(), LoopState::Stopped);
}

#[tokio::test]
async fn incompatible_existing_queue_fails_the_loop() {
    let broker = MemoryBroker::new();
    broker.declare("ping", QueueOptions::durable()).unwrap();
    let (dispatch, _shutdown) =
        dispatch_loop(&broker, "ping", echo(), &WorkerSettings::default());

    let err = dispatch.run().await.unwrap_err();
    assert!(matches!(err, Error::QueueConflict { .. }), "got {err:?}");
}

#[tokio::test]
async fn durable_setting_declares_durable_queue() {
    let broker = MemoryBroker::new();
    broker.declare("ping", QueueOptions::durable()).unwrap();
    let settings = WorkerSettings {
        durable_queues: true,
        ..WorkerSettings::default()
    };
    let running = start(&broker, "ping", echo(), settings).await;
    running.stop().await.unwrap();
}

#[tokio::test]
async fn cancelled_loop_stops_cleanly() {
    let broker = MemoryBroker::new();
    let (dispatch, shutdown) =
        dispatch_loop(&broker, "ping", echo(), &WorkerSettings::default());
    let mut state = dispatch.subscribe();
    let task = tokio::spawn(dispatch.run());

    state
        .wait_for(|s| *s == LoopState::Consuming)
        .await
        .unwrap();
    shutdown.cancel();

    task.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), LoopState::Stopped);
}

#[tokio::test]
async fn shutdown_lets_the_in_flight_message_finish() {
    let broker = MemoryBroker::new();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let handler = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        handler_fn(move |payload: Payload| {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                anyhow::Ok(payload)
            }
        })
    };
    let running = start(&broker, "ping", handler, WorkerSettings::default()).await;

    broker.deliver("ping", request("x", "abc", "R1")).unwrap();
    started.notified().await;

    running.shutdown.cancel();
    release.notify_one();
    running.task.await.unwrap().unwrap();

    let settled = broker.settlements("ping");
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].disposition, Disposition::Ack);
    assert_eq!(broker.published_to("R1").len(), 1);
}
