// Worker-loop behavior against the in-memory queue: envelope flow, failure
// handling, adaptive sleep, and the daily upload side task.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveTime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use call_insights_rs::bus::{InMemoryQueue, MessageQueue};
use call_insights_rs::error::WorkerError;
use call_insights_rs::uploader::SideTask;
use call_insights_rs::worker::{MessageHandler, Service};

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    fn family(&self) -> &str {
        "test_family"
    }

    async fn handle(&self, raw_message: &str) -> Result<serde_json::Value, WorkerError> {
        let input: serde_json::Value = serde_json::from_str(raw_message)
            .map_err(|e| WorkerError::MalformedInput(e.to_string()))?;
        let text = input["text"].as_str().unwrap_or_default();

        if text == "boom" {
            return Err(WorkerError::Backend("simulated failure".to_string()));
        }
        if text == "slow" {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }

        Ok(serde_json::json!({
            "id": input["id"],
            "echo": text,
            "message": "SUCCESS",
        }))
    }

    fn failure_envelope(
        &self,
        raw_message: &str,
        error: &WorkerError,
    ) -> Option<serde_json::Value> {
        let parsed: serde_json::Value = serde_json::from_str(raw_message).unwrap_or_default();
        Some(serde_json::json!({
            "id": parsed.get("id").cloned().unwrap_or_else(|| "unknown".into()),
            "error": error.to_string(),
            "message": "failed",
        }))
    }
}

#[derive(Default)]
struct CountingSideTask {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl SideTask for CountingSideTask {
    async fn run(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("upload failed");
        }
        Ok(())
    }
}

struct Harness {
    in_queue: Arc<InMemoryQueue>,
    out_queue: Arc<InMemoryQueue>,
    command_queue: Arc<InMemoryQueue>,
    side_task: Arc<CountingSideTask>,
    service: Service,
}

fn harness(timeout: Duration, target_time: &str, fail_uploads: bool) -> Harness {
    let in_queue = Arc::new(InMemoryQueue::new());
    let out_queue = Arc::new(InMemoryQueue::new());
    let command_queue = Arc::new(InMemoryQueue::new());
    let side_task = Arc::new(CountingSideTask {
        calls: AtomicUsize::new(0),
        fail: fail_uploads,
    });

    let service = Service::new(
        Arc::clone(&in_queue) as Arc<dyn MessageQueue>,
        Arc::clone(&out_queue) as Arc<dyn MessageQueue>,
        Arc::clone(&command_queue) as Arc<dyn MessageQueue>,
        Arc::new(EchoHandler),
        Arc::clone(&side_task) as Arc<dyn SideTask>,
        5,
        timeout,
        NaiveTime::parse_from_str(target_time, "%H:%M:%S").unwrap(),
    );

    Harness {
        in_queue,
        out_queue,
        command_queue,
        side_task,
        service,
    }
}

#[tokio::test]
async fn successful_messages_produce_success_envelopes() {
    let mut h = harness(Duration::from_secs(5), "23:59:59", false);
    h.in_queue
        .send(r#"{"id": "m1", "text": "hello"}"#)
        .await
        .unwrap();
    h.in_queue
        .send(r#"{"id": "m2", "text": "world"}"#)
        .await
        .unwrap();

    let processed = h.service.run_iteration().await;
    assert_eq!(processed, 2);

    let published = h.out_queue.drain_all();
    assert_eq!(published.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(first["message"], "SUCCESS");
    assert_eq!(first["id"], "m1");

    let stats = h.service.stats();
    assert_eq!(stats.total_received, 2);
    assert_eq!(stats.total_sent, 2);
    assert_eq!(stats.total_failed, 0);
}

#[tokio::test]
async fn handler_errors_become_failed_envelopes() {
    let mut h = harness(Duration::from_secs(5), "23:59:59", false);
    h.in_queue
        .send(r#"{"id": "m1", "text": "boom"}"#)
        .await
        .unwrap();

    h.service.run_iteration().await;

    let published = h.out_queue.drain_all();
    assert_eq!(published.len(), 1);
    let envelope: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(envelope["message"], "failed");
    assert_eq!(envelope["id"], "m1");
    assert_eq!(h.service.stats().total_failed, 1);
    // the message was consumed either way: at-most-once
    assert!(h.in_queue.is_empty());
}

#[tokio::test]
async fn malformed_payloads_still_produce_an_envelope() {
    let mut h = harness(Duration::from_secs(5), "23:59:59", false);
    h.in_queue.send("this is not json").await.unwrap();

    h.service.run_iteration().await;

    let published = h.out_queue.drain_all();
    assert_eq!(published.len(), 1);
    let envelope: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(envelope["message"], "failed");
    assert_eq!(envelope["id"], "unknown");
}

#[tokio::test]
async fn timed_out_handlers_are_recorded_and_reported() {
    let mut h = harness(Duration::from_millis(50), "23:59:59", false);
    h.in_queue
        .send(r#"{"id": "m1", "text": "slow"}"#)
        .await
        .unwrap();

    h.service.run_iteration().await;

    let published = h.out_queue.drain_all();
    assert_eq!(published.len(), 1);
    let envelope: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(envelope["message"], "failed");
    assert_eq!(h.service.stats().total_timeouts, 1);
}

#[tokio::test]
async fn sleep_interval_adapts_to_load() {
    let mut h = harness(Duration::from_secs(5), "23:59:59", false);

    // idle iterations back off one second at a time, capped at ten
    assert_eq!(h.service.sleep_seconds(), 4);
    for expected in [5, 6, 7, 8, 9, 10, 10] {
        h.service.run_iteration().await;
        assert_eq!(h.service.sleep_seconds(), expected);
    }

    // a processed message snaps the interval back to one second
    h.in_queue
        .send(r#"{"id": "m1", "text": "hello"}"#)
        .await
        .unwrap();
    h.service.run_iteration().await;
    assert_eq!(h.service.sleep_seconds(), 1);
}

#[tokio::test]
async fn upload_marker_is_scheduled_once_per_day() {
    let mut h = harness(Duration::from_secs(5), "23:59:59", false);

    h.service.run_iteration().await;
    assert_eq!(h.command_queue.len(), 1);

    // no duplicate on subsequent iterations
    h.service.run_iteration().await;
    assert_eq!(h.command_queue.len(), 1);
    assert_eq!(h.side_task.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn marker_after_target_time_triggers_one_upload() {
    let mut h = harness(Duration::from_secs(5), "00:00:00", false);
    h.command_queue.send("log-upload-marker").await.unwrap();

    h.service.run_iteration().await;
    assert_eq!(h.side_task.calls.load(Ordering::SeqCst), 1);

    // already uploaded today: no further attempts
    h.service.run_iteration().await;
    assert_eq!(h.side_task.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_uploads_are_capped_per_day() {
    let mut h = harness(Duration::from_secs(5), "00:00:00", true);
    h.command_queue.send("log-upload-marker").await.unwrap();

    for _ in 0..25 {
        h.service.run_iteration().await;
    }

    assert_eq!(h.side_task.calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn side_task_failures_never_break_message_processing() {
    let mut h = harness(Duration::from_secs(5), "00:00:00", true);
    h.command_queue.send("log-upload-marker").await.unwrap();
    h.in_queue
        .send(r#"{"id": "m1", "text": "hello"}"#)
        .await
        .unwrap();

    let processed = h.service.run_iteration().await;
    assert_eq!(processed, 1);
    assert_eq!(h.out_queue.len(), 1);
}
