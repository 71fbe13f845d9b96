//! Queue controller behavior.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;

use fetchbox::prelude::*;
use fetchbox::{ConcurrencyLimit, QueueItemStatus, Response};

use common::{MockTransport, wait_until};

fn queue_spec(auto_start: bool, concurrency: u8) -> QueueSpec {
    QueueSpec {
        base: OperationSpec::post("/upload"),
        config: QueueConfig {
            concurrency: ConcurrencyLimit::new_saturating(concurrency),
            auto_start,
        },
    }
}

#[tokio::test]
async fn trigger_resolves_with_response_and_generated_id() {
    let transport = MockTransport::ok(json!({"stored": true}));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 3));

    let response = queue
        .trigger(QueueInput::body(json!({"file": "a"})))
        .await
        .expect("trigger resolves");
    assert_eq!(response.data, Some(json!({"stored": true})));

    let items = queue.get_queue();
    assert_eq!(items.len(), 1);
    assert!(items[0].id.starts_with("q-"), "generated id format");
    assert_eq!(items[0].status, QueueItemStatus::Success);
    assert_eq!(items[0].input.body, Some(json!({"file": "a"})));
}

#[tokio::test]
async fn auto_start_off_holds_items_until_start() {
    let transport = MockTransport::ok(json!("done"));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(false, 3));
    assert!(!queue.is_started());

    let held = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.trigger(QueueInput::body(json!({"n": 1}))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.calls(), 0, "nothing dispatches before start");
    assert_eq!(queue.get_stats().pending, 1);

    queue.start();
    assert!(queue.is_started());
    let response = held.await.expect("join").expect("trigger resolves");
    assert!(response.is_success());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn abort_pending_item_resolves_aborted() {
    let transport =
        MockTransport::delayed(Duration::from_millis(100), |_| Response::ok(json!("done")));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 1));

    let first = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .trigger_with_id("first", QueueInput::body(json!({"n": 1})))
                .await
        })
    };
    let second = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .trigger_with_id("second", QueueInput::body(json!({"n": 2})))
                .await
        })
    };
    // Let the first take the only slot and the second park.
    assert!(
        wait_until(Duration::from_millis(500), {
            let queue = queue.clone();
            move || queue.get_stats().running == 1 && queue.get_stats().pending == 1
        })
        .await
    );

    queue.abort(Some("second"));
    let aborted = second.await.expect("join").expect("trigger resolves");
    assert!(aborted.aborted);

    let completed = first.await.expect("join").expect("trigger resolves");
    assert!(completed.is_success());

    let stats = queue.get_stats();
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.percentage, 100);
}

#[tokio::test]
async fn abort_running_item_settles_aborted() {
    let transport =
        MockTransport::delayed(Duration::from_millis(200), |_| Response::ok(json!("done")));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 1));

    let running = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .trigger_with_id("slow", QueueInput::body(json!({})))
                .await
        })
    };
    assert!(
        wait_until(Duration::from_millis(500), {
            let queue = queue.clone();
            move || queue.get_stats().running == 1
        })
        .await
    );

    queue.abort(Some("slow"));
    let response = running.await.expect("join").expect("trigger resolves");
    assert!(response.aborted);
    assert_eq!(queue.get_queue()[0].status, QueueItemStatus::Aborted);
}

#[tokio::test]
async fn retry_reruns_failed_item_with_original_input() {
    let failing = Arc::new(AtomicBool::new(true));
    let gate = Arc::clone(&failing);
    let transport = MockTransport::with_handler(move |request| {
        if gate.load(Ordering::SeqCst) {
            Response::error(500, json!("boom"))
        } else {
            Response::ok(request.body.clone().unwrap_or(json!(null)))
        }
    });
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 3));

    let response = queue
        .trigger_with_id("job", QueueInput::body(json!({"payload": 42})))
        .await
        .expect("trigger resolves");
    assert_eq!(response.error, Some(json!("boom")));
    assert_eq!(queue.get_queue()[0].status, QueueItemStatus::Error);

    failing.store(false, Ordering::SeqCst);
    queue.retry(Some("job"));
    assert!(
        wait_until(Duration::from_millis(500), {
            let queue = queue.clone();
            move || queue.get_stats().success == 1
        })
        .await,
        "retried item succeeds"
    );

    let item = &queue.get_queue()[0];
    assert_eq!(item.data, Some(json!({"payload": 42})), "original input preserved");
    assert_eq!(queue.get_stats().total, 1, "retry reuses the item");
}

#[tokio::test]
async fn remove_and_clear() {
    let transport = MockTransport::ok(json!("done"));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 3));

    for index in 0..3 {
        queue
            .trigger(QueueInput::body(json!({"n": index})))
            .await
            .expect("trigger resolves");
    }
    assert_eq!(queue.get_stats().success, 3);

    queue.remove_settled();
    assert_eq!(queue.get_stats().total, 0);

    queue
        .trigger(QueueInput::body(json!({"n": 9})))
        .await
        .expect("trigger resolves");
    queue.clear();
    assert_eq!(queue.get_stats(), Default::default());
    assert!(queue.get_queue().is_empty());
}

#[tokio::test]
async fn set_concurrency_admits_parked_items() {
    let transport =
        MockTransport::delayed(Duration::from_millis(60), |_| Response::ok(json!("done")));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let queue = layer.queue(queue_spec(true, 1));

    let triggers: Vec<_> = (0..3)
        .map(|index| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.trigger(QueueInput::body(json!({"n": index}))).await })
        })
        .collect();

    assert!(
        wait_until(Duration::from_millis(500), {
            let queue = queue.clone();
            move || queue.get_stats().pending == 2
        })
        .await
    );
    queue.set_concurrency(ConcurrencyLimit::new_saturating(3));

    for trigger in triggers {
        assert!(trigger.await.expect("join").expect("resolves").is_success());
    }
    assert_eq!(queue.get_stats().success, 3);
}
