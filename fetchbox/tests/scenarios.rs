//! End-to-end scenarios across the controller/plugin stack.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use smol_str::SmolStr;

use fetchbox::plugins::{DebouncePlugin, OptimisticTarget};
use fetchbox::prelude::*;
use fetchbox::{
    CachePatch, Event, InfinitePaging, InfiniteSpec, Method, PageRequest, QueryKey, events,
};

use common::MockTransport;

fn items_merger(responses: &[fetchbox::Response]) -> Value {
    let merged: Vec<Value> = responses
        .iter()
        .filter_map(|response| response.data.as_ref())
        .filter_map(|data| data.get("items"))
        .filter_map(Value::as_array)
        .flatten()
        .cloned()
        .collect();
    Value::Array(merged)
}

/// S1: a read inside the staleness window is served without a transport
/// call.
#[tokio::test]
async fn cache_hit_within_ttl() {
    let transport = MockTransport::ok(json!({"id": 1}));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let reader = layer.read(
        OperationSpec::get("/item")
            .plugin_options(PluginOptions::new().stale_time(Duration::from_millis(1000))),
    );

    let first = reader.execute(None, false).await.expect("first execute");
    assert_eq!(first.data, Some(json!({"id": 1})));
    assert_eq!(transport.calls(), 1);

    let second = reader.execute(None, false).await.expect("second execute");
    assert_eq!(second.status, 200);
    assert_eq!(second.data, Some(json!({"id": 1})));
    assert_eq!(transport.calls(), 1, "hit must not reach the transport");
}

/// A read outside the staleness window refetches.
#[tokio::test]
async fn cache_miss_after_ttl() {
    let transport = MockTransport::ok(json!({"id": 1}));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let reader = layer.read(
        OperationSpec::get("/item")
            .plugin_options(PluginOptions::new().stale_time(Duration::from_millis(5))),
    );
    reader.execute(None, false).await.expect("first execute");
    tokio::time::sleep(Duration::from_millis(20)).await;
    reader.execute(None, false).await.expect("second execute");
    assert_eq!(transport.calls(), 2);
}

/// S2: concurrent reads of one key collapse onto a single transport call.
#[tokio::test]
async fn concurrent_reads_deduplicate() {
    let transport =
        MockTransport::delayed(Duration::from_millis(50), |_| Response::ok(json!({"id": 7})));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let reader = layer.read(OperationSpec::get("/item"));
    let (a, b, c) = tokio::join!(
        reader.execute(None, false),
        reader.execute(None, false),
        reader.execute(None, false),
    );
    let (a, b, c) = (
        a.expect("first"),
        b.expect("second"),
        c.expect("third"),
    );

    assert_eq!(transport.calls(), 1, "exactly one dispatch");
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.data, Some(json!({"id": 7})));
}

/// S3: optimistic delete applies provisionally and rolls back on error.
#[tokio::test]
async fn optimistic_delete_rolls_back() {
    let transport = MockTransport::delayed(Duration::from_millis(40), |_| {
        Response::error(500, json!("write rejected"))
    });
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let posts_key = QueryKey::for_request("/posts", Method::Get, &RequestOptions::new());
    layer.state().set_cache(
        &posts_key,
        CachePatch::commit(json!([{"id": 1}, {"id": 2}]), 1).tags(vec![SmolStr::new("posts")]),
    );

    let writer = layer.write(
        OperationSpec::delete("/posts/:id")
            .tag("posts")
            .plugin_options(PluginOptions::new().optimistic(
                OptimisticTarget::get("/posts").update_cache(|current, _response| {
                    match current {
                        Some(Value::Array(posts)) => Value::Array(
                            posts
                                .iter()
                                .filter(|post| post.get("id") != Some(&json!(1)))
                                .cloned()
                                .collect(),
                        ),
                        other => other.cloned().unwrap_or(Value::Null),
                    }
                }),
            )),
    );

    let write = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.execute(None, false).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = layer.state().get_cache(&posts_key).expect("entry");
    assert_eq!(entry.state.data, Some(json!([{"id": 2}])), "provisional");
    assert!(entry.is_optimistic());
    assert_eq!(entry.meta.get("isOptimistic"), Some(&json!(true)));

    let response = write.await.expect("join").expect("write resolves");
    assert_eq!(response.error, Some(json!("write rejected")));

    let entry = layer.state().get_cache(&posts_key).expect("entry");
    assert_eq!(entry.state.data, Some(json!([{"id": 1}, {"id": 2}])), "rolled back");
    assert!(!entry.is_optimistic());
    assert_eq!(entry.meta.get("isOptimistic"), Some(&json!(false)));
}

/// S4: forward paging merges in order; refetch starts the composite over.
#[tokio::test]
async fn infinite_fetch_next_then_refetch() {
    let transport = MockTransport::with_handler(|request| {
        match request
            .query
            .as_ref()
            .and_then(|query| query.get("cursor"))
            .and_then(Value::as_i64)
        {
            None => Response::ok(json!({"items": ["A", "B"], "next": 2})),
            Some(2) => Response::ok(json!({"items": ["C", "D"]})),
            Some(other) => Response::error(404, json!(format!("no page {other}"))),
        }
    });
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let feed = layer.infinite(InfiniteSpec {
        base: OperationSpec::get("/feed").tag("feed"),
        paging: InfinitePaging::new(
            |view| {
                view.page_response
                    .data
                    .as_ref()
                    .and_then(|data| data.get("next"))
                    .is_some()
            },
            |view| {
                view.page_response
                    .data
                    .as_ref()
                    .and_then(|data| data.get("next"))
                    .map(|next| PageRequest::query(json!({"cursor": next})))
            },
            items_merger,
        ),
    });

    feed.fetch_next().await.expect("page 1").expect("dispatched");
    feed.fetch_next().await.expect("page 2").expect("dispatched");

    let state = feed.get_state();
    assert_eq!(state.data, Some(json!(["A", "B", "C", "D"])));
    assert!(!state.can_fetch_next, "last page has no next cursor");
    assert_eq!(state.all_requests.len(), 2);
    assert_eq!(transport.calls(), 2);

    let page_two_key = {
        let options = RequestOptions::new().query(json!({"cursor": 2}));
        QueryKey::for_request("/feed", Method::Get, &options)
    };
    assert!(layer.state().get_cache(&page_two_key).is_some());

    feed.refetch().await.expect("refetch");
    assert!(
        layer.state().get_cache(&page_two_key).is_none(),
        "old page entries deleted"
    );
    let state = feed.get_state();
    assert_eq!(state.data, Some(json!(["A", "B"])), "fresh first page");
    assert_eq!(transport.calls(), 3);
}

/// S5: debounce collapses rapid re-queries into one refetch of the latest.
#[tokio::test(start_paused = true)]
async fn debounce_collapses_typing() {
    let transport = MockTransport::ok(json!([]));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .plugin(DebouncePlugin::new())
        .build()
        .expect("plugin graph");

    let refetched: Arc<Mutex<Vec<QueryKey>>> = Arc::default();
    let sink = Arc::clone(&refetched);
    let _subscription = layer.events().subscribe(events::topic::REFETCH, move |event| {
        if let Event::Refetch(refetch) = event {
            sink.lock().expect("lock").push(refetch.query_key.clone());
        }
    });

    let search = layer.read(
        OperationSpec::get("/search").plugin_options(PluginOptions::new().debounce(200u64)),
    );
    let query = |text: &str| RequestOptions::new().query(json!({"q": text}));

    search.execute(Some(query("a")), false).await.expect("a");
    tokio::time::advance(Duration::from_millis(50)).await;
    search.execute(Some(query("ab")), false).await.expect("ab");
    tokio::time::advance(Duration::from_millis(100)).await;
    search.execute(Some(query("abc")), false).await.expect("abc");

    // t = 150. Nothing may fire before t = 350.
    tokio::time::advance(Duration::from_millis(199)).await;
    tokio::task::yield_now().await;
    assert_eq!(transport.calls(), 0);
    assert!(refetched.lock().expect("lock").is_empty());

    tokio::time::advance(Duration::from_millis(2)).await;
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let expected = QueryKey::for_request("/search", Method::Get, &query("abc"));
    let seen = refetched.lock().expect("lock");
    assert_eq!(seen.as_slice(), [expected], "exactly one refetch, for the latest");
    assert_eq!(transport.calls(), 0, "the emission itself does not dispatch");
}

/// S6: the queue keeps `running` under the concurrency cap and settles
/// everything.
#[tokio::test]
async fn queue_respects_concurrency_bound() {
    let transport =
        MockTransport::delayed(Duration::from_millis(20), |_| Response::ok(json!("done")));
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    let queue = layer.queue(QueueSpec {
        base: OperationSpec::post("/upload"),
        config: QueueConfig {
            concurrency: fetchbox::ConcurrencyLimit::new_saturating(2),
            auto_start: true,
        },
    });

    let peak: Arc<Mutex<usize>> = Arc::default();
    let _subscription = {
        let observer = queue.clone();
        let peak = Arc::clone(&peak);
        queue.subscribe(move || {
            let running = observer.get_stats().running;
            let mut peak = peak.lock().expect("lock");
            if running > *peak {
                *peak = running;
            }
        })
    };

    let triggers = (0..5).map(|index| {
        let queue = queue.clone();
        async move { queue.trigger(QueueInput::body(json!({"index": index}))).await }
    });
    let responses = futures::future::join_all(triggers).await;

    for response in responses {
        assert!(response.expect("trigger resolves").is_success());
    }
    assert!(*peak.lock().expect("lock") <= 2, "running never exceeds 2");

    let stats = queue.get_stats();
    assert_eq!(stats.success, 5);
    assert_eq!(stats.settled, 5);
    assert_eq!(stats.percentage, 100);
    assert_eq!(transport.calls(), 5);
}
