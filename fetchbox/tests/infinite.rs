//! Infinite read controller behavior.

mod common;

use std::time::Duration;

use serde_json::{Value, json};

use fetchbox::prelude::*;
use fetchbox::{FetchDirection, InfinitePaging, InfiniteSpec, PageRequest, Response};

use common::{MockTransport, wait_until};

/// Pages are keyed by cursor; cursor 0 is the newest page, higher cursors
/// are older pages, lower (negative) cursors are newer ones.
fn paged_transport() -> std::sync::Arc<MockTransport> {
    MockTransport::with_handler(|request| {
        let cursor = request
            .query
            .as_ref()
            .and_then(|query| query.get("cursor"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        match cursor {
            -1 => Response::ok(json!({"items": ["new-1", "new-2"], "cursor": -1})),
            0 => Response::ok(json!({"items": ["a", "b"], "cursor": 0})),
            1 => Response::ok(json!({"items": ["c", "d"], "cursor": 1})),
            2 => Response::ok(json!({"items": ["e"], "cursor": 2, "last": true})),
            other => Response::error(404, json!(format!("no page {other}"))),
        }
    })
}

fn cursor_of(response: &Response) -> i64 {
    response
        .data
        .as_ref()
        .and_then(|data| data.get("cursor"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn bidirectional_paging() -> InfinitePaging {
    InfinitePaging::new(
        |view| {
            view.page_response
                .data
                .as_ref()
                .and_then(|data| data.get("last"))
                .is_none()
        },
        |view| Some(PageRequest::query(json!({"cursor": cursor_of(&view.page_response) + 1}))),
        |responses| {
            let merged: Vec<Value> = responses
                .iter()
                .filter_map(|response| response.data.as_ref())
                .filter_map(|data| data.get("items"))
                .filter_map(Value::as_array)
                .flatten()
                .cloned()
                .collect();
            Value::Array(merged)
        },
    )
    .with_prev(
        |view| cursor_of(&view.page_response) > -1,
        |view| Some(PageRequest::query(json!({"cursor": cursor_of(&view.page_response) - 1}))),
    )
}

fn feed_spec() -> InfiniteSpec {
    InfiniteSpec {
        base: OperationSpec::get("/feed").tag("feed"),
        paging: bidirectional_paging(),
    }
}

#[tokio::test]
async fn fetch_prev_prepends() {
    let transport = paged_transport();
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let feed = layer.infinite(feed_spec());

    feed.fetch_next().await.expect("page 0").expect("dispatched");
    feed.fetch_next().await.expect("page 1").expect("dispatched");
    assert_eq!(feed.get_state().data, Some(json!(["a", "b", "c", "d"])));

    feed.fetch_prev().await.expect("page -1").expect("dispatched");
    let state = feed.get_state();
    assert_eq!(
        state.data,
        Some(json!(["new-1", "new-2", "a", "b", "c", "d"])),
        "prepended at index 0"
    );
    assert_eq!(state.all_requests[0], PageRequest::query(json!({"cursor": -1})));
    assert!(state.can_fetch_next);
    assert!(!state.can_fetch_prev, "cursor -1 is the newest page");
}

#[tokio::test]
async fn exhausted_paging_stops() {
    let transport = paged_transport();
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let feed = layer.infinite(feed_spec());

    for _ in 0..3 {
        feed.fetch_next().await.expect("page");
    }
    assert_eq!(transport.calls(), 3);
    assert!(!feed.get_state().can_fetch_next, "page 2 is marked last");

    let outcome = feed.fetch_next().await.expect("no-op");
    assert!(outcome.is_none());
    assert_eq!(transport.calls(), 3, "exhausted paging does not dispatch");
}

#[tokio::test]
async fn failed_page_keeps_loaded_pages() {
    let transport = MockTransport::with_handler(|request| {
        let cursor = request
            .query
            .as_ref()
            .and_then(|query| query.get("cursor"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if cursor == 0 {
            Response::ok(json!({"items": ["a"], "cursor": 0}))
        } else {
            Response::error(500, json!("page unavailable"))
        }
    });
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let feed = layer.infinite(feed_spec());

    feed.fetch_next().await.expect("page 0");
    feed.fetch_next().await.expect("page 1 fails");

    let state = feed.get_state();
    assert_eq!(state.data, Some(json!(["a"])), "loaded pages stay");
    assert_eq!(state.error, Some(json!("page unavailable")));
    assert_eq!(state.all_requests.len(), 1, "failed page is not appended");
}

#[tokio::test]
async fn tracker_survives_remount() {
    let transport = paged_transport();
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");

    {
        let feed = layer.infinite(feed_spec());
        feed.fetch_next().await.expect("page 0");
        feed.fetch_next().await.expect("page 1");
        assert_eq!(transport.calls(), 2);
    }

    // A new controller over the same layer finds the tracker and pages.
    let revived = layer.infinite(feed_spec());
    revived.mount().await.expect("mount");
    let state = revived.get_state();
    assert_eq!(state.data, Some(json!(["a", "b", "c", "d"])));
    assert_eq!(state.all_requests.len(), 2);
    assert_eq!(transport.calls(), 2, "restored from cache, no dispatch");
    revived.unmount().await.expect("unmount");
}

#[tokio::test]
async fn refetch_event_for_page_key_restarts_composite() {
    let transport = paged_transport();
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let feed = layer.infinite(feed_spec());

    feed.mount().await.expect("mount");
    feed.fetch_next().await.expect("page 0");
    feed.fetch_next().await.expect("page 1");
    assert_eq!(transport.calls(), 2);

    let page_one_key = {
        let options = RequestOptions::new().query(json!({"cursor": 1}));
        fetchbox::QueryKey::for_request("/feed", Method::Get, &options)
    };
    layer.events().emit(fetchbox::Event::Refetch(fetchbox::RefetchEvent {
        query_key: page_one_key,
        reason: fetchbox::RefetchReason::Invalidate,
    }));

    assert!(
        wait_until(Duration::from_millis(500), {
            let feed = feed.clone();
            move || {
                transport.calls() == 3 && feed.get_state().all_requests.len() == 1
            }
        })
        .await,
        "composite restarted from the first page"
    );
    feed.unmount().await.expect("unmount");
}

#[tokio::test]
async fn fetching_direction_is_visible_mid_flight() {
    let transport = MockTransport::delayed(Duration::from_millis(60), |_| {
        Response::ok(json!({"items": [], "cursor": 0}))
    });
    let layer = DataLayer::builder()
        .shared_transport(transport.clone())
        .with_default_plugins()
        .build()
        .expect("plugin graph");
    let feed = layer.infinite(feed_spec());

    assert_eq!(feed.get_fetching_direction(), None);
    let fetch = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.fetch_next().await })
    };
    assert!(
        wait_until(Duration::from_millis(500), {
            let feed = feed.clone();
            move || feed.get_fetching_direction() == Some(FetchDirection::Next)
        })
        .await
    );
    fetch.await.expect("join").expect("page resolves");
    assert_eq!(feed.get_fetching_direction(), None);
}
