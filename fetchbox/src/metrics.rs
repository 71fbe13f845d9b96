//! Metrics declaration and initialization.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Track number of cache hit events.
    pub static ref CACHE_HIT_COUNTER: &'static str = {
        metrics::describe_counter!(
            "cache_hit_count",
            "Total number of cache short-circuit hits."
        );
        "cache_hit_count"
    };
    /// Track number of cache miss events.
    pub static ref CACHE_MISS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "cache_miss_count",
            "Total number of cache misses that reached the transport chain."
        );
        "cache_miss_count"
    };
    /// Track number of deduplicated requests.
    pub static ref DEDUP_JOIN_COUNTER: &'static str = {
        metrics::describe_counter!(
            "request_dedup_join_count",
            "Total number of callers that joined an in-flight request."
        );
        "request_dedup_join_count"
    };
    /// Track number of queue items settled, by status.
    pub static ref QUEUE_SETTLED_COUNTER: &'static str = {
        metrics::describe_counter!(
            "queue_items_settled_total",
            "Total number of queue items settled, labeled by status."
        );
        "queue_items_settled_total"
    };
}
