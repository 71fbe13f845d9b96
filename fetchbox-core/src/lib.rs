#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Abort signalling for in-flight requests.
///
/// Provides the [`AbortController`] / [`AbortSignal`](abort::AbortSignal)
/// pair used to cancel transport calls cooperatively.
pub mod abort;

/// Canonical query keys.
///
/// A [`QueryKey`] is the canonical identifier of a `{path, method, options}`
/// triple. Semantically equal requests always produce byte-equal keys.
pub mod key;

/// Request descriptions: methods, options, and header sources.
pub mod request;

/// The response envelope returned by transports and controllers.
pub mod response;

/// Operation state and cache entry types.
pub mod state;

/// The injectable transport boundary.
///
/// The core never talks HTTP itself; it hands a [`TransportRequest`] to a
/// user-supplied [`Transport`] and receives a [`Response`] back.
pub mod transport;

pub use abort::{AbortController, AbortSignal};
pub use key::{DecodedKey, QueryKey};
pub use request::{HeaderSource, Method, RequestOptions};
pub use response::Response;
pub use state::{CacheEntry, CachePatch, MetaMap, OperationState, PatchOp, StatePatch};
pub use transport::{FnTransport, Transport, TransportRequest};
