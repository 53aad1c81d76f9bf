//! Multi-device sync through a key-value blob store.
//!
//! Local changes become [`SyncOperation`]s in a persistent FIFO
//! ([`SyncQueue`]). Each operation belongs to one cloud record (feeds, read
//! state, tags, tagged items, smart folders). Delivery reads the record,
//! merges the change in and writes it back with a version precondition,
//! re-merging on conflict.
//!
//! Records are [`SyncRecord`]s: per-key add/remove timestamps whose merge is
//! commutative, associative and idempotent, so any device can fold any other
//! device's record in at any time.
//!
//! - [`record`]: the mergeable record type
//! - [`operation`]: typed operations and their record mapping
//! - [`store`]: the [`BlobStore`] trait and an in-memory store
//! - [`http`]: [`HttpBlobStore`] over `reqwest`
//! - [`queue`]: retrying FIFO with backoff, rate-limit pauses and reconciliation
//! - [`engine`]: background worker loop and pull of remote state

mod engine;
mod http;
mod operation;
mod queue;
mod record;
mod store;

pub use engine::{DrainSummary, PullSummary, SyncEngine};
pub(crate) use engine::now_ms;
pub use http::HttpBlobStore;
pub use operation::{parse_tagged_item_key, tagged_item_key, QueuedOperation, RecordKey, SyncOperation};
pub use queue::{ProcessOutcome, RetryPolicy, SyncQueue};
pub use record::{EntryState, SyncRecord};
pub use store::{BlobStore, CloudError, MemoryBlobStore, VersionedBlob};
