//! Signal ingest for DriveTalk.
//!
//! Source adapters normalize raw telemetry, transcript and external-data
//! events into [`ContextDelta`](drivetalk_core::ContextDelta)s, stamp them with
//! per-source sequence numbers, and push them onto a bounded drop-oldest
//! queue that the fusion worker drains.

pub mod adapter;
pub mod hub;
pub mod queue;

pub use adapter::{ChannelConnector, Connector, Normalizer, RawEvent, SourceAdapter};
pub use hub::{Backoff, IngestHub};
pub use queue::DeltaQueue;
