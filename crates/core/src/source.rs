//! Signal source trait — the abstraction over context producers.
//!
//! A source owns one external connection (transcript socket, vehicle bus
//! subscription, external feed poller) and turns its raw events into
//! [`ContextDelta`]s. Reconnection is driven by the ingest hub through
//! `connect`; the fusion engine never sees it.

use async_trait::async_trait;

use crate::context::{ContextDelta, SourceKind};
use crate::error::IngestError;

#[async_trait]
pub trait SignalSource: Send {
    /// A human-readable name for this source (e.g. "can-gateway").
    fn name(&self) -> &str;

    /// Which kind of context this source produces.
    fn kind(&self) -> SourceKind;

    /// (Re)establish the external connection.
    ///
    /// Every successful call starts a new epoch: sequence numbers restart.
    async fn connect(&mut self) -> Result<(), IngestError>;

    /// The next normalized delta.
    ///
    /// `Ok(None)` means the connection closed. `Err(Malformed)` skips one raw
    /// event; `Err(ConnectionLost)` asks the hub to reconnect.
    async fn next_delta(&mut self) -> Result<Option<ContextDelta>, IngestError>;
}
