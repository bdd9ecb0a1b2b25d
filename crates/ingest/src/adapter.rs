//! Source adapters: raw external events → normalized context deltas.
//!
//! A [`SourceAdapter`] pairs a [`Connector`] (the external connection) with a
//! [`Normalizer`] chosen at construction for its source kind, and stamps
//! every delta with a per-session sequence number inside the current epoch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use drivetalk_core::{ContextDelta, IngestError, SessionId, SignalSource, SourceKind};

/// One event as it arrives from an external connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub session_id: String,

    /// Observation time; the receive time is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl RawEvent {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: None,
            payload: serde_json::Map::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// The external connection behind a source adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Where this connector points (socket address, bus name, feed URL).
    fn endpoint(&self) -> &str;

    /// Open a connection and return its event stream.
    async fn open(&self) -> Result<mpsc::Receiver<RawEvent>, IngestError>;
}

/// Per-kind normalization of raw payloads into semantic fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    /// Every key becomes `vehicle.<key>`; nulls are dropped.
    Telemetry,
    /// Requires `text`; yields `transcript.text`, `transcript.final`, `transcript.confidence`.
    Transcript,
    /// Requires `feed`; every other key becomes `external.<feed>.<key>`.
    External,
}

impl Normalizer {
    pub fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Telemetry => Self::Telemetry,
            SourceKind::Transcript => Self::Transcript,
            SourceKind::External => Self::External,
        }
    }

    pub fn normalize(
        &self,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, String> {
        let mut fields = BTreeMap::new();
        match self {
            Self::Telemetry => {
                for (key, value) in payload {
                    if !value.is_null() {
                        fields.insert(format!("vehicle.{key}"), value.clone());
                    }
                }
                if fields.is_empty() {
                    return Err("telemetry event carries no values".into());
                }
            }
            Self::Transcript => {
                let text = payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or("transcript event is missing 'text'")?;
                fields.insert("transcript.text".into(), text.into());
                let is_final = payload.get("final").and_then(|v| v.as_bool()).unwrap_or(false);
                fields.insert("transcript.final".into(), is_final.into());
                if let Some(confidence) = payload.get("confidence").and_then(|v| v.as_f64()) {
                    fields.insert("transcript.confidence".into(), confidence.into());
                }
            }
            Self::External => {
                let feed = payload
                    .get("feed")
                    .and_then(|v| v.as_str())
                    .filter(|f| !f.is_empty())
                    .ok_or("external event is missing 'feed'")?;
                for (key, value) in payload.iter().filter(|(k, _)| k.as_str() != "feed") {
                    fields.insert(format!("external.{feed}.{key}"), value.clone());
                }
                if fields.is_empty() {
                    return Err(format!("external feed '{feed}' carries no values"));
                }
            }
        }
        Ok(fields)
    }
}

/// A signal source built from a connector and a normalizer.
pub struct SourceAdapter {
    name: String,
    kind: SourceKind,
    normalizer: Normalizer,
    connector: Arc<dyn Connector>,
    events: Option<mpsc::Receiver<RawEvent>>,
    epoch: u32,
    /// Last sequence issued in this epoch. One counter for every session, so
    /// each session still sees strictly increasing numbers and the adapter
    /// keeps no per-session state.
    sequence: u64,
}

impl SourceAdapter {
    pub fn new(name: impl Into<String>, kind: SourceKind, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            kind,
            normalizer: Normalizer::for_kind(kind),
            connector,
            events: None,
            epoch: 0,
            sequence: 0,
        }
    }

    /// Vehicle bus subscription.
    pub fn telemetry(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::new(name, SourceKind::Telemetry, connector)
    }

    /// Streaming transcript socket.
    pub fn transcript(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::new(name, SourceKind::Transcript, connector)
    }

    /// External data poller (weather, traffic, calendar, trip history).
    pub fn external(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::new(name, SourceKind::External, connector)
    }

    /// Current connection generation (0 before the first connect).
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    fn malformed(&self, reason: impl Into<String>) -> IngestError {
        IngestError::Malformed {
            source_name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SignalSource for SourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<(), IngestError> {
        let events = self.connector.open().await?;
        self.events = Some(events);
        self.epoch += 1;
        self.sequence = 0;
        info!(
            source = %self.name,
            endpoint = %self.connector.endpoint(),
            epoch = self.epoch,
            "Source connected"
        );
        Ok(())
    }

    async fn next_delta(&mut self) -> Result<Option<ContextDelta>, IngestError> {
        let Some(events) = self.events.as_mut() else {
            return Err(IngestError::ConnectionLost(format!(
                "source '{}' is not connected",
                self.name
            )));
        };

        let Some(raw) = events.recv().await else {
            debug!(source = %self.name, epoch = self.epoch, "Source stream closed");
            self.events = None;
            return Ok(None);
        };

        if raw.session_id.trim().is_empty() {
            return Err(self.malformed("event has no session id"));
        }
        let fields = self
            .normalizer
            .normalize(&raw.payload)
            .map_err(|reason| self.malformed(reason))?;

        self.sequence += 1;

        Ok(Some(ContextDelta {
            session_id: SessionId::from(raw.session_id),
            source: self.kind,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            epoch: self.epoch,
            sequence: self.sequence,
            fields,
        }))
    }
}

/// An in-process connector that hands out pre-arranged `mpsc` streams.
///
/// Each `open` takes the next pending stream; with none left it reports a
/// lost connection, which exercises the hub's backoff.
pub struct ChannelConnector {
    endpoint: String,
    pending: Mutex<VecDeque<mpsc::Receiver<RawEvent>>>,
}

impl ChannelConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a connector with one pending connection and its sender.
    pub fn pair(endpoint: impl Into<String>, buffer: usize) -> (Self, mpsc::Sender<RawEvent>) {
        let connector = Self::new(endpoint);
        let tx = connector.add_connection(buffer);
        (connector, tx)
    }

    /// Queue another connection; returns the sender feeding it.
    pub fn add_connection(&self, buffer: usize) -> mpsc::Sender<RawEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(rx);
        tx
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open(&self) -> Result<mpsc::Receiver<RawEvent>, IngestError> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| {
                IngestError::ConnectionLost(format!("no connection available at {}", self.endpoint))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn telemetry_prefixes_and_drops_nulls() {
        let payload = RawEvent::new("s1")
            .with("speed_kph", json!(92))
            .with("fuel_pct", json!(null))
            .payload;
        let fields = Normalizer::Telemetry.normalize(&payload).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["vehicle.speed_kph"], json!(92));
    }

    #[test]
    fn transcript_requires_text() {
        let payload = RawEvent::new("s1").with("final", json!(true)).payload;
        assert!(Normalizer::Transcript.normalize(&payload).is_err());

        let payload = RawEvent::new("s1")
            .with("text", json!("take me home"))
            .with("final", json!(true))
            .with("confidence", json!(0.93))
            .payload;
        let fields = Normalizer::Transcript.normalize(&payload).unwrap();
        assert_eq!(fields["transcript.text"], json!("take me home"));
        assert_eq!(fields["transcript.final"], json!(true));
        assert_eq!(fields["transcript.confidence"], json!(0.93));
    }

    #[test]
    fn external_namespaces_by_feed() {
        let payload = RawEvent::new("s1")
            .with("feed", json!("weather"))
            .with("sky", json!("rain"))
            .payload;
        let fields = Normalizer::External.normalize(&payload).unwrap();
        assert_eq!(fields["external.weather.sky"], json!("rain"));
        assert!(!fields.contains_key("external.weather.feed"));

        let only_feed = RawEvent::new("s1").with("feed", json!("traffic")).payload;
        assert!(Normalizer::External.normalize(&only_feed).is_err());
    }

    #[tokio::test]
    async fn sequences_increase_across_sessions_and_reset_on_reconnect() {
        let connector = Arc::new(ChannelConnector::new("can0"));
        let first = connector.add_connection(8);
        let second = connector.add_connection(8);
        let mut adapter = SourceAdapter::telemetry("can-gateway", connector);

        adapter.connect().await.unwrap();
        first.send(RawEvent::new("a").with("speed", json!(1))).await.unwrap();
        first.send(RawEvent::new("b").with("speed", json!(2))).await.unwrap();
        first.send(RawEvent::new("a").with("speed", json!(3))).await.unwrap();
        drop(first);

        let d1 = adapter.next_delta().await.unwrap().unwrap();
        let d2 = adapter.next_delta().await.unwrap().unwrap();
        let d3 = adapter.next_delta().await.unwrap().unwrap();
        assert_eq!((d1.epoch, d1.sequence), (1, 1));
        assert_eq!((d2.session_id.as_str(), d2.sequence), ("b", 2));
        assert_eq!((d3.session_id.as_str(), d3.sequence), ("a", 3));
        assert!(adapter.next_delta().await.unwrap().is_none());

        adapter.connect().await.unwrap();
        second.send(RawEvent::new("a").with("speed", json!(4))).await.unwrap();
        let d4 = adapter.next_delta().await.unwrap().unwrap();
        assert_eq!((d4.epoch, d4.sequence), (2, 1));
    }

    #[tokio::test]
    async fn malformed_event_does_not_consume_a_sequence() {
        let (connector, tx) = ChannelConnector::pair("asr", 8);
        let mut adapter = SourceAdapter::transcript("asr-stream", Arc::new(connector));
        adapter.connect().await.unwrap();

        tx.send(RawEvent::new("s1").with("confidence", json!(0.4))).await.unwrap();
        tx.send(RawEvent::new("s1").with("text", json!("hello"))).await.unwrap();

        assert!(matches!(
            adapter.next_delta().await,
            Err(IngestError::Malformed { .. })
        ));
        let delta = adapter.next_delta().await.unwrap().unwrap();
        assert_eq!(delta.sequence, 1);
    }

    #[tokio::test]
    async fn many_sessions_keep_per_session_order() {
        let (connector, tx) = ChannelConnector::pair("can0", 512);
        let mut adapter = SourceAdapter::telemetry("can-gateway", Arc::new(connector));
        adapter.connect().await.unwrap();

        for round in 0..3 {
            for session in 0..100 {
                tx.send(RawEvent::new(format!("car-{session}")).with("speed", json!(round)))
                    .await
                    .unwrap();
            }
        }
        drop(tx);

        let mut last: HashMap<String, u64> = HashMap::new();
        while let Some(delta) = adapter.next_delta().await.unwrap() {
            let previous = last.insert(delta.session_id.to_string(), delta.sequence);
            assert!(previous.is_none_or(|p| p < delta.sequence));
        }
        assert_eq!(last.len(), 100);
        assert_eq!(last["car-99"], 300);
    }

    #[tokio::test]
    async fn next_delta_before_connect_is_connection_lost() {
        let mut adapter =
            SourceAdapter::external("weather", Arc::new(ChannelConnector::new("feeds")));
        assert!(matches!(
            adapter.next_delta().await,
            Err(IngestError::ConnectionLost(_))
        ));
        assert!(adapter.connect().await.is_err());
    }
}
