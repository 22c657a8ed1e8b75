//! Cross-context messaging between surfaces and the host.
//!
//! Surfaces post through a [`MessagePort`] stamped with their id; the host
//! owns the [`MessageBus`] and drains it. Delivery follows `postMessage`
//! target-origin rules. Which surface a message came from is left to the
//! host to judge, since a released surface may still have messages in flight.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Default number of console lines kept by the host.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Identity of one rendered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        }
    }
}

/// Structured notification from a sandbox to its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardedMessage {
    Console {
        level: ConsoleLevel,
        #[serde(default)]
        args: Vec<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl fmt::Display for ForwardedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardedMessage::Console { level, args } => write!(f, "[{}] {}", level.as_str(), args.join(" ")),
            ForwardedMessage::Error { message, .. } => write!(f, "[error] {message}"),
        }
    }
}

/// A posted message as it travels over the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: SurfaceId,
    pub target_origin: String,
    /// JSON-serialized payload.
    pub data: String,
}

/// Sending side handed to a surface.
#[derive(Debug, Clone)]
pub struct MessagePort {
    source: SurfaceId,
    tx: UnboundedSender<Envelope>,
}

impl MessagePort {
    pub fn source(&self) -> SurfaceId {
        self.source
    }

    pub fn post(&self, data: impl Into<String>, target_origin: impl Into<String>) {
        let envelope = Envelope {
            source: self.source,
            target_origin: target_origin.into(),
            data: data.into(),
        };
        // The host may already be gone; a message to nobody is dropped.
        if self.tx.send(envelope).is_err() {
            tracing::debug!(source = %self.source, "message posted after host shut down");
        }
    }
}

/// Host side of the message channel.
#[derive(Debug)]
pub struct MessageBus {
    origin: String,
    tx: UnboundedSender<Envelope>,
    rx: UnboundedReceiver<Envelope>,
}

impl MessageBus {
    /// Bus for a host living at `origin` (scheme://host[:port]).
    pub fn new(origin: impl AsRef<str>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            origin: serialize_origin(origin.as_ref()),
            tx,
            rx,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn port(&self, source: SurfaceId) -> MessagePort {
        MessagePort {
            source,
            tx: self.tx.clone(),
        }
    }

    /// Whether a message addressed to `target_origin` reaches this host.
    pub fn accepts_origin(&self, target_origin: &str) -> bool {
        target_origin == "*" || serialize_origin(target_origin) == self.origin
    }

    /// Take every delivered envelope, in arrival order.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            if self.accepts_origin(&envelope.target_origin) {
                delivered.push(envelope);
            } else {
                tracing::debug!(
                    source = %envelope.source,
                    target = %envelope.target_origin,
                    origin = %self.origin,
                    "dropped message addressed to another origin"
                );
            }
        }
        delivered
    }
}

/// Origins compare by their ASCII serialization, so a trailing slash or a
/// default port does not matter. Values that are not URLs compare as given,
/// minus any trailing slash.
fn serialize_origin(value: &str) -> String {
    match url::Url::parse(value) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => value.trim_end_matches('/').to_string(),
    }
}

/// Bounded, ordered console history. Oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    entries: VecDeque<ForwardedMessage>,
    capacity: usize,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl ConsoleLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity,
        }
    }

    pub fn push(&mut self, message: ForwardedMessage) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForwardedMessage> {
        self.entries.iter()
    }

    /// Display lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(text: &str) -> ForwardedMessage {
        ForwardedMessage::Console {
            level: ConsoleLevel::Log,
            args: vec![text.to_string()],
        }
    }

    #[test]
    fn test_parse_console_message() {
        let msg: ForwardedMessage =
            serde_json::from_str(r#"{"type":"console","level":"warn","args":["a","{\"b\":1}"]}"#).unwrap();
        assert_eq!(
            msg,
            ForwardedMessage::Console {
                level: ConsoleLevel::Warn,
                args: vec!["a".into(), r#"{"b":1}"#.into()],
            }
        );
        assert_eq!(msg.to_string(), r#"[warn] a {"b":1}"#);
    }

    #[test]
    fn test_parse_error_message() {
        let msg: ForwardedMessage =
            serde_json::from_str(r#"{"type":"error","message":"boom","stack":null}"#).unwrap();
        assert_eq!(
            msg,
            ForwardedMessage::Error {
                message: "boom".into(),
                stack: None
            }
        );
        assert_eq!(msg.to_string(), "[error] boom");
    }

    #[test]
    fn test_non_protocol_payloads_are_rejected() {
        assert!(serde_json::from_str::<ForwardedMessage>(r#"{"type":"ntml-action"}"#).is_err());
        assert!(serde_json::from_str::<ForwardedMessage>(r#""hello""#).is_err());
        assert!(serde_json::from_str::<ForwardedMessage>(r#"{"type":"console","level":"trace"}"#).is_err());
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut console = ConsoleLog::with_capacity(200);
        for i in 0..250 {
            console.push(log(&i.to_string()));
        }
        assert_eq!(console.len(), 200);
        let lines = console.lines();
        assert_eq!(lines.first().unwrap(), "[log] 50");
        assert_eq!(lines.last().unwrap(), "[log] 249");

        console.clear();
        assert!(console.is_empty());
        assert_eq!(console.capacity(), 200);
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut console = ConsoleLog::with_capacity(0);
        console.push(log("a"));
        console.push(log("b"));
        assert_eq!(console.lines(), vec!["[log] b".to_string()]);
    }

    #[test]
    fn test_bus_target_origin_rules() {
        let mut bus = MessageBus::new("http://localhost:8080");
        let port = bus.port(SurfaceId(1));

        port.post("1", "*");
        port.post("2", "http://localhost:8080");
        port.post("3", "https://evil.example");
        port.post("4", "http://localhost:8080/");

        let data: Vec<_> = bus.drain().into_iter().map(|e| e.data).collect();
        assert_eq!(data, vec!["1", "2", "4"]);
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_host_origin_is_normalized() {
        let bus = MessageBus::new("http://x.test/");
        assert_eq!(bus.origin(), "http://x.test");
        assert!(bus.accepts_origin("http://x.test"));
        assert!(bus.accepts_origin("http://x.test/"));
        assert!(bus.accepts_origin("http://X.test:80"));
        assert!(!bus.accepts_origin("http://x.test:8080"));
        assert!(!bus.accepts_origin("https://x.test"));
    }

    #[test]
    fn test_bus_preserves_source() {
        let mut bus = MessageBus::new("http://localhost");
        bus.port(SurfaceId(7)).post("a", "*");
        bus.port(SurfaceId(8)).post("b", "*");

        let sources: Vec<_> = bus.drain().into_iter().map(|e| e.source).collect();
        assert_eq!(sources, vec![SurfaceId(7), SurfaceId(8)]);
    }
}
