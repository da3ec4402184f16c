use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::error;
use uuid::Uuid;

/// The in-process events emitted by the ingestion pipeline and the servers.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum EventKind {
    PositionReceived,
    PositionRecorded,
    DeviceOnline,
    DeviceOffline,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::PositionReceived,
        EventKind::PositionRecorded,
        EventKind::DeviceOnline,
        EventKind::DeviceOffline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PositionReceived => "position.received",
            EventKind::PositionRecorded => "position.recorded",
            EventKind::DeviceOnline => "device.online",
            EventKind::DeviceOffline => "device.offline",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown event kind: {0}")]
pub struct ParseEventKindError(String);

/// Allow casting `EventKind` from the dotted wire names.
impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position.received" => Ok(EventKind::PositionReceived),
            "position.recorded" => Ok(EventKind::PositionRecorded),
            "device.online" => Ok(EventKind::DeviceOnline),
            "device.offline" => Ok(EventKind::DeviceOffline),
            unknown => Err(ParseEventKindError(unknown.to_owned())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct EventKindVisitor;

impl<'de> Visitor<'de> for EventKindVisitor {
    type Value = EventKind;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the dotted name of an event kind")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match EventKind::from_str(s) {
            Ok(kind) => Ok(kind),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

/// Deserialize from the dotted wire name, e.g. in webhook registrations.
impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(EventKindVisitor)
    }
}

/// Serialize to the dotted wire name used in webhook payloads.
impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// An event as published on the bus and delivered to webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// The entity the event is about: a device external id, or a position id.
    pub subject: String,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, subject: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            occurred_at: Utc::now(),
            subject: subject.into(),
            data,
        }
    }
}

/// A subscriber callback. Handlers run on their own spawned task, so a slow
/// or panicking handler cannot take down the publisher or its siblings.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process fan-out of [`Event`]s to registered handlers.
///
/// `publish` waits for every handler invocation to return before resuming the
/// caller. Handlers that need to outlive the publish call (webhook delivery
/// chains for example) must spawn their own tasks.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push(handler);
    }

    pub async fn publish(&self, event: Event) {
        let handlers = {
            let map = self.handlers.read().await;
            map.get(&event.kind).cloned().unwrap_or_default()
        };

        metrics::counter!("events_published_total", &[("event", event.kind.as_str())])
            .increment(1);

        if handlers.is_empty() {
            return;
        }

        let mut dispatched = JoinSet::new();
        for handler in handlers {
            dispatched.spawn(handler(event.clone()));
        }
        while let Some(joined) = dispatched.join_next().await {
            if let Err(err) = joined {
                error!(event = event.kind.as_str(), "event handler failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn collector(seen: &Arc<Mutex<Vec<Event>>>) -> EventHandler {
        let seen = seen.clone();
        Arc::new(move |event| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(event);
            })
        })
    }

    #[test]
    fn event_kind_dotted_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("device.exploded".parse::<EventKind>().is_err());
    }

    #[test]
    fn event_kind_serializes_to_wire_name() {
        let json = serde_json::to_string(&EventKind::PositionRecorded).unwrap();
        assert_eq!(json, r#""position.recorded""#);
        let kind: EventKind = serde_json::from_str(r#""device.online""#).unwrap();
        assert_eq!(kind, EventKind::DeviceOnline);
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = EventBus::new();
        let online_seen = Arc::new(Mutex::new(Vec::new()));
        let offline_seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::DeviceOnline, collector(&online_seen))
            .await;
        bus.subscribe(EventKind::DeviceOffline, collector(&offline_seen))
            .await;

        bus.publish(Event::new(
            EventKind::DeviceOnline,
            "860000000000001",
            serde_json::json!({"source": "gt06"}),
        ))
        .await;

        let online = online_seen.lock().unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].subject, "860000000000001");
        assert!(offline_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(Event::new(
            EventKind::PositionReceived,
            "x",
            serde_json::Value::Null,
        ))
        .await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_starve_siblings() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::PositionRecorded,
            Arc::new(|_| Box::pin(async { panic!("boom") })),
        )
        .await;
        bus.subscribe(EventKind::PositionRecorded, collector(&seen)).await;

        bus.publish(Event::new(
            EventKind::PositionRecorded,
            "p1",
            serde_json::Value::Null,
        ))
        .await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_waits_for_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slow_seen = seen.clone();
        bus.subscribe(
            EventKind::DeviceOffline,
            Arc::new(move |event| {
                let seen = slow_seen.clone();
                Box::pin(async move {
                    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
                    seen.lock().unwrap().push(event);
                })
            }),
        )
        .await;

        bus.publish(Event::new(
            EventKind::DeviceOffline,
            "d",
            serde_json::Value::Null,
        ))
        .await;

        // The slow handler must have completed by the time publish returns.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
