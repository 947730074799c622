mod lane;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::events::lane::Lanes;
use crate::models::sla::SlaViolation;
use crate::models::transition::StateTransition;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    StateChanged,
    DeliveryCompleted,
    BreakRequired,
    SlaBreach,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StateChanged => "stateChanged",
            EventKind::DeliveryCompleted => "deliveryCompleted",
            EventKind::BreakRequired => "breakRequired",
            EventKind::SlaBreach => "slaBreach",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DispatchEvent {
    StateChanged {
        transition: StateTransition,
    },
    DeliveryCompleted {
        driver_id: Uuid,
        order_id: Uuid,
        delivered_at: DateTime<Utc>,
        completed_today: u32,
        consecutive_deliveries: u32,
        gap_from_target: i64,
        on_time: bool,
    },
    BreakRequired {
        driver_id: Uuid,
        consecutive_deliveries: u32,
        requires_break_after: u32,
        at: DateTime<Utc>,
    },
    SlaBreach {
        violation: SlaViolation,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DispatchEvent::StateChanged { .. } => EventKind::StateChanged,
            DispatchEvent::DeliveryCompleted { .. } => EventKind::DeliveryCompleted,
            DispatchEvent::BreakRequired { .. } => EventKind::BreakRequired,
            DispatchEvent::SlaBreach { .. } => EventKind::SlaBreach,
        }
    }

    pub fn driver_id(&self) -> Uuid {
        match self {
            DispatchEvent::StateChanged { transition } => transition.driver_id,
            DispatchEvent::DeliveryCompleted { driver_id, .. }
            | DispatchEvent::BreakRequired { driver_id, .. } => *driver_id,
            DispatchEvent::SlaBreach { violation } => violation.driver_id,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&DispatchEvent) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// In-process publish/subscribe owned by one engine instance.
///
/// Handlers run synchronously on a publishing thread. For a single driver
/// they observe events in commit order; across drivers there is no order.
/// A handler that errors or panics is logged and counted, and never
/// affects the commit that produced the event.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    lanes: Lanes,
    stream_tx: broadcast::Sender<DispatchEvent>,
    metrics: Metrics,
}

impl EventBus {
    pub fn new(buffer_size: usize, metrics: Metrics) -> Self {
        let (stream_tx, _unused_rx) = broadcast::channel(buffer_size.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            lanes: Lanes::default(),
            stream_tx,
            metrics,
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&DispatchEvent) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Lossy async feed of every delivered event, for forwarders that live
    /// outside the process. Slow readers see `Lagged` errors, not back-pressure.
    pub fn stream(&self) -> BroadcastStream<DispatchEvent> {
        BroadcastStream::new(self.stream_tx.subscribe())
    }

    /// Delivers an event immediately, outside any commit ordering.
    pub fn publish(&self, event: DispatchEvent) {
        self.deliver(&event);
    }

    pub(crate) fn open_lane(&self, driver_id: Uuid, loaded_version: u64) {
        self.lanes.open(driver_id, loaded_version);
    }

    /// Releases the events produced by the commit that created `version`.
    pub(crate) fn publish_committed(&self, driver_id: Uuid, version: u64, events: Vec<DispatchEvent>) {
        self.lanes
            .submit(driver_id, version, events, |event| self.deliver(event));
    }

    fn deliver(&self, event: &DispatchEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers
                .get(&kind)
                .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("handler panicked".to_string()),
            };
            if let Some(failure) = failure {
                self.metrics
                    .subscriber_failures_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                warn!(
                    event = %kind,
                    driver_id = %event.driver_id(),
                    error = %failure,
                    "event subscriber failed"
                );
            }
        }

        let _ = self.stream_tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    use super::{DispatchEvent, EventBus, EventKind};
    use crate::error::DispatchError;
    use crate::observability::metrics::Metrics;

    fn break_required(driver_id: Uuid) -> DispatchEvent {
        DispatchEvent::BreakRequired {
            driver_id,
            consecutive_deliveries: 5,
            requires_break_after: 5,
            at: Utc::now(),
        }
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let bus = EventBus::new(16, Metrics::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe(EventKind::BreakRequired, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe(EventKind::SlaBreach, |_| panic!("wrong kind"));

        bus.publish(break_required(Uuid::new_v4()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_subscriber_does_not_stop_the_others() {
        let metrics = Metrics::new();
        let bus = EventBus::new(16, metrics.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::BreakRequired, |event| {
            Err(DispatchError::DriverNotFound(event.driver_id()))
        });
        bus.subscribe(EventKind::BreakRequired, |_| panic!("boom"));
        let sink = seen.clone();
        bus.subscribe(EventKind::BreakRequired, move |event| {
            sink.lock().unwrap().push(event.driver_id());
            Ok(())
        });

        let driver_id = Uuid::new_v4();
        bus.publish(break_required(driver_id));

        assert_eq!(*seen.lock().unwrap(), vec![driver_id]);
        assert_eq!(
            metrics
                .subscriber_failures_total
                .with_label_values(&["breakRequired"])
                .get(),
            2
        );
    }

    #[test]
    fn unsubscribed_handler_is_not_called() {
        let bus = EventBus::new(16, Metrics::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = bus.subscribe(EventKind::BreakRequired, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(break_required(Uuid::new_v4()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::new(16, Metrics::new());
        let mut stream = bus.stream();
        let driver_id = Uuid::new_v4();

        bus.publish(break_required(driver_id));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::BreakRequired);
        assert_eq!(event.driver_id(), driver_id);
    }

    #[test]
    fn events_serialize_with_camel_case_tag() {
        let json = serde_json::to_value(break_required(Uuid::new_v4())).unwrap();
        assert_eq!(json["type"], "breakRequired");
        assert_eq!(json["consecutive_deliveries"], 5);
    }
}
