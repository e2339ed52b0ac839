// 11.0: every order, position and account level change produces an event.
// published synchronously to subscribers in registration order, so a consumer
// that sees OrderExecuted has already seen the OrderPlaced before it.

use crate::account::AccountLevel;
use crate::liquidation::LiquidationType;
use crate::order::{Order, OrderCancellationReason, OrderRejectReason};
use crate::position::Position;
use crate::types::{AccountId, Timestamp};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Order events
    OrderPlaced(Order),
    OrderActivated(Order),
    OrderExecutionStarted(Order),
    OrderExecuted(Order),
    OrderPartiallyExecuted(Order),
    OrderChanged(OrderChangedEvent),
    OrderCancelled(OrderCancelledEvent),
    OrderRejected(OrderRejectedEvent),

    // Position events
    PositionOpened(Position),
    PositionPartiallyClosed(PositionClosedEvent),
    PositionClosed(PositionClosedEvent),

    // Risk events
    MarginCall(MarginCallEvent),
    StopOut(StopOutEvent),
}

impl EventPayload {
    pub fn account_id(&self) -> &AccountId {
        match self {
            EventPayload::OrderPlaced(o)
            | EventPayload::OrderActivated(o)
            | EventPayload::OrderExecutionStarted(o)
            | EventPayload::OrderExecuted(o)
            | EventPayload::OrderPartiallyExecuted(o) => &o.account_id,
            EventPayload::OrderChanged(e) => &e.order.account_id,
            EventPayload::OrderCancelled(e) => &e.order.account_id,
            EventPayload::OrderRejected(e) => &e.order.account_id,
            EventPayload::PositionOpened(p) => &p.account_id,
            EventPayload::PositionPartiallyClosed(e) | EventPayload::PositionClosed(e) => &e.position.account_id,
            EventPayload::MarginCall(e) => &e.account_id,
            EventPayload::StopOut(e) => &e.account_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderChangedField {
    Price,
    Validity,
    ForceOpen,
    Volume,
    /// NoLiquidity requeue of a pending order. The value is the retry count.
    PendingRetries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderChangedEvent {
    pub order: Order,
    pub field: OrderChangedField,
    pub old_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub order: Order,
    pub reason: OrderCancellationReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRejectedEvent {
    pub order: Order,
    pub reason: OrderRejectReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position: Position,
    pub closed_volume: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCallEvent {
    pub account_id: AccountId,
    pub level: AccountLevel,
    pub previous_level: AccountLevel,
    pub margin_usage_level: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutEvent {
    pub account_id: AccountId,
    pub operation_id: String,
    pub liquidation_type: LiquidationType,
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Ordered in-process publish/subscribe. Keeps the most recent events in memory.
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    log: Mutex<VecDeque<Event>>,
    max_events: usize,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.read().len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

impl EventBus {
    pub fn new(max_events: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            log: Mutex::new(VecDeque::new()),
            max_events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn publish(&self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let event = Event::new(id, timestamp, payload);

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_event(&event);
        }

        let mut log = self.log.lock();
        log.push_back(event);
        while log.len() > self.max_events {
            log.pop_front();
        }
        id
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        let log = self.log.lock();
        let start = log.len().saturating_sub(count);
        log.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

/// Subscriber that records everything it sees. Used in tests and the simulator.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EventPayload) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(&e.payload)).count()
    }
}

impl EventSubscriber for EventCollector {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn placed(id: &str) -> EventPayload {
        EventPayload::OrderPlaced(Order::market(id, "a1", "EURUSD", dec!(1), Timestamp::from_millis(0)))
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new(10);
        let first = Arc::new(EventCollector::new());
        let second = Arc::new(EventCollector::new());
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        bus.publish(Timestamp::from_millis(1), placed("o1"));
        bus.publish(Timestamp::from_millis(2), placed("o2"));

        let ids: Vec<EventId> = first.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EventId(1), EventId(2)]);
        assert_eq!(second.events().len(), 2);
    }

    #[test]
    fn log_is_bounded() {
        let bus = EventBus::new(2);
        for i in 0..5 {
            bus.publish(Timestamp::from_millis(i), placed(&format!("o{i}")));
        }
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.recent_events(10)[0].id, EventId(4));
    }

    #[test]
    fn collector_counts_by_kind() {
        let collector = EventCollector::new();
        let bus = EventBus::new(10);
        let collector = Arc::new(collector);
        bus.subscribe(collector.clone());
        bus.publish(Timestamp::from_millis(0), placed("o1"));
        bus.publish(
            Timestamp::from_millis(0),
            EventPayload::MarginCall(MarginCallEvent {
                account_id: AccountId::from("a1"),
                level: AccountLevel::MarginCall1,
                previous_level: AccountLevel::None,
                margin_usage_level: Some(dec!(1.2)),
            }),
        );
        assert_eq!(collector.count(|p| matches!(p, EventPayload::MarginCall(_))), 1);
        assert_eq!(collector.events()[1].payload.account_id().as_str(), "a1");
    }
}
