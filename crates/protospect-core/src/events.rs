//! Event bus.
//!
//! Components talk through named events with optional delayed delivery and
//! optional aggregation (coalescing). Delivery is single-threaded and
//! cooperative: the engine pops due events off a timer heap and runs the
//! subscribed handlers to completion. Handlers receive the state arena and
//! the event payload, and unsubscribe themselves by returning
//! [`Action::Unsubscribe`].

use std::collections::{BinaryHeap, HashMap};

use crate::classifier::ClassResult;
use crate::endpoint::EpKey;
use crate::engine::Core;
use crate::source::SourceId;

/// Event payloads, one variant per named event.
#[derive(Debug, Clone)]
pub enum Event {
    /// An endpoint accumulated a full packet window.
    EndpointPacketsReady(EpKey),
    /// The classifier produced a probability distribution for one window.
    EndpointClassification(ClassResult),
    /// An endpoint's verdict label changed.
    EndpointVerdictChanged(EpKey),
    /// New training samples were queued.
    TraindataUpdated,
    /// The classifier model was rebuilt.
    ClassifierModelUpdated,
    /// Someone suggests running the garbage collector now.
    GcSuggestion,
    /// A source finished delivering packets.
    SourceClosed(SourceId),
    /// All sources are closed and no training work is outstanding.
    Finished,
}

/// Event kinds, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EndpointPacketsReady,
    EndpointClassification,
    EndpointVerdictChanged,
    TraindataUpdated,
    ClassifierModelUpdated,
    GcSuggestion,
    SourceClosed,
    Finished,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::EndpointPacketsReady(_) => EventKind::EndpointPacketsReady,
            Event::EndpointClassification(_) => EventKind::EndpointClassification,
            Event::EndpointVerdictChanged(_) => EventKind::EndpointVerdictChanged,
            Event::TraindataUpdated => EventKind::TraindataUpdated,
            Event::ClassifierModelUpdated => EventKind::ClassifierModelUpdated,
            Event::GcSuggestion => EventKind::GcSuggestion,
            Event::SourceClosed(_) => EventKind::SourceClosed,
            Event::Finished => EventKind::Finished,
        }
    }
}

/// What a handler wants to happen to its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Unsubscribe,
}

/// Subscriber callback. Runs inside the event loop with exclusive access to
/// the state arena.
pub type Handler = Box<dyn FnMut(&mut Core, &Event) -> Action>;

/// Aggregation state of one event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggState {
    /// Every publish schedules a delivery.
    Disabled,
    /// Next publish schedules and moves to `Pending`.
    Ready,
    /// A delivery is scheduled; further publishes are coalesced into it.
    Pending,
}

#[derive(Default)]
struct Subscribers {
    handlers: Vec<Handler>,
    after_handlers: Vec<Handler>,
}

struct Scheduled {
    due_ms: u64,
    seq: u64,
    event: Event,
}

// Min-heap by (due, seq): earlier deadlines first, FIFO within a deadline.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.due_ms, other.seq).cmp(&(self.due_ms, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// Named-event pub/sub with delayed delivery and per-kind aggregation.
#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<EventKind, Subscribers>,
    agg: HashMap<EventKind, AggState>,
    schedule: BinaryHeap<Scheduled>,
    seq: u64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Registers a handler. `aggregate` sets the aggregation mode for the
    /// whole event kind; the last subscriber to set it wins.
    pub fn subscribe(&mut self, kind: EventKind, aggregate: bool, handler: Handler) {
        self.subscribers
            .entry(kind)
            .or_default()
            .handlers
            .push(handler);
        self.set_aggregation(kind, aggregate);
    }

    /// Like [`EventBus::subscribe`], but the handler runs after all
    /// ordinary handlers of the same event.
    pub fn subscribe_after(&mut self, kind: EventKind, aggregate: bool, handler: Handler) {
        self.subscribers
            .entry(kind)
            .or_default()
            .after_handlers
            .push(handler);
        self.set_aggregation(kind, aggregate);
    }

    fn set_aggregation(&mut self, kind: EventKind, aggregate: bool) {
        let state = if aggregate {
            AggState::Ready
        } else {
            AggState::Disabled
        };
        self.agg.insert(kind, state);
    }

    /// Schedules the event for delivery `delay_ms` from `now_ms`. Returns
    /// false when an aggregated delivery was already pending and the event
    /// was coalesced into it.
    pub fn publish(&mut self, event: Event, delay_ms: u64, now_ms: u64) -> bool {
        let kind = event.kind();
        match self.agg.get(&kind).copied().unwrap_or(AggState::Disabled) {
            AggState::Pending => return false,
            AggState::Ready => {
                self.agg.insert(kind, AggState::Pending);
            }
            AggState::Disabled => {}
        }

        self.seq += 1;
        self.schedule.push(Scheduled {
            due_ms: now_ms + delay_ms,
            seq: self.seq,
            event,
        });
        true
    }

    /// True when a delivery of this kind is scheduled and not yet popped.
    pub fn pending(&self, kind: EventKind) -> bool {
        self.schedule.iter().any(|s| s.event.kind() == kind)
    }

    /// Deadline of the earliest scheduled delivery.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.schedule.peek().map(|s| s.due_ms)
    }

    /// Pops the next event due at or before `now_ms`. Popping an aggregated
    /// event reopens its kind for scheduling, so handlers may re-publish.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<Event> {
        if self.schedule.peek()?.due_ms > now_ms {
            return None;
        }
        let scheduled = self.schedule.pop()?;
        let kind = scheduled.event.kind();
        if self.agg.get(&kind) == Some(&AggState::Pending) {
            self.agg.insert(kind, AggState::Ready);
        }
        Some(scheduled.event)
    }

    /// Runs the event's handlers: ordinary subscribers first, then
    /// after-subscribers. A handler returning [`Action::Unsubscribe`] is
    /// removed at the point of its own return.
    pub fn dispatch(&mut self, core: &mut Core, event: &Event) {
        let Some(subs) = self.subscribers.get_mut(&event.kind()) else {
            return;
        };
        subs.handlers
            .retain_mut(|handler| handler(core, event) == Action::Continue);
        subs.after_handlers
            .retain_mut(|handler| handler(core, event) == Action::Continue);
    }

    /// Discards all scheduled deliveries (teardown).
    pub fn clear_schedule(&mut self) {
        self.schedule.clear();
        for state in self.agg.values_mut() {
            if *state == AggState::Pending {
                *state = AggState::Ready;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Event, EventBus, EventKind};
    use crate::engine::Core;
    use crate::Config;
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_core() -> Core {
        Core::new(Config::default())
    }

    fn counting_handler(counter: &Rc<Cell<u32>>) -> super::Handler {
        let counter = Rc::clone(counter);
        Box::new(move |_core, _event| {
            counter.set(counter.get() + 1);
            Action::Continue
        })
    }

    #[test]
    fn plain_publish_order_equals_delivery_order() {
        let mut bus = EventBus::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        bus.subscribe(
            EventKind::GcSuggestion,
            false,
            Box::new(move |_c, _e| {
                log.borrow_mut().push("gc");
                Action::Continue
            }),
        );
        let log = Rc::clone(&order);
        bus.subscribe(
            EventKind::Finished,
            false,
            Box::new(move |_c, _e| {
                log.borrow_mut().push("finished");
                Action::Continue
            }),
        );

        bus.publish(Event::GcSuggestion, 0, 0);
        bus.publish(Event::Finished, 0, 0);
        bus.publish(Event::GcSuggestion, 0, 0);

        let mut core = test_core();
        while let Some(event) = bus.pop_due(0) {
            bus.dispatch(&mut core, &event);
        }
        assert_eq!(*order.borrow(), vec!["gc", "finished", "gc"]);
    }

    #[test]
    fn aggregation_coalesces_bursts_into_one_delivery() {
        let mut bus = EventBus::new();
        let deliveries = Rc::new(Cell::new(0));
        bus.subscribe(
            EventKind::TraindataUpdated,
            true,
            counting_handler(&deliveries),
        );

        assert!(bus.publish(Event::TraindataUpdated, 10, 0));
        assert!(!bus.publish(Event::TraindataUpdated, 10, 1));
        assert!(!bus.publish(Event::TraindataUpdated, 10, 2));

        let mut core = test_core();
        assert!(bus.pop_due(5).is_none());
        while let Some(event) = bus.pop_due(20) {
            bus.dispatch(&mut core, &event);
        }
        assert_eq!(deliveries.get(), 1);

        // after delivery the kind is ready again
        assert!(bus.publish(Event::TraindataUpdated, 0, 20));
        while let Some(event) = bus.pop_due(20) {
            bus.dispatch(&mut core, &event);
        }
        assert_eq!(deliveries.get(), 2);
    }

    #[test]
    fn delayed_events_fire_in_deadline_order() {
        let mut bus = EventBus::new();
        bus.publish(Event::Finished, 50, 0);
        bus.publish(Event::GcSuggestion, 10, 0);

        assert_eq!(bus.next_due_ms(), Some(10));
        assert!(matches!(bus.pop_due(10), Some(Event::GcSuggestion)));
        assert!(bus.pop_due(10).is_none());
        assert!(matches!(bus.pop_due(50), Some(Event::Finished)));
    }

    #[test]
    fn handler_can_unsubscribe_itself() {
        let mut bus = EventBus::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        bus.subscribe(
            EventKind::GcSuggestion,
            false,
            Box::new(move |_c, _e| {
                counter.set(counter.get() + 1);
                Action::Unsubscribe
            }),
        );

        let mut core = test_core();
        for _ in 0..3 {
            bus.publish(Event::GcSuggestion, 0, 0);
            while let Some(event) = bus.pop_due(0) {
                bus.dispatch(&mut core, &event);
            }
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn after_handlers_run_after_ordinary_ones() {
        let mut bus = EventBus::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        bus.subscribe_after(
            EventKind::Finished,
            false,
            Box::new(move |_c, _e| {
                log.borrow_mut().push("after");
                Action::Continue
            }),
        );
        let log = Rc::clone(&order);
        bus.subscribe(
            EventKind::Finished,
            false,
            Box::new(move |_c, _e| {
                log.borrow_mut().push("pre");
                Action::Continue
            }),
        );

        bus.publish(Event::Finished, 0, 0);
        let mut core = test_core();
        while let Some(event) = bus.pop_due(0) {
            bus.dispatch(&mut core, &event);
        }
        assert_eq!(*order.borrow(), vec!["pre", "after"]);
    }
}
