//! In-process publish/subscribe backplane.
//!
//! Subscribers register a sink together with a [`Predicate`]; `publish`
//! delivers an event to every sink whose predicate accepts it, in
//! registration order, on the publishing thread.
//!
//! Dispatch works on a snapshot of the registrations taken under the lock,
//! so sinks may subscribe or unsubscribe (themselves included) while an event
//! is being delivered. A sink that panics is logged and skipped; the remaining
//! sinks still receive the event.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::Result;
use crate::models::Event;
use crate::ticker_id;

// ============================================================================
// Predicates
// ============================================================================

/// Decides whether a subscriber receives an event.
pub trait Predicate: Send + Sync {
    fn matches(&self, event: &Event) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn matches(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Accepts every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct All;

impl Predicate for All {
    fn matches(&self, _event: &Event) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

/// Id-set predicate.
///
/// An inclusive selection accepts events whose id is in the set; an
/// exclusion accepts everything else. Elements are OR-ed. Symbols are
/// converted to their equity ticker id, so a symbol element does not match
/// the option legs of that symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    ids: BTreeSet<i64>,
    mode: Mode,
}

impl Selection {
    pub fn by_id(id: i64) -> Self {
        Self::new(Mode::Include, id)
    }

    pub fn by_symbol(symbol: &str) -> Result<Self> {
        Ok(Self::by_id(ticker_id::encode(symbol)?.into()))
    }

    pub fn exclude_by_id(id: i64) -> Self {
        Self::new(Mode::Exclude, id)
    }

    pub fn exclude_by_symbol(symbol: &str) -> Result<Self> {
        Ok(Self::exclude_by_id(ticker_id::encode(symbol)?.into()))
    }

    fn new(mode: Mode, id: i64) -> Self {
        Self {
            ids: BTreeSet::from([id]),
            mode,
        }
    }

    pub fn add_id(mut self, id: i64) -> Self {
        self.ids.insert(id);
        self
    }

    pub fn add_symbol(self, symbol: &str) -> Result<Self> {
        Ok(self.add_id(ticker_id::encode(symbol)?.into()))
    }

    pub fn is_exclusion(&self) -> bool {
        self.mode == Mode::Exclude
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.ids.iter().copied()
    }
}

impl Predicate for Selection {
    fn matches(&self, event: &Event) -> bool {
        let hit = self.ids.contains(&event.id());
        match self.mode {
            Mode::Include => hit,
            Mode::Exclude => !hit,
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Opaque subscription handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Sink = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: SubscriberId,
    predicate: Arc<dyn Predicate>,
    sink: Sink,
}

/// Fan-out of session events to registered subscribers.
pub struct EventBus {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `sink` for events accepted by `predicate`.
    pub fn subscribe<P, F>(&self, predicate: P, sink: F) -> SubscriberId
    where
        P: Predicate + 'static,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().push(Registration {
            id,
            predicate: Arc::new(predicate),
            sink: Arc::new(sink),
        });
        tracing::debug!(subscriber = %id, "subscribed");
        id
    }

    pub fn subscribe_all<F>(&self, sink: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(All, sink)
    }

    /// Removes a subscriber. Returns false if the handle was unknown.
    ///
    /// An event already being dispatched may still reach the removed sink.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut regs = self.registrations.lock();
        let before = regs.len();
        regs.retain(|r| r.id != id);
        let removed = regs.len() != before;
        if removed {
            tracing::debug!(subscriber = %id, "unsubscribed");
        }
        removed
    }

    /// Delivers `event` to every matching subscriber, in registration order.
    pub fn publish(&self, event: &Event) {
        let snapshot: Vec<Registration> = self.registrations.lock().clone();

        for reg in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                if reg.predicate.matches(event) {
                    (reg.sink)(event);
                }
            }));
            if delivered.is_err() {
                tracing::error!(
                    subscriber = %reg.id,
                    event_id = event.id(),
                    "subscriber panicked during dispatch"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn quote(id: i64) -> Event {
        Event::bid_ask(id, Side::Bid, Some(1.0), None)
    }

    fn recorder() -> (Arc<Mutex<Vec<i64>>>, impl Fn(&Event) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |e: &Event| seen.lock().push(e.id())
        };
        (seen, sink)
    }

    #[test]
    fn selection_by_id_and_exclusion() {
        let sel = Selection::by_id(1).add_id(3);
        assert!(sel.matches(&quote(1)));
        assert!(!sel.matches(&quote(2)));
        assert!(sel.matches(&quote(3)));

        let excl = Selection::exclude_by_id(2);
        assert!(excl.is_exclusion());
        assert!(excl.matches(&quote(1)));
        assert!(!excl.matches(&quote(2)));
    }

    #[test]
    fn selection_by_symbol_matches_equity_id_only() {
        let aapl: i64 = ticker_id::encode("AAPL").unwrap().into();
        let leg: i64 = ticker_id::encode_option("AAPL", true, 200.0).unwrap().into();
        let sel = Selection::by_symbol("aapl").unwrap();
        assert!(sel.matches(&quote(aapl)));
        assert!(!sel.matches(&quote(leg)));
        assert!(Selection::by_symbol("TOOLONG").is_err());
    }

    #[test]
    fn publish_filters_and_preserves_order() {
        let bus = EventBus::new();
        let (seen, sink) = recorder();
        bus.subscribe(Selection::by_id(7), sink);

        for id in [7, 8, 7, 9, 7] {
            bus.publish(&quote(id));
        }
        assert_eq!(*seen.lock(), vec![7, 7, 7]);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe_all(move |_| order.lock().push(tag));
        }
        bus.publish(&quote(1));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn closure_predicates_work() {
        let bus = EventBus::new();
        let (seen, sink) = recorder();
        bus.subscribe(|e: &Event| matches!(e, Event::Connect { .. }), sink);
        bus.publish(&quote(1));
        bus.publish(&Event::connect(42));
        assert_eq!(*seen.lock(), vec![42]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (seen, sink) = recorder();
        let id = bus.subscribe_all(sink);
        bus.publish(&quote(1));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&quote(2));
        assert_eq!(*seen.lock(), vec![1]);
        assert!(bus.is_empty());
    }

    #[test]
    fn sink_can_unsubscribe_itself_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<SubscriberId>>> = Arc::new(Mutex::new(None));

        let id = {
            let inner = Arc::clone(&bus);
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            bus.subscribe_all(move |_| {
                *hits.lock() += 1;
                let me = *slot.lock();
                if let Some(me) = me {
                    inner.unsubscribe(me);
                }
            })
        };
        *slot.lock() = Some(id);

        bus.publish(&quote(1));
        bus.publish(&quote(2));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(bus.len(), 0);
    }

    #[test]
    fn panicking_sink_does_not_starve_others() {
        let bus = EventBus::new();
        bus.subscribe_all(|_| panic!("boom"));
        let (seen, sink) = recorder();
        bus.subscribe_all(sink);

        bus.publish(&quote(5));
        bus.publish(&quote(6));
        assert_eq!(*seen.lock(), vec![5, 6]);
        assert_eq!(bus.len(), 2);
    }
}
