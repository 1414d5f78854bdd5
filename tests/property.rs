use std::sync::Arc;

use ib_backplane::backplane::{EventBus, Selection};
use ib_backplane::models::{Event, Side};
use ib_backplane::ticker_id::{self, MID};
use parking_lot::Mutex;
use proptest::prelude::*;

proptest! {
    #[test]
    fn symbol_round_trips(sym in "[A-Z]{1,4}") {
        let id = ticker_id::encode(&sym).unwrap();
        prop_assert_eq!(ticker_id::decode(id), sym);
        prop_assert!(!ticker_id::is_option(id));
    }

    #[test]
    fn lowercase_encodes_like_uppercase(sym in "[a-z]{1,4}") {
        prop_assert_eq!(
            ticker_id::encode(&sym).unwrap(),
            ticker_id::encode(&sym.to_ascii_uppercase()).unwrap()
        );
    }

    #[test]
    fn option_round_trips(sym in "[A-Z]{1,4}", is_call in any::<bool>(), strike in 1..MID) {
        let id = ticker_id::encode_option(&sym, is_call, f64::from(strike)).unwrap();
        let leg = ticker_id::decode_option(id);
        prop_assert_eq!(&leg.symbol, &sym);
        prop_assert_eq!(leg.is_call, is_call);
        prop_assert_eq!(leg.strike, strike);
        prop_assert!(ticker_id::is_option(id));
        prop_assert_eq!(id.underlying(), ticker_id::encode(&sym).unwrap());
    }

    #[test]
    fn distinct_symbols_never_share_an_equity_id(a in "[A-Z]{1,4}", b in "[A-Z]{1,4}") {
        prop_assume!(a != b);
        prop_assert_ne!(ticker_id::encode(&a).unwrap(), ticker_id::encode(&b).unwrap());
    }

    #[test]
    fn selection_never_leaks(ids in prop::collection::vec(0i64..10, 1000)) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let excluded = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Selection::by_id(5), move |e: &Event| seen.lock().push(e.id()));
        }
        {
            let excluded = Arc::clone(&excluded);
            bus.subscribe(Selection::exclude_by_id(5), move |e: &Event| excluded.lock().push(e.id()));
        }

        for &id in &ids {
            bus.publish(&Event::bid_ask(id, Side::Ask, Some(1.0), None));
        }

        let fives = ids.iter().filter(|&&id| id == 5).count();
        prop_assert!(seen.lock().iter().all(|&id| id == 5));
        prop_assert_eq!(seen.lock().len(), fives);
        prop_assert!(excluded.lock().iter().all(|&id| id != 5));
        prop_assert_eq!(excluded.lock().len(), ids.len() - fives);
    }

    #[test]
    fn dispatch_follows_registration_order(n in 1usize..20) {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..n {
            let order = Arc::clone(&order);
            bus.subscribe_all(move |_| order.lock().push(tag));
        }
        bus.publish(&Event::connect(1));
        prop_assert_eq!(order.lock().clone(), (0..n).collect::<Vec<_>>());
    }
}
