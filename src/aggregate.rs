//! Minimal fold seam over persisted events, consumed by the snapshot path
//! of the [`EventStream`][crate::stream::EventStream].
//!
//! State mutations are expressed through the persisted events which, if
//! applied in the same order as they were committed, yield the same state
//! value.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::Event;

/// An Aggregate folds a stream of persisted events into a state value.
///
/// The state must serialize both ways so snapshots of it can be persisted
/// and loaded through the snapshot store.
pub trait Aggregate {
    /// State of the aggregate, rebuilt by folding events.
    type State: Default + Serialize + DeserializeOwned + Send;

    /// Applies one event to the current state, returning the next state.
    fn apply(state: Self::State, event: &Event) -> Self::State;

    /// Folds a slice of events over the default state.
    fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self::State {
        events
            .into_iter()
            .fold(Self::State::default(), |state, event| {
                Self::apply(state, event)
            })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::version::Version;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct OrderTotals {
        placed: u32,
    }

    struct OrderAggregate;

    impl Aggregate for OrderAggregate {
        type State = OrderTotals;

        fn apply(mut state: Self::State, event: &Event) -> Self::State {
            if event.event_type == "OrderWasPlaced" {
                state.placed += 1;
            }
            state
        }
    }

    fn event(event_type: &str, version: Version) -> Event {
        Event {
            event_type: event_type.to_owned(),
            event_version: version,
            schema_version: 1,
            payload: json!({}),
            external_sequencer: None,
            action_metadata: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn fold_applies_events_in_order() {
        let events = vec![
            event("OrderWasPlaced", 0),
            event("OrderWasShipped", 1),
            event("OrderWasPlaced", 2),
        ];

        let state = OrderAggregate::fold(&events);
        assert_eq!(OrderTotals { placed: 2 }, state);
    }
}
