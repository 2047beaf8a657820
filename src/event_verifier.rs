use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Lifecycle of one double-write block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Empty,
    Filling,
    Flushing,
}

impl State {
    fn can_transition_to(&self, next: State) -> bool {
        match (self, next) {
            (State::Empty, State::Filling) => true,
            (State::Empty, _) => false,
            (State::Filling, State::Flushing) => true,
            (State::Filling, _) => false,
            (State::Flushing, State::Empty) => true,
            // a failed flush is retried
            (State::Flushing, State::Flushing) => true,
            (State::Flushing, _) => false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EventVerifier {
    block_model: Mutex<BTreeMap<usize, Vec<(State, &'static str)>>>,
}

impl Drop for EventVerifier {
    fn drop(&mut self) {
        // no block may be mid-flush when the buffer goes away
        let block_model = self.block_model.lock();
        for (block_no, history) in block_model.iter() {
            if let Some((last_state, _at)) = history.last() {
                assert_ne!(
                    *last_state,
                    State::Flushing,
                    "block {block_no} is Flushing when the buffer shuts down"
                );
            }
        }
    }
}

impl EventVerifier {
    pub(crate) fn mark(&self, block_no: usize, state: State, at: &'static str) {
        let mut block_model = self.block_model.lock();
        let history = block_model.entry(block_no).or_default();

        let last_state = history.last().map(|(s, _)| *s).unwrap_or(State::Empty);
        assert!(
            last_state.can_transition_to(state),
            "block {block_no} performed illegal state transition from \
            {last_state:?} to {state:?} at {at}.\nhistory: {:#?}",
            *history
        );
        history.push((state, at));
    }

    /// Forgets all history, used when the blocks are rebuilt.
    pub(crate) fn reset(&self) {
        self.block_model.lock().clear();
    }
}
