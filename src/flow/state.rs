use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Execution state of a scenario or a thesis within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    NoState,
    NotPerformed,
    Performing,
    Passed,
    Failed,
    Crashed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Perform,
    Pass,
    Fail,
    Crash,
    Cancel,
}

const TRANSITIONS: &[(State, Event, State)] = &[
    (State::NotPerformed, Event::Perform, State::Performing),
    (State::NotPerformed, Event::Pass, State::Passed),
    (State::NotPerformed, Event::Fail, State::Failed),
    (State::NotPerformed, Event::Crash, State::Crashed),
    (State::NotPerformed, Event::Cancel, State::Canceled),
    (State::Performing, Event::Pass, State::Passed),
    (State::Performing, Event::Fail, State::Failed),
    (State::Performing, Event::Crash, State::Crashed),
    (State::Performing, Event::Cancel, State::Canceled),
    (State::Passed, Event::Fail, State::Failed),
    (State::Passed, Event::Crash, State::Crashed),
    (State::Passed, Event::Cancel, State::Passed),
    (State::Failed, Event::Crash, State::Crashed),
    (State::Failed, Event::Cancel, State::Failed),
];

/// Shared by the scenario-level and the thesis-level automaton.
static TRANSITION_TABLE: LazyLock<HashMap<(State, Event), State>> = LazyLock::new(|| {
    TRANSITIONS
        .iter()
        .map(|&(from, event, to)| ((from, event), to))
        .collect()
});

impl State {
    /// Applies `event`. Pairs missing from the transition table keep the
    /// current state.
    pub fn next(self, event: Event) -> State {
        TRANSITION_TABLE
            .get(&(self, event))
            .copied()
            .unwrap_or(self)
    }

    /// Rank used to derive one state out of many; higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            State::NoState => 0,
            State::Passed => 1,
            State::NotPerformed => 2,
            State::Canceled => 3,
            State::Failed => 4,
            State::Crashed => 5,
            State::Performing => 6,
        }
    }

    /// The state with the highest precedence, `NoState` for no states.
    pub fn overall(states: impl IntoIterator<Item = State>) -> State {
        states
            .into_iter()
            .max_by_key(|state| state.precedence())
            .unwrap_or(State::NoState)
    }

    /// True when no further work is expected for the owner of this state.
    pub fn is_finished(self) -> bool {
        !matches!(self, State::NotPerformed | State::Performing)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::NoState => "no state",
            State::NotPerformed => "not performed",
            State::Performing => "performing",
            State::Passed => "passed",
            State::Failed => "failed",
            State::Crashed => "crashed",
            State::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Perform => "perform",
            Event::Pass => "pass",
            Event::Fail => "fail",
            Event::Crash => "crash",
            Event::Cancel => "cancel",
        };
        f.write_str(name)
    }
}
