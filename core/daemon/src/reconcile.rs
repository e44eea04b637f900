//! Counter reconciliation.
//!
//! Devices report absolute counters that can arrive out of order, repeat, or
//! drop back to zero after a restart. Reconciliation turns them into
//! non-negative deltas for the aggregates and a session-relative live view.

use carewalk_daemon_protocol::RawCounters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub steps: u64,
    pub stairs: u64,
    pub falls: u64,
}

/// Counter bookkeeping persisted on the current-session record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    pub baseline: Counters,
    pub carried: Counters,
    pub last_absolute: Counters,
    pub live: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub state: CounterState,
    pub deltas: Counters,
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Channel {
    baseline: u64,
    carried: u64,
    last_absolute: u64,
    live: u64,
}

pub fn reconcile(prev: &CounterState, raw: RawCounters) -> Reconciled {
    let (steps, steps_delta, steps_reset) =
        reconcile_channel(channel(prev, |c| c.steps), raw.steps);
    let (stairs, stairs_delta, stairs_reset) =
        reconcile_channel(channel(prev, |c| c.stairs), raw.stairs);
    let (falls, falls_delta, falls_reset) =
        reconcile_channel(channel(prev, |c| c.falls), raw.falls);

    let pick = |select: fn(&Channel) -> u64| Counters {
        steps: select(&steps),
        stairs: select(&stairs),
        falls: select(&falls),
    };

    Reconciled {
        state: CounterState {
            baseline: pick(|c| c.baseline),
            carried: pick(|c| c.carried),
            last_absolute: pick(|c| c.last_absolute),
            live: pick(|c| c.live),
        },
        deltas: Counters {
            steps: steps_delta,
            stairs: stairs_delta,
            falls: falls_delta,
        },
        reset: steps_reset || stairs_reset || falls_reset,
    }
}

fn channel(state: &CounterState, select: fn(&Counters) -> u64) -> Channel {
    Channel {
        baseline: select(&state.baseline),
        carried: select(&state.carried),
        last_absolute: select(&state.last_absolute),
        live: select(&state.live),
    }
}

fn reconcile_channel(prev: Channel, raw: Option<u64>) -> (Channel, u64, bool) {
    let Some(raw) = raw else {
        return (prev, 0, false);
    };

    // Only strict increases count; a repeat or a reordered older reading
    // contributes nothing.
    let delta = raw.saturating_sub(prev.last_absolute);

    let mut next = prev;
    let reset = raw < prev.baseline;
    if reset {
        next.carried = prev.live;
        next.baseline = raw;
    }
    next.live = next.carried.saturating_add(raw - next.baseline);
    next.last_absolute = raw;

    (next, delta, reset)
}
