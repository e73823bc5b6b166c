//! One-based binary min-heap of event ids, keyed on next firing time.
//!
//! The heap stores ids; each event records its own heap index in `qid`
//! (zero means unqueued), so removal by id never searches the array.

use alder_base::Time;

use crate::SchedState;

fn key(state: &SchedState, idx: usize) -> Time {
    let id = state.heap[idx];
    state
        .events
        .get(&id)
        .map(|e| e.nextqueue)
        .unwrap_or(Time::ZERO)
}

/// True when the entry at `j` sorts after the entry at `k`.
fn larger(state: &SchedState, j: usize, k: usize) -> bool {
    key(state, j) > key(state, k)
}

fn exchange(state: &mut SchedState, i: usize, j: usize) {
    state.heap.swap(i, j);
    let (a, b) = (state.heap[i], state.heap[j]);
    if let Some(e) = state.events.get_mut(&a) {
        e.qid = i;
    }
    if let Some(e) = state.events.get_mut(&b) {
        e.qid = j;
    }
}

/// Append the event and swim it up to its position.
pub(crate) fn enqueue(state: &mut SchedState, id: i32) {
    state.heap.push(id);
    let mut k = state.heap.len() - 1;
    if let Some(e) = state.events.get_mut(&id) {
        e.qid = k;
    }
    while k > 1 {
        let j = k / 2;
        if !larger(state, j, k) {
            break;
        }
        exchange(state, j, k);
        k = j;
    }
}

/// Remove the entry at heap position `k`: swap with the last element,
/// shrink, then sink the moved element down.
pub(crate) fn dequeue(state: &mut SchedState, k: usize) {
    let last = state.heap.len() - 1;
    exchange(state, k, last);
    let id = state.heap.pop().unwrap_or_else(|| unreachable!());
    if let Some(e) = state.events.get_mut(&id) {
        e.qid = 0;
    }

    let mut k = k;
    let nqueue = state.heap.len() - 1;
    loop {
        let mut j = 2 * k;
        if j > nqueue {
            break;
        }
        if j < nqueue && larger(state, j, j + 1) {
            j += 1;
        }
        if !larger(state, k, j) {
            break;
        }
        exchange(state, k, j);
        k = j;
    }
}
