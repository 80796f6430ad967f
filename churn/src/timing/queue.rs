//! Delta-encoded timer list.
//!
//! Pending entries are stored as successive *relative* delays: the
//! absolute fire time of entry `i` is `last_refresh + sum(delay[0..=i])`.
//! Only the head entry is ever touched by the passage of time, so the
//! wait budget until the next deadline is a single subtraction away and
//! the structure survives arbitrarily long idle periods between checks.
//!
//! Expected population is tens to low hundreds of concurrent timers, so
//! the O(n) sorted splice is deliberate; no heap is needed.

use std::collections::VecDeque;

use crate::timing::time::{Clock, Delta, MonoClock};

struct TimerEntry<T> {
    /// Delay relative to the predecessor entry (head: relative to
    /// `last_refresh`). May be negative once overdue.
    delay: Delta,
    payload: T,
}

/// Ordered collection of pending timed events.
///
/// `T` is an opaque payload handed back when the entry fires; the caller
/// dispatches on it. `C` is the clock seam; production code uses the
/// monotonic default, tests drive a manual clock.
pub struct DeltaTimerQueue<T, C: Clock = MonoClock> {
    entries: VecDeque<TimerEntry<T>>,
    clock: C,
    /// Clock reading the head entry's delay is anchored to.
    last_refresh: u64,
}

impl<T> DeltaTimerQueue<T, MonoClock> {
    /// Creates an empty queue on the monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonoClock::new())
    }
}

impl<T> Default for DeltaTimerQueue<T, MonoClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: Clock> DeltaTimerQueue<T, C> {
    /// Creates an empty queue anchored at `clock`'s current reading.
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        let last_refresh = clock.now_ns();
        Self {
            entries: VecDeque::new(),
            clock,
            last_refresh,
        }
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances `last_refresh` to now, charging the elapsed time to the
    /// head entry. No-op on an empty queue (beyond moving the anchor).
    pub fn refresh(&mut self) {
        let now = self.clock.now_ns();
        let elapsed = Delta::from_nanos((now - self.last_refresh) as i64);
        if let Some(head) = self.entries.front_mut() {
            head.delay -= elapsed;
        }
        self.last_refresh = now;
    }

    /// Schedules `payload` to fire `delay` from now.
    ///
    /// Splices into the delta list: the new entry's stored delay is
    /// reduced by everything consumed before its slot, and the entry it
    /// displaces is re-based against the newcomer so every successor
    /// keeps its absolute fire time.
    pub fn insert(&mut self, delay: Delta, payload: T) {
        self.refresh();
        let mut residual = delay;
        for idx in 0..self.entries.len() {
            let slot_delay = self.entries[idx].delay;
            if residual < slot_delay {
                self.entries[idx].delay = slot_delay - residual;
                self.entries.insert(
                    idx,
                    TimerEntry {
                        delay: residual,
                        payload,
                    },
                );
                return;
            }
            residual -= slot_delay;
        }
        self.entries.push_back(TimerEntry {
            delay: residual,
            payload,
        });
    }

    /// Pops the head entry if it is due, returning its payload and the
    /// overshoot: the (non-positive) delay remaining at fire time.
    ///
    /// The caller drains due entries one `pop_due` at a time, so event
    /// handlers are free to `insert` between pops and newly scheduled
    /// entries are immediately eligible for ordering against the ones
    /// not yet popped. The popped entry's overshoot is carried into the
    /// new head so successors keep their absolute fire times.
    pub fn pop_due(&mut self) -> Option<(T, Delta)> {
        self.refresh();
        let overshoot = self.entries.front().map(|e| e.delay)?;
        if !overshoot.is_due() {
            return None;
        }
        let entry = self.entries.pop_front()?;
        if let Some(next) = self.entries.front_mut() {
            next.delay += overshoot;
        }
        Some((entry.payload, overshoot))
    }

    /// Time remaining until the head entry is due. Zero or negative
    /// means a timer is already due.
    ///
    /// # Panics
    ///
    /// Panics on an empty queue. The controller keeps a recurring
    /// arrival event scheduled at all times, so an empty queue here is a
    /// scheduling-invariant violation that must abort the run.
    #[must_use]
    pub fn next_deadline(&mut self) -> Delta {
        self.refresh();
        self.entries
            .front()
            .map(|e| e.delay)
            .expect("timer queue empty: the recurring arrival event must always be scheduled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Manually advanced clock, shared between test and queue.
    #[derive(Clone, Default)]
    struct TestClock(Rc<Cell<u64>>);

    impl TestClock {
        fn advance(&self, delta: Delta) {
            self.0.set(self.0.get() + delta.as_nanos() as u64);
        }
    }

    impl Clock for TestClock {
        fn now_ns(&self) -> u64 {
            self.0.get()
        }
    }

    fn queue() -> (DeltaTimerQueue<&'static str, TestClock>, TestClock) {
        let clock = TestClock::default();
        (DeltaTimerQueue::with_clock(clock.clone()), clock)
    }

    /// Absolute fire offsets recovered from the stored deltas.
    fn absolute_offsets(q: &DeltaTimerQueue<&'static str, TestClock>) -> Vec<Delta> {
        let mut acc = Delta::ZERO;
        q.entries
            .iter()
            .map(|e| {
                acc += e.delay;
                acc
            })
            .collect()
    }

    #[test]
    fn sorted_splice_orders_five_two_eight() {
        let (mut q, _clock) = queue();
        q.insert(Delta::from_millis(5), "five");
        q.insert(Delta::from_millis(2), "two");
        q.insert(Delta::from_millis(8), "eight");

        assert_eq!(
            absolute_offsets(&q),
            vec![
                Delta::from_millis(2),
                Delta::from_millis(5),
                Delta::from_millis(8)
            ]
        );
        let payloads: Vec<_> = q.entries.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["two", "five", "eight"]);
    }

    #[test]
    fn rebasing_conserves_absolute_times() {
        let (mut q, _clock) = queue();
        q.insert(Delta::from_millis(10), "a");
        q.insert(Delta::from_millis(30), "b");
        let before = absolute_offsets(&q);

        q.insert(Delta::from_millis(20), "mid");
        let after = absolute_offsets(&q);

        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], Delta::from_millis(20));
        assert_eq!(after[2], before[1]);
    }

    #[test]
    fn due_entries_pop_in_fire_time_order_with_overshoot() {
        let (mut q, clock) = queue();
        q.insert(Delta::from_millis(1), "first");
        q.insert(Delta::from_millis(2), "second");
        clock.advance(Delta::from_millis(5));

        let (payload, overshoot) = q.pop_due().unwrap();
        assert_eq!(payload, "first");
        assert_eq!(overshoot, Delta::from_millis(-4));

        // Overshoot carries forward: "second" was due at 2ms, not 3ms.
        let (payload, overshoot) = q.pop_due().unwrap();
        assert_eq!(payload, "second");
        assert_eq!(overshoot, Delta::from_millis(-3));

        assert!(q.pop_due().is_none());
    }

    #[test]
    fn check_with_pending_head_fires_nothing() {
        let (mut q, clock) = queue();
        q.insert(Delta::from_millis(10), "later");
        clock.advance(Delta::from_millis(4));

        assert!(q.pop_due().is_none());
        assert_eq!(q.next_deadline(), Delta::from_millis(6));
        // Repeating the check mutates nothing further.
        assert!(q.pop_due().is_none());
        assert_eq!(q.next_deadline(), Delta::from_millis(6));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reentrant_insert_during_drain_stays_ordered() {
        let (mut q, clock) = queue();
        q.insert(Delta::from_millis(1), "a");
        q.insert(Delta::from_millis(8), "b");
        clock.advance(Delta::from_millis(10));

        let (payload, _) = q.pop_due().unwrap();
        assert_eq!(payload, "a");

        // Handler schedules a fresh due-now event mid-drain; "b" (due at
        // 8ms, before now) must still fire first.
        q.insert(Delta::ZERO, "c");
        assert_eq!(q.pop_due().unwrap().0, "b");
        assert_eq!(q.pop_due().unwrap().0, "c");
    }

    #[test]
    fn ordering_holds_across_interleaved_refreshes() {
        let (mut q, clock) = queue();
        q.insert(Delta::from_millis(50), "late");
        clock.advance(Delta::from_millis(10));
        q.insert(Delta::from_millis(10), "early");
        clock.advance(Delta::from_millis(15));
        q.insert(Delta::from_millis(40), "mid");

        clock.advance(Delta::from_millis(100));
        let mut fired = Vec::new();
        while let Some((payload, _)) = q.pop_due() {
            fired.push(payload);
        }
        // Absolute due times: early=20ms, late=50ms, mid=65ms.
        assert_eq!(fired, vec!["early", "late", "mid"]);
    }

    #[test]
    #[should_panic(expected = "timer queue empty")]
    fn next_deadline_on_empty_queue_panics() {
        let (mut q, _clock) = queue();
        let _ = q.next_deadline();
    }
}
