//! Tests for the timer handles: one-shot delays, repetition with stop,
//! cancellation, and restart semantics. Timing assertions keep the tight
//! lower bounds (a timer must never fire early) and allow a little
//! scheduling slack above.

use std::cell::Cell;
use std::rc::Rc;

use eddy_core::ErrorKind;

use super::*;
use crate::event_loop::Loop;

const SHORT_DELAY: Duration = Duration::from_millis(25);
const REPEAT_INTERVAL: Duration = Duration::from_millis(5);
const MAX_DISCREPANCY: Duration = Duration::from_millis(2);
const SCHEDULING_SLACK: Duration = Duration::from_millis(10);

/// Test that a zero-delay timeout fires on the next loop iteration, never
/// synchronously at the call site.
#[test]
fn zero_delay_fires_on_the_next_iteration() {
    let lp = Loop::new().expect("loop construction failed");
    let resolved = Rc::new(Cell::new(false));
    let started = Rc::new(Cell::new(None::<Instant>));

    let timeout = Timeout::new(&lp);
    timeout.start(Duration::ZERO).map({
        let resolved = resolved.clone();
        let started = started.clone();
        move |()| {
            let elapsed = started.get().expect("fired before run").elapsed();
            assert!(
                elapsed < MAX_DISCREPANCY + SCHEDULING_SLACK,
                "zero-delay timeout took {elapsed:?}"
            );
            resolved.set(true);
        }
    });
    assert!(!resolved.get(), "timeout resolved synchronously");

    started.set(Some(Instant::now()));
    lp.run().expect("run failed");
    assert!(resolved.get(), "timeout never resolved");
}

/// Test that a short delay fires no earlier than the requested delay and
/// close to it.
#[test]
fn short_delay_fires_on_time() {
    let lp = Loop::new().expect("loop construction failed");
    let resolved = Rc::new(Cell::new(false));
    let started = Rc::new(Cell::new(None::<Instant>));

    let timeout = Timeout::new(&lp);
    timeout.start(SHORT_DELAY).map({
        let resolved = resolved.clone();
        let started = started.clone();
        move |()| {
            let elapsed = started.get().expect("fired before run").elapsed();
            assert!(
                elapsed > SHORT_DELAY - MAX_DISCREPANCY,
                "timeout fired early after {elapsed:?}"
            );
            assert!(
                elapsed < SHORT_DELAY + MAX_DISCREPANCY + SCHEDULING_SLACK,
                "timeout fired late after {elapsed:?}"
            );
            resolved.set(true);
        }
    });
    assert!(!resolved.get());

    started.set(Some(Instant::now()));
    lp.run().expect("run failed");
    assert!(resolved.get(), "timeout never resolved");
}

/// Test a repeating timeout: the callback stops the repetition after four
/// calls, and consecutive calls keep to the interval.
#[test]
fn repeat_fires_at_the_interval_until_stopped() {
    let lp = Loop::new().expect("loop construction failed");
    let calls = Rc::new(Cell::new(0u32));
    let previous = Rc::new(Cell::new(None::<Instant>));

    let timeout = Timeout::new(&lp);
    {
        let calls = calls.clone();
        let previous = previous.clone();
        timeout.repeat(REPEAT_INTERVAL, move |handle| {
            let count = calls.get() + 1;
            calls.set(count);
            assert!(count < 5, "repeat kept firing after stop");

            let now = Instant::now();
            if let Some(last) = previous.get() {
                let gap = now - last;
                assert!(
                    gap > REPEAT_INTERVAL - MAX_DISCREPANCY,
                    "interval fired early, gap {gap:?} on call {count}"
                );
                assert!(
                    gap < REPEAT_INTERVAL + MAX_DISCREPANCY + SCHEDULING_SLACK,
                    "interval drifted, gap {gap:?} on call {count}"
                );
            }
            previous.set(Some(now));

            if count == 4 {
                handle.stop();
            }
        });
    }

    assert_eq!(calls.get(), 0, "repeat ran before the loop");
    lp.run().expect("run failed");
    assert_eq!(calls.get(), 4, "repeat call count is off");
}

/// Test that stopping a one-shot timeout keeps the loop from waiting on it
/// and leaves its future forever pending.
#[test]
fn stop_prevents_resolution() {
    let lp = Loop::new().expect("loop construction failed");
    let resolved = Rc::new(Cell::new(false));
    let rejected = Rc::new(Cell::new(false));

    let timeout = Timeout::new(&lp);
    let future = timeout.start(SHORT_DELAY);
    let observed = future.map_else(
        {
            let resolved = resolved.clone();
            move |()| resolved.set(true)
        },
        {
            let rejected = rejected.clone();
            move |_| rejected.set(true)
        },
    );
    timeout.stop();

    lp.run().expect("run failed");
    assert!(!resolved.get(), "stopped timeout still resolved");
    assert!(!rejected.get(), "stopped timeout rejected its future");
    assert!(!observed.is_finished(), "stopped timeout settled its future");
}

/// Test that restarting an active timeout cancels the previous schedule,
/// rejecting the outstanding future as a broken promise.
#[test]
fn restart_cancels_the_previous_schedule() {
    let lp = Loop::new().expect("loop construction failed");
    let first_outcome = Rc::new(Cell::new(None::<ErrorKind>));
    let second_resolved = Rc::new(Cell::new(false));

    let timeout = Timeout::new(&lp);
    timeout.start(Duration::from_millis(250)).map_else(
        |()| panic!("cancelled schedule still fired"),
        {
            let first_outcome = first_outcome.clone();
            move |error| first_outcome.set(Some(error.kind()))
        },
    );
    timeout.start(Duration::from_millis(1)).map({
        let second_resolved = second_resolved.clone();
        move |()| second_resolved.set(true)
    });

    lp.run().expect("run failed");
    assert_eq!(
        first_outcome.get(),
        Some(ErrorKind::BrokenPromise),
        "previous schedule was not rejected as broken"
    );
    assert!(second_resolved.get(), "restarted timeout never fired");
}

/// Test that `stop` on a timeout that never started is a no-op.
#[test]
fn stop_is_idempotent() {
    let lp = Loop::new().expect("loop construction failed");
    let timeout = Timeout::new(&lp);
    timeout.stop();
    timeout.stop();
    assert!(!timeout.is_active());
    lp.run().expect("run failed");
}

/// Test that starting an already active idle handle is rejected as a
/// programming error.
#[test]
#[should_panic(expected = "already started")]
fn idle_double_start_panics() {
    let lp = Loop::new().expect("loop construction failed");
    let idle = Idle::new(&lp);
    idle.start(|| {});
    idle.start(|| {});
}

/// Test that stopping an idle handle twice is harmless.
#[test]
fn idle_stop_is_idempotent() {
    let lp = Loop::new().expect("loop construction failed");
    let idle = Idle::new(&lp);
    idle.start(|| {});
    assert!(idle.is_active());
    idle.stop();
    idle.stop();
    assert!(!idle.is_active());
    lp.run().expect("run failed");
}
