//! Timer showcase: chained waits, a deferred value, and a repeating
//! timeout that stops itself.

use std::time::{Duration, Instant};

use eddy::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let lp = Loop::new().expect("loop construction failed");
    let started = Instant::now();

    // A value deferred to the next iteration, doubled after a short wait.
    let wait_future = wait(&lp, Duration::from_millis(50));
    resolve(&lp, 21)
        .then(move |value| wait_future.map(move |()| value * 2))
        .map(move |value| {
            tracing::info!(value, elapsed = ?started.elapsed(), "chain resolved");
        });

    // A repeating tick that stops after five rounds.
    let ticker = Timeout::new(&lp);
    let mut rounds = 0u32;
    ticker.repeat(Duration::from_millis(20), move |handle| {
        rounds += 1;
        tracing::info!(rounds, "tick");
        if rounds == 5 {
            handle.stop();
        }
    });

    lp.run().expect("run failed");
    tracing::info!(elapsed = ?started.elapsed(), "loop drained");
}
