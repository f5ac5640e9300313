//! Timer ownership for the coordinator
//!
//! The reference design had ticker objects reset from several call sites.
//! Here every rearm decision funnels through one [`Scheduler`] owned by the
//! coordinator: producer tasks just sleep on whatever interval their watch
//! channel currently holds, and a sentinel value parks them entirely while a
//! submission attempt is in flight.

use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Sentinel interval that parks a ticker until the next command.
pub const TICKER_HOLD: Duration = Duration::MAX;

/// Handle through which the scheduler commands one ticker task.
pub struct TickerControl {
    tx: watch::Sender<Duration>,
    nominal: Duration,
}

impl TickerControl {
    pub fn new(nominal: Duration) -> (Self, watch::Receiver<Duration>) {
        let (tx, rx) = watch::channel(nominal);
        (Self { tx, nominal }, rx)
    }

    /// Park the ticker; no tick fires until a later arm call.
    pub fn hold(&self) {
        let _ = self.tx.send(TICKER_HOLD);
    }

    /// Restart the ticker with period `interval`, beginning now.
    pub fn arm(&self, interval: Duration) {
        let _ = self.tx.send(interval);
    }

    pub fn arm_nominal(&self) {
        self.arm(self.nominal);
    }

    pub fn current(&self) -> Duration {
        *self.tx.borrow()
    }
}

/// Ticker task body: sleeps on the commanded interval, emits a tick, repeats.
/// Any command restarts the sleep, so `arm` behaves like a ticker reset.
pub async fn run_ticker(
    name: &'static str,
    mut interval_rx: watch::Receiver<Duration>,
    tick_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial = *interval_rx.borrow();
    info!(ticker = name, interval = ?initial, "ticker started");
    loop {
        let interval = *interval_rx.borrow_and_update();

        if interval == TICKER_HOLD {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = interval_rx.changed() => {
                // Re-read the new interval and restart the sleep
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                if tick_tx.send(()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(ticker = name, "ticker stopped");
}

/// Fixed-interval backoff with bounded uniform jitter.
#[derive(Debug)]
pub struct FixedBackoff {
    base: Duration,
    jitter: f64,
    attempt: u32,
}

impl FixedBackoff {
    pub fn new(base: Duration, jitter: f64) -> Self {
        Self {
            base,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Next delay in `[base, base * (1 + jitter)]`.
    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        let spread = self.base.as_secs_f64() * self.jitter;
        let extra = if spread > 0.0 {
            rand::thread_rng().gen_range(0.0..=spread)
        } else {
            0.0
        };
        self.base + Duration::from_secs_f64(extra)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// All rearm policy, in one place. The submitter reports outcomes; only the
/// coordinator calls in here.
pub struct Scheduler {
    pub poll: TickerControl,
    pub beat: TickerControl,
    backoff: FixedBackoff,
}

impl Scheduler {
    /// Returns the scheduler plus the watch receivers to hand to the two
    /// ticker tasks (chain poll, drumbeat).
    pub fn new(
        poll_interval: Duration,
        beat_interval: Duration,
        backoff: FixedBackoff,
    ) -> (Self, watch::Receiver<Duration>, watch::Receiver<Duration>) {
        let (poll, poll_rx) = TickerControl::new(poll_interval);
        let (beat, beat_rx) = TickerControl::new(beat_interval);
        (
            Self {
                poll,
                beat,
                backoff,
            },
            poll_rx,
            beat_rx,
        )
    }

    /// Park the drumbeat while an attempt is in flight.
    pub fn hold_submissions(&self) {
        self.beat.hold();
    }

    /// A confirmed submission: both tickers back to nominal, backoff cleared.
    pub fn rearm_after_confirmed(&mut self) {
        self.poll.arm_nominal();
        self.beat.arm_nominal();
        self.backoff.reset();
    }

    /// Not eligible this time: retry after the attempt's own elapsed time
    /// plus the backoff delay.
    pub fn rearm_not_eligible(&mut self, elapsed: Duration) -> Duration {
        let delay = elapsed + self.backoff.next();
        self.beat.arm(delay);
        delay
    }

    /// Send or confirmation failure: resume the nominal drumbeat without the
    /// optimistic poll reset.
    pub fn rearm_after_failure(&mut self) {
        self.beat.arm_nominal();
    }
}
