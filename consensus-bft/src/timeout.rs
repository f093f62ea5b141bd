//! Timeout scheduling for the consensus driver.
//!
//! A [`TimeoutTicker`] owns one timer on a dedicated thread. Scheduling
//! a timeout cancels whatever was armed, unless the request names an
//! older `(height, round, step)` than the armed one, in which case it is
//! dropped silently. At most one fire is in flight, and the consumer
//! sees fires in arming order minus the superseded ones.

use {
    crate::{
        error::{ConsensusError, Result},
        round_state::RoundStep,
    },
    crossbeam_channel::{after, bounded, never, select, Receiver, Sender},
    log::{debug, trace},
    std::{
        sync::Mutex,
        thread::{Builder, JoinHandle},
        time::Duration,
    },
};

/// Capacity of the schedule and fired channels.
const TICKER_CHANNEL_SIZE: usize = 10;

/// A request to fire after `duration` on behalf of `(height, round, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

impl TimeoutInfo {
    /// Supersession order: lexicographic on `(height, round, step)`.
    fn key(&self) -> (u64, u32, RoundStep) {
        (self.height, self.round, self.step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickerState {
    Idle,
    Running,
    Stopped,
}

struct TickerInner {
    state: TickerState,
    schedule_rx: Option<Receiver<TimeoutInfo>>,
    fired_tx: Option<Sender<TimeoutInfo>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Single-owner timer thread.
pub struct TimeoutTicker {
    schedule_tx: Sender<TimeoutInfo>,
    fired_rx: Receiver<TimeoutInfo>,
    inner: Mutex<TickerInner>,
}

impl TimeoutTicker {
    pub fn new() -> Self {
        let (schedule_tx, schedule_rx) = bounded(TICKER_CHANNEL_SIZE);
        let (fired_tx, fired_rx) = bounded(TICKER_CHANNEL_SIZE);
        Self {
            schedule_tx,
            fired_rx,
            inner: Mutex::new(TickerInner {
                state: TickerState::Idle,
                schedule_rx: Some(schedule_rx),
                fired_tx: Some(fired_tx),
                stop_tx: None,
                thread: None,
            }),
        }
    }

    /// Spawn the timer thread. Calling `start` on a running ticker is a
    /// no-op; a stopped ticker cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            TickerState::Running => return Ok(()),
            TickerState::Stopped => return Err(ConsensusError::AlreadyStopped),
            TickerState::Idle => {}
        }

        let schedule_rx = inner.schedule_rx.take().expect("ticker schedule end present");
        let fired_tx = inner.fired_tx.take().expect("ticker fired end present");
        let (stop_tx, stop_rx) = bounded(1);
        let thread = Builder::new()
            .name("tsrTimeoutTicker".to_string())
            .spawn(move || Self::run(schedule_rx, fired_tx, stop_rx))
            .expect("failed to spawn timeout ticker thread");

        inner.stop_tx = Some(stop_tx);
        inner.thread = Some(thread);
        inner.state = TickerState::Running;
        Ok(())
    }

    /// Stop the timer thread and join it. Idempotent; after `stop`, no
    /// further fires are delivered.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TickerState::Running {
            inner.state = TickerState::Stopped;
            return;
        }
        if let Some(stop_tx) = inner.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = inner.thread.take() {
            let _ = thread.join();
        }
        inner.state = TickerState::Stopped;
    }

    /// Arm a timeout, cancelling the currently armed one unless the new
    /// request is older in `(height, round, step)` order.
    pub fn schedule_timeout(&self, info: TimeoutInfo) {
        if self.schedule_tx.try_send(info).is_err() {
            debug!("timeout ticker not accepting schedules, dropping {info:?}");
        }
    }

    /// The channel delivering fires that were not superseded.
    pub fn fired(&self) -> &Receiver<TimeoutInfo> {
        &self.fired_rx
    }

    fn run(
        schedule_rx: Receiver<TimeoutInfo>,
        fired_tx: Sender<TimeoutInfo>,
        stop_rx: Receiver<()>,
    ) {
        let mut armed: Option<TimeoutInfo> = None;
        let mut deadline = never();
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(schedule_rx) -> msg => {
                    let Ok(info) = msg else { break };
                    if let Some(current) = armed {
                        if info.key() < current.key() {
                            trace!("ignoring stale timeout {info:?}, armed {current:?}");
                            continue;
                        }
                    }
                    trace!("arming timeout {info:?}");
                    deadline = after(info.duration);
                    armed = Some(info);
                },
                recv(deadline) -> _ => {
                    deadline = never();
                    let Some(info) = armed.take() else { continue };
                    // block until the consumer takes the fire, unless we
                    // are asked to stop in the meantime
                    select! {
                        send(fired_tx, info) -> res => {
                            if res.is_err() {
                                break;
                            }
                        },
                        recv(stop_rx) -> _ => break,
                    }
                },
            }
        }
    }
}

impl Default for TimeoutTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration_ms: u64, height: u64, round: u32, step: RoundStep) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(duration_ms),
            height,
            round,
            step,
        }
    }

    #[test]
    fn test_fires_after_duration() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        let ti = info(10, 1, 0, RoundStep::Propose);
        ticker.schedule_timeout(ti);
        let fired = ticker
            .fired()
            .recv_timeout(Duration::from_secs(2))
            .expect("timeout should fire");
        assert_eq!(fired, ti);
        ticker.stop();
    }

    #[test]
    fn test_newer_schedule_supersedes_armed() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        ticker.schedule_timeout(info(50, 1, 0, RoundStep::Propose));
        ticker.schedule_timeout(info(10, 1, 0, RoundStep::PrevoteFetch));

        let fired = ticker
            .fired()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(fired.step, RoundStep::PrevoteFetch);

        // the superseded propose timeout must never surface
        assert!(ticker
            .fired()
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        ticker.stop();
    }

    #[test]
    fn test_stale_schedule_ignored() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        ticker.schedule_timeout(info(30, 2, 0, RoundStep::NewHeight));
        ticker.schedule_timeout(info(1, 1, 5, RoundStep::PrecommitWait));

        let fired = ticker
            .fired()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(fired.height, 2);
        ticker.stop();
    }

    #[test]
    fn test_rearms_on_equal_key() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        // the fetch loop re-arms the same (height, round, step)
        ticker.schedule_timeout(info(500, 1, 0, RoundStep::PrevoteFetch));
        ticker.schedule_timeout(info(10, 1, 0, RoundStep::PrevoteFetch));
        let fired = ticker
            .fired()
            .recv_timeout(Duration::from_millis(200))
            .expect("re-armed timeout should fire quickly");
        assert_eq!(fired.duration, Duration::from_millis(10));
        ticker.stop();
    }

    #[test]
    fn test_fires_in_arming_order() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        ticker.schedule_timeout(info(5, 1, 0, RoundStep::Propose));
        let first = ticker
            .fired()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        ticker.schedule_timeout(info(5, 1, 0, RoundStep::PrevoteWait));
        let second = ticker
            .fired()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert!(first.step < second.step);
        ticker.stop();
    }

    #[test]
    fn test_stop_silences_ticker() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        ticker.stop();
        ticker.schedule_timeout(info(1, 1, 0, RoundStep::Propose));
        assert!(ticker
            .fired()
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        // stop is idempotent, start after stop is refused
        ticker.stop();
        assert!(matches!(
            ticker.start(),
            Err(ConsensusError::AlreadyStopped)
        ));
    }

    #[test]
    fn test_start_is_idempotent() {
        let ticker = TimeoutTicker::new();
        ticker.start().unwrap();
        ticker.start().unwrap();
        ticker.stop();
    }
}
