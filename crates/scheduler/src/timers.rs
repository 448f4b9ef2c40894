//! Delayed, debounced and throttled callbacks
//!
//! A [`Timers`] service owns one timer thread that sleeps until the earliest
//! deadline. Callbacks registered through [`Timers::delay`] or
//! [`Timers::debounce`] run on that thread. Only timers that have not fired
//! yet can be cancelled.
//!
//! - **delay**: run once after a fixed delay, cancellable by id
//! - **debounce**: run only after a key has been quiet for the delay; each
//!   call re-arms the timer and replaces the callback
//! - **throttle**: run at most once per period per key; a call inside the
//!   period is deferred to the end of it, replacing any deferred callback
//!
//! A delay or period too large to represent as a deadline never elapses: the
//! callback stays pending until cancelled or shut down.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a pending delayed callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerKind {
    Delay,
    Debounce(String),
    Throttle(String),
}

struct Timer {
    callback: Callback,
    kind: TimerKind,
}

#[derive(Debug)]
struct ThrottleState {
    /// End of the current window; `None` when the period never ends
    open_at: Option<Instant>,
    period: Duration,
    pending: Option<u64>,
}

impl ThrottleState {
    fn is_stale(&self, now: Instant) -> bool {
        self.pending.is_none() && self.open_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct State {
    timers: HashMap<u64, Timer>,
    // Cancelled timers stay in the heap and are skipped when they surface
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    debounces: HashMap<String, u64>,
    throttles: HashMap<String, ThrottleState>,
    next_id: u64,
    shutdown: bool,
}

impl State {
    /// Register a timer; one without a deadline never fires
    fn arm(&mut self, deadline: Option<Instant>, kind: TimerKind, callback: Callback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.timers.insert(id, Timer { callback, kind });
        if let Some(deadline) = deadline {
            self.deadlines.push(Reverse((deadline, id)));
        }
        id
    }

    fn disarm(&mut self, id: u64) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Pop the next due timer, or report how long to sleep
    fn next_due(&mut self, now: Instant) -> std::result::Result<Timer, Option<Instant>> {
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if !self.timers.contains_key(&id) {
                self.deadlines.pop();
                continue;
            }
            if deadline > now {
                return Err(Some(deadline));
            }
            self.deadlines.pop();
            if let Some(timer) = self.timers.remove(&id) {
                self.on_fired(id, &timer.kind, now);
                return Ok(timer);
            }
        }
        Err(None)
    }

    fn on_fired(&mut self, id: u64, kind: &TimerKind, now: Instant) {
        match kind {
            TimerKind::Delay => {}
            TimerKind::Debounce(key) => {
                if self.debounces.get(key) == Some(&id) {
                    self.debounces.remove(key);
                }
            }
            TimerKind::Throttle(key) => {
                if let Some(state) = self.throttles.get_mut(key) {
                    if state.pending == Some(id) {
                        state.pending = None;
                        state.open_at = now.checked_add(state.period);
                    }
                }
            }
        }
    }

    /// Forget throttle keys whose window has closed with nothing deferred
    fn prune_throttles(&mut self, now: Instant) {
        self.throttles.retain(|_, throttle| !throttle.is_stale(now));
    }

    fn clear(&mut self) {
        self.timers.clear();
        self.deadlines.clear();
        self.debounces.clear();
        self.throttles.clear();
    }
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

/// Timer service backing delay, debounce and throttle
pub struct Timers {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    /// Start the timer thread
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        let name = "sidechain-timers";
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&worker))
            .map_err(|e| Error::spawn(name, e))?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `callback` once after `delay`
    ///
    /// Returns `None` once the service has shut down.
    pub fn delay<F>(&self, delay: Duration, callback: F) -> Option<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return None;
        }
        let id = state.arm(
            Instant::now().checked_add(delay),
            TimerKind::Delay,
            Box::new(callback),
        );
        drop(state);
        self.inner.wake.notify_one();
        Some(TimerId(id))
    }

    /// Cancel a pending delayed callback
    ///
    /// Returns `true` if the callback had not fired yet.
    pub fn cancel_delay(&self, id: TimerId) -> bool {
        self.inner.state.lock().disarm(id.0)
    }

    /// Run `callback` once `key` has been quiet for `delay`
    ///
    /// Each call restarts the wait and replaces the previous callback for
    /// the key. Empty keys are ignored.
    pub fn debounce<F>(&self, key: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if key.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        if let Some(previous) = state.debounces.remove(key) {
            state.disarm(previous);
        }
        let id = state.arm(
            Instant::now().checked_add(delay),
            TimerKind::Debounce(key.to_string()),
            Box::new(callback),
        );
        state.debounces.insert(key.to_string(), id);
        drop(state);
        self.inner.wake.notify_one();
        trace!(key, "Debounce armed");
    }

    /// Drop the pending debounced callback for `key`
    pub fn cancel_debounce(&self, key: &str) {
        let mut state = self.inner.state.lock();
        if let Some(id) = state.debounces.remove(key) {
            state.disarm(id);
        }
    }

    /// Drop every pending debounced callback
    pub fn cancel_all_debounces(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.debounces.drain().map(|(_, id)| id).collect();
        for id in ids {
            state.disarm(id);
        }
    }

    /// Run `callback` at most once per `period` for `key`
    ///
    /// When the period has elapsed since the key last fired, the callback
    /// runs immediately on the calling thread. Otherwise it is deferred to
    /// the end of the period on the timer thread, replacing any callback
    /// already deferred. Empty keys are ignored.
    pub fn throttle<F>(&self, key: &str, period: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if key.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        state.prune_throttles(now);
        let window = state
            .throttles
            .get_mut(key)
            .map(|throttle| (throttle.open_at, throttle.pending.take()));

        match window {
            Some((open_at, pending)) if open_at.is_none_or(|at| at > now) => {
                if let Some(previous) = pending {
                    state.disarm(previous);
                }
                let id = state.arm(
                    open_at,
                    TimerKind::Throttle(key.to_string()),
                    Box::new(callback),
                );
                if let Some(throttle) = state.throttles.get_mut(key) {
                    throttle.period = period;
                    throttle.pending = Some(id);
                }
                drop(state);
                self.inner.wake.notify_one();
                trace!(key, "Throttled call deferred");
            }
            window => {
                if let Some((_, Some(previous))) = window {
                    state.disarm(previous);
                }
                state.throttles.insert(
                    key.to_string(),
                    ThrottleState {
                        open_at: now.checked_add(period),
                        period,
                        pending: None,
                    },
                );
                drop(state);
                callback();
            }
        }
    }

    /// Forget throttle state for `key`, dropping any deferred callback
    pub fn cancel_throttle(&self, key: &str) {
        let mut state = self.inner.state.lock();
        if let Some(throttle) = state.throttles.remove(key) {
            if let Some(id) = throttle.pending {
                state.disarm(id);
            }
        }
    }

    /// Number of callbacks waiting to fire
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().timers.len()
    }

    /// Discard all pending callbacks and stop the timer thread
    ///
    /// Every later call is a no-op. Calling this more than once is safe.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.clear();
        }
        self.inner.wake.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Timer thread exited abnormally");
            }
        }
        debug!("Timers stopped");
    }

    /// Whether [`Timers::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Timers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timers")
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn timer_loop(inner: &Inner) {
    loop {
        let timer = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                match state.next_due(Instant::now()) {
                    Ok(timer) => break timer,
                    Err(Some(deadline)) => {
                        inner.wake.wait_until(&mut state, deadline);
                    }
                    Err(None) => inner.wake.wait(&mut state),
                }
            }
        };

        let kind = timer.kind;
        if panic::catch_unwind(AssertUnwindSafe(timer.callback)).is_err() {
            error!(kind = ?kind, "Timer callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn noop() -> Callback {
        Box::new(|| {})
    }

    #[test]
    fn test_next_due_skips_disarmed() {
        let mut state = State::default();
        let now = Instant::now();
        let first = state.arm(Some(now), TimerKind::Delay, noop());
        let second = state.arm(Some(now), TimerKind::Delay, noop());
        assert!(state.disarm(first));

        assert!(state.next_due(now).is_ok());
        assert!(!state.timers.contains_key(&second));
        assert!(matches!(state.next_due(now), Err(None)));
    }

    #[test]
    fn test_next_due_reports_earliest_deadline() {
        let mut state = State::default();
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        state.arm(Some(later), TimerKind::Delay, noop());
        state.arm(Some(now + Duration::from_secs(1)), TimerKind::Delay, noop());

        match state.next_due(now) {
            Err(Some(deadline)) => assert_eq!(deadline, now + Duration::from_secs(1)),
            _ => unreachable!("nothing should be due yet"),
        }
    }

    #[test]
    fn test_firing_debounce_clears_key() {
        let mut state = State::default();
        let now = Instant::now();
        let id = state.arm(Some(now), TimerKind::Debounce("search".into()), noop());
        state.debounces.insert("search".into(), id);

        assert!(state.next_due(now).is_ok());
        assert!(state.debounces.is_empty());
    }

    #[test]
    fn test_firing_throttle_records_time() {
        let mut state = State::default();
        let now = Instant::now();
        let id = state.arm(Some(now), TimerKind::Throttle("scroll".into()), noop());
        state.throttles.insert(
            "scroll".into(),
            ThrottleState {
                open_at: Some(now),
                period: Duration::from_millis(50),
                pending: Some(id),
            },
        );

        assert!(state.next_due(now).is_ok());
        let throttle = &state.throttles["scroll"];
        assert_eq!(throttle.open_at, Some(now + Duration::from_millis(50)));
        assert!(throttle.pending.is_none());
    }

    #[test]
    fn test_timer_without_deadline_never_due() {
        let mut state = State::default();
        let id = state.arm(None, TimerKind::Delay, noop());

        assert!(matches!(state.next_due(Instant::now()), Err(None)));
        assert!(state.timers.contains_key(&id));
        assert!(state.disarm(id));
    }

    #[test]
    fn test_prune_keeps_open_and_pending_windows() {
        let mut state = State::default();
        let now = Instant::now();
        let period = Duration::from_secs(1);
        let window = |open_at, pending| ThrottleState {
            open_at,
            period,
            pending,
        };
        state.throttles.insert("closed".into(), window(Some(now), None));
        state
            .throttles
            .insert("open".into(), window(Some(now + period), None));
        state.throttles.insert("endless".into(), window(None, None));
        state
            .throttles
            .insert("deferred".into(), window(Some(now), Some(7)));

        state.prune_throttles(now);

        let mut kept: Vec<&str> = state.throttles.keys().map(String::as_str).collect();
        kept.sort_unstable();
        assert_eq!(kept, ["deferred", "endless", "open"]);
    }

    #[test]
    fn test_huge_durations_stay_pending() {
        let timers = Timers::new().unwrap();
        timers.delay(Duration::MAX, || {}).unwrap();
        timers.debounce("zoom", Duration::MAX, || {});
        timers.throttle("pan", Duration::MAX, || {});
        timers.throttle("pan", Duration::MAX, || {});

        assert_eq!(timers.pending_count(), 3);
        assert_eq!(timers.inner.state.lock().throttles["pan"].open_at, None);
        timers.shutdown();
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn test_stale_throttle_keys_are_forgotten() {
        let timers = Timers::new().unwrap();
        for i in 0..50 {
            timers.throttle(&format!("knob-{i}"), Duration::from_millis(1), || {});
        }
        thread::sleep(Duration::from_millis(20));
        timers.throttle("fader", Duration::from_secs(60), || {});

        let state = timers.inner.state.lock();
        assert_eq!(state.throttles.len(), 1);
        assert!(state.throttles.contains_key("fader"));
    }
}
