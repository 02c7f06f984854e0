//! A deadline-ordered timer set serviced by a single caller loop, with a
//! self-pipe used to wake that loop early whenever a nearer deadline is
//! scheduled than the one it's currently sleeping on.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use tcpmany_clock::{now_us, Timestamp, ONE_MILLI_SECOND, ONE_SECOND};

pub type TimerId = i64;
pub type TimerCallback = Box<dyn FnOnce() + Send>;

static NEXT_TIMER_ID: AtomicI64 = AtomicI64::new(1);

struct ScheduledTimer {
    id: TimerId,
    expiration: Timestamp,
    callback: TimerCallback,
}

/// Orders the timer heap by expiration, breaking ties by id so two
/// timers scheduled for the same microsecond still have a total order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    expiration: Timestamp,
    id: TimerId,
}

/// Both maps a single [`Mutex`] guards: the deadline-ordered set itself and
/// the `id -> key` index used to cancel by id. Kept behind one lock (rather
/// than one each) because `add_timer` and `cancel_timer` touch both and a
/// consistent lock order between the two would otherwise have to be
/// maintained by hand — the original guards both with a single `mutex_`
/// for the same reason (timer.h:171).
struct TimerState {
    timers: std::collections::BTreeMap<TimerKey, TimerCallback>,
    id_to_key: std::collections::HashMap<TimerId, TimerKey>,
}

/// Services a set of pending timers, run from a single dedicated thread
/// that alternates between sleeping until the next deadline and firing
/// whatever has expired. [`TimerManager::add_timer`] and
/// [`TimerManager::cancel_timer`] may be called concurrently from any
/// thread; they wake the run loop via a self-pipe when a nearer timer is
/// scheduled than the one currently being waited on.
pub struct TimerManager {
    state: Mutex<TimerState>,
    notify_write: UnixStream,
    notify_read: UnixStream,
    stopped: std::sync::atomic::AtomicBool,
}

impl TimerManager {
    pub fn new() -> std::io::Result<Self> {
        let (notify_write, notify_read) = UnixStream::pair()?;
        notify_write.set_nonblocking(true)?;
        notify_read.set_nonblocking(true)?;
        Ok(Self {
            state: Mutex::new(TimerState {
                timers: std::collections::BTreeMap::new(),
                id_to_key: std::collections::HashMap::new(),
            }),
            notify_write,
            notify_read,
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Schedules `callback` to run at `when` (microseconds, same epoch as
    /// [`tcpmany_clock::now_us`]). Returns an id that can later be passed
    /// to [`TimerManager::cancel_timer`].
    pub fn add_timer(&self, when: Timestamp, callback: TimerCallback) -> TimerId {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let key = TimerKey {
            expiration: when,
            id,
        };

        let mut state = self.state.lock();
        let has_earlier_timer = state
            .timers
            .keys()
            .next()
            .map(|earliest| when < earliest.expiration)
            .unwrap_or(true);

        state.timers.insert(key, callback);
        state.id_to_key.insert(id, key);
        drop(state);

        if has_earlier_timer {
            self.notify();
        }
        id
    }

    pub fn cancel_timer(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(key) = state.id_to_key.remove(&id) {
            state.timers.remove(&key);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Blocks until the earliest pending timer expires (or the manager
    /// is stopped), then runs and removes every timer that has expired.
    /// Intended to be called in a loop from one dedicated thread.
    pub fn run_expired(&self) {
        self.wait_for_next_deadline();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let expired = {
            let mut state = self.state.lock();
            let now = now_us();
            let split_key = TimerKey {
                expiration: now,
                id: TimerId::MAX,
            };
            let remaining = state.timers.split_off(&split_key);
            let expired_map = std::mem::replace(&mut state.timers, remaining);
            for key in expired_map.keys() {
                state.id_to_key.remove(&key.id);
            }
            expired_map.into_iter().collect::<Vec<_>>()
        };

        for (_, callback) in expired {
            callback();
        }
    }

    fn time_until_earliest(&self) -> Timestamp {
        self.state
            .lock()
            .timers
            .keys()
            .next()
            .map(|key| key.expiration - now_us())
            .unwrap_or(ONE_SECOND)
    }

    fn wait_for_next_deadline(&self) {
        loop {
            let time_diff = self.time_until_earliest();
            if time_diff <= ONE_MILLI_SECOND {
                return;
            }

            let timeout_ms = (time_diff / ONE_MILLI_SECOND) as i32;
            let mut pfd = libc::pollfd {
                fd: self.notify_read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret == 0 {
                tracing::trace!("timer wait: poll timed out");
            } else if ret > 0 {
                tracing::trace!("timer wait: woken by notification");
                let mut buf = [0u8; 64];
                let mut read_side = &self.notify_read;
                while matches!(read_side.read(&mut buf), Ok(n) if n > 0) {}
            } else {
                tracing::error!("timer wait: poll failed: {}", std::io::Error::last_os_error());
            }

            if self.stopped.load(Ordering::SeqCst) {
                let remaining = self.state.lock().timers.len();
                if remaining > 0 {
                    tracing::warn!(remaining, "timer manager stopped with pending timers");
                }
                return;
            }
        }
    }

    fn notify(&self) {
        let mut write_side = &self.notify_write;
        let _ = write_side.write(&[1u8]);
    }
}
